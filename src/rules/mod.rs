//! Patch rules and instrumentation rules: the two extension points of the
//! translation pipeline.
//!
//! Grounded on QBDI's `PatchRule`/`InstrRule` split
//! (`original_source/include/QBDI/Patch`, as described by `Engine.h`'s
//! `addInstrRule`/`instrRuleRangeSet` surface) and on the teacher crate's
//! preference for small trait objects over a deep class hierarchy
//! (`ProfileReceiver`, `EcalHandler`).

mod instr_rule;
mod memory_shadow;
mod patch_rule;

pub use instr_rule::{InstrRule, InstrRuleEntry};
pub use memory_shadow::MemoryShadowRule;
pub use patch_rule::{PatchRule, PatchRuleTable};

/// An instrumentation pass identifier. Rules run in ascending pass order;
/// within a pass, in registration order. Mirrors QBDI's
/// `InstPosition`-independent `priority`, generalized to a named pass so a
/// rule can be grounded against "runs before/after X" without a numeric
/// priority race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Pass(pub u8);

impl Pass {
    /// The earliest pass: coarse, block-shape-changing instrumentation
    /// (memory-access shadow recording) should register here so later
    /// passes see its effect on the patch's instruction count.
    pub const FIRST: Pass = Pass(0);
    /// The latest built-in pass. User rules registered without an explicit
    /// pass run here, after every shadow-recording rule.
    pub const LAST: Pass = Pass(255);
}

impl Default for Pass {
    fn default() -> Self {
        Pass::LAST
    }
}
