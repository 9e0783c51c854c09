//! Instrumentation rules: generators of spliced-in instrumentation code.

use alloc::vec::Vec;

use crate::{
    assembler::{CodeAssembler, DecodedInst},
    callback::InstPosition,
    patch::RelocInst,
    range::{GuestAddr, Range},
    rules::Pass,
};

/// A generator of instrumentation fragments to splice around instructions
/// it recognizes.
///
/// Distinct from [`crate::rules::PatchRule`]: a `PatchRule` produces the one
/// baseline translation an instruction gets, while any number of
/// `InstrRule`s may additionally match the same instruction and contribute
/// a fragment each. Grounded on QBDI's `InstrRuleCallback`/`InstrRule`
/// pairing and `addInstrRule`'s priority-ordered, range-filtered semantics.
pub trait InstrRule {
    /// `true` if this rule wants to instrument `inst`.
    fn matches(&self, inst: &DecodedInst, assembler: &dyn CodeAssembler) -> bool;

    /// Produce the relocatable host instructions to splice at `position`.
    /// Only called after `matches` returned `true` for the same
    /// instruction and position.
    fn generate(
        &self,
        inst: &DecodedInst,
        position: InstPosition,
        assembler: &dyn CodeAssembler,
    ) -> Vec<RelocInst>;

    /// Which positions this rule wants to run at. Most rules instrument
    /// only one side; a rule wanting both should return both.
    fn positions(&self) -> &[InstPosition];

    /// The pass this rule runs in. Defaults to
    /// [`Pass::LAST`](crate::rules::Pass::LAST); shadow-recording rules
    /// should override this to [`Pass::FIRST`](crate::rules::Pass::FIRST)
    /// so later user rules see their effect on instruction count.
    fn pass(&self) -> Pass {
        Pass::LAST
    }
}

/// A registered [`InstrRule`] together with the id it was registered under,
/// kept in the order rules are tried.
pub struct InstrRuleEntry {
    /// The id `delete_instrumentation` uses to find this entry again.
    pub id: crate::callback::EventId,
    /// The rule itself.
    pub rule: alloc::boxed::Box<dyn InstrRule>,
    /// The guest-PC range this rule applies to, per `add_instr_rule_range`.
    /// `None` for rules registered unranged via `add_instr_rule` (and for
    /// the built-in memory-shadow rule), which apply everywhere and whose
    /// addition/removal must flush the whole cache rather than one range.
    pub range: Option<Range<GuestAddr>>,
}
