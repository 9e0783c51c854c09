//! Patch rules: the generators that turn one decoded guest instruction into
//! its baseline host translation.

use alloc::vec::Vec;

use crate::{
    assembler::{CodeAssembler, DecodedInst},
    error::EngineError,
    patch::Patch,
};

/// A generator of the baseline (non-instrumentation) translation for guest
/// instructions it recognizes.
///
/// Exactly one matching rule produces each [`Patch`]; the translation
/// pipeline walks the engine's [`PatchRuleTable`] in registration order and
/// uses the first rule whose `matches` returns `true`. Grounded on QBDI's
/// `PatchRule` (`matches`/`generate` pair), simplified from the teacher
/// crate's per-opcode `match` dispatch (`executors::instruction`) into an
/// open, user-extensible table rather than a closed `match`.
pub trait PatchRule {
    /// `true` if this rule knows how to translate `inst`.
    fn matches(&self, inst: &DecodedInst, assembler: &dyn CodeAssembler) -> bool;

    /// Produce the baseline translation for `inst`. Only called after
    /// `matches` returned `true` for the same instruction.
    fn generate(
        &self,
        inst: &DecodedInst,
        assembler: &dyn CodeAssembler,
    ) -> Result<Patch, EngineError>;
}

/// An ordered list of [`PatchRule`]s, queried in registration order.
///
/// A default, catch-all rule (one that translates every instruction as an
/// opaque relocatable copy) should be registered last so the table always
/// produces a match; the engine surfaces
/// [`EngineError::NoMatchingPatchRule`](crate::error::EngineError::NoMatchingPatchRule)
/// only when even that fails to match, which a well-formed assembler facade
/// should never do.
#[derive(Default)]
pub struct PatchRuleTable {
    rules: Vec<alloc::boxed::Box<dyn PatchRule>>,
}

impl PatchRuleTable {
    /// An empty table.
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule, to be tried after every rule already registered.
    pub fn push(&mut self, rule: alloc::boxed::Box<dyn PatchRule>) {
        self.rules.push(rule);
    }

    /// Find the first rule matching `inst`, if any.
    pub fn find(
        &self,
        inst: &DecodedInst,
        assembler: &dyn CodeAssembler,
    ) -> Option<&dyn PatchRule> {
        self.rules
            .iter()
            .map(alloc::boxed::Box::as_ref)
            .find(|rule| rule.matches(inst, assembler))
    }
}
