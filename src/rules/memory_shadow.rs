//! The built-in memory-access shadow-recording instrumentation rule.
//!
//! Grounded on QBDI's always-installed "MemCB" pattern
//! (`original_source/src/Engine/Engine.cpp`'s `recordMemoryAccess`): the
//! first time the embedder asks for memory callbacks, the engine installs
//! this rule once per access type and never again, and every later
//! instruction that reads or writes memory gets PRE/POST recording code
//! spliced in ahead of (resp. behind) any user instrumentation, so user
//! rules always see accesses already shadow-recorded.
//!
//! This type never appears directly in ordinary rule registration: the
//! engine special-cases its id so its fragments are always spliced first
//! among PRE and last among POST, rather than relying on
//! [`crate::rules::Pass`] ordering alone (see
//! `Engine::splice_instrumentation`).

use alloc::vec::Vec;

use crate::{
    assembler::{CodeAssembler, DecodedInst},
    callback::InstPosition,
    memory_access::MemoryAccessType,
    patch::RelocInst,
    rules::{InstrRule, Pass},
};

/// Splices shadow-recording code around every instruction the assembler
/// facade reports as touching memory, for the access types the embedder
/// has asked to record.
#[derive(Debug, Clone, Copy)]
pub struct MemoryShadowRule {
    /// Which access types to record. Reads are recorded PRE (their value
    /// is available before the instruction runs), writes are recorded
    /// POST (the written value is only known after).
    pub record: MemoryAccessType,
}

impl MemoryShadowRule {
    /// A rule recording nothing yet; callers set `record` via
    /// [`Self::with_access_type`] as the embedder asks for more.
    pub fn new(record: MemoryAccessType) -> Self {
        Self { record }
    }

    /// This rule, extended to also record `access_type`.
    pub fn with_access_type(self, access_type: MemoryAccessType) -> Self {
        Self {
            record: self.record | access_type,
        }
    }
}

impl InstrRule for MemoryShadowRule {
    fn matches(&self, inst: &DecodedInst, assembler: &dyn CodeAssembler) -> bool {
        assembler.supports_memory_shadow()
            && (assembler.reads_memory(inst) || assembler.writes_memory(inst))
    }

    fn generate(
        &self,
        inst: &DecodedInst,
        position: InstPosition,
        assembler: &dyn CodeAssembler,
    ) -> Vec<RelocInst> {
        match position {
            InstPosition::Pre if self.record.contains(MemoryAccessType::READ) && assembler.reads_memory(inst) => {
                assembler.gen_memory_shadow_code(inst, position, MemoryAccessType::READ)
            }
            InstPosition::Post if self.record.contains(MemoryAccessType::WRITE) && assembler.writes_memory(inst) => {
                assembler.gen_memory_shadow_code(inst, position, MemoryAccessType::WRITE)
            }
            // REP-prefixed reads get a second, POST-position fragment
            // recording the total byte count (§4.10); the PRE fragment
            // above already recorded the first access with its size
            // unknown.
            InstPosition::Post
                if self.record.contains(MemoryAccessType::READ)
                    && assembler.reads_memory(inst)
                    && assembler.is_rep_prefixed(inst) =>
            {
                assembler.gen_memory_shadow_code(inst, position, MemoryAccessType::READ)
            }
            _ => Vec::new(),
        }
    }

    fn positions(&self) -> &[InstPosition] {
        &[InstPosition::Pre, InstPosition::Post]
    }

    fn pass(&self) -> Pass {
        Pass::FIRST
    }
}
