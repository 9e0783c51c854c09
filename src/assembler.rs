//! The assembler facade: the narrow seam through which the translation
//! pipeline reaches the architecture-specific disassembler and code
//! emitter.
//!
//! Per the design, the real disassembler and the tables of encoded patch
//! templates are out of scope for this crate — they are architecture-
//! specific collaborators the core only ever calls through this trait.
//! Grounded on the teacher crate's `storage::InterpreterStorage`: an
//! external trait the engine is generic over and never owns, queried
//! on-demand rather than cached beyond what the caller asks for.

use alloc::{
    string::String,
    vec::Vec,
};

use crate::{
    callback::{DispatchTrigger, InstPosition, VMAction},
    error::EngineError,
    memory_access::MemoryAccessType,
    patch::RelocInst,
    range::GuestAddr,
};

/// A single guest instruction as decoded by the assembler facade.
///
/// Kept deliberately thin: the core never interprets the instruction's
/// semantics itself (that's the patch rule's job, via the facade's own
/// query methods), it only needs address/size bookkeeping and a handle it
/// can hand back to the facade for mnemonic/operand queries.
#[derive(Debug, Clone)]
pub struct DecodedInst {
    /// Address of this instruction in guest memory.
    pub address: GuestAddr,
    /// Encoded size of this instruction, in bytes.
    pub size: u8,
    /// Raw encoded bytes, as read from guest memory.
    pub bytes: Vec<u8>,
    /// Opaque mnemonic/operand handle; architecture-specific, produced and
    /// interpreted only by the assembler facade that decoded it.
    pub opcode: u32,
}

impl DecodedInst {
    /// Address one past the end of this instruction.
    pub fn next_address(&self) -> GuestAddr {
        self.address.saturating_add(self.size as GuestAddr)
    }
}

/// Coarse control-flow classification of a decoded instruction, used by
/// patch rules to decide `modify_pc` and by `InstAnalysis`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ControlFlow {
    /// Falls through to the next instruction.
    Sequential,
    /// Unconditional direct or indirect jump.
    Jump,
    /// Conditional branch.
    Branch,
    /// Call instruction (pushes/links a return address).
    Call,
    /// Return instruction.
    Return,
}

/// The architecture-specific collaborator the translation pipeline
/// disassembles guest bytes through and emits host instructions through.
///
/// Implementations of this trait are exactly the "out of scope" pieces
/// named in the specification: the real disassembler and the tables of
/// encoded patch templates. This crate ships only a toy implementation,
/// under `test-helpers`, sufficient to exercise the pipeline end to end.
pub trait CodeAssembler {
    /// Decode one instruction starting at `addr` from `bytes` (which must
    /// begin at `addr`, i.e. `bytes[0]` is the first byte at `addr`).
    fn decode(&self, bytes: &[u8], addr: GuestAddr) -> Result<DecodedInst, EngineError>;

    /// The instruction's mnemonic, e.g. `"MOV"`, `"CALL"`. Used by mnemonic
    /// filters and by `InstAnalysis`.
    fn mnemonic(&self, inst: &DecodedInst) -> String;

    /// This instruction's control-flow classification.
    fn control_flow(&self, inst: &DecodedInst) -> ControlFlow;

    /// `true` if this instruction reads memory (other than instruction
    /// fetch), used to drive memory-access shadow recording.
    fn reads_memory(&self, inst: &DecodedInst) -> bool;

    /// `true` if this instruction writes memory.
    fn writes_memory(&self, inst: &DecodedInst) -> bool;

    /// Decode `inst`'s operands, for [`crate::analysis::AnalysisType::OPERANDS`].
    /// Default empty: a facade that can't (or doesn't need to) decode
    /// operand shape just reports none, the same way
    /// [`Self::supports_memory_shadow`] defaults to unsupported rather than
    /// every implementer having to opt out explicitly.
    fn operands(&self, inst: &DecodedInst) -> Vec<crate::analysis::Operand> {
        let _ = inst;
        Vec::new()
    }

    /// `true` if this is a REP-prefixed (or architecturally equivalent)
    /// string instruction whose access count is only known at runtime.
    fn is_rep_prefixed(&self, inst: &DecodedInst) -> bool {
        let _ = inst;
        false
    }

    /// `true` if this instruction's memory operand is wider than a guest
    /// word (e.g. a vector load/store); its value is not recorded.
    fn is_wide_vector_access(&self, inst: &DecodedInst) -> bool {
        let _ = inst;
        false
    }

    /// Finalize a relocatable host instruction against its eventual load
    /// address, producing the host bytes to place in the `ExecBlock`'s RX
    /// arena.
    fn encode(&self, reloc: &RelocInst, load_addr: u64) -> Result<Vec<u8>, EngineError>;

    /// Produce the relocatable fragment that, once placed in the `ExecBlock`
    /// arena, calls back into the engine's dispatch trampoline for `trigger`
    /// when reached. Used both for unfiltered `add_code_cb` registrations
    /// (spliced at every instruction) and for the memory-access gate
    /// checkpoint.
    fn gen_dispatch_marker(&self, trigger: DispatchTrigger) -> RelocInst;

    /// `true` if this facade can generate the inline address/value
    /// recording code [`Self::gen_memory_shadow_code`] needs; `false` on
    /// architectures (or test doubles) that don't support it, per spec
    /// §4.10 ("on others these calls return false").
    fn supports_memory_shadow(&self) -> bool {
        false
    }

    /// Produce the relocatable fragment recording `access_type` for `inst`
    /// at `position`, tagging shadow slots per §4.10 (`MEM_READ_ADDRESS_TAG`
    /// PRE, `MEM_WRITE_ADDRESS_TAG` POST, `MEM_VALUE_TAG` for the paired
    /// value). Only called when [`Self::supports_memory_shadow`] is `true`
    /// and the instruction's `reads_memory`/`writes_memory` matches
    /// `access_type`.
    fn gen_memory_shadow_code(
        &self,
        inst: &DecodedInst,
        position: InstPosition,
        access_type: MemoryAccessType,
    ) -> Vec<RelocInst> {
        let _ = (inst, position, access_type);
        Vec::new()
    }

    /// Execute a fully materialized sequence of host code against the
    /// given context, returning when the sequence yields (at a sequence
    /// boundary, a dispatch point, or a `STOP`).
    ///
    /// `dispatch` is called once per [`DispatchTrigger`] reached while
    /// executing `code`; its return value tells the facade whether to keep
    /// running, unwind to `BreakToVm`, or stop. This is the one operation
    /// that is inherently unsafe on a real backend (it transfers control to
    /// dynamically generated code); the core crate forbids `unsafe` itself
    /// and delegates the actual jump to the facade implementation, which
    /// owns the architecture-specific trampoline.
    fn execute_block(
        &self,
        code: &[u8],
        ctx: &mut crate::exec_block::BlockContext,
        dispatch: &mut dyn FnMut(DispatchTrigger, &mut crate::exec_block::BlockContext) -> VMAction,
    ) -> crate::exec_block::BlockExit;
}
