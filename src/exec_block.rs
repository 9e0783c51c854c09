//! A single translated basic block: its host-code arenas, and the context
//! handed to the assembler facade while it's executing.
//!
//! Grounded on QBDI's `ExecBlock` (`src/ExecBlock/ExecBlock.h`): a paired
//! RX (executable) and RW (writable) memory arena per block, so the engine
//! never needs a writable-and-executable mapping. The teacher crate has no
//! direct analogue (it interprets bytecode rather than JITing), so the
//! arena-ownership shape here follows QBDI directly, while the surrounding
//! `Debug`/`Clone` derive conventions and doc density follow the teacher's
//! `state::debugger` module.

use alloc::vec::Vec;

use crate::{
    memory_access::ShadowSpace,
    range::GuestAddr,
    registers::GuestRegisters,
};

/// Why an [`ExecBlock::execute`] call returned control to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// The block ran to completion and fell through (or branched) to
    /// guest code outside the block; `next_pc` in the context names
    /// where.
    BranchOut,
    /// A callback requested [`crate::callback::VMAction::Stop`].
    Stopped,
    /// A callback requested
    /// [`crate::callback::VMAction::BreakToVm`]: this block's cached
    /// translation must be discarded before re-entry.
    BreakToVm,
    /// Execution left the instrumented range entirely (a call or jump to
    /// native code); `next_pc` names the native entry point.
    ExecTransfer,
}

/// The mutable state threaded through one [`ExecBlock::execute`] call: the
/// live register file and the shadow-recording scratch space, both owned
/// by the block for the duration of the call and handed back to the engine
/// (as the "live" copy, see [`crate::registers::RegisterStorage`]) once it
/// returns.
#[derive(Debug)]
pub struct BlockContext {
    /// The live register file.
    pub registers: GuestRegisters,
    /// Shadow-recording scratch space for this execution.
    pub shadow: ShadowSpace,
    /// Set by the trampoline when it returns control: where guest
    /// execution should resume.
    pub next_pc: GuestAddr,
}

impl BlockContext {
    /// Build a context seeding the live registers from `registers`.
    pub fn new(registers: GuestRegisters, shadow: ShadowSpace) -> Self {
        Self {
            registers,
            shadow,
            next_pc: 0,
        }
    }
}

/// One translated basic block: its guest address range, the sequence of
/// patches making it up, and the host code emitted from them.
///
/// The RX/RW split modeled by [`ExecBlock`] is conceptual in this crate
/// (the actual page-permission toggling is the assembler facade's
/// responsibility, not something this crate can do without `unsafe`): `rx`
/// holds the host bytes as last finalized, `rw` is the staging buffer
/// `write_basic_block` assembles into before `rx` is published.
#[derive(Debug, Clone)]
pub struct ExecBlock {
    /// Guest address this block was translated from.
    pub guest_start: GuestAddr,
    /// One past the guest address of the last instruction translated into
    /// this block.
    pub guest_end: GuestAddr,
    /// Load address of this block's host code, once placed.
    pub load_addr: u64,
    /// Finalized host code, ready to execute.
    rx: Vec<u8>,
    /// Staging buffer for the next `write_basic_block` call.
    rw: Vec<u8>,
    /// Patches making up this block, kept for `InstAnalysis` and
    /// `delete_instrumentation` bookkeeping.
    pub patches: Vec<crate::patch::Patch>,
}

impl ExecBlock {
    /// An empty block covering `[guest_start, guest_start)`, not yet
    /// written to.
    pub fn empty(guest_start: GuestAddr) -> Self {
        Self {
            guest_start,
            guest_end: guest_start,
            load_addr: 0,
            rx: Vec::new(),
            rw: Vec::new(),
            patches: Vec::new(),
        }
    }

    /// `true` if this block has been written to at least once.
    pub fn is_built(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Stage a freshly translated basic block: encode every patch's
    /// flattened instruction sequence against `load_addr` and extend the
    /// block's guest range.
    ///
    /// Returns `Err` if any patch fails to encode; on error, the block is
    /// left unchanged (the staging buffer is discarded, `rx` keeps
    /// whatever it held before).
    pub fn write_basic_block(
        &mut self,
        patches: Vec<crate::patch::Patch>,
        load_addr: u64,
        assembler: &dyn crate::assembler::CodeAssembler,
    ) -> Result<(), crate::error::EngineError> {
        let mut staged = Vec::new();
        for patch in &patches {
            for reloc in patch.flattened() {
                let bytes = assembler.encode(reloc, load_addr)?;
                staged.extend(bytes);
            }
        }

        self.guest_end = patches
            .last()
            .map(|p| p.address.saturating_add(p.inst_size as GuestAddr))
            .unwrap_or(self.guest_start);
        self.load_addr = load_addr;
        self.rw = staged;
        core::mem::swap(&mut self.rx, &mut self.rw);
        self.patches = patches;
        Ok(())
    }

    /// Run this block's finalized host code against `ctx` until it
    /// yields. `dispatch` is invoked once per spliced dispatch point
    /// (unfiltered instruction callbacks, the memory-access gate) reached
    /// during execution; see [`crate::assembler::CodeAssembler::execute_block`].
    pub fn execute(
        &self,
        ctx: &mut BlockContext,
        assembler: &dyn crate::assembler::CodeAssembler,
        dispatch: &mut dyn FnMut(
            crate::callback::DispatchTrigger,
            &mut BlockContext,
        ) -> crate::callback::VMAction,
    ) -> BlockExit {
        assembler.execute_block(&self.rx, ctx, dispatch)
    }

    /// The patch translated from the instruction at `addr`, if this block
    /// contains one.
    pub fn patch_at(&self, addr: GuestAddr) -> Option<&crate::patch::Patch> {
        self.patches.iter().find(|p| p.address == addr)
    }
}
