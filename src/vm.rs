//! The public instrumentation surface: the facade embedders construct and
//! drive, wrapping an [`Engine`] with the three callback-registration
//! shapes, cache control, and the guest-call convenience wrappers.
//!
//! Grounded on QBDI's `VM` class (`original_source/include/QBDI/VM.h`):
//! the thin public wrapper around the (non-public) `Engine`, including its
//! `call`/`callA`/`callV` trio of argument-passing conveniences.

use alloc::{boxed::Box, vec::Vec};

use crate::{
    analysis::{AnalysisType, InstAnalysis, SymbolResolver},
    assembler::{CodeAssembler, DecodedInst},
    broker::TransferHandler,
    callback::{
        EventId, InstCallback, InstFilter, InstPosition, InstrumentCallback, VMCallback, VMEvent,
    },
    engine::{Engine, RunOutcome},
    error::EngineResult,
    memory_access::MemoryAccessType,
    options::EngineParams,
    range::{GuestAddr, Range},
    registers::{GuestRegisters, RegId, RegValue},
};

/// The mutable state exposed to a running callback: the live register
/// file, and which instruction triggered the callback.
///
/// Deliberately not generic over the assembler type, so callback closures
/// (stored in [`crate::callback::CallbackRegistration`]) don't force every
/// caller of this crate to name a concrete `CodeAssembler` type.
pub struct CallbackContext<'a> {
    /// The live register file. Writes here are observed by the
    /// currently-executing block on resume.
    pub registers: &'a mut GuestRegisters,
    /// Address of the instruction this callback fired for (or of the
    /// basic block, for a [`VMEvent`] callback).
    pub instruction_address: GuestAddr,
}

impl CallbackContext<'_> {
    /// Read a general-purpose register.
    pub fn gpr(&self, id: RegId) -> RegValue {
        self.registers.gpr(id)
    }

    /// Write a general-purpose register, observed immediately by the
    /// executing block.
    pub fn set_gpr(&mut self, id: RegId, value: RegValue) {
        self.registers.set_gpr(id, value);
    }
}

/// One argument to a guest call made through [`VM::call`] or
/// [`VM::call_a`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallArg {
    /// A plain integer/pointer-sized argument.
    Int(u64),
    /// A floating-point argument, carried as its bit pattern.
    Float(u64),
}

/// The public VM facade.
pub struct VM<A: CodeAssembler> {
    engine: Engine<A>,
}

impl<A: CodeAssembler> VM<A> {
    /// Construct a VM for the given assembler facade and parameters.
    pub fn new(assembler: A, params: EngineParams) -> Self {
        Self {
            engine: Engine::new(assembler, params),
        }
    }

    /// Direct access to the underlying engine, for callers that need
    /// lower-level control (e.g. registering architecture patch rules).
    pub fn engine_mut(&mut self) -> &mut Engine<A> {
        &mut self.engine
    }

    /// Add a guest range to the instrumented set.
    pub fn add_instrumented_range(&mut self, start: GuestAddr, end: GuestAddr) {
        self.engine.add_instrumented_range(Range::new(start, end));
    }

    /// Instrument the whole address space.
    pub fn add_instrumented_range_all(&mut self) {
        self.engine
            .add_instrumented_range(Range::new(GuestAddr::MIN, GuestAddr::MAX));
    }

    /// Remove a guest range from the instrumented set.
    pub fn remove_instrumented_range(&mut self, start: GuestAddr, end: GuestAddr) {
        self.engine
            .remove_instrumented_range(Range::new(start, end));
    }

    /// Remove every guest range from the instrumented set.
    pub fn remove_all_instrumented_ranges(&mut self) {
        self.engine.remove_all_instrumented_ranges();
    }

    /// `true` if `addr` falls within an instrumented range.
    pub fn is_instrumented(&self, addr: GuestAddr) -> bool {
        self.engine.broker().is_instrumented(addr)
    }

    /// Attach the handler used to hand execution off to native code at the
    /// instrumented-range boundary.
    pub fn set_transfer_handler(&mut self, handler: Box<dyn TransferHandler>) {
        self.engine.broker_mut().set_transfer_handler(handler);
    }

    /// Attach a symbol resolver, consulted by `get_inst_analysis` whenever
    /// `AnalysisType::SYMBOL` is requested. Passing `None` clears it.
    pub fn set_symbol_resolver(&mut self, resolver: Option<Box<dyn SymbolResolver>>) {
        self.engine.set_symbol_resolver(resolver);
    }

    /// Register a callback firing at `position` relative to every
    /// instruction (no filter). For callbacks that need to filter by
    /// operand shape rather than address/mnemonic, register a
    /// [`crate::rules::InstrRule`] via [`Self::add_instr_rule`] instead.
    pub fn add_code_cb(&mut self, position: InstPosition, callback: InstCallback) -> EventId {
        self.engine.add_inst_cb(position, InstFilter::All, callback)
    }

    /// Register a callback firing at `position` only for the instruction
    /// at the exact address `addr`.
    pub fn add_code_addr_cb(
        &mut self,
        addr: GuestAddr,
        position: InstPosition,
        callback: InstCallback,
    ) -> EventId {
        self.engine
            .add_inst_cb(position, InstFilter::Address(addr), callback)
    }

    /// Register a callback firing at `position` for every instruction
    /// within `[start, end)`.
    pub fn add_code_range_cb(
        &mut self,
        start: GuestAddr,
        end: GuestAddr,
        position: InstPosition,
        callback: InstCallback,
    ) -> EventId {
        self.engine.add_inst_cb(
            position,
            InstFilter::InRange(Range::new(start, end)),
            callback,
        )
    }

    /// Register a callback firing at `position` for every instruction
    /// whose mnemonic matches `mnemonic` (case insensitive, exact match;
    /// see [`InstFilter::Mnemonic`] for the prefix-family caveat).
    pub fn add_mnemonic_cb(
        &mut self,
        mnemonic: &str,
        position: InstPosition,
        callback: InstCallback,
    ) -> EventId {
        self.engine.add_inst_cb(
            position,
            InstFilter::Mnemonic(mnemonic.into()),
            callback,
        )
    }

    /// Register a full [`crate::rules::InstrRule`], for callbacks that
    /// need to filter by mnemonic, address range, or operand shape.
    pub fn add_instr_rule(&mut self, rule: Box<dyn crate::rules::InstrRule>) -> EventId {
        self.engine.add_instr_rule(rule)
    }

    /// Register a full [`crate::rules::InstrRule`] scoped to `[start, end)`:
    /// only instructions inside that range are offered to it, and
    /// adding/removing it invalidates exactly that range rather than the
    /// whole cache.
    pub fn add_instr_rule_range(
        &mut self,
        start: GuestAddr,
        end: GuestAddr,
        rule: Box<dyn crate::rules::InstrRule>,
    ) -> EventId {
        self.engine
            .add_instr_rule_range(crate::range::Range::new(start, end), rule)
    }

    /// Register a VM-event callback.
    pub fn add_vm_event_cb(&mut self, events: VMEvent, callback: VMCallback) -> EventId {
        self.engine.add_vm_event_cb(events, callback)
    }

    /// Register a memory-access callback over `[start, end)`.
    pub fn add_mem_range_cb(
        &mut self,
        start: GuestAddr,
        end: GuestAddr,
        access_type: MemoryAccessType,
        callback: InstrumentCallback,
    ) -> EventId {
        self.engine
            .add_mem_range_cb(Range::new(start, end), access_type, callback)
    }

    /// Register a memory-access callback firing on every access in the
    /// instrumented set, regardless of address.
    pub fn add_mem_access_cb(
        &mut self,
        access_type: MemoryAccessType,
        callback: InstrumentCallback,
    ) -> EventId {
        self.add_mem_range_cb(GuestAddr::MIN, GuestAddr::MAX, access_type, callback)
    }

    /// Explicitly enable memory-access shadow recording for `access_type`,
    /// without registering a callback. `add_mem_range_cb`/`add_mem_access_cb`
    /// already call this internally the first time they're used; most
    /// callers only need this directly when they want `get_inst_memory_access`
    /// / `get_bb_memory_access` without also registering a gate callback.
    /// Returns `false` if the assembler facade can't generate shadow-recording
    /// code at all.
    pub fn record_memory_access(&mut self, access_type: MemoryAccessType) -> bool {
        self.engine.ensure_memory_shadow(access_type)
    }

    /// Accesses recorded for the instruction at `addr`, within the current
    /// (or most recently executed) basic block. Empty if memory-access
    /// recording was never enabled via [`Self::record_memory_access`] or a
    /// memory callback registration.
    pub fn get_inst_memory_access(&self, addr: GuestAddr) -> Vec<crate::memory_access::MemoryAccess> {
        self.engine.inst_memory_accesses(addr)
    }

    /// Every access recorded so far in the current (or most recently
    /// executed) basic block.
    pub fn get_bb_memory_access(&self) -> Vec<crate::memory_access::MemoryAccess> {
        self.engine.block_memory_accesses().to_vec()
    }

    /// Remove a previously registered callback or rule.
    pub fn delete_instrumentation(&mut self, id: EventId) -> bool {
        self.engine.delete_instrumentation(id)
    }

    /// Remove every registered callback and rule.
    pub fn delete_all_instrumentations(&mut self) {
        self.engine.delete_all_instrumentations();
    }

    /// Read a general-purpose register from the canonical file.
    pub fn gpr(&self, id: RegId) -> RegValue {
        self.engine.registers().gpr(id)
    }

    /// Write a general-purpose register in the canonical file.
    pub fn set_gpr(&mut self, id: RegId, value: RegValue) {
        self.engine.active_registers_mut().set_gpr(id, value);
    }

    /// Read a floating-point register from the canonical file.
    pub fn fpr(&self, id: RegId) -> RegValue {
        self.engine.registers().fpr(id)
    }

    /// Write a floating-point register in the canonical file.
    pub fn set_fpr(&mut self, id: RegId, value: RegValue) {
        self.engine.active_registers_mut().set_fpr(id, value);
    }

    /// Pre-translate the basic block at `addr` without executing it, so
    /// the first real run doesn't pay translation latency.
    pub fn precache_basic_block(
        &mut self,
        addr: GuestAddr,
        fetch: &dyn Fn(GuestAddr, usize) -> Vec<u8>,
    ) -> EngineResult<()> {
        self.engine.run_precache_only(addr, fetch)
    }

    /// Evict the cached translation covering `[start, end)`.
    pub fn clear_cache(&mut self, start: GuestAddr, end: GuestAddr) {
        self.engine.clear_cache(Range::new(start, end));
    }

    /// Evict every cached translation.
    pub fn clear_all_cache(&mut self) {
        self.engine.clear_all_cache();
    }

    /// Analyze the instruction at `addr`, decoding it first if needed.
    pub fn get_inst_analysis(
        &mut self,
        addr: GuestAddr,
        analysis_type: AnalysisType,
        fetch: &dyn Fn(GuestAddr, usize) -> Vec<u8>,
    ) -> EngineResult<InstAnalysis> {
        let bytes = fetch(addr, 16);
        let decoded: DecodedInst = self.engine.decode_for_analysis(&bytes, addr)?;
        Ok(self
            .engine
            .analyze_instruction(&decoded, analysis_type)
            .clone())
    }

    /// Run instrumented execution starting at `start` until a callback
    /// stops it or execution transfers out of the instrumented set.
    pub fn run(
        &mut self,
        start: GuestAddr,
        fetch: &dyn Fn(GuestAddr, usize) -> Vec<u8>,
    ) -> EngineResult<RunOutcome> {
        self.engine.run(start, fetch)
    }

    /// Call a guest function at `addr` with plain integer arguments,
    /// seeding the calling-convention-defined argument registers and
    /// running until it returns.
    ///
    /// `arg_regs` names, in order, which general-purpose registers the
    /// target architecture's calling convention passes arguments in; this
    /// crate has no notion of a calling convention of its own.
    pub fn call(
        &mut self,
        addr: GuestAddr,
        args: &[u64],
        arg_regs: &[RegId],
        fetch: &dyn Fn(GuestAddr, usize) -> Vec<u8>,
    ) -> EngineResult<RunOutcome> {
        for (&value, &reg) in args.iter().zip(arg_regs) {
            self.set_gpr(reg, value);
        }
        self.run(addr, fetch)
    }

    /// Call a guest function with arguments of mixed int/float shape, per
    /// [`CallArg`].
    pub fn call_a(
        &mut self,
        addr: GuestAddr,
        args: &[CallArg],
        arg_regs: &[RegId],
        fetch: &dyn Fn(GuestAddr, usize) -> Vec<u8>,
    ) -> EngineResult<RunOutcome> {
        for (arg, &reg) in args.iter().zip(arg_regs) {
            match *arg {
                CallArg::Int(v) => self.set_gpr(reg, v),
                CallArg::Float(v) => self.set_fpr(reg, v),
            }
        }
        self.run(addr, fetch)
    }

}

/// Call a guest function with a variadic-style argument list, mirroring
/// QBDI's C varargs `callV` (`original_source/include/QBDI/VM.h`) — the
/// third of the three call-argument shapes, for call sites that already
/// have their arguments as a bare comma-separated list rather than an
/// array built up ahead of time. Each argument is wrapped as
/// [`CallArg::Int`] and forwarded to [`VM::call_a`].
#[macro_export]
macro_rules! call_va {
    ($vm:expr, $addr:expr, $arg_regs:expr, $fetch:expr $(, $arg:expr)* $(,)?) => {
        $vm.call_a(
            $addr,
            &[$($crate::vm::CallArg::Int($arg as u64)),*],
            $arg_regs,
            $fetch,
        )
    };
}
