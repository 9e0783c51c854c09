//! The translation and execution engine: owns the canonical register file,
//! the execution-block cache, the broker, and the registered rules and
//! callbacks, and drives the run loop that ties them together.
//!
//! Grounded on the teacher crate's `Interpreter`
//! (`interpreter::executors::main::run_program`) for the run-loop shape —
//! decode/translate/execute/check-for-yield, repeated until a terminal
//! condition — generalized from "run a whole program to completion" to
//! "run until the next callback-requested stop", and on QBDI's `Engine`
//! (`original_source/src/Engine/Engine.h`) for the registration surface
//! this type exposes to [`crate::vm::VM`].

use alloc::{boxed::Box, vec::Vec};

use crate::{
    analysis::{AnalysisCache, SymbolResolver},
    assembler::CodeAssembler,
    block_manager::{BlockHandle, ExecBlockManager},
    broker::ExecBroker,
    callback::{
        CallbackRegistration, DispatchTrigger, EventId, EventIdBand, InstCallback, InstFilter,
        InstPosition, InstrumentCallback, VMAction, VMCallback, VMEvent, VMState,
    },
    consts,
    error::{BugVariant, EngineError, EngineResult},
    exec_block::{BlockContext, BlockExit, ExecBlock},
    memory_access::{MemoryAccess, MemoryAccessType, ShadowSpace},
    options::EngineParams,
    patch::Patch,
    range::{GuestAddr, Range},
    registers::{GuestRegisters, RegisterStorage},
    rules::{InstrRule, InstrRuleEntry, PatchRuleTable},
    vm::CallbackContext,
};

/// Outcome of [`Engine::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A callback requested `Stop`.
    Stopped,
    /// Execution transferred to native code that did not return back into
    /// the instrumented range.
    TransferredOut,
    /// The broker declined the transfer via
    /// [`crate::broker::ExecBroker::can_transfer_execution`]. Per spec.md
    /// §7's "Broker refusal" case, no `EXEC_TRANSFER_CALL` was signaled and
    /// `pc` is left exactly where it was.
    BrokerRefused,
}

/// The strongest of two [`VMAction`]s a dispatch point must resolve to,
/// when more than one registered callback fires at the same trigger.
/// `Stop` dominates `BreakToVm`, which dominates `Continue`: callbacks are
/// invoked in registration order, but a later callback can only escalate
/// the verdict an earlier one requested, never downgrade it.
fn combine_action(a: VMAction, b: VMAction) -> VMAction {
    match (a, b) {
        (VMAction::Stop, _) | (_, VMAction::Stop) => VMAction::Stop,
        (VMAction::BreakToVm, _) | (_, VMAction::BreakToVm) => VMAction::BreakToVm,
        _ => VMAction::Continue,
    }
}

/// Owns every piece of mutable engine state and drives translation and
/// execution.
///
/// Generic over the assembler facade so the core never depends on a
/// concrete architecture; see [`CodeAssembler`].
pub struct Engine<A: CodeAssembler> {
    assembler: A,
    params: EngineParams,
    canonical_registers: GuestRegisters,
    storage: RegisterStorage,
    block_manager: ExecBlockManager,
    broker: ExecBroker,
    patch_rules: PatchRuleTable,
    instr_rules: Vec<InstrRuleEntry>,
    callbacks: Vec<(EventId, CallbackRegistration)>,
    analysis_cache: AnalysisCache,
    symbol_resolver: Option<Box<dyn SymbolResolver>>,
    next_instr_rule_index: u32,
    next_vm_event_index: u32,
    next_mem_range_index: u32,
    /// Id of the built-in memory-shadow rule, if `record_memory_access` has
    /// ever been called; re-registering upgrades in place rather than
    /// stacking a second rule.
    memory_shadow_rule_id: Option<EventId>,
    /// Access types currently being shadow-recorded.
    memory_shadow_record: MemoryAccessType,
    /// Accesses recorded so far in the basic block currently (or most
    /// recently) executing; cleared at `BASIC_BLOCK_ENTRY`.
    block_accesses: Vec<MemoryAccess>,
}

impl<A: CodeAssembler> Engine<A> {
    /// Construct a fresh engine with an empty register file, empty caches,
    /// and no registered rules.
    pub fn new(assembler: A, params: EngineParams) -> Self {
        let registers = GuestRegisters::new(params.gpr_count, params.fpr_count);
        Self {
            assembler,
            params,
            canonical_registers: registers,
            storage: RegisterStorage::Canonical,
            block_manager: ExecBlockManager::new(),
            broker: ExecBroker::new(),
            patch_rules: PatchRuleTable::new(),
            instr_rules: Vec::new(),
            callbacks: Vec::new(),
            analysis_cache: AnalysisCache::new(),
            symbol_resolver: None,
            next_instr_rule_index: 0,
            next_vm_event_index: 0,
            next_mem_range_index: 0,
            memory_shadow_rule_id: None,
            memory_shadow_record: MemoryAccessType::empty(),
            block_accesses: Vec::new(),
        }
    }

    /// Engine construction parameters, as passed to [`Self::new`].
    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    /// The patch rule table, mutable so callers can register architecture
    /// rules before the first call to [`Self::run`].
    pub fn patch_rules_mut(&mut self) -> &mut PatchRuleTable {
        &mut self.patch_rules
    }

    /// Read the canonical register file. Between block executions this is
    /// also the live file; see [`RegisterStorage`].
    pub fn registers(&self) -> &GuestRegisters {
        &self.canonical_registers
    }

    /// Mutably access whichever register-file copy is currently active.
    /// Used by callback invocation so a callback firing mid-execution
    /// writes the live copy the running block will observe on resume.
    pub fn active_registers_mut(&mut self) -> &mut GuestRegisters {
        &mut self.canonical_registers
    }

    /// Add a guest range to the instrumented set.
    pub fn add_instrumented_range(&mut self, range: Range<GuestAddr>) {
        self.broker.add_instrumented_range(range);
    }

    /// Remove a guest range from the instrumented set, invalidating any
    /// cached translations it overlapped.
    pub fn remove_instrumented_range(&mut self, range: Range<GuestAddr>) {
        self.broker.remove_instrumented_range(range);
        self.block_manager.invalidate_range(range);
        self.analysis_cache.invalidate_range(range);
    }

    /// Remove every guest range from the instrumented set.
    pub fn remove_all_instrumented_ranges(&mut self) {
        self.broker.remove_all_instrumented_ranges();
        self.block_manager.invalidate_all();
        self.analysis_cache.clear();
    }

    /// Register an [`InstrRule`] with no applicability range, returning the
    /// id it can later be removed by. Applies everywhere, so invalidates
    /// every cached block, since any of them may now need the new rule's
    /// instrumentation spliced in.
    pub fn add_instr_rule(&mut self, rule: Box<dyn InstrRule>) -> EventId {
        let id = EventId::new(EventIdBand::InstrRule, self.next_instr_rule_index);
        self.next_instr_rule_index += 1;
        self.instr_rules.push(InstrRuleEntry {
            id,
            rule,
            range: None,
        });
        self.block_manager.invalidate_all();
        id
    }

    /// Register an [`InstrRule`] scoped to `range`: only instructions
    /// inside `range` are offered to it. Per spec.md:84,89, adding or
    /// removing a range-scoped rule invalidates exactly its applicability
    /// range rather than the whole cache.
    pub fn add_instr_rule_range(&mut self, range: Range<GuestAddr>, rule: Box<dyn InstrRule>) -> EventId {
        let id = EventId::new(EventIdBand::InstrRule, self.next_instr_rule_index);
        self.next_instr_rule_index += 1;
        self.instr_rules.push(InstrRuleEntry {
            id,
            rule,
            range: Some(range),
        });
        self.block_manager.invalidate_range(range);
        id
    }

    /// Register a VM-event callback.
    pub fn add_vm_event_cb(&mut self, events: VMEvent, callback: VMCallback) -> EventId {
        let id = EventId::new(EventIdBand::VmEvent, self.next_vm_event_index);
        self.next_vm_event_index += 1;
        self.callbacks
            .push((id, CallbackRegistration::Event { events, callback }));
        id
    }

    /// Register an instruction-position callback, filtered per `filter`,
    /// without going through a full [`InstrRule`]. Backs
    /// `add_code_cb`/`add_code_addr_cb`/`add_code_range_cb`/`add_mnemonic_cb`.
    pub fn add_inst_cb(
        &mut self,
        position: InstPosition,
        filter: InstFilter,
        callback: InstCallback,
    ) -> EventId {
        let id = EventId::new(EventIdBand::InstrRule, self.next_instr_rule_index);
        self.next_instr_rule_index += 1;
        self.callbacks.push((
            id,
            CallbackRegistration::Instruction {
                position,
                filter,
                callback,
            },
        ));
        self.block_manager.invalidate_all();
        id
    }

    /// Register a memory-range callback. The first call into this
    /// (transitively, from [`crate::vm::VM`]) enables shadow recording for
    /// `access_type` if it isn't already on.
    pub fn add_mem_range_cb(
        &mut self,
        range: Range<GuestAddr>,
        access_type: MemoryAccessType,
        callback: InstrumentCallback,
    ) -> EventId {
        self.ensure_memory_shadow(access_type);
        let id = EventId::new(EventIdBand::MemRange, self.next_mem_range_index);
        self.next_mem_range_index += 1;
        self.callbacks.push((
            id,
            CallbackRegistration::MemoryRange {
                range,
                access_type,
                callback,
            },
        ));
        id
    }

    /// Enable memory-access shadow recording for (at least) `access_type`.
    /// Idempotent: calling again with an access type already covered is a
    /// no-op; calling with a wider type upgrades the installed rule in
    /// place (one rule, re-registered under the same id, never stacked).
    /// Returns `false`, logged, if the assembler facade can't generate
    /// shadow-recording code at all.
    pub fn ensure_memory_shadow(&mut self, access_type: MemoryAccessType) -> bool {
        if !self.assembler.supports_memory_shadow() {
            tracing::warn!(
                "record_memory_access: assembler facade does not support shadow recording"
            );
            return false;
        }
        let combined = self.memory_shadow_record | access_type;
        if combined == self.memory_shadow_record && self.memory_shadow_rule_id.is_some() {
            return true;
        }

        if let Some(id) = self.memory_shadow_rule_id {
            self.instr_rules.retain(|entry| entry.id != id);
        }
        let id = self.memory_shadow_rule_id.unwrap_or_else(|| {
            let id = EventId::new(EventIdBand::InstrRule, self.next_instr_rule_index);
            self.next_instr_rule_index += 1;
            id
        });
        self.instr_rules.push(InstrRuleEntry {
            id,
            rule: Box::new(crate::rules::MemoryShadowRule::new(combined)),
            range: None,
        });
        self.memory_shadow_rule_id = Some(id);
        self.memory_shadow_record = combined;
        self.block_manager.invalidate_all();
        true
    }

    /// Remove a previously registered callback or instrumentation rule.
    /// Returns `false` (and logs) if `id` doesn't name a live
    /// registration, per the error taxonomy's "invalid registration is a
    /// logged no-op" rule.
    pub fn delete_instrumentation(&mut self, id: EventId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(existing, _)| *existing != id);
        if self.callbacks.len() != before {
            self.block_manager.invalidate_all();
            return true;
        }

        if let Some(pos) = self.instr_rules.iter().position(|entry| entry.id == id) {
            let removed = self.instr_rules.remove(pos);
            if self.memory_shadow_rule_id == Some(id) {
                self.memory_shadow_rule_id = None;
                self.memory_shadow_record = MemoryAccessType::empty();
            }
            match removed.range {
                Some(range) => self.block_manager.invalidate_range(range),
                None => self.block_manager.invalidate_all(),
            }
            return true;
        }

        tracing::warn!(id = id.raw(), "delete_instrumentation: unknown id");
        false
    }

    /// Remove every registered callback and instrumentation rule.
    pub fn delete_all_instrumentations(&mut self) {
        self.callbacks.clear();
        self.instr_rules.clear();
        self.memory_shadow_rule_id = None;
        self.memory_shadow_record = MemoryAccessType::empty();
        self.block_manager.invalidate_all();
    }

    /// Force eviction of the cached translation (if any) covering `range`.
    pub fn clear_cache(&mut self, range: Range<GuestAddr>) {
        self.block_manager.invalidate_range(range);
        self.block_manager.commit_pending_invalidations();
    }

    /// Force eviction of every cached translation.
    pub fn clear_all_cache(&mut self) {
        self.block_manager.invalidate_all();
        self.block_manager.commit_pending_invalidations();
    }

    /// Accesses recorded so far for the basic block currently (or most
    /// recently) executing.
    pub fn block_memory_accesses(&self) -> &[MemoryAccess] {
        &self.block_accesses
    }

    /// Accesses recorded for the single instruction at `addr`, within the
    /// current (or most recent) basic block.
    pub fn inst_memory_accesses(&self, addr: GuestAddr) -> Vec<MemoryAccess> {
        self.block_accesses
            .iter()
            .filter(|a| a.inst_address == addr)
            .copied()
            .collect()
    }

    /// Translate (or fetch the cached translation of) the basic block
    /// starting at `addr`, reading guest bytes from `fetch`. Returns
    /// whether this call built a fresh translation (`true`) or served one
    /// already cached (`false`), so the run loop knows whether to signal
    /// `BASIC_BLOCK_NEW`.
    pub(crate) fn translate_block(
        &mut self,
        addr: GuestAddr,
        fetch: &dyn Fn(GuestAddr, usize) -> Vec<u8>,
    ) -> EngineResult<(BlockHandle, bool)> {
        if let Some((handle, _)) = self.block_manager.lookup(addr) {
            return Ok((handle, false));
        }

        let mut patches: Vec<Patch> = Vec::new();
        let mut cursor = addr;
        let mut pending_merge: Option<Patch> = None;

        while patches.len() < consts::MAX_SEQUENCE_INSTS {
            let bytes = fetch(cursor, 16);
            let decoded = self
                .assembler
                .decode(&bytes, cursor)
                .map_err(|_| EngineError::Decode(cursor))?;

            let rule = self
                .patch_rules
                .find(&decoded, &self.assembler)
                .ok_or(EngineError::NoMatchingPatchRule(cursor))?;
            let mut patch = rule.generate(&decoded, &self.assembler)?;

            if let Some(mut prev) = pending_merge.take() {
                prev.body.extend(core::mem::take(&mut patch.body));
                patch = prev;
            }

            if patch.merge {
                pending_merge = Some(patch);
                cursor = decoded.next_address();
                continue;
            }

            self.splice_instrumentation(&mut patch, &decoded);

            let ends_block = patch.modify_pc;
            cursor = decoded.next_address();
            patches.push(patch);
            if ends_block {
                break;
            }
        }

        if pending_merge.is_some() {
            return Err(BugVariant::DanglingMergePatch.into());
        }

        let mut block = ExecBlock::empty(addr);
        block.write_basic_block(patches, addr, &self.assembler)?;
        Ok((self.block_manager.insert(block), true))
    }

    /// Ask every matching, pass-ordered [`InstrRule`] to contribute
    /// instrumentation fragments to `patch`, then splice in the dispatch
    /// markers that let the run loop invoke blanket instruction callbacks
    /// and the memory-access gate at this instruction.
    ///
    /// Per spec.md §5(c), the built-in memory-shadow rule is pinned
    /// globally first among PRE fragments and globally last among POST
    /// fragments — two independent orderings, not one group-then-group
    /// pass over both positions, since "first" and "last" are opposite
    /// ends of the splice order.
    fn splice_instrumentation(&self, patch: &mut Patch, decoded: &crate::assembler::DecodedInst) {
        let (shadow_entries, mut other_entries): (Vec<_>, Vec<_>) = self
            .instr_rules
            .iter()
            .partition(|e| Some(e.id) == self.memory_shadow_rule_id);
        other_entries.sort_by_key(|e| e.rule.pass());

        let splice_at = |patch: &mut Patch, entry: &InstrRuleEntry, position: InstPosition| {
            if let Some(range) = entry.range {
                if !range.contains(decoded.address) {
                    return;
                }
            }
            if !entry.rule.matches(decoded, &self.assembler) {
                return;
            }
            if !entry.rule.positions().contains(&position) {
                return;
            }
            let code = entry.rule.generate(decoded, position, &self.assembler);
            if code.is_empty() {
                return;
            }
            let splice_pos = match position {
                InstPosition::Pre => crate::patch::SplicePosition::Pre,
                InstPosition::Post => crate::patch::SplicePosition::Post,
            };
            patch.splice(crate::patch::SplicedInstrumentation {
                position: splice_pos,
                pass: entry.rule.pass(),
                rule_id: entry.id.raw(),
                code,
            });
        };

        for &entry in &shadow_entries {
            splice_at(patch, entry, InstPosition::Pre);
        }
        for &entry in &other_entries {
            splice_at(patch, entry, InstPosition::Pre);
        }
        for &entry in &other_entries {
            splice_at(patch, entry, InstPosition::Post);
        }
        for &entry in &shadow_entries {
            splice_at(patch, entry, InstPosition::Post);
        }

        let needs_mnemonic = self.callbacks.iter().any(|(_, reg)| {
            matches!(reg, CallbackRegistration::Instruction { filter, .. } if filter.needs_mnemonic())
        });
        let mnemonic = if needs_mnemonic {
            self.assembler.mnemonic(decoded)
        } else {
            alloc::string::String::new()
        };
        let has_matching = |position: InstPosition| {
            self.callbacks.iter().any(|(_, reg)| {
                matches!(
                    reg,
                    CallbackRegistration::Instruction { position: p, filter, .. }
                        if *p == position && filter.matches(decoded.address, &mnemonic)
                )
            })
        };
        let mem_gate_active = self.memory_shadow_rule_id.is_some();

        if has_matching(InstPosition::Pre) || mem_gate_active {
            patch.splice(crate::patch::SplicedInstrumentation {
                position: crate::patch::SplicePosition::Pre,
                pass: crate::rules::Pass::LAST,
                rule_id: consts::INVALID_EVENTID,
                code: alloc::vec![self.assembler.gen_dispatch_marker(DispatchTrigger {
                    address: decoded.address,
                    position: InstPosition::Pre,
                })],
            });
        }
        if has_matching(InstPosition::Post) || mem_gate_active {
            patch.splice(crate::patch::SplicedInstrumentation {
                position: crate::patch::SplicePosition::Post,
                pass: crate::rules::Pass::LAST,
                rule_id: consts::INVALID_EVENTID,
                code: alloc::vec![self.assembler.gen_dispatch_marker(DispatchTrigger {
                    address: decoded.address,
                    position: InstPosition::Post,
                })],
            });
        }
    }

    /// Run translated execution starting at `start`, until a callback
    /// requests `Stop` or execution transfers out of the instrumented set
    /// without returning.
    ///
    /// `fetch` reads raw guest bytes for translation; it stands in for the
    /// guest's real memory image, which this crate does not own.
    pub fn run(
        &mut self,
        start: GuestAddr,
        fetch: &dyn Fn(GuestAddr, usize) -> Vec<u8>,
    ) -> EngineResult<RunOutcome> {
        let mut pc = start;
        loop {
            if self.block_manager.flush_pending() {
                if self.storage == RegisterStorage::Live {
                    return Err(BugVariant::FlushDuringExecution.into());
                }
                self.block_manager.commit_pending_invalidations();
            }

            if !self.broker.is_instrumented(pc) {
                if !self
                    .broker
                    .can_transfer_execution(crate::broker::TransferReason::Call, pc)
                {
                    return Ok(RunOutcome::BrokerRefused);
                }
                self.signal_event(
                    VMEvent::EXEC_TRANSFER_CALL,
                    &VMState {
                        event: VMEvent::EXEC_TRANSFER_CALL,
                        basic_block_addr: pc,
                        basic_block_size: 0,
                        sequence_start: pc,
                    },
                );
                match self.broker.transfer_execution(
                    crate::broker::TransferReason::Call,
                    pc,
                    &mut self.canonical_registers,
                ) {
                    Some(resume) => {
                        self.signal_event(
                            VMEvent::EXEC_TRANSFER_RETURN,
                            &VMState {
                                event: VMEvent::EXEC_TRANSFER_RETURN,
                                basic_block_addr: pc,
                                basic_block_size: 0,
                                sequence_start: pc,
                            },
                        );
                        pc = resume;
                        continue;
                    }
                    None => return Ok(RunOutcome::TransferredOut),
                }
            }

            let (handle, is_new) = self.translate_block(pc, fetch)?;
            let block = self
                .block_manager
                .resolve(handle)
                .ok_or(BugVariant::StaleBlockHandle)?
                .clone();

            if is_new {
                self.signal_event(
                    VMEvent::BASIC_BLOCK_NEW,
                    &VMState {
                        event: VMEvent::BASIC_BLOCK_NEW,
                        basic_block_addr: block.guest_start,
                        basic_block_size: (block.guest_end - block.guest_start) as usize,
                        sequence_start: block.guest_start,
                    },
                );
            }

            self.block_accesses.clear();

            let bb_state = VMState {
                event: VMEvent::BASIC_BLOCK_ENTRY,
                basic_block_addr: block.guest_start,
                basic_block_size: (block.guest_end - block.guest_start) as usize,
                sequence_start: block.guest_start,
            };
            // Fired while `self.storage` is still `Canonical`, so a callback
            // that writes a register here lands in `self.canonical_registers`
            // and survives into the block below, rather than being clobbered
            // once execution finishes and `ctx.registers` is written back.
            self.signal_event(
                VMEvent::SEQUENCE_ENTRY,
                &VMState {
                    event: VMEvent::SEQUENCE_ENTRY,
                    ..bb_state
                },
            );
            self.signal_event(VMEvent::BASIC_BLOCK_ENTRY, &bb_state);

            let shadow = ShadowSpace::with_default_capacity();
            let mut ctx = BlockContext::new(self.canonical_registers.clone(), shadow);
            self.storage = RegisterStorage::Live;

            let exit = {
                let callbacks = &self.callbacks;
                let block_accesses = &mut self.block_accesses;
                let assembler = &self.assembler;
                let mnemonic_at = |addr: GuestAddr| -> Option<alloc::string::String> {
                    block.patch_at(addr).map(|p| assembler.mnemonic(&p.original))
                };
                let mut dispatch = |trigger: DispatchTrigger, ctx: &mut BlockContext| -> VMAction {
                    let accesses = ctx.shadow.drain(trigger.address);
                    let mut action = VMAction::Continue;

                    for access in &accesses {
                        for (_, reg) in callbacks {
                            if let CallbackRegistration::MemoryRange {
                                range,
                                access_type,
                                callback,
                            } = reg
                            {
                                if range.contains(access.address)
                                    && access_type.intersects(access.access_type)
                                {
                                    let mut cb_ctx = CallbackContext {
                                        registers: &mut ctx.registers,
                                        instruction_address: trigger.address,
                                    };
                                    action = combine_action(action, callback(&mut cb_ctx, access));
                                }
                            }
                        }
                    }
                    block_accesses.extend(accesses);

                    for (_, reg) in callbacks {
                        if let CallbackRegistration::Instruction {
                            position,
                            filter,
                            callback,
                        } = reg
                        {
                            if *position != trigger.position {
                                continue;
                            }
                            let matched = if filter.needs_mnemonic() {
                                mnemonic_at(trigger.address)
                                    .is_some_and(|m| filter.matches(trigger.address, &m))
                            } else {
                                filter.matches(trigger.address, "")
                            };
                            if matched {
                                let mut cb_ctx = CallbackContext {
                                    registers: &mut ctx.registers,
                                    instruction_address: trigger.address,
                                };
                                action = combine_action(action, callback(&mut cb_ctx));
                            }
                        }
                    }
                    action
                };
                block.execute(&mut ctx, &self.assembler, &mut dispatch)
            };

            self.canonical_registers = ctx.registers;
            self.storage = RegisterStorage::Canonical;

            let exit_state = VMState {
                event: VMEvent::BASIC_BLOCK_EXIT,
                ..bb_state
            };

            match exit {
                BlockExit::Stopped => {
                    self.signal_event(
                        VMEvent::SEQUENCE_EXIT,
                        &VMState {
                            event: VMEvent::SEQUENCE_EXIT,
                            ..bb_state
                        },
                    );
                    self.signal_event(VMEvent::BASIC_BLOCK_EXIT, &exit_state);
                    return Ok(RunOutcome::Stopped);
                }
                BlockExit::BreakToVm => {
                    self.block_manager
                        .invalidate_range(Range::new(block.guest_start, block.guest_end));
                    self.block_manager.commit_pending_invalidations();
                    pc = block.guest_start;
                }
                BlockExit::BranchOut => {
                    self.signal_event(
                        VMEvent::SEQUENCE_EXIT,
                        &VMState {
                            event: VMEvent::SEQUENCE_EXIT,
                            ..bb_state
                        },
                    );
                    self.signal_event(VMEvent::BASIC_BLOCK_EXIT, &exit_state);
                    pc = ctx.next_pc;
                }
                BlockExit::ExecTransfer => {
                    if !self
                        .broker
                        .can_transfer_execution(crate::broker::TransferReason::Jump, ctx.next_pc)
                    {
                        return Ok(RunOutcome::BrokerRefused);
                    }
                    self.signal_event(
                        VMEvent::SEQUENCE_EXIT,
                        &VMState {
                            event: VMEvent::SEQUENCE_EXIT,
                            ..bb_state
                        },
                    );
                    self.signal_event(VMEvent::BASIC_BLOCK_EXIT, &exit_state);
                    self.signal_event(
                        VMEvent::EXEC_TRANSFER_CALL,
                        &VMState {
                            event: VMEvent::EXEC_TRANSFER_CALL,
                            ..bb_state
                        },
                    );
                    match self.broker.transfer_execution(
                        crate::broker::TransferReason::Jump,
                        ctx.next_pc,
                        &mut self.canonical_registers,
                    ) {
                        Some(resume) => {
                            self.signal_event(
                                VMEvent::EXEC_TRANSFER_RETURN,
                                &VMState {
                                    event: VMEvent::EXEC_TRANSFER_RETURN,
                                    ..bb_state
                                },
                            );
                            pc = resume;
                        }
                        None => return Ok(RunOutcome::TransferredOut),
                    }
                }
            }

        }
    }

    /// Signal a [`VMEvent`] to every registered event callback that
    /// listens for it.
    pub(crate) fn signal_event(&mut self, event: VMEvent, state: &VMState) {
        debug_assert!(
            !event.intersects(VMEvent::SYSCALL_ENTRY | VMEvent::SYSCALL_EXIT | VMEvent::SIGNAL),
            "SYSCALL_*/SIGNAL events are reserved and never raised by this engine"
        );
        for (_, registration) in &self.callbacks {
            if let CallbackRegistration::Event { events, callback } = registration {
                if events.intersects(event) {
                    let mut cb_ctx = CallbackContext {
                        registers: &mut self.canonical_registers,
                        instruction_address: state.basic_block_addr,
                    };
                    let _ = callback(&mut cb_ctx, state);
                }
            }
        }
    }

    /// Shared analysis cache, queried by `VM::get_inst_analysis`.
    pub fn analysis_cache_mut(&mut self) -> &mut AnalysisCache {
        &mut self.analysis_cache
    }

    /// Attach a symbol resolver, consulted by `analyze_instruction` whenever
    /// `AnalysisType::SYMBOL` is requested. Passing `None` clears it.
    pub fn set_symbol_resolver(&mut self, resolver: Option<Box<dyn SymbolResolver>>) {
        self.symbol_resolver = resolver;
    }

    /// Analyze `decoded`, satisfying at least `requested` fields, using
    /// this engine's assembler facade. Exists as a single method (rather
    /// than separate `analysis_cache_mut`/`assembler` calls at the call
    /// site) so the two disjoint field borrows it needs don't have to
    /// cross the `Engine` API boundary.
    pub fn analyze_instruction(
        &mut self,
        decoded: &crate::assembler::DecodedInst,
        requested: crate::analysis::AnalysisType,
    ) -> &crate::analysis::InstAnalysis {
        self.analysis_cache.analyze(
            decoded,
            requested,
            &self.assembler,
            self.symbol_resolver.as_deref(),
        )
    }

    /// The execution broker, for read-only queries (`VM::is_instrumented`,
    /// `VM::get_instrumented_range`).
    pub fn broker(&self) -> &ExecBroker {
        &self.broker
    }

    /// The execution broker, mutable, so `VM` can attach a transfer
    /// handler.
    pub fn broker_mut(&mut self) -> &mut ExecBroker {
        &mut self.broker
    }

    /// The number of cached translated blocks.
    pub fn cached_block_count(&self) -> usize {
        self.block_manager.len()
    }

    /// The assembler facade, for callers (the [`crate::vm::VM`] facade)
    /// that need to query it directly, e.g. for `InstAnalysis`.
    pub fn assembler(&self) -> &A {
        &self.assembler
    }

    /// Decode one instruction for analysis purposes, without going
    /// through the translation pipeline.
    pub fn decode_for_analysis(
        &self,
        bytes: &[u8],
        addr: GuestAddr,
    ) -> EngineResult<crate::assembler::DecodedInst> {
        self.assembler
            .decode(bytes, addr)
            .map_err(|_| EngineError::Decode(addr))
    }

    /// Translate the basic block at `addr` without executing it.
    pub fn run_precache_only(
        &mut self,
        addr: GuestAddr,
        fetch: &dyn Fn(GuestAddr, usize) -> Vec<u8>,
    ) -> EngineResult<()> {
        self.translate_block(addr, fetch)?;
        Ok(())
    }
}
