//! End-to-end scenarios driving the public [`dbi_vm::vm::VM`] facade
//! against the `test-helpers` toy ISA: the same properties a real
//! architecture backend would be expected to preserve, exercised without
//! one.

#![cfg(feature = "test-helpers")]

use dbi_vm::broker::{TransferHandler, TransferReason};
use dbi_vm::callback::{InstPosition, VMAction, VMEvent};
use dbi_vm::engine::RunOutcome;
use dbi_vm::memory_access::MemoryAccessType;
use dbi_vm::options::EngineParams;
use dbi_vm::range::GuestAddr;
use dbi_vm::registers::{GuestRegisters, RegId};
use dbi_vm::test_helpers::{GuestImage, ToyAssembler, ToyNativeReturn, ToyPatchRule, ToyProgram};
use dbi_vm::vm::VM;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const R0: RegId = RegId(0);
const R1: RegId = RegId(1);
const R2: RegId = RegId(2);
const SP: RegId = RegId(7);
const INST_WIDTH: GuestAddr = 16;

fn new_vm() -> VM<ToyAssembler> {
    let assembler = ToyAssembler::new(0x10000, SP);
    let mut vm = VM::new(
        assembler,
        EngineParams {
            gpr_count: 8,
            fpr_count: 0,
            ..Default::default()
        },
    );
    vm.engine_mut()
        .patch_rules_mut()
        .push(Box::new(ToyPatchRule));
    vm
}

/// `fib(n) = n < 2 ? n : fib(n-1) + fib(n-2)`, self-recursive, 14
/// instructions: the shared `RET` sits at a fixed offset so both
/// early-return jumps (for `n == 0` and `n == 1`) can target it directly.
fn build_fib(base: GuestAddr) -> GuestImage {
    let mut p = ToyProgram::new(base);
    let ret_addr = base + 13 * INST_WIDTH;
    p.jz(R0, ret_addr);
    p.add_imm(R1, R0, -1);
    p.jz(R1, ret_addr);
    p.push_reg(R0);
    p.mov_reg(R0, R1);
    p.call(base);
    p.pop_reg(R1);
    p.mov_reg(R2, R0);
    p.add_imm(R0, R1, -2);
    p.push_reg(R2);
    p.call(base);
    p.pop_reg(R2);
    p.add(R0, R0, R2);
    p.ret();
    p.build()
}

fn naive_fib(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        naive_fib(n - 1) + naive_fib(n - 2)
    }
}

fn expected_call_count(n: u64) -> u64 {
    2 * naive_fib(n + 1) - 1
}

#[test]
fn fib_call_returns_correct_value_and_call_count() {
    let base: GuestAddr = 0x1000;
    let image = build_fib(base);
    let mut vm = new_vm();
    vm.add_instrumented_range(base, image.end());
    vm.set_gpr(SP, 0x9000);

    let entries = Arc::new(AtomicU64::new(0));
    let entries_cb = entries.clone();
    vm.add_vm_event_cb(
        VMEvent::BASIC_BLOCK_ENTRY,
        Box::new(move |_ctx, state| {
            if state.basic_block_addr == base {
                entries_cb.fetch_add(1, Ordering::SeqCst);
            }
            VMAction::Continue
        }),
    );

    let outcome = vm
        .call(base, &[9], &[R0], &image.fetcher())
        .expect("call should terminate by leaving the instrumented range");

    assert_eq!(outcome, RunOutcome::TransferredOut);
    assert_eq!(vm.gpr(R0), naive_fib(9));
    assert_eq!(entries.load(Ordering::SeqCst), expected_call_count(9));
}

#[test]
fn cache_invalidation_does_not_change_call_count_or_result() {
    let base: GuestAddr = 0x1100;
    let image = build_fib(base);
    let mut vm = new_vm();
    vm.add_instrumented_range(base, image.end());
    vm.set_gpr(SP, 0x9000);

    let calls = Arc::new(AtomicU64::new(0));
    let calls_cb = calls.clone();
    vm.add_vm_event_cb(
        VMEvent::BASIC_BLOCK_ENTRY,
        Box::new(move |_ctx, state| {
            if state.basic_block_addr == base {
                calls_cb.fetch_add(1, Ordering::SeqCst);
            }
            VMAction::Continue
        }),
    );

    let first_outcome = vm
        .call(base, &[7], &[R0], &image.fetcher())
        .expect("first call should terminate");
    let first_result = vm.gpr(R0);
    let first_calls = calls.load(Ordering::SeqCst);

    vm.clear_all_cache();
    calls.store(0, Ordering::SeqCst);
    vm.set_gpr(SP, 0x9000);

    let second_outcome = vm
        .call(base, &[7], &[R0], &image.fetcher())
        .expect("second call should terminate identically");

    assert_eq!(first_outcome, second_outcome);
    assert_eq!(first_result, vm.gpr(R0));
    assert_eq!(first_calls, calls.load(Ordering::SeqCst));
}

#[test]
fn mnemonic_callback_traces_every_call_site_in_order() {
    let base: GuestAddr = 0x1200;
    let image = build_fib(base);
    let mut vm = new_vm();
    vm.add_instrumented_range(base, image.end());
    vm.set_gpr(SP, 0x9000);

    // `InstCallback` requires `Send + Sync`, so the trace is collected as
    // a per-call-site hit count rather than an ordered log of an `Rc`.
    let first_call_hits = Arc::new(AtomicU64::new(0));
    let second_call_hits = Arc::new(AtomicU64::new(0));
    let first_addr = base + 5 * INST_WIDTH;
    let second_addr = base + 10 * INST_WIDTH;

    let first_cb = first_call_hits.clone();
    vm.add_code_addr_cb(
        first_addr,
        InstPosition::Pre,
        Box::new(move |_ctx| {
            first_cb.fetch_add(1, Ordering::SeqCst);
            VMAction::Continue
        }),
    );
    let second_cb = second_call_hits.clone();
    vm.add_code_addr_cb(
        second_addr,
        InstPosition::Pre,
        Box::new(move |_ctx| {
            second_cb.fetch_add(1, Ordering::SeqCst);
            VMAction::Continue
        }),
    );

    let total_calls = Arc::new(AtomicU64::new(0));
    let total_cb = total_calls.clone();
    vm.add_mnemonic_cb(
        "CALL",
        InstPosition::Pre,
        Box::new(move |_ctx| {
            total_cb.fetch_add(1, Ordering::SeqCst);
            VMAction::Continue
        }),
    );

    vm.call(base, &[6], &[R0], &image.fetcher())
        .expect("call should terminate");

    let expected = expected_call_count(6) - 1; // excludes the initial, non-CALL entry
    assert_eq!(
        first_call_hits.load(Ordering::SeqCst) + second_call_hits.load(Ordering::SeqCst),
        expected
    );
    assert_eq!(total_calls.load(Ordering::SeqCst), expected);
}

#[test]
fn memory_write_access_is_recorded_with_address_and_value() {
    let mut p = ToyProgram::new(0x1300);
    let base = p.here();
    p.store(SP, 0, R1);
    p.ret();
    let image = p.build();

    let mut vm = new_vm();
    vm.add_instrumented_range(base, image.end());
    vm.set_gpr(SP, 0x200);
    vm.set_gpr(R1, 0x1337_c0de);

    let recorded = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorded_cb = recorded.clone();
    vm.add_mem_access_cb(
        MemoryAccessType::WRITE,
        Box::new(move |_ctx, access| {
            recorded_cb.lock().unwrap().push(*access);
            VMAction::Continue
        }),
    );

    vm.call(base, &[], &[], &image.fetcher())
        .expect("call should terminate");

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].address, 0x200);
    assert_eq!(recorded[0].value, 0x1337_c0de);
    assert!(recorded[0].access_type.contains(MemoryAccessType::WRITE));
}

/// A transfer handler that refuses every target, for exercising the
/// broker-refusal path. `transfer` should never actually be invoked, since
/// `can_transfer` always declines first.
struct RefusingHandler;

impl TransferHandler for RefusingHandler {
    fn transfer(
        &self,
        _reason: TransferReason,
        _target: GuestAddr,
        _registers: &mut GuestRegisters,
    ) -> Option<GuestAddr> {
        panic!("transfer should not be called once can_transfer refused it");
    }

    fn can_transfer(&self, _reason: TransferReason, _target: GuestAddr) -> bool {
        false
    }
}

#[test]
fn broker_refusal_stops_the_run_without_signaling_a_transfer() {
    let base: GuestAddr = 0x1500;
    let native_addr: GuestAddr = 0x9000_1000;

    let mut p = ToyProgram::new(base);
    p.call(native_addr);
    let image = p.build();

    let assembler = ToyAssembler::new(0x10000, SP);
    let mut vm = VM::new(
        assembler,
        EngineParams {
            gpr_count: 8,
            fpr_count: 0,
            ..Default::default()
        },
    );
    vm.engine_mut()
        .patch_rules_mut()
        .push(Box::new(ToyPatchRule));
    vm.set_transfer_handler(Box::new(RefusingHandler));
    vm.add_instrumented_range(base, image.end());
    vm.set_gpr(SP, 0x9000);

    let transfer_calls = Arc::new(AtomicU64::new(0));
    let calls_cb = transfer_calls.clone();
    vm.add_vm_event_cb(
        VMEvent::EXEC_TRANSFER_CALL,
        Box::new(move |_ctx, _state| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
            VMAction::Continue
        }),
    );

    let outcome = vm
        .call(base, &[], &[], &image.fetcher())
        .expect("call should terminate with the broker refusing the transfer");

    assert_eq!(outcome, RunOutcome::BrokerRefused);
    assert_eq!(transfer_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn execution_transfer_is_bracketed_by_call_and_return_events() {
    let base: GuestAddr = 0x1400;
    let native_addr: GuestAddr = 0x9000_0000;
    let exit_addr: GuestAddr = 0xdead_0000;

    let mut p = ToyProgram::new(base);
    p.call(native_addr); // transfers out; resumes at base + 16
    p.add_imm(R0, R0, 100); // runs only once control returns
    p.jmp(exit_addr); // deliberately leaves the instrumented range again
    let image = p.build();

    let assembler = ToyAssembler::new(0x10000, SP);
    let native_return = ToyNativeReturn::new(&assembler, native_addr, 5);
    let mut vm = VM::new(
        assembler,
        EngineParams {
            gpr_count: 8,
            fpr_count: 0,
            ..Default::default()
        },
    );
    vm.engine_mut()
        .patch_rules_mut()
        .push(Box::new(ToyPatchRule));
    vm.set_transfer_handler(Box::new(native_return));
    vm.add_instrumented_range(base, image.end());
    vm.set_gpr(SP, 0x9000);

    let transfer_calls = Arc::new(AtomicU64::new(0));
    let transfer_returns = Arc::new(AtomicU64::new(0));
    let calls_cb = transfer_calls.clone();
    let returns_cb = transfer_returns.clone();
    vm.add_vm_event_cb(
        VMEvent::EXEC_TRANSFER_CALL,
        Box::new(move |_ctx, _state| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
            VMAction::Continue
        }),
    );
    vm.add_vm_event_cb(
        VMEvent::EXEC_TRANSFER_RETURN,
        Box::new(move |_ctx, _state| {
            returns_cb.fetch_add(1, Ordering::SeqCst);
            VMAction::Continue
        }),
    );

    let outcome = vm
        .call(base, &[], &[], &image.fetcher())
        .expect("call should terminate by jumping to exit_addr");

    // The native call transfers out and back in exactly once; the trailing
    // `jmp exit_addr` is a second, unmatched transfer-out with no
    // corresponding return, since nothing handles `exit_addr`.
    assert_eq!(transfer_calls.load(Ordering::SeqCst), 2);
    assert_eq!(transfer_returns.load(Ordering::SeqCst), 1);
    assert_eq!(vm.gpr(R0), 105);
    assert_eq!(outcome, RunOutcome::TransferredOut);
}
