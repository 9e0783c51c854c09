use criterion::{black_box, criterion_group, criterion_main, Criterion};

use dbi_vm::callback::{InstPosition, VMAction};
use dbi_vm::engine::Engine;
use dbi_vm::options::EngineParams;
use dbi_vm::range::{GuestAddr, Range};
use dbi_vm::registers::RegId;
use dbi_vm::test_helpers::{ToyAssembler, ToyPatchRule, ToyProgram};

const SP: RegId = RegId(7);

/// A straight-line basic block long enough that translating it dominates
/// the cost of running it once, for measuring cold-cache translation
/// throughput in isolation from execution.
fn straight_line_block(base: GuestAddr, insts: usize) -> dbi_vm::test_helpers::GuestImage {
    let mut p = ToyProgram::new(base);
    for _ in 0..insts {
        p.add_imm(RegId(0), RegId(0), 1);
    }
    p.ret();
    p.build()
}

fn new_engine() -> Engine<ToyAssembler> {
    let assembler = ToyAssembler::new(0x10000, SP);
    let mut engine = Engine::new(
        assembler,
        EngineParams {
            gpr_count: 8,
            fpr_count: 0,
            ..Default::default()
        },
    );
    engine.patch_rules_mut().push(Box::new(ToyPatchRule));
    engine
}

fn cold_translation(c: &mut Criterion) {
    let base: GuestAddr = 0x1000;
    let image = straight_line_block(base, 256);

    let mut group = c.benchmark_group("translation");
    group.bench_function("translate 256-instruction block (cold cache)", |b| {
        b.iter(|| {
            let mut engine = new_engine();
            engine.add_instrumented_range(Range::new(base, image.end()));
            black_box(engine.run_precache_only(base, &image.fetcher())).unwrap();
        })
    });
}

fn warm_execution(c: &mut Criterion) {
    let base: GuestAddr = 0x2000;
    let image = straight_line_block(base, 256);
    let mut engine = new_engine();
    engine.add_instrumented_range(Range::new(base, image.end()));
    engine.run_precache_only(base, &image.fetcher()).unwrap();

    let mut group = c.benchmark_group("translation");
    group.bench_function("run 256-instruction block (warm cache)", |b| {
        b.iter(|| {
            engine.active_registers_mut().set_gpr(SP, 0x9000);
            black_box(engine.run(base, &image.fetcher())).unwrap();
        })
    });
}

fn instrumented_dispatch_overhead(c: &mut Criterion) {
    let base: GuestAddr = 0x3000;
    let image = straight_line_block(base, 256);
    let mut engine = new_engine();
    engine.add_instrumented_range(Range::new(base, image.end()));
    engine.add_inst_cb(
        InstPosition::Pre,
        dbi_vm::callback::InstFilter::All,
        Box::new(|_ctx| VMAction::Continue),
    );
    engine.run_precache_only(base, &image.fetcher()).unwrap();

    let mut group = c.benchmark_group("translation");
    group.bench_function("run 256-instruction block (blanket PRE callback)", |b| {
        b.iter(|| {
            engine.active_registers_mut().set_gpr(SP, 0x9000);
            black_box(engine.run(base, &image.fetcher())).unwrap();
        })
    });
}

criterion_group!(
    benches,
    cold_translation,
    warm_execution,
    instrumented_dispatch_overhead
);
criterion_main!(benches);
