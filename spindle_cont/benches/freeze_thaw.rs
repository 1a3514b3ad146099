//! Freeze/Thaw Fast-Path Benchmarks
//!
//! Measures the steady-state yield/resume cycle on compiled-only
//! stacks, the hottest path in the runtime. Each iteration thaws the
//! continuation, reinstalls the yield stub and freezes again, so the
//! chunk is reused every cycle with no allocation.
//!
//! # Performance Targets
//!
//! - Bulk freeze + thaw cycle (small stack): O(one memcpy each way)
//! - Single-frame thaw (large stack): independent of chunk depth

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spindle_cont::{CarrierThread, ContId, Continuation, ContinuationRuntime, ScopeId, ThawKind};
use spindle_core::code::RefMap;
use spindle_core::platform;
use spindle_gc::{HeapConfig, NoBarriers};

const STACK_WORDS: usize = 16 * 1024;

struct Fixture {
    rt: ContinuationRuntime<NoBarriers>,
    thread: CarrierThread,
    cont: Continuation,
}

/// Build a carrier with `frames` compiled frames of `frame_size` words
/// each, frozen once so the bench loop starts from the chunked state.
fn frozen_fixture(frames: usize, frame_size: usize) -> Fixture {
    let rt = ContinuationRuntime::resolve(HeapConfig::default(), NoBarriers);
    let blob = rt.code.register_compiled("bench_frame", frame_size, 0, RefMap::empty());

    let mut thread = CarrierThread::new(STACK_WORDS);
    let entry_sp = STACK_WORDS - 16;
    let entry_pc = rt.stubs.entry_blob().start().offset(5);
    thread.push_entry(ContId(1), ScopeId(1), entry_sp, entry_sp + 4, entry_pc);
    let mut cont = Continuation::new(ContId(1), ScopeId(1));

    // Lay the frames out the way the enter stub would.
    let mut caller_pc = entry_pc;
    let mut caller_fp = entry_sp + 4;
    let mut sender_sp = entry_sp;
    for _ in 0..frames {
        let stack = thread.stack_mut();
        platform::patch_ret_pc(stack, sender_sp, caller_pc);
        platform::patch_saved_fp(stack, sender_sp, caller_fp);
        let sp = sender_sp - frame_size;
        caller_pc = blob.start().offset(2);
        caller_fp = sp;
        sender_sp = sp;
    }
    let stub_sp = install_yield_stub(&rt, &mut thread, sender_sp);
    assert_eq!(rt.freeze(&mut thread, &mut cont, stub_sp), 0);

    Fixture { rt, thread, cont }
}

/// Reinstall the yield stub below the resumed frame at `sp` and publish
/// the anchor, as the yield stub prologue does.
fn install_yield_stub(
    rt: &ContinuationRuntime<NoBarriers>,
    thread: &mut CarrierThread,
    sp: usize,
) -> usize {
    let stub_sp = sp - platform::METADATA_WORDS;
    let pc = rt.stubs.yield_stub().start().offset(1);
    let stack = thread.stack_mut();
    platform::patch_ret_pc(stack, stub_sp, pc);
    platform::patch_saved_fp(stack, stub_sp, sp);
    thread.set_anchor(stub_sp);
    stub_sp
}

fn bench_bulk_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_cycle");
    for frames in [1usize, 4, 16] {
        let words = frames * 16;
        group.throughput(Throughput::Elements(words as u64));
        group.bench_with_input(BenchmarkId::from_parameter(frames), &frames, |bench, &n| {
            let mut fx = frozen_fixture(n, 16);
            bench.iter(|| {
                let sp = fx.rt.thaw(&mut fx.thread, &mut fx.cont, ThawKind::Top);
                let stub_sp = install_yield_stub(&fx.rt, &mut fx.thread, black_box(sp));
                let status = fx.rt.freeze(&mut fx.thread, &mut fx.cont, stub_sp);
                debug_assert_eq!(status, 0);
                black_box(status)
            });
        });
    }
    group.finish();
}

fn bench_single_frame_thaw(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_frame_thaw");
    // Deep stack: well past the bulk threshold, so each thaw peels one
    // frame and each freeze reuses the tail with overlap.
    group.bench_function("deep_chunk", |bench| {
        let mut fx = frozen_fixture(64, 16);
        bench.iter(|| {
            let sp = fx.rt.thaw(&mut fx.thread, &mut fx.cont, ThawKind::Top);
            let stub_sp = install_yield_stub(&fx.rt, &mut fx.thread, black_box(sp));
            let status = fx.rt.freeze(&mut fx.thread, &mut fx.cont, stub_sp);
            debug_assert_eq!(status, 0);
            black_box(status)
        });
    });
    group.finish();
}

fn bench_prepare_thaw(c: &mut Criterion) {
    c.bench_function("prepare_thaw", |bench| {
        let mut fx = frozen_fixture(4, 16);
        bench.iter(|| black_box(fx.rt.prepare_thaw(&fx.thread, &mut fx.cont, false)));
    });
}

criterion_group!(
    benches,
    bench_bulk_cycle,
    bench_single_frame_thaw,
    bench_prepare_thaw
);
criterion_main!(benches);
