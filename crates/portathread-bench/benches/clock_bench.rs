//! Clock and thread lifecycle benchmarks.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use portathread_core::clock;
use portathread_core::thread::{self, Priority};

fn bench_clock_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("clock");
    group.bench_function("now", |b| b.iter(|| black_box(clock::now())));
    group.bench_function("wall_now", |b| b.iter(|| black_box(clock::wall_now())));
    group.finish();
}

fn bench_spawn_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread");
    group.sample_size(20);
    group.bench_function("spawn_join", |b| {
        b.iter(|| {
            let h = thread::spawn(|| black_box(1u32), Priority::NORMAL).unwrap();
            black_box(h.join().returned());
        });
    });
    group.bench_function("spawn_cancel_join", |b| {
        b.iter(|| {
            let h = thread::spawn(|| clock::sleep(clock::CLOCK_FREQ), Priority::NORMAL).unwrap();
            h.cancel();
            black_box(h.join().is_cancelled());
        });
    });
    group.finish();
}

criterion_group!(benches, bench_clock_reads, bench_spawn_join);
criterion_main!(benches);
