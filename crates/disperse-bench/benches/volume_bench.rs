//! Whole-volume write/read throughput over in-memory bricks.

use criterion::{Criterion, criterion_group, criterion_main, Throughput};

use disperse_bench::pattern;
use disperse_core::Disperse;
use disperse_core::config::VolumeOptions;
use disperse_core::types::Gfid;
use disperse_simbrick::SimBrick;

fn build() -> Disperse {
    let bricks = SimBrick::cluster(6);
    let mut opts = VolumeOptions::new(6, 2);
    opts.eager_lock = true;
    Disperse::new("bench", opts, SimBrick::as_bricks(&bricks)).unwrap()
}

fn bench_aligned_write(c: &mut Criterion) {
    let vol = build();
    let (fd, _) = vol.create(Gfid::ROOT, "bench", 0o644, 0).unwrap();
    let stripe = vol.stripe_size() as usize;
    let data = pattern(stripe * 4, 3);

    let mut group = c.benchmark_group("volume");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("aligned-write", |b| {
        b.iter(|| vol.writev(&fd, &data, 0).unwrap());
    });
    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let vol = build();
    let (fd, _) = vol.create(Gfid::ROOT, "bench", 0o644, 0).unwrap();
    let stripe = vol.stripe_size() as usize;
    let data = pattern(stripe * 4, 4);
    vol.writev(&fd, &data, 0).unwrap();

    let mut group = c.benchmark_group("volume");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("read", |b| {
        b.iter(|| vol.readv(&fd, data.len() as u64, 0).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_aligned_write, bench_read);
criterion_main!(benches);
