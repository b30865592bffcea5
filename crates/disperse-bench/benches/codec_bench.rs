//! Reed-Solomon throughput: encode and decode at common geometries.

use criterion::{Criterion, criterion_group, criterion_main, BenchmarkId, Throughput};

use disperse_bench::pattern;
use disperse_codec::{FragmentCodec, RsCodec};

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for &(k, m) in &[(4usize, 2usize), (8, 3)] {
        let codec = RsCodec::new(k, m, 4096);
        let data = pattern(codec.stripe_size() * 16, 7);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{k}+{m}")),
            &data,
            |b, data| {
                b.iter(|| codec.encode(data).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for &(k, m) in &[(4usize, 2usize), (8, 3)] {
        let codec = RsCodec::new(k, m, 4096);
        let data = pattern(codec.stripe_size() * 16, 11);
        let fragments = codec.encode(&data).unwrap();
        // Worst case: decode purely from redundancy plus the tail of the
        // data fragments.
        let picked: Vec<(usize, &[u8])> = (m..k + m)
            .map(|i| (i, fragments[i].as_slice()))
            .collect();
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{k}+{m}")),
            &picked,
            |b, picked| {
                b.iter(|| codec.decode(picked).unwrap());
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
