use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use meshsync_proto::{Envelope, FrameCodec, Presentation, ReplicaId, SyncMessage, VectorClock};
use tokio_util::codec::{Decoder, Encoder};

fn wide_clock(width: usize, base: u64) -> VectorClock {
    (0..width)
        .map(|i| (ReplicaId::new(format!("replica-{i:04}")), base + i as u64))
        .collect()
}

fn clock_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("clock");
    let a = wide_clock(64, 10);
    let b = wide_clock(64, 7);
    group.throughput(Throughput::Elements(64));

    group.bench_function("merge_64", |bench| bench.iter(|| a.merged(&b)));
    group.bench_function("sum_all_64", |bench| bench.iter(|| VectorClock::sum_all(&a, &b)));
    group.bench_function("diff_64", |bench| bench.iter(|| VectorClock::diff(&b, &a)));
    group.bench_function("dominates_64", |bench| {
        bench.iter(|| VectorClock::does_second_have_first(&b, &a))
    });

    group.finish();
}

fn codec_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let env = Envelope::new(
        "doc",
        SyncMessage::Presentation(Presentation::init(wide_clock(64, 1), false)),
    );

    group.bench_function("encode_decode_presentation", |bench| {
        let mut codec = FrameCodec::<Envelope>::new();
        let mut buf = BytesMut::new();
        bench.iter(|| {
            codec.encode(env.clone(), &mut buf).unwrap();
            codec.decode(&mut buf).unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, clock_benchmark, codec_benchmark);
criterion_main!(benches);
