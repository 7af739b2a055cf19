//! Frame codec and reconciliation benchmarks

use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chat_fusion_system::{Frame, FusionEngine, MemberEntry, DEFAULT_MAX_FRAME_SIZE};

fn chunk_encoding_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_encoding");

    for size in [64, 256, 1024, 3000] {
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let frame = Frame::FileChunk {
                transfer_id: 7,
                sequence: 0,
                data: Bytes::from(vec![0u8; size]),
            };

            b.iter(|| {
                frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
            });
        });
    }

    group.finish();
}

fn chunk_decoding_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_decoding");

    for size in [64, 256, 1024, 3000] {
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let frame = Frame::FileChunk {
                transfer_id: 7,
                sequence: 0,
                data: Bytes::from(vec![0u8; size]),
            };
            let encoded = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();

            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE)
                    .unwrap()
                    .unwrap();
            });
        });
    }

    group.finish();
}

fn member_sync_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("member_sync_encoding");

    for count in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let members: Vec<MemberEntry> = (0..count)
                .map(|i| MemberEntry::new(format!("user{}", i), "server-a", "10.0.0.1:7878"))
                .collect();
            let frame = Frame::MemberListSync { members };

            b.iter(|| {
                frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
            });
        });
    }

    group.finish();
}

fn reconcile_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("fusion_reconcile");

    for count in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            // Half the identities collide across the two networks.
            let left: Vec<MemberEntry> = (0..count)
                .map(|i| MemberEntry::new(format!("user{}", i), "server-a", "10.0.0.1:7878"))
                .collect();
            let right: Vec<MemberEntry> = (count / 2..count + count / 2)
                .map(|i| MemberEntry::new(format!("user{}", i), "server-b", "10.0.0.2:7878"))
                .collect();

            b.iter(|| {
                FusionEngine::reconcile(&left, &right).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    chunk_encoding_benchmark,
    chunk_decoding_benchmark,
    member_sync_benchmark,
    reconcile_benchmark
);
criterion_main!(benches);
