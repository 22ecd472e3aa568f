//! Throughput Benchmarks
//!
//! Benchmarks for measuring:
//! - Frame header encode/decode cost
//! - Payload copy throughput at different chunk sizes
//!
//! Run with: cargo bench --bench throughput -p courier-daemon

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Runtime;

use courier_core::{copy_exact, encode_header, read_header, FrameLimits};

/// Benchmark header encoding and parsing
fn bench_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_header");
    let rt = Runtime::new().expect("runtime");
    let limits = FrameLimits::default();
    let encoded = encode_header("quarterly-report-final.pdf", 48 * 1024 * 1024).expect("header");

    group.bench_function("encode", |b| {
        b.iter(|| encode_header(black_box("quarterly-report-final.pdf"), black_box(4096)))
    });

    group.bench_function("decode", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut reader: &[u8] = black_box(&encoded);
                read_header(&mut reader, &limits).await
            })
        })
    });

    group.finish();
}

/// Benchmark payload copy over an in-memory pipe
fn bench_copy(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_exact");
    let rt = Runtime::new().expect("runtime");

    let size = 8 * 1024 * 1024usize;
    let data: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();

    for (name, chunk) in [("4KB", 4 * 1024), ("64KB", 64 * 1024), ("1MB", 1024 * 1024)] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("chunk", name), &chunk, |b, &chunk| {
            b.iter(|| {
                rt.block_on(async {
                    let (mut tx, mut rx) = tokio::io::duplex(chunk);
                    let payload = &data;
                    let writer = async move {
                        tx.write_all(payload).await.expect("write");
                        tx.shutdown().await.expect("shutdown");
                    };
                    let reader = async {
                        let mut sink = tokio::io::sink();
                        copy_exact(&mut rx, &mut sink, size as u64, chunk, None).await
                    };
                    let (_, copied) = tokio::join!(writer, reader);
                    black_box(copied.expect("copy"))
                })
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_header, bench_copy);
criterion_main!(benches);
