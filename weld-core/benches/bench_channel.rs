//! Benchmarks for the rendezvous channel and the weld algorithm.
//!
//! Run with: cargo bench -p weld-core --bench bench_channel

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures::stream;

use weld_core::channel;
use weld_core::scope::Scope;
use weld_core::section::PipelineSection;
use weld_core::weld::weld;

/// Throughput of a bare rendezvous channel with one sender and one
/// receiver running concurrently on the same runtime.
fn bench_channel_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("channel_throughput");

    for item_count in [100usize, 1_000, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("rendezvous", item_count),
            &item_count,
            |b, &item_count| {
                b.to_async(&rt).iter(|| async move {
                    let (tx, mut rx) = channel::channel::<u32>(0);
                    let sender = tokio::spawn(async move {
                        for i in 0..item_count as u32 {
                            tx.send(black_box(i)).await.unwrap();
                        }
                    });
                    let mut received = 0u32;
                    while (rx.recv().await).is_some() {
                        received += 1;
                    }
                    sender.await.unwrap();
                    black_box(received)
                });
            },
        );
    }

    group.finish();
}

/// Overhead of welding a chain of pump workers versus the raw channel, to
/// isolate the per-stage scheduling cost the weld algorithm adds.
fn bench_weld_chain_overhead(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("weld_chain_overhead");

    for stage_count in [1usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("stages", stage_count),
            &stage_count,
            |b, &stage_count| {
                b.to_async(&rt).iter(|| async move {
                    let scope = Scope::new();
                    let mut sections = vec![PipelineSection::source(stream::iter(0..1_000u32))];
                    for _ in 0..stage_count {
                        sections.push(PipelineSection::stage(PassThrough));
                    }
                    let mut out = weld(&scope, sections).unwrap();
                    let mut total = 0u64;
                    while let Some(item) = out.next().await {
                        total += item as u64;
                    }
                    scope.join().await.unwrap();
                    black_box(total)
                });
            },
        );
    }

    group.finish();
}

struct PassThrough;

#[async_trait::async_trait]
impl weld_core::section::Section<u32> for PassThrough {
    async fn run(
        &self,
        input: Option<&mut weld_core::section::ItemStream<u32>>,
        output: &weld_core::section::OutputSink<u32>,
    ) -> weld_core::Result<()> {
        let input = input.expect("PassThrough requires input");
        while let Some(item) = input.next().await {
            output.send(item).await?;
        }
        Ok(())
    }
}

criterion_group!(benches, bench_channel_throughput, bench_weld_chain_overhead);
criterion_main!(benches);
