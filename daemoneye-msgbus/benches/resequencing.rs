//! Performance benchmarks for the inbound filter and broker routing

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use daemoneye_msgbus::transport::headers;
use daemoneye_msgbus::transport::memory::topic_matches;
use daemoneye_msgbus::{
    BusMessage, CurrentMessageInformation, MessageFilter, ResequencingDeduplicationFilter,
};
use serde::{Deserialize, Serialize};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
struct Sample(u64);

impl BusMessage for Sample {
    const TYPE_NAME: &'static str = "bench.sample";
}

fn sequenced(producer: &str, sequence: u64) -> CurrentMessageInformation {
    let mut information = CurrentMessageInformation::local(Arc::new(Sample(sequence)));
    information
        .headers
        .insert(headers::PRODUCER_ID.to_string(), producer.to_string());
    information
        .headers
        .insert(headers::SEQUENCE.to_string(), sequence.to_string());
    information
}

fn bench_in_order(c: &mut Criterion) {
    c.bench_function("resequencing_in_order_1000", |b| {
        b.iter(|| {
            let filter = ResequencingDeduplicationFilter::new(Duration::from_secs(5), 1_000);
            let now = Instant::now();
            let mut delivered = 0;
            for sequence in 1..=1_000 {
                delivered += filter.filter(sequenced("p", sequence), now).deliver.len();
            }
            black_box(delivered)
        })
    });
}

fn bench_reversed_pairs(c: &mut Criterion) {
    c.bench_function("resequencing_swapped_pairs_1000", |b| {
        b.iter(|| {
            let filter = ResequencingDeduplicationFilter::new(Duration::from_secs(5), 1_000);
            let now = Instant::now();
            let mut delivered = 0;
            for pair in 0..500 {
                let first = pair * 2 + 1;
                delivered += filter.filter(sequenced("p", first + 1), now).deliver.len();
                delivered += filter.filter(sequenced("p", first), now).deliver.len();
            }
            black_box(delivered)
        })
    });
}

fn bench_many_producers(c: &mut Criterion) {
    let mut group = c.benchmark_group("resequencing_producers");
    for producers in [1_usize, 16, 256] {
        let names: Vec<String> = (0..producers).map(|i| format!("producer-{i}")).collect();
        group.bench_with_input(
            BenchmarkId::from_parameter(producers),
            &names,
            |b, names| {
                b.iter(|| {
                    let filter =
                        ResequencingDeduplicationFilter::new(Duration::from_secs(5), 1_000);
                    let now = Instant::now();
                    for sequence in 1..=20 {
                        for name in names {
                            black_box(filter.filter(sequenced(name, sequence), now));
                        }
                    }
                })
            },
        );
    }
    group.finish();
}

fn bench_topic_matching(c: &mut Criterion) {
    c.bench_function("topic_matches", |b| {
        b.iter(|| {
            black_box(topic_matches(
                black_box("process.#.started"),
                black_box("process.linux.x86_64.started"),
            ));
            black_box(topic_matches(
                black_box("process.*"),
                black_box("process.started"),
            ));
        })
    });
}

criterion_group!(
    benches,
    bench_in_order,
    bench_reversed_pairs,
    bench_many_producers,
    bench_topic_matching
);
criterion_main!(benches);
