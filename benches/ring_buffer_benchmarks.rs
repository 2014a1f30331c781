use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use fluxweld::prelude::*;
use fluxweld::processors::RingProcessorConfig;
use fluxweld::ring_buffer::{ProducerType, RingBuffer, RingBufferConfig, WaitStrategy};

const ITEMS: u64 = 100_000;

fn ring(size: usize, producer_type: ProducerType) -> Arc<RingBuffer<u64>> {
    Arc::new(
        RingBuffer::new(
            RingBufferConfig::default()
                .buffer_size(size)
                .producer_type(producer_type)
                .wait_strategy(WaitStrategy::Yielding),
        )
        .unwrap(),
    )
}

fn bench_ring_hand_off(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_hand_off");
    group.throughput(Throughput::Elements(ITEMS));

    for size in [64usize, 1024, 16384].iter() {
        group.bench_with_input(BenchmarkId::new("single_producer", size), size, |b, &size| {
            b.iter(|| {
                let ring = ring(size, ProducerType::Single);
                let reader = ring.reader();
                let consumer = std::thread::spawn(move || {
                    let mut sum = 0u64;
                    for _ in 0..ITEMS {
                        sum += reader.recv().unwrap();
                    }
                    sum
                });
                for i in 0..ITEMS {
                    ring.emit(i);
                }
                black_box(consumer.join().unwrap());
            });
        });

        group.bench_with_input(BenchmarkId::new("multi_producer", size), size, |b, &size| {
            b.iter(|| {
                let ring = ring(size, ProducerType::Multi);
                let reader = ring.reader();
                let producers: Vec<_> = (0..4)
                    .map(|_| {
                        let ring = ring.clone();
                        std::thread::spawn(move || {
                            for i in 0..ITEMS / 4 {
                                ring.emit(i);
                            }
                        })
                    })
                    .collect();
                let mut sum = 0u64;
                for _ in 0..ITEMS {
                    sum += reader.recv().unwrap();
                }
                for producer in producers {
                    producer.join().unwrap();
                }
                black_box(sum);
            });
        });
    }

    group.finish();
}

fn bench_topic_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_fan_out");
    group.throughput(Throughput::Elements(10_000));
    let runtime = tokio::runtime::Runtime::new().unwrap();

    for subscribers in [1usize, 2, 4].iter() {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            subscribers,
            |b, &subscribers| {
                b.iter(|| {
                    runtime.block_on(async {
                        let topic = TopicProcessor::with_config(
                            RingProcessorConfig::default()
                                .buffer_size(1024)
                                .wait_strategy(WaitStrategy::Yielding),
                            TokioScheduler::shared().unwrap(),
                        )
                        .unwrap();
                        let probes: Vec<_> =
                            (0..subscribers).map(|_| TestConsumer::<u64>::new()).collect();
                        for probe in &probes {
                            topic.subscribe(probe.clone());
                        }
                        let producer = topic.clone();
                        tokio::task::spawn_blocking(move || {
                            for i in 0..10_000u64 {
                                producer.next(black_box(i));
                            }
                            producer.complete();
                        })
                        .await
                        .unwrap();
                        for probe in &probes {
                            probe.await_terminal(Duration::from_secs(10)).await.unwrap();
                        }
                    })
                });
            },
        );
    }

    group.finish();
}

fn bench_source_demand(c: &mut Criterion) {
    let mut group = c.benchmark_group("source_demand");

    for batch in [1u64, 16, 256].iter() {
        group.bench_with_input(BenchmarkId::new("range_request", batch), batch, |b, &batch| {
            b.iter(|| {
                let probe = TestConsumer::with_request(0);
                Flux::range(0..10_000).subscribe_with(probe.clone());
                while !probe.is_terminated() {
                    probe.request(batch);
                }
                black_box(probe.value_count());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_ring_hand_off,
    bench_topic_fan_out,
    bench_source_demand
);
criterion_main!(benches);
