use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use orderflow_core::SnowflakeIdGenerator;
use orderflow_events::{DomainEvent, EventPublisher, EventType, MemoryQueuePublisher};
use orderflow_infra::outbox::{DomainEventStore, InMemoryDomainEventStore, OutboxPublisher};
use std::sync::Arc;

fn id_generation(c: &mut Criterion) {
    let ids = SnowflakeIdGenerator::new(1).unwrap();
    let mut group = c.benchmark_group("snowflake");
    group.throughput(Throughput::Elements(1));
    group.bench_function("next_id", |b| b.iter(|| black_box(ids.next_id().unwrap())));
    group.finish();
}

fn seeded_store(ids: &SnowflakeIdGenerator, count: usize) -> Arc<InMemoryDomainEventStore> {
    let store = InMemoryDomainEventStore::arc();
    let now = Utc::now();
    for _ in 0..count {
        let event = DomainEvent::new(ids.next_id().unwrap(), EventType::OrderPaid, "{}", now);
        store.append(&event).unwrap();
    }
    store
}

fn outbox_claim(c: &mut Criterion) {
    let ids = SnowflakeIdGenerator::new(2).unwrap();
    let mut group = c.benchmark_group("outbox_claim_batch");

    for &batch in &[10usize, 100, 500] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter_batched(
                || seeded_store(&ids, 1_000),
                |store| black_box(store.claim_batch(batch, Utc::now()).unwrap()),
                criterion::BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

fn publish_paths(c: &mut Criterion) {
    let ids = SnowflakeIdGenerator::new(3).unwrap();
    let mut group = c.benchmark_group("publish");

    let store = InMemoryDomainEventStore::arc();
    let outbox = OutboxPublisher::new("outbox", store.clone());
    group.bench_function("outbox", |b| {
        b.iter(|| {
            let event = DomainEvent::new(ids.next_id().unwrap(), EventType::OrderCreated, "{}", Utc::now());
            black_box(outbox.publish(&event))
        })
    });

    let (memory, subscription) = MemoryQueuePublisher::new("memory", 1 << 16);
    group.bench_function("memory_queue", |b| {
        b.iter(|| {
            let event = DomainEvent::new(ids.next_id().unwrap(), EventType::OrderCreated, "{}", Utc::now());
            let accepted = memory.publish(&event);
            subscription.drain();
            black_box(accepted)
        })
    });
    group.finish();
}

criterion_group!(benches, id_generation, outbox_claim, publish_paths);
criterion_main!(benches);
