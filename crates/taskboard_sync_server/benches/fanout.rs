//! Fan-out and commit benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use taskboard_sync_protocol::{
    Actor, EntityFields, EntityId, EntityKind, EntityState, Patch, Role, Topic, UserId,
};
use taskboard_sync_server::{
    Broadcaster, ConnectionRegistry, MemoryEntityStore, MutationEvent, ServerConfig, SyncServer,
};

fn sample_state() -> EntityState {
    let fields = EntityFields::create(
        EntityKind::Task,
        &Patch::new().set("title", "Benchmark task"),
        &UserId::new("bench"),
    )
    .unwrap();
    EntityState {
        id: EntityId::new(),
        fields,
        version: 2,
        updated_at: 0,
        deleted: false,
        last_actor: Some(UserId::new("bench")),
    }
}

/// Benchmark publishing one event to N subscribers of an aggregate topic.
fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");

    for subscribers in [1usize, 16, 128, 1024].iter() {
        group.throughput(Throughput::Elements(*subscribers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            subscribers,
            |b, &subscribers| {
                let registry = Arc::new(ConnectionRegistry::new(64));
                let mut receivers = Vec::with_capacity(subscribers);
                for i in 0..subscribers {
                    let (id, rx) = registry.register(Actor::new(format!("user-{i}"), Role::Member));
                    registry.subscribe(id, Topic::TaskList).unwrap();
                    receivers.push(rx);
                }
                let broadcaster = Broadcaster::new(registry.clone());
                let state = sample_state();
                let event = MutationEvent {
                    entity_id: state.id,
                    version: state.version,
                    actor: UserId::new("bench"),
                    topics: vec![(Topic::Entity(state.id), 2), (Topic::TaskList, 1)],
                    state,
                };

                b.iter(|| {
                    let report = broadcaster.publish(black_box(&event));
                    // Keep the queues from filling up.
                    for rx in receivers.iter_mut() {
                        while rx.try_recv().is_ok() {}
                    }
                    black_box(report);
                });
            },
        );
    }

    group.finish();
}

/// Benchmark a full propose through the mutation service.
fn bench_propose(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(MemoryEntityStore::new());
    let server = SyncServer::new(ServerConfig::default(), store.clone());
    let state = sample_state();
    let id = state.id;
    store.insert(state);
    let actor = Actor::new("bench", Role::Member);
    let patch = Patch::new().set("priority", "high");

    c.bench_function("propose", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let current = server.ledger().get(id).await.unwrap().version;
                let outcome = server
                    .mutations()
                    .propose(id, current, &patch, &actor)
                    .await
                    .unwrap();
                black_box(outcome);
            })
        });
    });
}

criterion_group!(benches, bench_publish, bench_propose);
criterion_main!(benches);
