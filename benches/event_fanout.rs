//! Benchmarks for the event path: handler delivery and work queue hand-off

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use kube::ResourceExt;
use std::sync::Arc;
use volume_pool_operator::{
    Event, EventType, Handler, LabelSelector, ObjectKey, VolumeClass, VolumeClassRegistry,
    VolumeClassSpec, WorkQueue,
};

fn volume_class(i: usize) -> VolumeClass {
    let mut class = VolumeClass::new(&format!("class-{:04}", i), VolumeClassSpec::with_limits(100, 1));
    let suitable_for = if i % 2 == 0 { "testing" } else { "production" };
    class
        .labels_mut()
        .insert("suitable-for".to_string(), suitable_for.to_string());
    class
}

fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("volume_class_registry");
    group.throughput(Throughput::Elements(1));

    let classes: Vec<_> = (0..1000).map(volume_class).collect();

    group.bench_function("handle_update", |b| {
        let registry = VolumeClassRegistry::new(LabelSelector::default().with("suitable-for", "testing"));
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            let class = classes[counter % classes.len()].clone();
            registry.handle(black_box(Event::new(EventType::Updated, class)));
        });
    });

    group.bench_function("fan_out_8_handlers", |b| {
        let handlers: Vec<Arc<dyn Handler<VolumeClass>>> = (0..8)
            .map(|_| {
                Arc::new(VolumeClassRegistry::new(
                    LabelSelector::default().with("suitable-for", "testing"),
                )) as Arc<dyn Handler<VolumeClass>>
            })
            .collect();
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            let event = Event::new(EventType::Generic, classes[counter % classes.len()].clone());
            for handler in &handlers {
                handler.handle(event.clone());
            }
        });
    });

    group.finish();
}

fn bench_selector(c: &mut Criterion) {
    let mut group = c.benchmark_group("label_selector");
    group.throughput(Throughput::Elements(1));

    let selector = LabelSelector::parse("suitable-for=testing,tier=gold").unwrap();
    let class = volume_class(0);

    group.bench_function("matches", |b| {
        b.iter(|| black_box(selector.matches(black_box(class.labels()))));
    });

    group.finish();
}

fn bench_work_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("work_queue");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    group.bench_function("add_get_done", |b| {
        let queue = WorkQueue::new();
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            queue.add(ObjectKey::cluster(format!("pool-{}", counter % 64)));
            let key = runtime.block_on(queue.get()).unwrap();
            queue.done(black_box(&key));
        });
    });

    group.bench_function("add_duplicate", |b| {
        let queue = WorkQueue::new();
        let key = ObjectKey::cluster("pool-a");
        b.iter(|| queue.add(black_box(key.clone())));
    });

    group.finish();
}

criterion_group!(benches, bench_registry, bench_selector, bench_work_queue);
criterion_main!(benches);
