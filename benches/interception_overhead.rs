//! Interception entry point overhead
//!
//! Measures the cost every instrumented call pays before the guarded API
//! runs, on paths that never block:
//!
//! 1. Disabled detector
//! 2. Unclassified call under the learned controller
//! 3. Classified read under the learned controller (no trap possible)
//! 4. Plan lookup in a store of exact and wildcard plans
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench interception_overhead
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use racetrap::hit_count::HitCount;
use racetrap::interception::InterceptionPoint;
use racetrap::object_id::InstanceRef;
use racetrap::{
    Detector, LearnedParams, RuntimeConfig, ThreadSafetyGroup, TrapPlan, TrapPlanStore,
};

fn learned_detector() -> Detector {
    let params = LearnedParams {
        delay_probability: 0.0,
        ..LearnedParams::in_memory()
    };
    Detector::builder(
        RuntimeConfig::learned(params).with_group(
            ThreadSafetyGroup::new("List")
                .with_write_api("List.Add*")
                .with_read_api("List.Contains"),
        ),
    )
    .with_tracing(false)
    .build()
    .expect("valid configuration")
}

fn bench_entry_point(c: &mut Criterion) {
    let mut group = c.benchmark_group("on_interception_start");
    let list: Vec<u32> = Vec::new();

    let disabled = Detector::disabled();
    group.bench_function("disabled", |b| {
        b.iter(|| {
            disabled
                .on_interception_start(
                    black_box(Some(InstanceRef::of(&list))),
                    "Main",
                    "List.Add",
                    1,
                )
                .ok()
        })
    });

    let learned = learned_detector();
    group.bench_function("learned_unclassified", |b| {
        b.iter(|| {
            learned
                .on_interception_start(black_box(None), "Main", "Dictionary.TryGetValue", 3)
                .ok()
        })
    });
    group.bench_function("learned_read", |b| {
        b.iter(|| {
            learned
                .on_interception_start(
                    black_box(Some(InstanceRef::of(&list))),
                    "Main",
                    "List.Contains",
                    5,
                )
                .ok()
        })
    });

    group.finish();
}

fn bench_plan_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_matching_plan");

    for plans in [10usize, 100, 1000] {
        let mut store = TrapPlanStore::new();
        for i in 0..plans {
            let plan = TrapPlan::new(format!("Type{}.Method", i))
                .with_caller(format!("Caller{}.Run", i))
                .with_offset(i as i32)
                .with_hit_count(HitCount::new(3, 100));
            store.add_plan(plan).expect("valid plan");
        }
        store
            .add_plan(TrapPlan::new("Wild*.Method").with_caller("Caller*"))
            .expect("valid plan");

        let mut exact = InterceptionPoint::new("Caller7.Run", "Type7.Method", 7, 1);
        exact.local_hit_count = 4;
        exact.global_hit_count = 110;
        let wildcard = InterceptionPoint::new("Caller9.Run", "WildType.Method", 0, 1);

        group.bench_with_input(BenchmarkId::new("exact", plans), &exact, |b, point| {
            b.iter(|| store.find_matching_plan(black_box(point), 20, 5))
        });
        group.bench_with_input(BenchmarkId::new("wildcard", plans), &wildcard, |b, point| {
            b.iter(|| store.find_matching_plan(black_box(point), 20, 5))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_entry_point, bench_plan_lookup);
criterion_main!(benches);
