// Shared helpers for racetrap integration tests

#![allow(dead_code)]

use racetrap::object_id::InstanceRef;
use racetrap::{Detector, LearnedParams, MemorySink, RuntimeConfig, ThreadSafetyGroup};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const PLAN_FILE: &str = "plans.log";
pub const BUG_FILE: &str = "bugs.log";

/// Instance-scoped group with one write and one read API
pub fn list_group() -> ThreadSafetyGroup {
    ThreadSafetyGroup::new("List")
        .with_write_api("List.Add*")
        .with_read_api("List.Contains")
}

/// Learned parameters that only trap planned or dangerous points
pub fn learned_params() -> LearnedParams {
    LearnedParams {
        delay_probability: 0.0,
        dangerous_delay_ms: 10,
        dangerous_delay_probability: 1.0,
        random_seed: Some(11),
        ..LearnedParams::in_memory()
    }
}

/// Learned configuration persisting plan and bug files under `dir`
pub fn persistent_config(dir: &Path, mut params: LearnedParams) -> RuntimeConfig {
    params.last_run_plan_file = Some(PLAN_FILE.into());
    params.last_run_bug_file = Some(BUG_FILE.into());
    RuntimeConfig::learned(params)
        .with_group(list_group())
        .with_log_directory(dir)
}

pub fn build(config: RuntimeConfig, sink: &Arc<MemorySink>) -> Arc<Detector> {
    Arc::new(
        Detector::builder(config)
            .with_sink(Arc::clone(sink))
            .with_tracing(false)
            .build()
            .expect("valid configuration"),
    )
}

/// Run one intercepted call on a fresh thread and wait for it
pub fn call_on_new_thread(
    detector: &Arc<Detector>,
    target: &Arc<Vec<u32>>,
    caller: &'static str,
    callee: &'static str,
    offset: i32,
) {
    let (detector, target) = (Arc::clone(detector), Arc::clone(target));
    thread::spawn(move || {
        detector
            .on_interception_start(Some(InstanceRef::of(&*target)), caller, callee, offset)
            .expect("no race expected");
    })
    .join()
    .expect("thread panicked");
}

/// Spawn one intercepted call without waiting for it
pub fn spawn_call(
    detector: &Arc<Detector>,
    target: &Arc<Vec<u32>>,
    caller: &'static str,
    callee: &'static str,
    offset: i32,
) -> thread::JoinHandle<(Result<(), racetrap::RaceDetected>, Duration)> {
    let (detector, target) = (Arc::clone(detector), Arc::clone(target));
    thread::spawn(move || {
        let start = Instant::now();
        let result =
            detector.on_interception_start(Some(InstanceRef::of(&*target)), caller, callee, offset);
        (result, start.elapsed())
    })
}

/// Poll until `condition` holds, failing after five seconds
pub fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}
