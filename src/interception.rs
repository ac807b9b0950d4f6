//! Interception points: one runtime hit of a guarded call site

use crate::object_id::ObjectId;
use backtrace::Backtrace;
use serde::Serialize;
use std::cell::Cell;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Process-unique id of the calling OS thread
///
/// Assigned on first use; stable for the life of the thread.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

/// Location key `callee|caller|offset`
pub fn location_key(callee: &str, caller: &str, offset: i32) -> String {
    format!("{}|{}|{}", callee, caller, offset)
}

/// One observed hit of a guarded call site
///
/// Created fresh on every intercepted call. Once stamped by the controller it
/// is shared as `Arc<InterceptionPoint>` with the history structures; only
/// the delay credit and the lazily captured stack change after that.
#[derive(Debug)]
pub struct InterceptionPoint {
    /// Signature of the guarded API being called
    pub callee: String,
    /// Signature of the method containing the call site
    pub caller: String,
    /// Offset of the call inside the caller
    pub offset: i32,
    pub thread_id: u64,
    /// Monotonic timestamp used for closeness comparisons
    pub timestamp: Instant,
    /// Wall-clock timestamp used in reports
    pub wall_time: SystemTime,
    pub object_id: ObjectId,
    pub is_write: bool,
    /// Derived `callee|caller|offset` key
    pub location: String,
    /// Hits of this exact location before this one
    pub local_hit_count: i64,
    /// Position in the process-wide interception sequence
    pub global_hit_count: i64,
    /// Matched a trap plan
    pub in_plan: bool,
    /// Distinct threads seen in the recent history window
    pub active_threads: usize,
    delay_credit: AtomicI64,
    stack: OnceLock<Backtrace>,
}

impl InterceptionPoint {
    pub fn new(caller: &str, callee: &str, offset: i32, thread_id: u64) -> Self {
        Self {
            callee: callee.to_string(),
            caller: caller.to_string(),
            offset,
            thread_id,
            timestamp: Instant::now(),
            wall_time: SystemTime::now(),
            object_id: ObjectId::STATIC,
            is_write: false,
            location: location_key(callee, caller, offset),
            local_hit_count: 0,
            global_hit_count: 0,
            in_plan: false,
            active_threads: 0,
            delay_credit: AtomicI64::new(0),
            stack: OnceLock::new(),
        }
    }

    /// Persisted form `callee|caller|offset|globalHitCount|localHitCount`
    pub fn plan_string(&self) -> String {
        format!(
            "{}|{}|{}",
            self.location, self.global_hit_count, self.local_hit_count
        )
    }

    pub fn delay_credit(&self) -> i64 {
        self.delay_credit.load(Ordering::Acquire)
    }

    pub fn grant_delay_credit(&self, credit: i64) {
        self.delay_credit.store(credit, Ordering::Release);
    }

    /// Spend one unit of delay credit; false when none is left
    pub fn consume_delay_credit(&self) -> bool {
        self.delay_credit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c > 0).then_some(c - 1)
            })
            .is_ok()
    }

    /// Capture the calling thread's stack once
    ///
    /// Must run on the thread that produced this point. Symbols are resolved
    /// only when the stack is rendered.
    pub fn capture_stack(&self) {
        self.stack.get_or_init(Backtrace::new_unresolved);
    }

    pub fn has_stack(&self) -> bool {
        self.stack.get().is_some()
    }

    /// Rendered stack, if one was captured
    pub fn stack_trace(&self) -> Option<String> {
        self.stack.get().map(|bt| {
            let mut bt = bt.clone();
            bt.resolve();
            format!("{:?}", bt)
        })
    }

    /// Milliseconds since the Unix epoch
    pub fn unix_millis(&self) -> u64 {
        self.wall_time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Serializable snapshot for reports
    pub fn record(&self) -> PointRecord {
        PointRecord {
            id: self.global_hit_count,
            thread_id: self.thread_id,
            timestamp_ms: self.unix_millis(),
            callee: self.callee.clone(),
            caller: self.caller.clone(),
            offset: self.offset,
            location: self.location.clone(),
            local_hit_count: self.local_hit_count,
            object_id: self.object_id,
            is_write: self.is_write,
            stack: self.stack_trace(),
        }
    }
}

/// Owned snapshot of an [`InterceptionPoint`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointRecord {
    pub id: i64,
    pub thread_id: u64,
    pub timestamp_ms: u64,
    pub callee: String,
    pub caller: String,
    pub offset: i32,
    pub location: String,
    pub local_hit_count: i64,
    pub object_id: ObjectId,
    pub is_write: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}
