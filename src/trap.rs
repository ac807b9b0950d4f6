//! Traps and the per-group trap store
//!
//! A trap is a thread parked at a guarded call for a bounded delay. While it
//! waits, the trap sits in the bucket of its thread-safety group keyed by the
//! object it touches, where a conflicting caller can find it.

use crate::classifier::Classification;
use crate::interception::InterceptionPoint;
use crate::object_id::ObjectId;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a trap wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A conflicting caller released the trap early
    Released,
    /// The full delay elapsed
    TimedOut,
}

/// A delayed access waiting for a conflicting caller
#[derive(Debug)]
pub struct Trap {
    pub id: u64,
    pub object_id: ObjectId,
    pub point: Arc<InterceptionPoint>,
    pub classification: Classification,
    pub delay: Duration,
    release_tx: Sender<()>,
    release_rx: Receiver<()>,
}

impl Trap {
    pub fn new(
        id: u64,
        point: Arc<InterceptionPoint>,
        classification: Classification,
        delay: Duration,
    ) -> Self {
        let (release_tx, release_rx) = channel::bounded(1);
        Self {
            id,
            object_id: point.object_id,
            point,
            classification,
            delay,
            release_tx,
            release_rx,
        }
    }

    pub fn is_write(&self) -> bool {
        self.classification.is_write
    }

    pub fn group_name(&self) -> &str {
        self.classification.group_name()
    }

    /// Whether an access with the given write flag conflicts with this trap
    pub fn conflicts_with(&self, is_write: bool) -> bool {
        self.is_write() || is_write
    }

    /// Wake the waiting thread; a no-op once released or after the wait ended
    pub fn release(&self) {
        let _ = self.release_tx.try_send(());
    }

    /// Block for at most the trap's delay
    pub fn wait(&self) -> WaitOutcome {
        match self.release_rx.recv_timeout(self.delay) {
            Ok(()) => WaitOutcome::Released,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                WaitOutcome::TimedOut
            }
        }
    }
}

/// Traps of one group, keyed by object
#[derive(Debug, Default)]
pub struct TrapBucket {
    traps: Mutex<HashMap<ObjectId, Vec<Arc<Trap>>>>,
}

impl TrapBucket {
    /// Lock the bucket for a check-then-register sequence
    pub fn lock(&self) -> BucketGuard<'_> {
        BucketGuard {
            traps: self.traps.lock(),
        }
    }

    /// Remove one trap by id
    pub fn remove(&self, trap: &Trap) {
        self.lock().remove(trap);
    }

    /// Outstanding traps across all objects
    pub fn len(&self) -> usize {
        self.traps.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive view of a bucket
pub struct BucketGuard<'a> {
    traps: MutexGuard<'a, HashMap<ObjectId, Vec<Arc<Trap>>>>,
}

impl BucketGuard<'_> {
    /// Traps outstanding on one object
    pub fn traps_on(&self, object_id: ObjectId) -> &[Arc<Trap>] {
        self.traps.get(&object_id).map_or(&[], Vec::as_slice)
    }

    pub fn register(&mut self, trap: Arc<Trap>) {
        self.traps.entry(trap.object_id).or_default().push(trap);
    }

    pub fn remove(&mut self, trap: &Trap) {
        if let Some(list) = self.traps.get_mut(&trap.object_id) {
            list.retain(|t| t.id != trap.id);
            if list.is_empty() {
                self.traps.remove(&trap.object_id);
            }
        }
    }
}

/// Group name to bucket map
#[derive(Debug, Default)]
pub struct TrapStore {
    buckets: RwLock<HashMap<String, Arc<TrapBucket>>>,
    next_id: AtomicU64,
}

impl TrapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket for a group, created on first use
    pub fn bucket(&self, group: &str) -> Arc<TrapBucket> {
        if let Some(bucket) = self.buckets.read().get(group) {
            return Arc::clone(bucket);
        }
        Arc::clone(self.buckets.write().entry(group.to_string()).or_default())
    }

    pub fn next_trap_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Outstanding traps across every group
    pub fn outstanding(&self) -> usize {
        self.buckets.read().values().map(|b| b.len()).sum()
    }
}

/// Count of traps currently waiting, with a high-water mark
#[derive(Debug, Default)]
pub struct ActiveTraps {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ActiveTraps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more active trap
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
    }

    /// Claim the single global slot; false if any trap is active
    pub fn try_enter_exclusive(&self) -> bool {
        let claimed = self
            .current
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            self.peak.fetch_max(1, Ordering::AcqRel);
        }
        claimed
    }

    pub fn exit(&self) {
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn any_active(&self) -> bool {
        self.current() > 0
    }

    /// Highest number of simultaneously active traps seen
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

/// Wait on a trap and report how long it actually blocked
pub fn wait_timed(trap: &Trap) -> (WaitOutcome, Duration) {
    let start = Instant::now();
    let outcome = trap.wait();
    (outcome, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ApiClassifier, ThreadSafetyGroup};

    fn classification(is_write: bool) -> Classification {
        let classifier = ApiClassifier::new(&[ThreadSafetyGroup::new("List")
            .with_write_api("List.Add")
            .with_read_api("List.Contains")])
        .unwrap();
        let callee = if is_write { "List.Add" } else { "List.Contains" };
        classifier.classify(callee).unwrap()
    }

    fn trap(id: u64, object: u64, delay_ms: u64) -> Arc<Trap> {
        let mut point = InterceptionPoint::new("Worker.Run", "List.Add", 1, 1);
        point.object_id = ObjectId(object);
        Arc::new(Trap::new(
            id,
            Arc::new(point),
            classification(true),
            Duration::from_millis(delay_ms),
        ))
    }

    #[test]
    fn test_wait_times_out_within_delay() {
        let trap = trap(1, 1, 30);
        let (outcome, elapsed) = wait_timed(&trap);
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_millis(1000));
    }

    #[test]
    fn test_release_ends_wait_early() {
        let trap = trap(1, 1, 5_000);
        let waiter = {
            let trap = Arc::clone(&trap);
            std::thread::spawn(move || wait_timed(&trap))
        };
        std::thread::sleep(Duration::from_millis(20));
        trap.release();
        let (outcome, elapsed) = waiter.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Released);
        assert!(elapsed < Duration::from_millis(5_000));
    }

    #[test]
    fn test_release_twice_is_noop() {
        let trap = trap(1, 1, 0);
        trap.release();
        trap.release();
        assert_eq!(trap.wait(), WaitOutcome::Released);
    }

    #[test]
    fn test_bucket_register_and_remove_by_id() {
        let store = TrapStore::new();
        let bucket = store.bucket("List");
        let first = trap(1, 7, 10);
        let second = trap(2, 7, 10);
        {
            let mut guard = bucket.lock();
            guard.register(Arc::clone(&first));
            guard.register(Arc::clone(&second));
            assert_eq!(guard.traps_on(ObjectId(7)).len(), 2);
            assert!(guard.traps_on(ObjectId(8)).is_empty());
        }
        bucket.remove(&first);
        let guard = bucket.lock();
        assert_eq!(guard.traps_on(ObjectId(7)).len(), 1);
        assert_eq!(guard.traps_on(ObjectId(7))[0].id, 2);
    }

    #[test]
    fn test_buckets_are_shared_per_group() {
        let store = TrapStore::new();
        let a = store.bucket("List");
        let b = store.bucket("List");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &store.bucket("Dictionary")));

        a.lock().register(trap(1, 1, 10));
        assert_eq!(store.outstanding(), 1);
    }

    #[test]
    fn test_conflicts() {
        let write = trap(1, 1, 0);
        assert!(write.conflicts_with(false));
        assert!(write.conflicts_with(true));
    }

    #[test]
    fn test_exclusive_slot() {
        let active = ActiveTraps::new();
        assert!(active.try_enter_exclusive());
        assert!(!active.try_enter_exclusive());
        active.exit();
        assert!(active.try_enter_exclusive());
        active.exit();
        active.exit();
        assert_eq!(active.current(), 0);
        assert_eq!(active.peak(), 1);
    }

    #[test]
    fn test_peak_tracks_stacking() {
        let active = ActiveTraps::new();
        active.enter();
        active.enter();
        active.exit();
        active.enter();
        assert_eq!(active.current(), 2);
        assert_eq!(active.peak(), 2);
    }
}
