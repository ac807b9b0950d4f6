//! Access history for the learned controller
//!
//! Four small structures, each behind its own lock:
//! - [`LocalHitCounts`]: hits per location key
//! - [`GlobalHistory`]: the last N threads to make any intercepted call
//! - [`ThreadRecords`]: each thread's latest access and what it is blocked by
//! - [`ObjectAccessLog`]: recent accesses per (group, object)

use crate::interception::InterceptionPoint;
use crate::object_id::ObjectId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Per-location hit counter
#[derive(Debug, Default)]
pub struct LocalHitCounts {
    counts: Mutex<HashMap<String, i64>>,
}

impl LocalHitCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a hit; returns the number of earlier hits
    pub fn next(&self, location: &str) -> i64 {
        let mut counts = self.counts.lock();
        match counts.get_mut(location) {
            Some(count) => {
                let previous = *count;
                *count += 1;
                previous
            }
            None => {
                counts.insert(location.to_string(), 1);
                0
            }
        }
    }

    pub fn get(&self, location: &str) -> i64 {
        self.counts.lock().get(location).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct Ring {
    threads: VecDeque<u64>,
    per_thread: HashMap<u64, usize>,
}

/// Bounded ring of the threads behind the most recent calls
#[derive(Debug)]
pub struct GlobalHistory {
    capacity: usize,
    ring: Mutex<Ring>,
}

impl GlobalHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: Mutex::new(Ring::default()),
        }
    }

    /// Record a call; returns distinct threads now in the window
    pub fn push(&self, thread_id: u64) -> usize {
        let mut ring = self.ring.lock();
        ring.threads.push_back(thread_id);
        *ring.per_thread.entry(thread_id).or_insert(0) += 1;

        while ring.threads.len() > self.capacity {
            if let Some(evicted) = ring.threads.pop_front() {
                if let Some(count) = ring.per_thread.get_mut(&evicted) {
                    *count -= 1;
                    if *count == 0 {
                        ring.per_thread.remove(&evicted);
                    }
                }
            }
        }
        ring.per_thread.len()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct ThreadRecord {
    last: Option<Arc<InterceptionPoint>>,
    blocked_by: Option<Arc<InterceptionPoint>>,
}

/// Latest access and inferred blocker of every thread
#[derive(Debug, Default)]
pub struct ThreadRecords {
    records: Mutex<HashMap<u64, ThreadRecord>>,
}

impl ThreadRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_last(&self, point: Arc<InterceptionPoint>) {
        let thread_id = point.thread_id;
        self.records.lock().entry(thread_id).or_default().last = Some(point);
    }

    pub fn last(&self, thread_id: u64) -> Option<Arc<InterceptionPoint>> {
        self.records.lock().get(&thread_id).and_then(|r| r.last.clone())
    }

    pub fn blocked_by(&self, thread_id: u64) -> Option<Arc<InterceptionPoint>> {
        self.records
            .lock()
            .get(&thread_id)
            .and_then(|r| r.blocked_by.clone())
    }

    pub fn clear_blocked_by(&self, thread_id: u64) {
        if let Some(record) = self.records.lock().get_mut(&thread_id) {
            record.blocked_by = None;
        }
    }

    /// Mark every other thread whose latest access lies within `limit` of
    /// `blocker` as blocked by it; returns how many were marked
    pub fn mark_blocked_near(&self, blocker: &Arc<InterceptionPoint>, limit: Duration) -> usize {
        let mut marked = 0;
        for (thread_id, record) in self.records.lock().iter_mut() {
            if *thread_id == blocker.thread_id {
                continue;
            }
            let Some(last) = &record.last else {
                continue;
            };
            let distance = if last.timestamp >= blocker.timestamp {
                last.timestamp - blocker.timestamp
            } else {
                blocker.timestamp - last.timestamp
            };
            if distance <= limit {
                record.blocked_by = Some(Arc::clone(blocker));
                marked += 1;
            }
        }
        marked
    }
}

/// Recent accesses per (group, object)
#[derive(Debug)]
pub struct ObjectAccessLog {
    window: usize,
    accesses: Mutex<HashMap<(String, ObjectId), VecDeque<Arc<InterceptionPoint>>>>,
}

impl ObjectAccessLog {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            accesses: Mutex::new(HashMap::new()),
        }
    }

    /// Append an access; returns the accesses that preceded it, oldest first
    pub fn push(&self, group: &str, point: &Arc<InterceptionPoint>) -> Vec<Arc<InterceptionPoint>> {
        let mut accesses = self.accesses.lock();
        let queue = accesses
            .entry((group.to_string(), point.object_id))
            .or_default();
        let previous: Vec<_> = queue.iter().cloned().collect();
        queue.push_back(Arc::clone(point));
        while queue.len() > self.window {
            queue.pop_front();
        }
        previous
    }

    /// Drop the queues of a freed object; returns how many were removed
    pub fn forget(&self, object_id: ObjectId) -> usize {
        let mut accesses = self.accesses.lock();
        let before = accesses.len();
        accesses.retain(|(_, id), _| *id != object_id);
        before - accesses.len()
    }

    /// Number of (group, object) queues held
    pub fn len(&self) -> usize {
        self.accesses.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.accesses.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn point(thread_id: u64, location_offset: i32) -> Arc<InterceptionPoint> {
        Arc::new(InterceptionPoint::new("Worker", "List.Add", location_offset, thread_id))
    }

    #[test]
    fn test_local_hit_counts() {
        let counts = LocalHitCounts::new();
        assert_eq!(counts.next("a"), 0);
        assert_eq!(counts.next("a"), 1);
        assert_eq!(counts.next("b"), 0);
        assert_eq!(counts.get("a"), 2);
        assert_eq!(counts.get("c"), 0);
    }

    #[test]
    fn test_global_history_distinct_threads() {
        let history = GlobalHistory::new(3);
        assert_eq!(history.push(1), 1);
        assert_eq!(history.push(1), 1);
        assert_eq!(history.push(2), 2);
        // thread 1's first entry is evicted, the second remains
        assert_eq!(history.push(3), 3);
        // both thread 1 entries are gone now
        assert_eq!(history.push(3), 2);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_thread_records_blocked_by() {
        let records = ThreadRecords::new();
        let a = point(1, 1);
        let b = point(2, 2);
        records.set_last(Arc::clone(&a));
        records.set_last(Arc::clone(&b));

        let marked = records.mark_blocked_near(&a, Duration::from_secs(60));
        assert_eq!(marked, 1);
        assert_eq!(records.blocked_by(2).unwrap().location, a.location);
        assert!(records.blocked_by(1).is_none());

        records.clear_blocked_by(2);
        assert!(records.blocked_by(2).is_none());
        assert_eq!(records.last(1).unwrap().location, a.location);
    }

    #[test]
    fn test_blocked_by_respects_limit() {
        let records = ThreadRecords::new();
        let mut early = InterceptionPoint::new("Worker", "List.Add", 1, 2);
        early.timestamp = Instant::now() - Duration::from_secs(5);
        records.set_last(Arc::new(early));

        let blocker = point(1, 9);
        assert_eq!(records.mark_blocked_near(&blocker, Duration::from_millis(50)), 0);
        assert!(records.blocked_by(2).is_none());
    }

    #[test]
    fn test_object_access_log_window() {
        let log = ObjectAccessLog::new(2);
        let first = point(1, 1);
        assert!(log.push("List", &first).is_empty());
        assert_eq!(log.push("List", &point(2, 2)).len(), 1);
        let previous = log.push("List", &point(3, 3));
        assert_eq!(previous.len(), 2);
        // oldest evicted
        let previous = log.push("List", &point(4, 4));
        assert_eq!(previous[0].offset, 2);
        assert!(log.push("Dictionary", &point(5, 5)).is_empty());
    }

    #[test]
    fn test_object_access_log_forget() {
        let log = ObjectAccessLog::new(4);
        let mut other = InterceptionPoint::new("Worker", "List.Add", 7, 3);
        other.object_id = ObjectId(9);
        let other = Arc::new(other);

        log.push("List", &point(1, 1));
        log.push("Dictionary", &point(2, 2));
        log.push("List", &other);
        assert_eq!(log.len(), 3);

        // every group queue of the freed object goes, the other object stays
        assert_eq!(log.forget(point(1, 1).object_id), 2);
        assert_eq!(log.len(), 1);
        assert_eq!(log.forget(ObjectId(9)), 1);
        assert!(log.is_empty());
        assert_eq!(log.forget(ObjectId(9)), 0);
    }
}
