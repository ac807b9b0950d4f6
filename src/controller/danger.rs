//! Dangerous-pair bookkeeping
//!
//! A dangerous pair is two call sites seen touching the same object from
//! different threads close together in time. Each location in a live pair
//! carries a trap hit count that grows every time the location is weighed
//! for a trap; the count lowers the trap probability and, once the pair's
//! combined count passes a threshold, stops the pair from being refreshed.

use crate::persistence::LocationPair;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct DangerState {
    pairs: HashSet<LocationPair>,
    membership: HashMap<String, usize>,
    hit_time: HashMap<String, u64>,
}

impl DangerState {
    fn hits(&self, location: &str) -> u64 {
        self.hit_time.get(location).copied().unwrap_or(0)
    }

    fn adjust_membership(&mut self, pair: &LocationPair, add: bool) {
        let locations: &[&str] = if pair.first() == pair.second() {
            &[pair.first()]
        } else {
            &[pair.first(), pair.second()]
        };
        for location in locations {
            if add {
                *self.membership.entry(location.to_string()).or_insert(0) += 1;
            } else if let Some(count) = self.membership.get_mut(*location) {
                *count -= 1;
                if *count == 0 {
                    self.membership.remove(*location);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct DangerTracker {
    state: Mutex<DangerState>,
}

impl DangerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a candidate pair
    ///
    /// Returns false, leaving state untouched, when the pair is already
    /// known and its locations were weighed `threshold` times or more.
    /// Otherwise resets both hit counts, (re-)inserts the pair and returns
    /// true.
    pub fn consider(&self, pair: LocationPair, threshold: u64) -> bool {
        let mut state = self.state.lock();
        let known = state.pairs.contains(&pair);
        if known && state.hits(pair.first()) + state.hits(pair.second()) >= threshold {
            return false;
        }

        state.hit_time.insert(pair.first().to_string(), 0);
        state.hit_time.insert(pair.second().to_string(), 0);
        if !known {
            state.adjust_membership(&pair, true);
            state.pairs.insert(pair);
        }
        true
    }

    /// Drop a pair shown to be ordered by happens-before
    pub fn remove(&self, pair: &LocationPair) -> bool {
        let mut state = self.state.lock();
        if state.pairs.remove(pair) {
            state.adjust_membership(pair, false);
            true
        } else {
            false
        }
    }

    /// Danger level of a location, counting this query as a hit
    ///
    /// `None` when the location is in no live pair.
    pub fn weigh(&self, location: &str) -> Option<u64> {
        let mut state = self.state.lock();
        if !state.membership.contains_key(location) {
            return None;
        }
        let hits = state.hit_time.entry(location.to_string()).or_insert(0);
        let level = *hits;
        *hits += 1;
        Some(level)
    }

    pub fn is_dangerous(&self, location: &str) -> bool {
        self.state.lock().membership.contains_key(location)
    }

    pub fn contains(&self, pair: &LocationPair) -> bool {
        self.state.lock().pairs.contains(pair)
    }

    /// Snapshot of live pairs, sorted
    pub fn pairs(&self) -> Vec<LocationPair> {
        let mut pairs: Vec<_> = self.state.lock().pairs.iter().cloned().collect();
        pairs.sort();
        pairs
    }

    pub fn len(&self) -> usize {
        self.state.lock().pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
