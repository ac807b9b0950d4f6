//! Hit-count windows for replaying trap plans
//!
//! A plan recorded in one run remembers how many times its call site had
//! been hit (locally, and across all call sites globally) when the
//! interesting interleaving happened. On replay the live counts rarely line
//! up exactly, so matching tolerates a configurable distance.

use serde::{Deserialize, Serialize};

/// Recorded (local, global) hit counts
///
/// A negative recorded value means "don't care".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitCount {
    #[serde(default = "dont_care")]
    pub local: i64,
    #[serde(default = "dont_care")]
    pub global: i64,
}

fn dont_care() -> i64 {
    -1
}

impl Default for HitCount {
    fn default() -> Self {
        Self {
            local: -1,
            global: -1,
        }
    }
}

impl HitCount {
    pub fn new(local: i64, global: i64) -> Self {
        Self { local, global }
    }

    /// Check a live hit against this record
    ///
    /// # Example
    /// ```
    /// use racetrap::hit_count::HitCount;
    ///
    /// let recorded = HitCount::new(3, -1);
    /// assert!(recorded.is_match(8, 5, 1000, 20));
    /// assert!(!recorded.is_match(9, 5, 1000, 20));
    /// ```
    pub fn is_match(&self, local: i64, local_window: i64, global: i64, global_window: i64) -> bool {
        (self.local < 0 || (local - self.local).abs() <= local_window)
            && (self.global < 0 || (global - self.global).abs() <= global_window)
    }
}
