// Trap controllers
//
// A controller sees every intercepted call and decides whether to delay it.
// Two strategies are available: `randomized` traps writes with a fixed
// probability and allows at most one trap at a time; `learned` keeps a
// history of recent accesses, learns which call-site pairs come close to
// racing, and concentrates delays on those pairs in this and later runs.
//
// Both share a `ControllerContext` holding the classifier, object identities,
// the trap store and the race ledger, and report through the same sink.

mod danger;
mod history;
mod learned;
mod randomized;

pub use danger::DangerTracker;
pub use history::{GlobalHistory, LocalHitCounts, ObjectAccessLog, ThreadRecords};
pub use learned::LearnedController;
pub use randomized::RandomizedController;

use crate::classifier::{ApiClassifier, Classification};
use crate::error::RaceDetected;
use crate::interception::InterceptionPoint;
use crate::object_id::{InstanceRef, ObjectId, ObjectTracker};
use crate::persistence::{BugLog, LocationPair};
use crate::sink::ReportSink;
use crate::trap::{ActiveTraps, Trap, TrapStore};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::time::Duration;

/// Strategy deciding when to trap an intercepted call
pub trait TrapController: Send + Sync {
    /// Handle one intercepted call, possibly blocking for a bounded delay
    fn on_call(
        &self,
        instance: Option<InstanceRef>,
        point: InterceptionPoint,
    ) -> Result<(), RaceDetected>;

    fn name(&self) -> &'static str;

    /// Shared state, for inspection
    fn context(&self) -> &ControllerContext;

    /// Currently known dangerous pairs
    fn dangerous_pairs(&self) -> Vec<LocationPair> {
        Vec::new()
    }

    /// Drop the identity of a freed instance and anything keyed by it
    fn forget(&self, instance: InstanceRef) -> Option<ObjectId> {
        self.context().objects.forget(instance)
    }

    /// Flush buffered state
    fn shutdown(&self) {
        self.context().sink.flush();
    }
}

/// What happened to a detected conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceVerdict {
    /// First occurrence of this pair in the run
    New,
    /// Already reported in this run
    Duplicate,
    /// Confirmed in an earlier run
    Blacklisted,
}

/// Per-run record of reported races plus the cross-run blacklist
#[derive(Debug)]
pub struct RaceLedger {
    seen: Mutex<HashSet<LocationPair>>,
    blacklist: HashSet<LocationPair>,
    bug_log: BugLog,
}

impl RaceLedger {
    pub fn new(blacklist: HashSet<LocationPair>, bug_log: BugLog) -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            blacklist,
            bug_log,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(HashSet::new(), BugLog::disabled())
    }

    pub fn is_blacklisted(&self, pair: &LocationPair) -> bool {
        self.blacklist.contains(pair)
    }

    /// Classify a race and persist it when new
    pub fn record(&self, pair: LocationPair) -> RaceVerdict {
        if self.is_blacklisted(&pair) {
            return RaceVerdict::Blacklisted;
        }
        if !self.seen.lock().insert(pair.clone()) {
            return RaceVerdict::Duplicate;
        }
        self.bug_log.append(&pair);
        RaceVerdict::New
    }

    /// Distinct races reported this run
    pub fn reported(&self) -> Vec<LocationPair> {
        let mut pairs: Vec<_> = self.seen.lock().iter().cloned().collect();
        pairs.sort();
        pairs
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.len()
    }
}

/// State shared by every controller
pub struct ControllerContext {
    pub classifier: ApiClassifier,
    pub objects: ObjectTracker,
    pub traps: TrapStore,
    pub active: ActiveTraps,
    pub ledger: RaceLedger,
    pub sink: Box<dyn ReportSink>,
    pub raise_on_race: bool,
}

impl ControllerContext {
    pub fn new(
        classifier: ApiClassifier,
        ledger: RaceLedger,
        sink: Box<dyn ReportSink>,
        raise_on_race: bool,
    ) -> Self {
        Self {
            classifier,
            objects: ObjectTracker::new(),
            traps: TrapStore::new(),
            active: ActiveTraps::new(),
            ledger,
            sink,
            raise_on_race,
        }
    }

    /// Classify a call and skip instance-scoped groups without an instance
    pub fn classify(
        &self,
        callee: &str,
        instance: Option<InstanceRef>,
    ) -> Option<Classification> {
        self.classifier
            .classify(callee)
            .filter(|c| !c.requires_instance() || instance.is_some())
    }

    /// Object a classified call touches
    pub fn object_for(
        &self,
        classification: &Classification,
        instance: Option<InstanceRef>,
    ) -> ObjectId {
        if classification.requires_instance() {
            self.objects.id_of(instance)
        } else {
            ObjectId::STATIC
        }
    }

    /// Report a conflict between `trap` and `racing`
    ///
    /// Returns the error to surface when the conflict counts as a race.
    pub fn handle_race(&self, trap: &Trap, racing: &InterceptionPoint) -> Option<RaceDetected> {
        let pair = LocationPair::new(trap.point.location.as_str(), racing.location.as_str());
        match self.ledger.record(pair) {
            RaceVerdict::Blacklisted => return None,
            RaceVerdict::New => {
                racing.capture_stack();
                self.sink.race_found(trap, racing);
            }
            RaceVerdict::Duplicate => {
                tracing::debug!(
                    trapped = %trap.point.location,
                    racing = %racing.location,
                    "duplicate race suppressed"
                );
            }
        }
        trap.release();
        Some(RaceDetected {
            object_id: trap.object_id,
            trapped: trap.point.location.clone(),
            racing: racing.location.clone(),
        })
    }

    /// Convert the first detected race into the caller's result
    pub fn finish(&self, race: Option<RaceDetected>) -> Result<(), RaceDetected> {
        match race {
            Some(race) if self.raise_on_race => Err(race),
            _ => Ok(()),
        }
    }
}

/// RNG from an optional seed; absent or zero seeds from entropy
pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) if seed != 0 => StdRng::seed_from_u64(seed),
        _ => StdRng::from_entropy(),
    }
}

/// Uniform delay in `[0, max_ms)`
pub fn random_delay<R: rand::Rng + ?Sized>(rng: &mut R, max_ms: u64) -> Duration {
    if max_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rng.gen_range(0..max_ms))
    }
}
