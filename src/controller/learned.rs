//! Learned happens-before trap controller
//!
//! Watches every intercepted call, including unclassified ones, to learn
//! which call-site pairs touch the same object from different threads in
//! close succession. Such dangerous pairs are trapped with a high, decaying
//! probability and written to the plan file so the next run can replay them.
//!
//! A trap that delays one thread and thereby stalls another suggests the two
//! accesses are ordered by synchronization. After each wait the trapped point
//! receives delay credit; the stalled threads spend it to drop the pair.

use super::{
    random_delay, seeded_rng, ControllerContext, DangerTracker, GlobalHistory, LocalHitCounts,
    ObjectAccessLog, ThreadRecords, TrapController,
};
use crate::classifier::Classification;
use crate::config::LearnedParams;
use crate::error::RaceDetected;
use crate::interception::InterceptionPoint;
use crate::object_id::{InstanceRef, ObjectId};
use crate::persistence::{format_plan_line, LocationPair, PlanLog};
use crate::signature::PatternSet;
use crate::trap::Trap;
use crate::trap_plan::{TrapPlan, TrapPlanStore};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

pub struct LearnedController {
    ctx: ControllerContext,
    params: LearnedParams,
    plans: TrapPlanStore,
    plan_log: PlanLog,
    lock_apis: PatternSet,
    local_hits: LocalHitCounts,
    history: GlobalHistory,
    threads: ThreadRecords,
    accesses: ObjectAccessLog,
    danger: DangerTracker,
    rng: Mutex<StdRng>,
}

impl LearnedController {
    pub fn new(
        ctx: ControllerContext,
        params: LearnedParams,
        plans: TrapPlanStore,
        plan_log: PlanLog,
        lock_apis: PatternSet,
    ) -> Self {
        Self {
            ctx,
            history: GlobalHistory::new(params.history_window),
            accesses: ObjectAccessLog::new(params.last_access_window),
            rng: Mutex::new(seeded_rng(params.random_seed)),
            params,
            plans,
            plan_log,
            lock_apis,
            local_hits: LocalHitCounts::new(),
            threads: ThreadRecords::new(),
            danger: DangerTracker::new(),
        }
    }

    pub fn plans(&self) -> &TrapPlanStore {
        &self.plans
    }

    pub fn danger(&self) -> &DangerTracker {
        &self.danger
    }

    pub fn access_log(&self) -> &ObjectAccessLog {
        &self.accesses
    }

    fn learning(&self, point: &InterceptionPoint) -> bool {
        !point.in_plan && self.params.detect_dangerous_pairs
    }

    /// Record candidate pairs formed with earlier accesses to the same object
    fn discover_pairs(&self, group: &str, point: &Arc<InterceptionPoint>) {
        let near_miss = Duration::from_millis(self.params.near_miss_window_ms);

        for other in self.accesses.push(group, point) {
            if other.thread_id == point.thread_id {
                continue;
            }
            if !other.is_write && !point.is_write {
                continue;
            }
            if point.timestamp.saturating_duration_since(other.timestamp) > near_miss {
                continue;
            }
            if other.active_threads <= 1 && point.active_threads <= 1 {
                continue;
            }

            let pair = LocationPair::new(other.location.as_str(), point.location.as_str());
            if self.ctx.ledger.is_blacklisted(&pair) {
                continue;
            }
            if self.danger.consider(pair, self.params.pair_decay_threshold) {
                tracing::debug!(
                    first = %other.location,
                    second = %point.location,
                    "dangerous pair"
                );
                self.plan_log
                    .record(format_plan_line(&other.plan_string(), &point.plan_string()));
            }
        }
    }

    /// Spend a blocker's credit to drop a pair ordered by synchronization
    fn prune_happens_before(&self, point: &InterceptionPoint) {
        let Some(blocker) = self.threads.blocked_by(point.thread_id) else {
            return;
        };
        if blocker.consume_delay_credit() {
            let pair = LocationPair::new(point.location.as_str(), blocker.location.as_str());
            if self.danger.remove(&pair) {
                tracing::debug!(
                    first = %point.location,
                    second = %blocker.location,
                    "pair pruned by happens-before"
                );
            }
        }
        if blocker.delay_credit() <= 0 {
            self.threads.clear_blocked_by(point.thread_id);
        }
    }

    /// Probability and delay for a new trap, or `None` if not eligible
    fn trap_terms(
        &self,
        point: &InterceptionPoint,
        plan: Option<&TrapPlan>,
        rng: &mut StdRng,
    ) -> Option<Duration> {
        if plan.is_none() && !point.is_write {
            return None;
        }

        let danger = self.danger.weigh(&point.location);
        let first_trap = self.params.trap_unknown_points && !self.ctx.active.any_active();
        if !(first_trap || danger.is_some() || point.in_plan) {
            return None;
        }

        let (probability, delay) = match (plan, danger) {
            (Some(plan), _) => {
                if !plan.should_inject(rng) {
                    return None;
                }
                return Some(plan.delay(rng, self.params.max_delay_ms));
            }
            (None, Some(level)) => (
                self.params.dangerous_delay_probability - self.params.decay_factor * level as f64,
                Duration::from_millis(self.params.dangerous_delay_ms),
            ),
            (None, None) => (
                self.params.delay_probability,
                random_delay(rng, self.params.max_delay_ms),
            ),
        };

        (rng.gen::<f64>() < probability).then_some(delay)
    }

    fn decide(
        &self,
        point: &Arc<InterceptionPoint>,
        classification: Classification,
        plan: Option<&Arc<TrapPlan>>,
    ) -> (Vec<Arc<Trap>>, Option<Arc<Trap>>) {
        let repeat = plan.is_some_and(|p| p.repeat);
        let bucket = self.ctx.traps.bucket(classification.group_name());
        let mut guard = bucket.lock();

        let mut races = Vec::new();
        for trap in guard.traps_on(point.object_id) {
            if trap.point.thread_id == point.thread_id || !trap.conflicts_with(point.is_write) {
                continue;
            }
            let pair = LocationPair::new(trap.point.location.as_str(), point.location.as_str());
            if self.ctx.ledger.is_blacklisted(&pair) {
                continue;
            }
            races.push(Arc::clone(trap));
            if !repeat {
                break;
            }
        }
        if !races.is_empty() && !repeat {
            return (races, None);
        }

        let delay = {
            let mut rng = self.rng.lock();
            self.trap_terms(point, plan.map(Arc::as_ref), &mut rng)
        };
        let Some(delay) = delay else {
            return (races, None);
        };

        // A racing thread can report the trap as soon as it is registered
        point.capture_stack();
        let trap = Arc::new(Trap::new(
            self.ctx.traps.next_trap_id(),
            Arc::clone(point),
            classification,
            delay,
        ));
        guard.register(Arc::clone(&trap));
        self.ctx.active.enter();
        if let Some(plan) = plan {
            plan.record_injection();
        }
        (races, Some(trap))
    }
}

impl TrapController for LearnedController {
    fn on_call(
        &self,
        instance: Option<InstanceRef>,
        mut point: InterceptionPoint,
    ) -> Result<(), RaceDetected> {
        point.local_hit_count = self.local_hits.next(&point.location);

        let plan = self.plans.find_matching_plan(
            &point,
            self.params.global_hitcount_window,
            self.params.local_hitcount_window,
        );
        point.in_plan = plan.is_some();
        if point.in_plan {
            tracing::debug!(
                location = %point.location,
                hit = point.local_hit_count,
                "plan matched"
            );
        }

        point.active_threads = self.history.push(point.thread_id);

        let is_lock = self.lock_apis.matches_any(&point.callee);
        let classification = if is_lock {
            None
        } else {
            self.ctx.classify(&point.callee, instance)
        };
        if let Some(classification) = &classification {
            point.is_write = classification.is_write;
            point.object_id = self.ctx.object_for(classification, instance);
        }

        let point = Arc::new(point);
        self.threads.set_last(Arc::clone(&point));

        let Some(classification) = classification else {
            return Ok(());
        };

        if self.learning(&point) {
            self.discover_pairs(classification.group_name(), &point);
            self.prune_happens_before(&point);
        }

        let bucket = self.ctx.traps.bucket(classification.group_name());
        let (races, trap) = self.decide(&point, classification, plan.as_ref());

        let mut race = None;
        for conflict in &races {
            let found = self.ctx.handle_race(conflict, &point);
            race = race.or(found);
        }

        if let Some(trap) = trap {
            self.ctx.sink.trap_set(&trap);
            trap.wait();

            point.grant_delay_credit(self.params.infer_size);
            let limit = Duration::try_from_secs_f64(
                (self.params.infer_limit * self.params.dangerous_delay_ms as f64 / 1000.0).max(0.0),
            )
            .unwrap_or(Duration::MAX);
            self.threads.mark_blocked_near(&point, limit);

            bucket.remove(&trap);
            self.ctx.active.exit();
        }

        self.ctx.finish(race)
    }

    fn name(&self) -> &'static str {
        "learned_history"
    }

    fn context(&self) -> &ControllerContext {
        &self.ctx
    }

    fn dangerous_pairs(&self) -> Vec<LocationPair> {
        self.danger.pairs()
    }

    fn forget(&self, instance: InstanceRef) -> Option<ObjectId> {
        let id = self.ctx.objects.forget(instance)?;
        let dropped = self.accesses.forget(id);
        tracing::trace!(object = id.as_u64(), queues = dropped, "object forgotten");
        Some(id)
    }

    fn shutdown(&self) {
        self.plan_log.flush();
        self.ctx.sink.flush();
    }
}
