//! Trap plans: call sites to delay on purpose
//!
//! Plans come from two places: the `[[learned.plan]]` configuration table
//! and the plan file a previous run left behind. Each plan names a call site
//! (callee, caller, offset), optionally with `*` wildcards, plus the hit
//! counts at which it was interesting and how to delay when it matches.
//!
//! Lookup first tries the exact identity key `callee;caller;offset`. Only when
//! that misses are the pattern plans scanned, in insertion order.

use crate::error::ConfigError;
use crate::hit_count::HitCount;
use crate::interception::InterceptionPoint;
use crate::signature::{is_wildcard, WildcardPattern};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn any_offset() -> i32 {
    -1
}

fn full_probability() -> f64 {
    1.0
}

/// Number of times a plan has injected a delay
#[derive(Debug, Default)]
struct Injections(AtomicU32);

impl Clone for Injections {
    fn clone(&self) -> Self {
        Self(AtomicU32::new(self.0.load(Ordering::Relaxed)))
    }
}

/// A single trap plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrapPlan {
    /// Callee signature; may contain `*`
    pub callee: String,

    /// Caller signature; may contain `*`; absent matches any caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,

    /// Call-site offset, `-1` for any
    #[serde(default = "any_offset")]
    pub offset: i32,

    /// Only trap on this thread
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<u64>,

    /// Hit-count windows; empty matches every hit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hit_counts: Vec<HitCount>,

    #[serde(default = "full_probability")]
    pub delay_probability: f64,

    /// Fraction of probability lost after every injected delay
    #[serde(default)]
    pub decay_factor: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_delay_ms: Option<u64>,

    /// Upper bound for a uniformly drawn delay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_delay_ms: Option<u64>,

    /// Keep trapping after this plan already exposed a race
    #[serde(default)]
    pub repeat: bool,

    #[serde(skip)]
    injections: Injections,
}

impl TrapPlan {
    pub fn new(callee: impl Into<String>) -> Self {
        Self {
            callee: callee.into(),
            caller: None,
            offset: -1,
            thread_id: None,
            hit_counts: Vec::new(),
            delay_probability: 1.0,
            decay_factor: 0.0,
            fixed_delay_ms: None,
            random_delay_ms: None,
            repeat: false,
            injections: Injections::default(),
        }
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn with_offset(mut self, offset: i32) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_thread(mut self, thread_id: u64) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn with_hit_count(mut self, hit_count: HitCount) -> Self {
        self.hit_counts.push(hit_count);
        self
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.delay_probability = probability;
        self
    }

    pub fn with_decay(mut self, decay_factor: f64) -> Self {
        self.decay_factor = decay_factor;
        self
    }

    pub fn with_fixed_delay(mut self, delay_ms: u64) -> Self {
        self.fixed_delay_ms = Some(delay_ms);
        self
    }

    pub fn with_random_delay(mut self, bound_ms: u64) -> Self {
        self.random_delay_ms = Some(bound_ms);
        self
    }

    pub fn with_repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    /// Identity key `callee;caller;offset`
    pub fn identity_key(&self) -> String {
        format!(
            "{};{};{}",
            self.callee,
            self.caller.as_deref().unwrap_or(""),
            self.offset
        )
    }

    /// Whether the plan names one concrete call site
    pub fn is_exact(&self) -> bool {
        !is_wildcard(&self.callee)
            && self.caller.as_deref().is_some_and(|c| !is_wildcard(c))
            && self.offset >= 0
    }

    fn accepts_thread(&self, thread_id: u64) -> bool {
        self.thread_id.map_or(true, |t| t == thread_id)
    }

    fn accepts_hits(
        &self,
        point: &InterceptionPoint,
        global_window: i64,
        local_window: i64,
    ) -> bool {
        self.hit_counts.is_empty()
            || self.hit_counts.iter().any(|h| {
                h.is_match(
                    point.local_hit_count,
                    local_window,
                    point.global_hit_count,
                    global_window,
                )
            })
    }

    /// Probability after decay from previous injections
    pub fn current_probability(&self) -> f64 {
        let steps = self.injections.0.load(Ordering::Relaxed);
        let factor = (1.0 - self.decay_factor).clamp(0.0, 1.0);
        self.delay_probability * factor.powi(steps as i32)
    }

    /// Draw against the current probability
    pub fn should_inject<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        rng.gen::<f64>() < self.current_probability()
    }

    /// Record an injected delay, decaying future probability
    pub fn record_injection(&self) {
        self.injections.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn injections(&self) -> u32 {
        self.injections.0.load(Ordering::Relaxed)
    }

    /// Delay to inject when this plan fires
    ///
    /// Fixed delay wins, then a draw below the plan's own bound, then a draw
    /// below the controller-wide `max_delay_ms`.
    pub fn delay<R: Rng + ?Sized>(&self, rng: &mut R, max_delay_ms: u64) -> Duration {
        if let Some(fixed) = self.fixed_delay_ms {
            return Duration::from_millis(fixed);
        }
        let bound = self.random_delay_ms.unwrap_or(max_delay_ms);
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(0..bound))
    }

    fn merge(&mut self, other: TrapPlan) {
        self.hit_counts.extend(other.hit_counts);
        self.repeat |= other.repeat;
    }
}

#[derive(Debug)]
struct PatternPlan {
    plan: Arc<TrapPlan>,
    callee: WildcardPattern,
    caller: Option<WildcardPattern>,
}

impl PatternPlan {
    fn compile(plan: Arc<TrapPlan>) -> Result<Self, ConfigError> {
        let callee = WildcardPattern::new(&plan.callee)
            .map_err(|e| ConfigError::from((plan.callee.clone(), e)))?;
        let caller = plan
            .caller
            .as_deref()
            .map(|c| WildcardPattern::new(c).map_err(|e| ConfigError::from((c.to_string(), e))))
            .transpose()?;
        Ok(Self {
            plan,
            callee,
            caller,
        })
    }

    fn matches(&self, point: &InterceptionPoint, global_window: i64, local_window: i64) -> bool {
        self.callee.matches(&point.callee)
            && self.caller.as_ref().map_or(true, |c| c.matches(&point.caller))
            && (self.plan.offset < 0 || self.plan.offset == point.offset)
            && self.plan.accepts_thread(point.thread_id)
            && self.plan.accepts_hits(point, global_window, local_window)
    }
}

/// Lookup structure over all loaded plans
///
/// Built once at detector start; read-only afterwards apart from each plan's
/// own decay counter.
#[derive(Debug, Default)]
pub struct TrapPlanStore {
    exact: HashMap<String, Arc<TrapPlan>>,
    patterns: Vec<PatternPlan>,
    pattern_index: HashMap<String, usize>,
}

impl TrapPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a plan, merging with any plan sharing its identity key
    pub fn add_plan(&mut self, plan: TrapPlan) -> Result<(), ConfigError> {
        let key = plan.identity_key();

        if plan.is_exact() {
            match self.exact.get_mut(&key) {
                Some(existing) => Arc::make_mut(existing).merge(plan),
                None => {
                    self.exact.insert(key, Arc::new(plan));
                }
            }
            return Ok(());
        }

        if let Some(&index) = self.pattern_index.get(&key) {
            Arc::make_mut(&mut self.patterns[index].plan).merge(plan);
            return Ok(());
        }

        let compiled = PatternPlan::compile(Arc::new(plan))?;
        self.pattern_index.insert(key, self.patterns.len());
        self.patterns.push(compiled);
        Ok(())
    }

    /// Insert every plan from an iterator
    pub fn extend<I>(&mut self, plans: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = TrapPlan>,
    {
        for plan in plans {
            self.add_plan(plan)?;
        }
        Ok(())
    }

    /// Find the plan governing a live interception point
    pub fn find_matching_plan(
        &self,
        point: &InterceptionPoint,
        global_window: i64,
        local_window: i64,
    ) -> Option<Arc<TrapPlan>> {
        let key = format!("{};{};{}", point.callee, point.caller, point.offset);
        if let Some(plan) = self.exact.get(&key) {
            if plan.accepts_thread(point.thread_id)
                && plan.accepts_hits(point, global_window, local_window)
            {
                return Some(Arc::clone(plan));
            }
            return None;
        }

        self.patterns
            .iter()
            .find(|p| p.matches(point, global_window, local_window))
            .map(|p| Arc::clone(&p.plan))
    }

    /// All plans, exact plans first in key order, then pattern plans
    pub fn plans(&self) -> Vec<Arc<TrapPlan>> {
        let mut keys: Vec<&String> = self.exact.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|k| self.exact.get(k).cloned())
            .chain(self.patterns.iter().map(|p| Arc::clone(&p.plan)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
