//! Detector context and the interception entry point
//!
//! Instrumented code calls [`Detector::on_interception_start`] right before
//! every guarded API call. The detector stamps the call with thread and
//! sequence information and hands it to the configured controller.
//!
//! # Example
//! ```
//! use racetrap::{Detector, RuntimeConfig, ThreadSafetyGroup, RandomizedParams};
//! use racetrap::object_id::InstanceRef;
//!
//! let config = RuntimeConfig::randomized(RandomizedParams::default())
//!     .with_group(ThreadSafetyGroup::new("List").with_write_api("List.Add"));
//! let detector = Detector::from_config(config);
//!
//! let list: Vec<u32> = Vec::new();
//! detector
//!     .on_interception_start(Some(InstanceRef::of(&list)), "Example.Main", "List.Contains", 4)
//!     .unwrap();
//! ```

use crate::classifier::ApiClassifier;
use crate::config::{RuntimeConfig, TrapAlgorithm};
use crate::controller::{
    ControllerContext, LearnedController, RaceLedger, RandomizedController, TrapController,
};
use crate::error::{ConfigError, RaceDetected};
use crate::interception::{current_thread_id, InterceptionPoint};
use crate::object_id::InstanceRef;
use crate::persistence::{self, BugLog, LocationPair, PlanLog};
use crate::signature::PatternSet;
use crate::sink::{FileSink, MultiSink, ReportSink, TracingSink};
use crate::trap_plan::TrapPlanStore;
use std::sync::atomic::{AtomicI64, Ordering};

/// Controller context owned by the instrumented process
pub struct Detector {
    controller: Option<Box<dyn TrapController>>,
    sequence: AtomicI64,
}

impl Detector {
    /// Build a detector, disabling detection if the configuration is invalid
    pub fn from_config(config: RuntimeConfig) -> Self {
        match Self::try_from_config(config) {
            Ok(detector) => detector,
            Err(e) => {
                tracing::error!("Invalid racetrap configuration, detection disabled: {}", e);
                Self::disabled()
            }
        }
    }

    /// Build a detector, returning configuration errors
    pub fn try_from_config(config: RuntimeConfig) -> Result<Self, ConfigError> {
        DetectorBuilder::new(config).build()
    }

    pub fn builder(config: RuntimeConfig) -> DetectorBuilder {
        DetectorBuilder::new(config)
    }

    /// Detector on which every call is a no-op
    pub fn disabled() -> Self {
        Self {
            controller: None,
            sequence: AtomicI64::new(0),
        }
    }

    /// Entry point called before a guarded API executes
    ///
    /// May block the calling thread for up to the configured maximum delay.
    /// Fails only when `raise_on_race` is set and this call raced with a
    /// trapped access.
    pub fn on_interception_start(
        &self,
        instance: Option<InstanceRef>,
        caller: &str,
        callee: &str,
        offset: i32,
    ) -> Result<(), RaceDetected> {
        let Some(controller) = &self.controller else {
            return Ok(());
        };
        let mut point = InterceptionPoint::new(caller, callee, offset, current_thread_id());
        point.global_hit_count = self.sequence.fetch_add(1, Ordering::Relaxed);
        controller.on_call(instance, point)
    }

    pub fn is_enabled(&self) -> bool {
        self.controller.is_some()
    }

    /// Name of the active controller
    pub fn algorithm(&self) -> &'static str {
        self.controller.as_ref().map_or("none", |c| c.name())
    }

    /// Calls seen so far
    pub fn interceptions(&self) -> i64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Drop the identity of an instance that was freed
    pub fn forget(&self, instance: InstanceRef) {
        if let Some(controller) = &self.controller {
            controller.forget(instance);
        }
    }

    /// Distinct races reported in this run
    pub fn reported_races(&self) -> Vec<LocationPair> {
        self.controller
            .as_ref()
            .map(|c| c.context().ledger.reported())
            .unwrap_or_default()
    }

    pub fn dangerous_pairs(&self) -> Vec<LocationPair> {
        self.controller
            .as_ref()
            .map(|c| c.dangerous_pairs())
            .unwrap_or_default()
    }

    /// Most traps ever waiting at the same time
    pub fn peak_active_traps(&self) -> usize {
        self.controller
            .as_ref()
            .map_or(0, |c| c.context().active.peak())
    }

    pub fn outstanding_traps(&self) -> usize {
        self.controller
            .as_ref()
            .map_or(0, |c| c.context().traps.outstanding())
    }

    /// Flush the plan log and report sinks
    pub fn shutdown(&self) {
        if let Some(controller) = &self.controller {
            controller.shutdown();
        }
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for [`Detector`]
///
/// # Example
/// ```
/// use racetrap::{Detector, LearnedParams, MemorySink, RuntimeConfig};
///
/// let sink = MemorySink::new();
/// let detector = Detector::builder(RuntimeConfig::learned(LearnedParams::in_memory()))
///     .with_sink(sink.clone())
///     .with_raise_on_race(true)
///     .build()
///     .unwrap();
/// assert_eq!(detector.algorithm(), "learned_history");
/// ```
pub struct DetectorBuilder {
    config: RuntimeConfig,
    sinks: Vec<Box<dyn ReportSink>>,
    tracing: bool,
}

impl DetectorBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            sinks: Vec::new(),
            tracing: true,
        }
    }

    /// Add a sink next to the configured ones
    pub fn with_sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn with_raise_on_race(mut self, raise: bool) -> Self {
        self.config.raise_on_race = raise;
        self
    }

    /// Emit `tracing` events for traps and races (on by default)
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.tracing = enabled;
        self
    }

    pub fn build(self) -> Result<Detector, ConfigError> {
        let config = self.config;
        config.validate()?;

        if config.algorithm == TrapAlgorithm::None {
            tracing::info!("racetrap detection disabled");
            return Ok(Detector::disabled());
        }

        let classifier = ApiClassifier::new(&config.groups)?;

        let mut sink = MultiSink::new();
        if self.tracing {
            sink.push(Box::new(TracingSink));
        }
        if let Some(report) = &config.report_file {
            let path = config.resolve_log_path(report);
            match FileSink::create(&path, config.report_format, config.log_traps) {
                Ok(file) => {
                    tracing::info!("Writing race reports to {}", file.path().display());
                    sink.push(Box::new(file));
                }
                Err(e) => tracing::warn!("Failed to open report file {}: {}", path.display(), e),
            }
        }
        for extra in self.sinks {
            sink.push(extra);
        }

        let controller: Box<dyn TrapController> = match config.algorithm {
            TrapAlgorithm::Randomized => {
                let params = config.randomized.clone().unwrap_or_default();
                let ctx = ControllerContext::new(
                    classifier,
                    RaceLedger::in_memory(),
                    Box::new(sink),
                    config.raise_on_race,
                );
                Box::new(RandomizedController::new(ctx, &params))
            }
            TrapAlgorithm::LearnedHistory | TrapAlgorithm::None => {
                let params = config.learned.clone().unwrap_or_default();
                let plan_path = params
                    .last_run_plan_file
                    .as_deref()
                    .map(|p| config.resolve_log_path(p));
                let bug_path = params
                    .last_run_bug_file
                    .as_deref()
                    .map(|p| config.resolve_log_path(p));

                let mut plans = TrapPlanStore::new();
                plans.extend(params.plans.iter().cloned())?;
                if let Some(path) = &plan_path {
                    plans.extend(persistence::load_plan_file(path, params.dangerous_delay_ms))?;
                }
                let blacklist = bug_path
                    .as_deref()
                    .map(persistence::load_bug_file)
                    .unwrap_or_default();
                tracing::info!(
                    plans = plans.len(),
                    blacklisted = blacklist.len(),
                    "learned controller ready"
                );

                let lock_apis = PatternSet::new(&params.lock_apis)?;
                let ctx = ControllerContext::new(
                    classifier,
                    RaceLedger::new(blacklist, BugLog::new(bug_path)),
                    Box::new(sink),
                    config.raise_on_race,
                );
                Box::new(LearnedController::new(
                    ctx,
                    params,
                    plans,
                    PlanLog::new(plan_path),
                    lock_apis,
                ))
            }
        };

        tracing::info!(algorithm = controller.name(), "racetrap detector started");
        Ok(Detector {
            controller: Some(controller),
            sequence: AtomicI64::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ThreadSafetyGroup;
    use crate::config::{LearnedParams, RandomizedParams};
    use crate::sink::MemorySink;

    fn list_group() -> ThreadSafetyGroup {
        ThreadSafetyGroup::new("List")
            .with_write_api("List.Add")
            .with_read_api("List.Contains")
    }

    #[test]
    fn test_invalid_config_disables() {
        let mut params = RandomizedParams::default();
        params.delay_probability = 2.0;
        let detector = Detector::from_config(RuntimeConfig::randomized(params));
        assert!(!detector.is_enabled());
        assert_eq!(detector.algorithm(), "none");
        assert!(detector
            .on_interception_start(None, "A", "List.Add", 0)
            .is_ok());
    }

    #[test]
    fn test_try_from_config_reports_error() {
        let config = RuntimeConfig {
            algorithm: TrapAlgorithm::LearnedHistory,
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            Detector::try_from_config(config),
            Err(ConfigError::MissingParameters { .. })
        ));
    }

    #[test]
    fn test_none_algorithm_is_disabled() {
        let detector = Detector::try_from_config(RuntimeConfig::default()).unwrap();
        assert!(!detector.is_enabled());
    }

    #[test]
    fn test_sequence_counts_calls() {
        let mut params = RandomizedParams::default();
        params.delay_probability = 0.0;
        let detector =
            Detector::from_config(RuntimeConfig::randomized(params).with_group(list_group()));
        for i in 0..5 {
            detector
                .on_interception_start(None, "Main", "Unrelated.Call", i)
                .unwrap();
        }
        assert_eq!(detector.interceptions(), 5);
        assert_eq!(detector.algorithm(), "randomized");
    }

    #[test]
    fn test_builder_attaches_sink() {
        let sink = MemorySink::new();
        let mut params = RandomizedParams::default();
        params.max_delay_ms = 5;
        let detector = Detector::builder(RuntimeConfig::randomized(params).with_group(list_group()))
            .with_sink(sink.clone())
            .with_tracing(false)
            .build()
            .unwrap();

        let list: Vec<u8> = Vec::new();
        detector
            .on_interception_start(Some(InstanceRef::of(&list)), "Main", "List.Add", 1)
            .unwrap();
        assert_eq!(sink.trap_count(), 1);
        assert_eq!(sink.traps()[0].point.location, "List.Add|Main|1");
        assert_eq!(detector.peak_active_traps(), 1);
        assert_eq!(detector.outstanding_traps(), 0);
    }

    #[test]
    fn test_learned_detector_in_memory() {
        let detector =
            Detector::try_from_config(RuntimeConfig::learned(LearnedParams::in_memory())).unwrap();
        assert_eq!(detector.algorithm(), "learned_history");
        assert!(detector.dangerous_pairs().is_empty());
        assert!(detector.reported_races().is_empty());
    }
}
