//! Runtime configuration
//!
//! Loaded from TOML. The `algorithm` key selects the controller and the
//! matching `[randomized]` or `[learned]` table supplies its parameters.
//!
//! # Example
//! ```toml
//! algorithm = "learned_history"
//! report_file = "races.log"
//!
//! [learned]
//! dangerous_delay_ms = 100
//!
//! [[group]]
//! name = "List"
//! write_apis = ["List.Add*", "List.Clear"]
//! read_apis = ["List.get_Item", "List.Contains"]
//! ```

use crate::classifier::ThreadSafetyGroup;
use crate::error::ConfigError;
use crate::sink::ReportFormat;
use crate::trap_plan::TrapPlan;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Which controller drives trap decisions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrapAlgorithm {
    /// Detection disabled
    #[default]
    None,
    Randomized,
    #[serde(alias = "learnedHistory", alias = "learned")]
    LearnedHistory,
}

impl TrapAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            TrapAlgorithm::None => "none",
            TrapAlgorithm::Randomized => "randomized",
            TrapAlgorithm::LearnedHistory => "learned_history",
        }
    }
}

/// Parameters of the randomized controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomizedParams {
    pub delay_probability: f64,
    pub max_delay_ms: u64,
    /// Absent or 0 seeds from entropy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,
}

impl Default for RandomizedParams {
    fn default() -> Self {
        Self {
            delay_probability: 1.0,
            max_delay_ms: 100,
            random_seed: None,
        }
    }
}

/// Parameters of the learned happens-before controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnedParams {
    /// Probability of trapping an ordinary point
    pub delay_probability: f64,
    /// Bound of the random delay for ordinary points
    pub max_delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,
    /// Probability lost per past trap hit at a dangerous location
    pub decay_factor: f64,
    /// Delay at dangerous locations and for replayed plans
    pub dangerous_delay_ms: u64,
    pub dangerous_delay_probability: f64,
    /// Accesses kept in the global history ring
    pub history_window: usize,
    /// Recent accesses kept per object for pair discovery
    pub last_access_window: usize,
    pub local_hitcount_window: i64,
    pub global_hitcount_window: i64,
    /// Delay credit granted to a point after its trap wait
    pub infer_size: i64,
    /// Fraction of `dangerous_delay_ms` within which a thread counts as blocked
    pub infer_limit: f64,
    /// Maximum distance between the two accesses of a candidate pair
    pub near_miss_window_ms: u64,
    /// Combined trap hits after which a known pair stops being refreshed
    pub pair_decay_threshold: u64,
    pub detect_dangerous_pairs: bool,
    /// Allow traps at points that are neither dangerous nor planned
    pub trap_unknown_points: bool,
    /// Lock operations skipped entirely
    pub lock_apis: Vec<String>,
    /// Plan file read at start and rewritten during the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_plan_file: Option<PathBuf>,
    /// Blacklist of confirmed races, appended during the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_bug_file: Option<PathBuf>,
    /// Statically configured plans
    #[serde(rename = "plan", skip_serializing_if = "Vec::is_empty")]
    pub plans: Vec<TrapPlan>,
}

impl Default for LearnedParams {
    fn default() -> Self {
        Self {
            delay_probability: 1.0,
            max_delay_ms: 100,
            random_seed: None,
            decay_factor: 0.1,
            dangerous_delay_ms: 100,
            dangerous_delay_probability: 0.99,
            history_window: 32,
            last_access_window: 5,
            local_hitcount_window: 5,
            global_hitcount_window: 20,
            infer_size: 5,
            infer_limit: 0.5,
            near_miss_window_ms: 10_000_000,
            pair_decay_threshold: 10,
            detect_dangerous_pairs: true,
            trap_unknown_points: true,
            lock_apis: vec![
                "System.Threading.Monitor.Enter*".to_string(),
                "System.Threading.Monitor.Exit*".to_string(),
            ],
            last_run_plan_file: Some(PathBuf::from("racetrap-preplans.log")),
            last_run_bug_file: Some(PathBuf::from("racetrap-allbugs.log")),
            plans: Vec::new(),
        }
    }
}

impl LearnedParams {
    /// Parameters that never touch the filesystem
    pub fn in_memory() -> Self {
        Self {
            last_run_plan_file: None,
            last_run_bug_file: None,
            ..Self::default()
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub algorithm: TrapAlgorithm,
    /// Return `RaceDetected` to the racing caller
    pub raise_on_race: bool,
    /// Base directory for relative log paths
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_directory: Option<PathBuf>,
    /// Report file; an execution id is inserted before the extension
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_file: Option<PathBuf>,
    pub report_format: ReportFormat,
    /// Also report every trap that is set
    pub log_traps: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub randomized: Option<RandomizedParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learned: Option<LearnedParams>,
    #[serde(rename = "group")]
    pub groups: Vec<ThreadSafetyGroup>,
}

impl RuntimeConfig {
    pub fn randomized(params: RandomizedParams) -> Self {
        Self {
            algorithm: TrapAlgorithm::Randomized,
            randomized: Some(params),
            ..Self::default()
        }
    }

    pub fn learned(params: LearnedParams) -> Self {
        Self {
            algorithm: TrapAlgorithm::LearnedHistory,
            learned: Some(params),
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group: ThreadSafetyGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn with_raise_on_race(mut self, raise: bool) -> Self {
        self.raise_on_race = raise;
        self
    }

    pub fn with_log_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_directory = Some(dir.into());
        self
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.algorithm {
            TrapAlgorithm::None => {}
            TrapAlgorithm::Randomized => {
                let params = self
                    .randomized
                    .as_ref()
                    .ok_or(ConfigError::MissingParameters {
                        algorithm: "randomized",
                    })?;
                check_probability("randomized.delay_probability", params.delay_probability)?;
            }
            TrapAlgorithm::LearnedHistory => {
                let params = self
                    .learned
                    .as_ref()
                    .ok_or(ConfigError::MissingParameters { algorithm: "learned" })?;
                validate_learned(params)?;
            }
        }

        let mut names = HashSet::new();
        for group in &self.groups {
            if !names.insert(group.name.as_str()) {
                return Err(ConfigError::DuplicateGroup(group.name.clone()));
            }
        }
        Ok(())
    }

    /// Resolve a log path against `log_directory` when relative
    pub fn resolve_log_path(&self, path: &Path) -> PathBuf {
        match &self.log_directory {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

fn check_probability(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidProbability { field, value })
    }
}

fn check_factor(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidFactor { field, value })
    }
}

fn validate_learned(params: &LearnedParams) -> Result<(), ConfigError> {
    check_probability("learned.delay_probability", params.delay_probability)?;
    check_probability(
        "learned.dangerous_delay_probability",
        params.dangerous_delay_probability,
    )?;
    check_probability("learned.decay_factor", params.decay_factor)?;
    check_factor("learned.infer_limit", params.infer_limit)?;

    if params.history_window == 0 {
        return Err(ConfigError::InvalidWindow {
            field: "learned.history_window",
        });
    }
    if params.last_access_window == 0 {
        return Err(ConfigError::InvalidWindow {
            field: "learned.last_access_window",
        });
    }
    if params.local_hitcount_window < 0 {
        return Err(ConfigError::InvalidWindow {
            field: "learned.local_hitcount_window",
        });
    }
    if params.global_hitcount_window < 0 {
        return Err(ConfigError::InvalidWindow {
            field: "learned.global_hitcount_window",
        });
    }

    for plan in &params.plans {
        check_probability("learned.plan.delay_probability", plan.delay_probability)?;
        check_probability("learned.plan.decay_factor", plan.decay_factor)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL: &str = r#"
algorithm = "learned_history"
raise_on_race = true
log_directory = "target/racetrap"
report_file = "races.log"
report_format = "json"

[learned]
dangerous_delay_ms = 50
history_window = 16
lock_apis = []

[[learned.plan]]
callee = "Foo.Add*"
caller = "Program.Worker*"
fixed_delay_ms = 50
repeat = true
hit_counts = [{ local = 3, global = -1 }]

[[group]]
name = "List"
write_apis = ["List.Add*", "List.Clear"]
read_apis = ["List.get_Item", "List.Contains"]
"#;

    #[test]
    fn test_parse_full_config() {
        let config = RuntimeConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.algorithm, TrapAlgorithm::LearnedHistory);
        assert!(config.raise_on_race);
        assert_eq!(config.report_format, ReportFormat::Json);
        assert_eq!(config.groups.len(), 1);

        let learned = config.learned.unwrap();
        assert_eq!(learned.dangerous_delay_ms, 50);
        assert_eq!(learned.history_window, 16);
        // untouched keys keep their defaults
        assert_eq!(learned.infer_size, 5);
        assert_eq!(learned.dangerous_delay_probability, 0.99);
        assert!(learned.lock_apis.is_empty());
        assert_eq!(learned.plans.len(), 1);
        assert!(learned.plans[0].repeat);
    }

    #[test]
    fn test_algorithm_aliases() {
        let config =
            RuntimeConfig::from_toml_str("algorithm = \"learnedHistory\"\n[learned]\n").unwrap();
        assert_eq!(config.algorithm, TrapAlgorithm::LearnedHistory);

        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config.algorithm, TrapAlgorithm::None);
    }

    #[test]
    fn test_missing_section() {
        let err = RuntimeConfig::from_toml_str("algorithm = \"randomized\"").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingParameters {
                algorithm: "randomized"
            }
        ));
    }

    #[test]
    fn test_invalid_probability() {
        let err = RuntimeConfig::from_toml_str(
            "algorithm = \"randomized\"\n[randomized]\ndelay_probability = 1.5\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidProbability { value, .. } if value == 1.5));
    }

    #[test]
    fn test_zero_history_window_rejected() {
        let mut params = LearnedParams::in_memory();
        params.history_window = 0;
        let err = RuntimeConfig::learned(params).validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWindow { .. }));
    }

    #[test]
    fn test_unbounded_infer_limit_rejected() {
        for value in ["inf", "nan", "-0.5"] {
            let toml = format!(
                "algorithm = \"learned_history\"\n[learned]\ninfer_limit = {}\n",
                value
            );
            let err = RuntimeConfig::from_toml_str(&toml).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidFactor { field: "learned.infer_limit", .. }),
                "{} accepted",
                value
            );
        }

        let mut params = LearnedParams::in_memory();
        params.infer_limit = 2.0;
        assert!(RuntimeConfig::learned(params).validate().is_ok());
    }

    #[test]
    fn test_duplicate_group_rejected() {
        let config = RuntimeConfig::default()
            .with_group(ThreadSafetyGroup::new("List"))
            .with_group(ThreadSafetyGroup::new("List"));
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateGroup(_))));
    }

    #[test]
    fn test_parse_error() {
        let err = RuntimeConfig::from_toml_str("algorithm = \"sometimes\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let config = RuntimeConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.algorithm, TrapAlgorithm::LearnedHistory);

        let err = RuntimeConfig::from_toml_file("/nonexistent/racetrap.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_resolve_log_path() {
        let config = RuntimeConfig::default().with_log_directory("/var/log/rt");
        assert_eq!(
            config.resolve_log_path(Path::new("races.log")),
            PathBuf::from("/var/log/rt/races.log")
        );
        assert_eq!(
            config.resolve_log_path(Path::new("/tmp/races.log")),
            PathBuf::from("/tmp/races.log")
        );
        assert_eq!(
            RuntimeConfig::default().resolve_log_path(Path::new("races.log")),
            PathBuf::from("races.log")
        );
    }

    #[test]
    fn test_serialize_round_trip_keeps_defaults() {
        let config = RuntimeConfig::learned(LearnedParams::default());
        let text = toml::to_string(&config).unwrap();
        let back = RuntimeConfig::from_toml_str(&text).unwrap().learned.unwrap();
        let defaults = LearnedParams::default();
        assert_eq!(back.lock_apis, defaults.lock_apis);
        assert_eq!(back.last_run_plan_file, defaults.last_run_plan_file);
        assert_eq!(back.near_miss_window_ms, defaults.near_miss_window_ms);
    }
}
