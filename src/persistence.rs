//! Cross-run persistence of dangerous pairs and confirmed races
//!
//! Two plain-text files carry knowledge from one run to the next:
//!
//! - the plan file, one candidate pair per line, `A ! B` where each side is
//!   `callee|caller|offset|globalHitCount|localHitCount`. It is loaded and
//!   deleted at start, then rewritten from the pairs discovered in this run.
//! - the bug file, one confirmed race per line, `X Y` with the two location
//!   keys, larger key first. It only ever grows and acts as a blacklist.
//!
//! Runtime loading is forgiving: a missing file is empty, unreadable files
//! and malformed lines are logged and skipped. The `read_*_strict` functions
//! surface every problem instead and are used by the inspection CLI.

use crate::error::PersistenceError;
use crate::hit_count::HitCount;
use crate::trap_plan::TrapPlan;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Minimum spacing between plan-log flushes
pub const PLAN_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Separator between the two sides of a plan line
pub const PLAN_SEPARATOR: &str = " ! ";

/// Unordered pair of location keys, stored larger key first
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationPair {
    first: String,
    second: String,
}

impl LocationPair {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a >= b {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    pub fn first(&self) -> &str {
        &self.first
    }

    pub fn second(&self) -> &str {
        &self.second
    }

    pub fn contains(&self, location: &str) -> bool {
        self.first == location || self.second == location
    }

    /// The other location of the pair, if `location` is a member
    pub fn partner(&self, location: &str) -> Option<&str> {
        if self.first == location {
            Some(&self.second)
        } else if self.second == location {
            Some(&self.first)
        } else {
            None
        }
    }
}

impl fmt::Display for LocationPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.first, self.second)
    }
}

/// One side of a plan line
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanPoint {
    pub callee: String,
    pub caller: String,
    pub offset: i32,
    pub global_hit_count: i64,
    pub local_hit_count: i64,
}

impl PlanPoint {
    /// Parse `callee|caller|offset|global|local`
    pub fn parse(text: &str) -> Result<Self, String> {
        let fields: Vec<&str> = text.split('|').collect();
        if fields.len() != 5 {
            return Err(format!("expected 5 '|'-separated fields, found {}", fields.len()));
        }
        if fields[0].is_empty() {
            return Err("empty callee".to_string());
        }
        let number = |name: &str, value: &str| -> Result<i64, String> {
            value
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("invalid {} '{}'", name, value))
        };
        let offset = number("offset", fields[2])?;
        Ok(Self {
            callee: fields[0].to_string(),
            caller: fields[1].to_string(),
            offset: i32::try_from(offset).map_err(|_| format!("offset out of range: {}", offset))?,
            global_hit_count: number("global hit count", fields[3])?,
            local_hit_count: number("local hit count", fields[4])?,
        })
    }

    pub fn location(&self) -> String {
        crate::interception::location_key(&self.callee, &self.caller, self.offset)
    }

    fn into_plan(self, repeat: bool, delay_ms: u64) -> TrapPlan {
        TrapPlan::new(self.callee)
            .with_caller(self.caller)
            .with_offset(self.offset)
            .with_hit_count(HitCount::new(self.local_hit_count, self.global_hit_count))
            .with_fixed_delay(delay_ms)
            .with_repeat(repeat)
    }
}

impl fmt::Display for PlanPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.callee, self.caller, self.offset, self.global_hit_count, self.local_hit_count
        )
    }
}

fn is_skippable(line: &str) -> bool {
    let line = line.trim();
    line.is_empty() || line.starts_with('#')
}

/// Parse one plan line; `Ok(None)` for blanks and comments
pub fn parse_plan_line(line: &str) -> Result<Option<(PlanPoint, PlanPoint)>, String> {
    if is_skippable(line) {
        return Ok(None);
    }
    let (a, b) = line
        .trim()
        .split_once(PLAN_SEPARATOR)
        .ok_or_else(|| format!("missing '{}' separator", PLAN_SEPARATOR.trim()))?;
    Ok(Some((PlanPoint::parse(a.trim())?, PlanPoint::parse(b.trim())?)))
}

/// Format a plan line from two serialized points
pub fn format_plan_line(a: &str, b: &str) -> String {
    format!("{}{}{}", a, PLAN_SEPARATOR, b)
}

/// Parse one bug line; `Ok(None)` for blanks and comments
pub fn parse_bug_line(line: &str) -> Result<Option<LocationPair>, String> {
    if is_skippable(line) {
        return Ok(None);
    }
    let mut tokens = line.split_whitespace();
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(a), Some(b), None) => Ok(Some(LocationPair::new(a, b))),
        _ => Err("expected exactly two location keys".to_string()),
    }
}

/// Turn parsed plan lines into trap plans
///
/// Every side of every line becomes a plan with a fixed delay. A point
/// string seen more than once across the lines marks its plan `repeat`.
pub fn plans_from_pairs(pairs: Vec<(PlanPoint, PlanPoint)>, delay_ms: u64) -> Vec<TrapPlan> {
    let mut frequency: HashMap<PlanPoint, usize> = HashMap::new();
    let mut order = Vec::new();
    for point in pairs.into_iter().flat_map(|(a, b)| [a, b]) {
        let count = frequency.entry(point.clone()).or_insert(0);
        if *count == 0 {
            order.push(point);
        }
        *count += 1;
    }

    order
        .into_iter()
        .map(|point| {
            let repeat = frequency.get(&point).copied().unwrap_or(0) > 1;
            point.into_plan(repeat, delay_ms)
        })
        .collect()
}

fn read_optional(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!("Failed to read {}: {}", path.display(), e);
            None
        }
    }
}

/// Load the previous run's plans, then delete the file
pub fn load_plan_file(path: &Path, delay_ms: u64) -> Vec<TrapPlan> {
    let Some(content) = read_optional(path) else {
        return Vec::new();
    };

    let mut pairs = Vec::new();
    for (index, line) in content.lines().enumerate() {
        match parse_plan_line(line) {
            Ok(Some(pair)) => pairs.push(pair),
            Ok(None) => {}
            Err(reason) => tracing::warn!(
                "Skipping malformed plan line {} in {}: {}",
                index + 1,
                path.display(),
                reason
            ),
        }
    }

    if let Err(e) = fs::remove_file(path) {
        tracing::warn!("Failed to delete plan file {}: {}", path.display(), e);
    }

    plans_from_pairs(pairs, delay_ms)
}

/// Load confirmed races as a blacklist; the file is left in place
pub fn load_bug_file(path: &Path) -> HashSet<LocationPair> {
    let Some(content) = read_optional(path) else {
        return HashSet::new();
    };

    content
        .lines()
        .enumerate()
        .filter_map(|(index, line)| match parse_bug_line(line) {
            Ok(pair) => pair,
            Err(reason) => {
                tracing::warn!(
                    "Skipping malformed bug line {} in {}: {}",
                    index + 1,
                    path.display(),
                    reason
                );
                None
            }
        })
        .collect()
}

/// Parse a plan file, failing on the first malformed line
pub fn read_plan_file_strict(
    path: &Path,
    delay_ms: u64,
) -> Result<Vec<TrapPlan>, PersistenceError> {
    let content = fs::read_to_string(path)?;
    let mut pairs = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let parsed = parse_plan_line(line).map_err(|reason| PersistenceError::MalformedLine {
            line: index + 1,
            reason,
        })?;
        pairs.extend(parsed);
    }
    Ok(plans_from_pairs(pairs, delay_ms))
}

/// Parse a bug file, failing on the first malformed line
pub fn read_bug_file_strict(path: &Path) -> Result<Vec<LocationPair>, PersistenceError> {
    let content = fs::read_to_string(path)?;
    let mut pairs = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let parsed = parse_bug_line(line).map_err(|reason| PersistenceError::MalformedLine {
            line: index + 1,
            reason,
        })?;
        if let Some(pair) = parsed {
            if !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }
    }
    Ok(pairs)
}

fn append_lines(path: &Path, lines: &[String]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut buf = String::new();
    for line in lines {
        buf.push_str(line);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes())
}

#[derive(Debug)]
struct PlanLogState {
    pending: Vec<String>,
    seen: HashSet<String>,
    last_flush: Instant,
}

/// Buffered writer for the next run's plan file
///
/// Lines are deduplicated and written in batches, at most once per
/// [`PLAN_FLUSH_INTERVAL`], and on [`PlanLog::flush`] or drop.
#[derive(Debug)]
pub struct PlanLog {
    path: Option<PathBuf>,
    state: Mutex<PlanLogState>,
}

impl PlanLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            state: Mutex::new(PlanLogState {
                pending: Vec::new(),
                seen: HashSet::new(),
                last_flush: Instant::now(),
            }),
        }
    }

    /// Log that discards everything
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Queue a line; returns false if it was already logged this run
    pub fn record(&self, line: String) -> bool {
        let mut state = self.state.lock();
        if !state.seen.insert(line.clone()) {
            return false;
        }
        state.pending.push(line);
        if state.last_flush.elapsed() >= PLAN_FLUSH_INTERVAL {
            self.write_pending(&mut state);
        }
        true
    }

    /// Write all pending lines now
    pub fn flush(&self) {
        let mut state = self.state.lock();
        self.write_pending(&mut state);
    }

    /// Lines queued but not yet written
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn write_pending(&self, state: &mut PlanLogState) {
        state.last_flush = Instant::now();
        if state.pending.is_empty() {
            return;
        }
        let lines = std::mem::take(&mut state.pending);
        if let Some(path) = &self.path {
            if let Err(e) = append_lines(path, &lines) {
                tracing::warn!("Failed to write plan file {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for PlanLog {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Append-only writer for confirmed races
#[derive(Debug)]
pub struct BugLog {
    path: Option<PathBuf>,
}

impl BugLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one race immediately
    pub fn append(&self, pair: &LocationPair) {
        if let Some(path) = &self.path {
            if let Err(e) = append_lines(path, &[pair.to_string()]) {
                tracing::warn!("Failed to write bug file {}: {}", path.display(), e);
            }
        }
    }
}
