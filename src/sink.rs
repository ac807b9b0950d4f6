//! Reporting sinks for traps and detected races
//!
//! The controllers hand every event to a [`ReportSink`]. Three sinks ship
//! with the crate: [`TracingSink`] emits structured `tracing` events,
//! [`FileSink`] appends a report file (text or JSON lines) and
//! [`MemorySink`] collects events in memory for tests and embedders.

use crate::interception::{InterceptionPoint, PointRecord};
use crate::object_id::ObjectId;
use crate::trap::Trap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Receiver of controller events
///
/// Called from the intercepted threads, outside every controller lock.
pub trait ReportSink: Send + Sync {
    /// A trap was registered and its thread is about to wait
    fn trap_set(&self, trap: &Trap);

    /// `racing` ran into `trap` on the same object
    fn race_found(&self, trap: &Trap, racing: &InterceptionPoint);

    fn flush(&self) {}
}

/// Report file layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

/// Snapshot of a registered trap
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrapRecord {
    pub trap_id: u64,
    pub group: String,
    pub object_id: ObjectId,
    pub delay_ms: u64,
    pub point: PointRecord,
}

impl TrapRecord {
    pub fn from_trap(trap: &Trap) -> Self {
        Self {
            trap_id: trap.id,
            group: trap.group_name().to_string(),
            object_id: trap.object_id,
            delay_ms: trap.delay.as_millis() as u64,
            point: trap.point.record(),
        }
    }
}

/// Snapshot of a detected race
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceReport {
    pub trap: TrapRecord,
    pub racing: PointRecord,
}

impl RaceReport {
    pub fn new(trap: &Trap, racing: &InterceptionPoint) -> Self {
        Self {
            trap: TrapRecord::from_trap(trap),
            racing: racing.record(),
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.trap.object_id
    }

    pub fn trapped_location(&self) -> &str {
        &self.trap.point.location
    }

    pub fn racing_location(&self) -> &str {
        &self.racing.location
    }
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn trap_set(&self, trap: &Trap) {
        tracing::debug!(
            trap_id = trap.id,
            group = trap.group_name(),
            object_id = trap.object_id.as_u64(),
            location = %trap.point.location,
            thread_id = trap.point.thread_id,
            delay_ms = trap.delay.as_millis() as u64,
            "trap set"
        );
    }

    fn race_found(&self, trap: &Trap, racing: &InterceptionPoint) {
        tracing::warn!(
            group = trap.group_name(),
            object_id = trap.object_id.as_u64(),
            trapped = %trap.point.location,
            trapped_thread = trap.point.thread_id,
            racing = %racing.location,
            racing_thread = racing.thread_id,
            "thread-safety violation"
        );
    }
}

/// Collects events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    traps: Mutex<Vec<TrapRecord>>,
    races: Mutex<Vec<RaceReport>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn traps(&self) -> Vec<TrapRecord> {
        self.traps.lock().clone()
    }

    pub fn races(&self) -> Vec<RaceReport> {
        self.races.lock().clone()
    }

    pub fn trap_count(&self) -> usize {
        self.traps.lock().len()
    }

    pub fn race_count(&self) -> usize {
        self.races.lock().len()
    }
}

impl ReportSink for MemorySink {
    fn trap_set(&self, trap: &Trap) {
        self.traps.lock().push(TrapRecord::from_trap(trap));
    }

    fn race_found(&self, trap: &Trap, racing: &InterceptionPoint) {
        self.races.lock().push(RaceReport::new(trap, racing));
    }
}

impl<S: ReportSink + ?Sized> ReportSink for Arc<S> {
    fn trap_set(&self, trap: &Trap) {
        (**self).trap_set(trap)
    }

    fn race_found(&self, trap: &Trap, racing: &InterceptionPoint) {
        (**self).race_found(trap, racing)
    }

    fn flush(&self) {
        (**self).flush()
    }
}

/// Per-process execution id, fixed on first use
pub fn execution_id() -> &'static str {
    static ID: OnceLock<String> = OnceLock::new();
    ID.get_or_init(|| format!("{}-{:08x}", std::process::id(), rand::random::<u32>()))
}

/// Insert an execution id before the extension: `races.log` -> `races-ID.log`
pub fn with_execution_id(path: &Path, id: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, id, ext.to_string_lossy()),
        None => format!("{}-{}", stem, id),
    };
    path.with_file_name(name)
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum JsonEvent<'a> {
    Process {
        name: String,
        pid: u32,
        execution_id: &'a str,
    },
    Trap(TrapRecord),
    Race(RaceReport),
}

/// Append-only report file
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    format: ReportFormat,
    log_traps: bool,
    file: Mutex<File>,
}

impl FileSink {
    /// Create the report file `path` with the process execution id appended
    pub fn create(path: &Path, format: ReportFormat, log_traps: bool) -> io::Result<Self> {
        Self::create_exact(&with_execution_id(path, execution_id()), format, log_traps)
    }

    /// Create the report file at exactly `path`
    pub fn create_exact(path: &Path, format: ReportFormat, log_traps: bool) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let sink = Self {
            path: path.to_path_buf(),
            format,
            log_traps,
            file: Mutex::new(file),
        };
        sink.write_header()?;
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(&self) -> io::Result<()> {
        let name = process_name();
        let pid = std::process::id();
        let text = match self.format {
            ReportFormat::Text => format!(
                "Process: {} (pid {})\nExecution: {}\n\n",
                name,
                pid,
                execution_id()
            ),
            ReportFormat::Json => json_line(&JsonEvent::Process {
                name,
                pid,
                execution_id: execution_id(),
            }),
        };
        self.file.lock().write_all(text.as_bytes())
    }

    fn append(&self, text: &str) {
        if let Err(e) = self.file.lock().write_all(text.as_bytes()) {
            tracing::warn!("Failed to write report {}: {}", self.path.display(), e);
        }
    }
}

fn json_line(event: &JsonEvent<'_>) -> String {
    match serde_json::to_string(event) {
        Ok(mut line) => {
            line.push('\n');
            line
        }
        Err(e) => {
            tracing::warn!("Failed to serialize report event: {}", e);
            String::new()
        }
    }
}

fn write_point(out: &mut String, point: &InterceptionPoint) {
    let _ = writeln!(out, "Id: {}", point.global_hit_count);
    let _ = writeln!(out, "ThreadId: {}", point.thread_id);
    let _ = writeln!(out, "Timestamp: {}", point.unix_millis());
    let _ = writeln!(out, "API: {}", point.callee);
    let _ = writeln!(out, "Method: {}", point.caller);
    let _ = writeln!(out, "ILOffset: {}", point.offset);
    let _ = writeln!(out, "ObjectId: {}", point.object_id);
    if let Some(stack) = point.stack_trace() {
        let _ = writeln!(out, "StackTrace:\n{}", stack);
    }
}

/// Text block for a trap
pub fn format_trap(trap: &Trap) -> String {
    let mut out = String::from("---Trap---\n");
    write_point(&mut out, &trap.point);
    let _ = writeln!(out, "Delay: {}ms", trap.delay.as_millis());
    out
}

/// Text block for a race: the trap, then the access that hit it
pub fn format_race(trap: &Trap, racing: &InterceptionPoint) -> String {
    let mut out = String::from("---Race Condition---\n");
    out.push_str(&format_trap(trap));
    out.push_str("---Trapped---\n");
    write_point(&mut out, racing);
    out.push('\n');
    out
}

impl ReportSink for FileSink {
    fn trap_set(&self, trap: &Trap) {
        if !self.log_traps {
            return;
        }
        let text = match self.format {
            ReportFormat::Text => format!("{}\n", format_trap(trap)),
            ReportFormat::Json => json_line(&JsonEvent::Trap(TrapRecord::from_trap(trap))),
        };
        self.append(&text);
    }

    fn race_found(&self, trap: &Trap, racing: &InterceptionPoint) {
        let text = match self.format {
            ReportFormat::Text => format_race(trap, racing),
            ReportFormat::Json => json_line(&JsonEvent::Race(RaceReport::new(trap, racing))),
        };
        self.append(&text);
    }

    fn flush(&self) {
        if let Err(e) = self.file.lock().flush() {
            tracing::warn!("Failed to flush report {}: {}", self.path.display(), e);
        }
    }
}

/// Fans events out to several sinks
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn ReportSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn push(&mut self, sink: Box<dyn ReportSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ReportSink for MultiSink {
    fn trap_set(&self, trap: &Trap) {
        self.sinks.iter().for_each(|s| s.trap_set(trap));
    }

    fn race_found(&self, trap: &Trap, racing: &InterceptionPoint) {
        self.sinks.iter().for_each(|s| s.race_found(trap, racing));
    }

    fn flush(&self) {
        self.sinks.iter().for_each(|s| s.flush());
    }
}
