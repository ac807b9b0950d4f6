//! Racetrap - dynamic thread-safety violation detector
//!
//! Instrumented programs call [`Detector::on_interception_start`] before
//! every call to a thread-unsafe API. The detector classifies the call,
//! occasionally delays the calling thread ("sets a trap"), and reports a
//! race when another thread makes a conflicting call on the same object
//! while the trap is outstanding. The learned controller remembers call-site
//! pairs that came close to racing and replays them in later runs.

pub mod classifier;
pub mod cli;
pub mod config;
pub mod controller;
pub mod detector;
pub mod error;
pub mod hit_count;
pub mod interception;
pub mod object_id;
pub mod persistence;
pub mod signature;
pub mod sink;
pub mod trap;
pub mod trap_plan;

pub use classifier::{ApiClassifier, Classification, ThreadSafetyGroup};
pub use config::{LearnedParams, RandomizedParams, RuntimeConfig, TrapAlgorithm};
pub use detector::{Detector, DetectorBuilder};
pub use error::{ConfigError, PersistenceError, RaceDetected};
pub use object_id::{InstanceRef, ObjectId};
pub use sink::{FileSink, MemorySink, ReportFormat, ReportSink, TracingSink};
pub use trap_plan::{TrapPlan, TrapPlanStore};
