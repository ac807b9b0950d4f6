//! Error types for racetrap

use crate::object_id::ObjectId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating a runtime configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Algorithm '{algorithm}' selected but its [{algorithm}] parameters are missing")]
    MissingParameters { algorithm: &'static str },

    #[error("Invalid probability for {field}: {value} (expected 0.0-1.0)")]
    InvalidProbability { field: &'static str, value: f64 },

    #[error("Invalid window for {field}: must be greater than zero")]
    InvalidWindow { field: &'static str },

    #[error("Invalid value for {field}: {value} (expected a finite non-negative number)")]
    InvalidFactor { field: &'static str, value: f64 },

    #[error("Duplicate thread-safety group '{0}'")]
    DuplicateGroup(String),

    #[error("Invalid API pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

impl From<(String, regex::Error)> for ConfigError {
    fn from((pattern, source): (String, regex::Error)) -> Self {
        ConfigError::InvalidPattern { pattern, source }
    }
}

/// Errors raised by the strict plan/bug file readers
///
/// The controller itself never surfaces these: at runtime unreadable or
/// malformed persistence files are logged and skipped.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },
}

/// A thread-safety violation surfaced to the calling thread
///
/// Only returned from the entry point when `raise_on_race` is configured.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Thread-safety violation on object {object_id}: {trapped} <-> {racing}")]
pub struct RaceDetected {
    /// Object both accesses touched
    pub object_id: ObjectId,
    /// Location key of the access that was being delayed
    pub trapped: String,
    /// Location key of the access that ran into the trap
    pub racing: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidProbability {
            field: "randomized.delay_probability",
            value: 1.5,
        };
        assert!(err.to_string().contains("1.5"));
        assert!(err.to_string().contains("randomized.delay_probability"));

        let err = ConfigError::MissingParameters {
            algorithm: "learned",
        };
        assert!(err.to_string().contains("[learned]"));
    }

    #[test]
    fn test_race_detected_display() {
        let err = RaceDetected {
            object_id: ObjectId::STATIC,
            trapped: "List.Add|Worker.A|10".to_string(),
            racing: "List.Add|Worker.B|20".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("object 0"));
        assert!(text.contains("Worker.A|10"));
        assert!(text.contains("Worker.B|20"));
    }

    #[test]
    fn test_persistence_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PersistenceError = io.into();
        assert!(err.to_string().contains("gone"));
    }
}
