//! API classification into thread-safety groups
//!
//! A thread-safety group names a set of write APIs and read APIs that must
//! not run concurrently on the same object (or, for static groups, at all).
//! Groups are loaded from configuration and never change afterwards.
//!
//! Classification scans groups in configured order, write patterns before
//! read patterns, and returns the first match. Results (including misses)
//! are memoized per callee signature.

use crate::error::ConfigError;
use crate::signature::PatternSet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A named classification unit loaded from configuration
///
/// # Example TOML
/// ```toml
/// [[group]]
/// name = "List"
/// is_static = false
/// write_apis = ["List.Add*", "List.Clear"]
/// read_apis = ["List.get_Item", "List.Contains"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSafetyGroup {
    /// Unique group name
    pub name: String,

    /// Static groups conflict regardless of instance
    #[serde(default)]
    pub is_static: bool,

    /// Wildcard patterns of mutating APIs
    #[serde(default)]
    pub write_apis: Vec<String>,

    /// Wildcard patterns of read-only APIs
    #[serde(default)]
    pub read_apis: Vec<String>,
}

impl ThreadSafetyGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_static: false,
            write_apis: Vec::new(),
            read_apis: Vec::new(),
        }
    }

    pub fn with_static(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self
    }

    pub fn with_write_api(mut self, pattern: impl Into<String>) -> Self {
        self.write_apis.push(pattern.into());
        self
    }

    pub fn with_read_api(mut self, pattern: impl Into<String>) -> Self {
        self.read_apis.push(pattern.into());
        self
    }
}

/// Result of classifying a callee signature
#[derive(Debug, Clone)]
pub struct Classification {
    pub group: Arc<ThreadSafetyGroup>,
    pub is_write: bool,
}

impl Classification {
    pub fn group_name(&self) -> &str {
        &self.group.name
    }

    /// Instance-scoped groups skip calls that carry no instance
    pub fn requires_instance(&self) -> bool {
        !self.group.is_static
    }
}

#[derive(Debug)]
struct CompiledGroup {
    group: Arc<ThreadSafetyGroup>,
    writes: PatternSet,
    reads: PatternSet,
}

/// Memoizing classifier over the configured groups
#[derive(Debug)]
pub struct ApiClassifier {
    groups: Vec<CompiledGroup>,
    cache: RwLock<HashMap<String, Option<Classification>>>,
}

impl ApiClassifier {
    /// Compile group patterns
    ///
    /// # Errors
    /// Fails on duplicate group names or uncompilable patterns.
    pub fn new(groups: &[ThreadSafetyGroup]) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(groups.len());

        for group in groups {
            if !seen.insert(group.name.clone()) {
                return Err(ConfigError::DuplicateGroup(group.name.clone()));
            }
            compiled.push(CompiledGroup {
                writes: PatternSet::new(&group.write_apis)?,
                reads: PatternSet::new(&group.read_apis)?,
                group: Arc::new(group.clone()),
            });
        }

        Ok(Self {
            groups: compiled,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Classify a callee signature
    ///
    /// Returns `None` when no group claims the API; the caller must then
    /// skip detection for that call.
    pub fn classify(&self, callee: &str) -> Option<Classification> {
        if let Some(cached) = self.cache.read().get(callee) {
            return cached.clone();
        }

        let result = self.scan(callee);
        self.cache
            .write()
            .insert(callee.to_string(), result.clone());
        result
    }

    fn scan(&self, callee: &str) -> Option<Classification> {
        for compiled in &self.groups {
            if compiled.writes.matches_any(callee) {
                return Some(Classification {
                    group: Arc::clone(&compiled.group),
                    is_write: true,
                });
            }
            if compiled.reads.matches_any(callee) {
                return Some(Classification {
                    group: Arc::clone(&compiled.group),
                    is_write: false,
                });
            }
        }
        None
    }

    /// Configured groups in classification order
    pub fn groups(&self) -> impl Iterator<Item = &ThreadSafetyGroup> {
        self.groups.iter().map(|g| g.group.as_ref())
    }

    /// Number of distinct callee signatures memoized so far
    pub fn cached_signatures(&self) -> usize {
        self.cache.read().len()
    }
}
