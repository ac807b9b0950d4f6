//! Wildcard signature matching for API classification and trap plans
//!
//! Patterns use `*` as the only metacharacter: it matches any (possibly
//! empty) substring. Every other character is literal and the match is
//! anchored at both ends, so `List.Add*` matches `List.Add` and
//! `List.AddRange` but never `MyList.Add`.

use regex::Regex;

/// A compiled wildcard pattern
///
/// # Example
/// ```
/// use racetrap::signature::WildcardPattern;
///
/// let pattern = WildcardPattern::new("Foo.Add*").unwrap();
/// assert!(pattern.matches("Foo.AddRange"));
/// assert!(pattern.matches("Foo.Add"));
/// assert!(!pattern.matches("Foo.Remove"));
/// ```
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    source: String,
    regex: Regex,
}

impl WildcardPattern {
    /// Compile a wildcard pattern
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&wildcard_regex(pattern))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Check whether a full signature matches this pattern
    pub fn matches(&self, signature: &str) -> bool {
        self.regex.is_match(signature)
    }

    /// The pattern text as configured
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the pattern contains a wildcard at all
    pub fn is_wildcard(&self) -> bool {
        is_wildcard(&self.source)
    }
}

/// An ordered list of wildcard patterns
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<WildcardPattern>,
}

impl PatternSet {
    /// Compile every pattern, failing on the first invalid one
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, (String, regex::Error)> {
        let patterns = patterns
            .iter()
            .map(|p| WildcardPattern::new(p.as_ref()).map_err(|e| (p.as_ref().to_string(), e)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Whether any pattern matches the signature
    pub fn matches_any(&self, signature: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(signature))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Anchored regex source for a wildcard pattern
pub fn wildcard_regex(pattern: &str) -> String {
    let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
    format!("^{}$", escaped.join(".*"))
}

/// Whether a pattern contains the `*` wildcard
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.contains('*')
}

/// One-shot match of a signature against a wildcard pattern
///
/// Compiles the pattern on every call; hot paths should hold a
/// [`WildcardPattern`] instead. An uncompilable pattern never matches.
pub fn is_wildcard_match(signature: &str, pattern: &str) -> bool {
    WildcardPattern::new(pattern)
        .map(|p| p.matches(signature))
        .unwrap_or(false)
}
