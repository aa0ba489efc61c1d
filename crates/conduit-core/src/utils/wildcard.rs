//! Glob-style wildcard matching for method names and upstream identifiers.
//!
//! Patterns support `*` (any run of characters, including none) and `?` (exactly one
//! character) and are always matched against the full input string.

use globset::{GlobBuilder, GlobMatcher};
use thiserror::Error;

/// A pattern that could not be compiled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid wildcard pattern '{pattern}': {reason}")]
pub struct WildcardError {
    pub pattern: String,
    pub reason: String,
}

/// A compiled wildcard pattern.
///
/// Compile once when the pattern is reused on a hot path (rule tables, method lists),
/// or use [`wildcard_match`] for one-off checks.
#[derive(Clone, Debug)]
pub struct WildcardPattern {
    matcher: GlobMatcher,
}

impl WildcardPattern {
    /// Compiles `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`WildcardError`] if the pattern is malformed (e.g. an unclosed `[` class).
    pub fn new(pattern: &str) -> Result<Self, WildcardError> {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(false)
            .backslash_escape(true)
            .build()
            .map_err(|e| WildcardError { pattern: pattern.to_string(), reason: e.to_string() })?;

        Ok(Self { matcher: glob.compile_matcher() })
    }

    #[must_use]
    pub fn is_match(&self, value: &str) -> bool {
        self.matcher.is_match(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.matcher.glob().glob()
    }
}

/// Matches `value` against `pattern`.
///
/// An exact string comparison short-circuits compilation, which covers the common case
/// of fully spelled-out method names in allow/ignore lists.
///
/// # Errors
///
/// Returns [`WildcardError`] if the pattern is malformed.
pub fn wildcard_match(pattern: &str, value: &str) -> Result<bool, WildcardError> {
    if pattern == value || pattern == "*" {
        return Ok(true);
    }
    if !pattern.contains(['*', '?', '[', '{']) {
        return Ok(false);
    }

    WildcardPattern::new(pattern).map(|p| p.is_match(value))
}
