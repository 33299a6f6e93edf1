//! Glob exclusions for source enumeration
//!
//! Folders and files have separate exclusion lists, each given on the command line as a
//! comma-separated list of patterns.
//!
//! # Pattern Syntax
//!
//! - `*` matches anything except `/`
//! - `**` matches anything including `/` (crosses directories)
//! - `?` matches a single character (except `/`)
//! - `[...]` character classes
//! - Leading `/` anchors to the copy root
//!
//! Patterns are matched against the path relative to the copy root. Patterns without a `/` also
//! match the entry name alone, wherever the entry is.
//!
//! # Examples
//!
//! ```
//! use common::filter::ExcludeFilter;
//!
//! let filter = ExcludeFilter::parse_list("*.tmp, /scratch").unwrap();
//! assert!(filter.excluded_by("projects/a/build.tmp").is_some());
//! assert!(filter.excluded_by("scratch").is_some());
//! assert!(filter.excluded_by("projects/scratch").is_none());
//! ```

use anyhow::{Context, anyhow};

/// A compiled exclusion pattern
#[derive(Debug, Clone)]
pub struct FilterPattern {
    /// pattern as given by the user
    pub original: String,
    matcher: globset::GlobMatcher,
    /// pattern starts with / (anchored to root)
    pub anchored: bool,
}

impl FilterPattern {
    pub fn parse(pattern: &str) -> Result<Self, anyhow::Error> {
        if pattern.is_empty() {
            return Err(anyhow!("empty pattern is not allowed"));
        }
        let anchored = pattern.starts_with('/');
        let pattern_str = pattern.trim_start_matches('/').trim_end_matches('/');
        if pattern_str.is_empty() {
            return Err(anyhow!(
                "pattern '{}' results in empty glob after stripping / markers",
                pattern
            ));
        }
        let glob = globset::GlobBuilder::new(pattern_str)
            .literal_separator(true) // * doesn't match /
            .build()
            .with_context(|| format!("invalid glob pattern: {}", pattern))?;
        Ok(Self {
            original: pattern.to_string(),
            matcher: glob.compile_matcher(),
            anchored,
        })
    }

    /// Path patterns require a full relative path match, simple ones can match the entry name
    fn is_path_pattern(&self) -> bool {
        let core = self.original.trim_start_matches('/').trim_end_matches('/');
        core.contains('/')
    }

    /// Check if this pattern matches `relative_path` (forward slashes, no leading slash)
    pub fn matches(&self, relative_path: &str) -> bool {
        if self.matcher.is_match(relative_path) {
            return true;
        }
        if self.anchored || self.is_path_pattern() {
            return false;
        }
        match relative_path.rsplit_once('/') {
            Some((_, name)) => self.matcher.is_match(name),
            None => false,
        }
    }
}

/// Set of exclusion patterns
#[derive(Debug, Clone, Default)]
pub struct ExcludeFilter {
    pub patterns: Vec<FilterPattern>,
}

impl ExcludeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pattern: &str) -> Result<(), anyhow::Error> {
        self.patterns.push(FilterPattern::parse(pattern)?);
        Ok(())
    }

    /// Parses a comma-separated list, blank entries are ignored
    pub fn parse_list(list: &str) -> Result<Self, anyhow::Error> {
        let mut filter = Self::new();
        for pattern in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            filter
                .add(pattern)
                .with_context(|| format!("invalid exclusion list '{list}'"))?;
        }
        Ok(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns the first pattern excluding `relative_path`
    pub fn excluded_by(&self, relative_path: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|pattern| pattern.matches(relative_path))
            .map(|pattern| pattern.original.as_str())
    }
}
