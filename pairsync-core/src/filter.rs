//! Include/exclude glob filtering of workspace-relative paths.
//!
//! A path is selected iff it matches at least one include pattern (an empty
//! include list selects everything) and matches no exclude pattern.
//!
//! Pattern forms:
//! - containing `/`: matched against the whole relative path; `*` stops at
//!   separators, `**` spans directories.
//! - without `/`: an include pattern is matched against the final component;
//!   an exclude pattern is matched against every component, so excluding a
//!   directory name also excludes everything beneath it.
//!
//! Patterns are compiled once in [`GlobFilter::new`]; malformed syntax is a
//! configuration error, never a per-event one.

use glob::{MatchOptions, Pattern};

use crate::error::FilterError;
use crate::types::RelPath;

/// Suffix of the scratch files written during atomic replacement; never synced.
pub const TEMP_SUFFIX: &str = ".pairsync.tmp";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct CompiledPattern {
    pattern: Pattern,
    anchored: bool,
}

impl CompiledPattern {
    fn compile(raw: &str) -> Result<Self, FilterError> {
        let pattern = Pattern::new(raw).map_err(|source| FilterError::InvalidPattern {
            pattern: raw.to_string(),
            source,
        })?;
        Ok(Self {
            pattern,
            anchored: raw.contains('/'),
        })
    }

    fn matches_include(&self, path: &str) -> bool {
        if self.anchored {
            return self.pattern.matches_with(path, MATCH_OPTIONS);
        }
        let name = path.rsplit('/').next().unwrap_or(path);
        self.pattern.matches_with(name, MATCH_OPTIONS)
    }

    fn matches_exclude(&self, path: &str) -> bool {
        if self.anchored {
            return self.pattern.matches_with(path, MATCH_OPTIONS);
        }
        path.split('/')
            .any(|component| self.pattern.matches_with(component, MATCH_OPTIONS))
    }
}

/// Compiled include/exclude lists. Cheap to clone; pure to evaluate.
#[derive(Debug, Clone)]
pub struct GlobFilter {
    include: Vec<CompiledPattern>,
    exclude: Vec<CompiledPattern>,
}

impl GlobFilter {
    pub fn new<I, E>(include: I, exclude: E) -> Result<Self, FilterError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        let include = include
            .into_iter()
            .map(|p| CompiledPattern::compile(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let exclude = exclude
            .into_iter()
            .map(|p| CompiledPattern::compile(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { include, exclude })
    }

    /// A filter that selects every path.
    pub fn allow_all() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    pub fn matches(&self, path: &RelPath) -> bool {
        self.matches_str(path.as_str())
    }

    pub fn matches_str(&self, path: &str) -> bool {
        if path.ends_with(TEMP_SUFFIX) {
            return false;
        }
        let included =
            self.include.is_empty() || self.include.iter().any(|p| p.matches_include(path));
        included && !self.exclude.iter().any(|p| p.matches_exclude(path))
    }

    /// True when `path` is excluded outright, independent of the include list.
    /// Directories are only pruned from scans on this basis.
    pub fn excludes(&self, path: &RelPath) -> bool {
        path.as_str().ends_with(TEMP_SUFFIX)
            || self
                .exclude
                .iter()
                .any(|p| p.matches_exclude(path.as_str()))
    }
}

/// One-shot form: compile both lists and evaluate `path`.
pub fn matches<S: AsRef<str>>(include: &[S], exclude: &[S], path: &str) -> Result<bool, FilterError> {
    Ok(GlobFilter::new(include, exclude)?.matches_str(path))
}
