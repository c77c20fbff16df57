//! Domain types for the change log.
//!
//! Paths inside a workspace are always [`RelPath`] (relative, `/`-separated);
//! absolute paths only exist at the filesystem edge as `PathBuf`.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PathError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed name for a configured sync job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobName(pub String);

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for JobName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Which endpoint of a job a workspace is. `Local` is the primary side and
/// wins exact conflict ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

/// Storage key prefix of one workspace's change log: `<job>.<side>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkspaceId(pub String);

impl WorkspaceId {
    pub fn for_side(job: &JobName, side: Side) -> Self {
        Self(format!("{}.{}", job.0, side))
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for WorkspaceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Position in a workspace's change log. `Sequence::ZERO` means "nothing yet";
/// the first appended record is sequence 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);

    pub fn next(self) -> Sequence {
        Sequence(self.0 + 1)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Normalised workspace-relative POSIX path: no leading `/`, no `.` or `..`
/// components, `/` separators, never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelPath(String);

impl RelPath {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, PathError> {
        let raw = raw.as_ref();
        let mut parts = Vec::new();
        for part in raw.split('/') {
            match part {
                "" | "." => continue,
                ".." => return Err(PathError(raw.to_string())),
                other => parts.push(other),
            }
        }
        if parts.is_empty() {
            return Err(PathError(raw.to_string()));
        }
        Ok(Self(parts.join("/")))
    }

    /// Relative path of `path` under `root`, or `None` when `path` is the root
    /// itself or lies outside it.
    pub fn from_root(root: &Path, path: &Path) -> Option<Self> {
        let relative = path.strip_prefix(root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?.to_string()),
                Component::CurDir => continue,
                _ => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(Self(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_path(&self, root: &Path) -> PathBuf {
        self.0.split('/').fold(root.to_path_buf(), |acc, p| acc.join(p))
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn parent(&self) -> Option<RelPath> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| RelPath(parent.to_string()))
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Replace the final component.
    pub fn with_file_name(&self, name: &str) -> RelPath {
        match self.parent() {
            Some(parent) => RelPath(format!("{}/{name}", parent.0)),
            None => RelPath(name.to_string()),
        }
    }

    /// True when `self` is `ancestor` or lies beneath it.
    pub fn is_within(&self, ancestor: &RelPath) -> bool {
        self.0 == ancestor.0
            || (self.0.starts_with(&ancestor.0)
                && self.0.as_bytes().get(ancestor.0.len()) == Some(&b'/'))
    }

    /// `self` re-rooted from beneath `from` to beneath `to`; `None` when
    /// `self` is not within `from`.
    pub fn rebase(&self, from: &RelPath, to: &RelPath) -> Option<RelPath> {
        if self == from {
            return Some(to.clone());
        }
        if !self.is_within(from) {
            return None;
        }
        let rest = &self.0[from.0.len() + 1..];
        Some(RelPath(format!("{}/{rest}", to.0)))
    }

    pub fn depth(&self) -> usize {
        self.0.split('/').count()
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for RelPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RelPath::new(value)
    }
}

impl From<RelPath> for String {
    fn from(path: RelPath) -> Self {
        path.0
    }
}

// ---------------------------------------------------------------------------
// Inode snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InodeKind {
    File,
    Directory,
}

/// Immutable snapshot of one filesystem resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub path: RelPath,
    pub kind: InodeKind,
    /// Hex SHA-256 of the content; empty for directories.
    #[serde(default)]
    pub fingerprint: String,
    pub mod_time: DateTime<Utc>,
    pub size: u64,
}

impl Inode {
    pub fn file(
        path: RelPath,
        fingerprint: impl Into<String>,
        mod_time: DateTime<Utc>,
        size: u64,
    ) -> Self {
        Self {
            path,
            kind: InodeKind::File,
            fingerprint: fingerprint.into(),
            mod_time,
            size,
        }
    }

    pub fn directory(path: RelPath, mod_time: DateTime<Utc>) -> Self {
        Self {
            path,
            kind: InodeKind::Directory,
            fingerprint: String::new(),
            mod_time,
            size: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    /// Same kind and same content, ignoring path and timestamps.
    pub fn same_content(&self, other: &Inode) -> bool {
        self.kind == other.kind && self.fingerprint == other.fingerprint
    }

    pub fn relocated(&self, path: RelPath) -> Inode {
        Inode {
            path,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Change records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Created,
    Deleted,
    Modified,
    Moved,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOp::Created => write!(f, "created"),
            ChangeOp::Deleted => write!(f, "deleted"),
            ChangeOp::Modified => write!(f, "modified"),
            ChangeOp::Moved => write!(f, "moved"),
        }
    }
}

/// One classified mutation. `subject` is the post-state, or the pre-state for
/// `Deleted`. `previous_path` is set only for `Moved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub sequence: Sequence,
    pub op: ChangeOp,
    pub subject: Inode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_path: Option<RelPath>,
}

impl ChangeRecord {
    pub fn path(&self) -> &RelPath {
        &self.subject.path
    }

    /// Every path this record mutates: the subject path, plus the source of a move.
    pub fn touched_paths(&self) -> impl Iterator<Item = &RelPath> {
        std::iter::once(&self.subject.path).chain(self.previous_path.iter())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
