//! Executes planned operations against the two trees.
//!
//! ## Copy protocol
//!
//! 1. Snapshot the destination; skip if it already has the wanted fingerprint.
//! 2. Check the destination guard.
//! 3. Check the source still has the planned fingerprint.
//! 4. Copy to `<dst>.pairsync.tmp` and verify its fingerprint.
//! 5. Give the temp file the source's mtime.
//! 6. Check the destination guard again, then rename to the final path
//!    (atomic on POSIX).
//!
//! Every operation returns the changes it made so the caller can record them
//! on the target side.

use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;

use pairsync_core::filter::TEMP_SUFFIX;
use pairsync_core::{Inode, RelPath, Side};

use crate::classifier::AppliedChange;
use crate::error::{io_err, SyncError};
use crate::fingerprint::{fingerprint_file, snapshot};
use crate::plan::{Guard, PlannedOp};

/// Outcome of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// Disk changed; these changes happened on the target side, parents first.
    Applied(Vec<AppliedChange>),
    /// The target already was in the wanted state, or was left alone.
    Unchanged,
}

/// Roots of the two sides of a job.
#[derive(Debug, Clone, Copy)]
pub struct Roots<'a> {
    pub local: &'a Path,
    pub remote: &'a Path,
}

impl<'a> Roots<'a> {
    pub fn of(&self, side: Side) -> &'a Path {
        match side {
            Side::Local => self.local,
            Side::Remote => self.remote,
        }
    }
}

pub fn execute(op: &PlannedOp, roots: Roots<'_>) -> Result<StepResult, SyncError> {
    match op {
        PlannedOp::Preserve {
            side,
            path,
            to,
            guard,
        }
        | PlannedOp::Rename {
            side,
            from: path,
            to,
            guard,
        } => rename(*side, roots.of(*side), path, to, guard),
        PlannedOp::Remove { side, path, guard } => remove(*side, roots.of(*side), path, guard),
        PlannedOp::EnsureDir { side, path } => ensure_dir(*side, roots.of(*side), path),
        PlannedOp::Copy {
            to,
            src,
            dst,
            fingerprint,
            guard,
        } => copy_file(
            *to,
            roots.of(to.other()),
            src,
            roots.of(*to),
            dst,
            fingerprint,
            guard,
        ),
    }
}

fn check_guard(
    side: Side,
    path: &RelPath,
    current: Option<&Inode>,
    guard: &Guard,
) -> Result<(), SyncError> {
    let ok = match (guard, current) {
        (Guard::Absent, None) => true,
        (Guard::Content(fp), Some(inode)) => !inode.is_dir() && inode.fingerprint == *fp,
        (Guard::Directory, Some(inode)) => inode.is_dir(),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(SyncError::Diverged {
            side,
            path: path.clone(),
        })
    }
}

/// Create missing ancestors of `path`, returning the ones created.
fn ensure_parents(root: &Path, path: &RelPath) -> Result<Vec<AppliedChange>, SyncError> {
    let mut missing = Vec::new();
    let mut parent = path.parent();
    while let Some(dir) = parent {
        if dir.to_path(root).is_dir() {
            break;
        }
        parent = dir.parent();
        missing.push(dir);
    }
    let mut created = Vec::new();
    for dir in missing.into_iter().rev() {
        let abs = dir.to_path(root);
        fs::create_dir(&abs).map_err(|e| io_err(&abs, e))?;
        if let Some(inode) = snapshot(root, &dir)? {
            created.push(AppliedChange::Present(inode));
        }
    }
    Ok(created)
}

#[cfg(test)]
thread_local! {
    /// Runs just before a copy's final guard check.
    static BEFORE_COMMIT: std::cell::RefCell<Option<Box<dyn Fn(&Path)>>> =
        std::cell::RefCell::new(None);
}

fn tmp_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}{TEMP_SUFFIX}", path.display()))
}

pub(crate) fn copy_file(
    to: Side,
    src_root: &Path,
    src: &RelPath,
    dst_root: &Path,
    dst: &RelPath,
    fingerprint: &str,
    guard: &Guard,
) -> Result<StepResult, SyncError> {
    let current = snapshot(dst_root, dst)?;
    if let Some(existing) = &current {
        if !existing.is_dir() && existing.fingerprint == fingerprint {
            tracing::debug!(side = %to, path = %dst, "unchanged");
            return Ok(StepResult::Unchanged);
        }
    }
    check_guard(to, dst, current.as_ref(), guard)?;

    let source = snapshot(src_root, src)?.ok_or_else(|| SyncError::SourceMissing {
        side: to.other(),
        path: src.clone(),
    })?;
    if source.is_dir() || source.fingerprint != fingerprint {
        return Err(SyncError::Diverged {
            side: to.other(),
            path: src.clone(),
        });
    }

    let mut changes = ensure_parents(dst_root, dst)?;
    let src_path = src.to_path(src_root);
    let dst_path = dst.to_path(dst_root);
    let tmp = tmp_path(&dst_path);

    fs::copy(&src_path, &tmp).map_err(|e| io_err(&src_path, e))?;
    let finish = || -> Result<(), SyncError> {
        let copied = fingerprint_file(&tmp).map_err(|e| io_err(&tmp, e))?;
        if copied != fingerprint {
            return Err(SyncError::Diverged {
                side: to.other(),
                path: src.clone(),
            });
        }
        let mtime = FileTime::from_unix_time(
            source.mod_time.timestamp(),
            source.mod_time.timestamp_subsec_nanos(),
        );
        filetime::set_file_mtime(&tmp, mtime).map_err(|e| io_err(&tmp, e))?;

        #[cfg(test)]
        BEFORE_COMMIT.with(|hook| {
            if let Some(hook) = hook.borrow().as_ref() {
                hook(&dst_path);
            }
        });
        check_guard(to, dst, snapshot(dst_root, dst)?.as_ref(), guard)?;
        fs::rename(&tmp, &dst_path).map_err(|e| io_err(&dst_path, e))
    };
    if let Err(err) = finish() {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }

    let written = snapshot(dst_root, dst)?.ok_or_else(|| SyncError::Diverged {
        side: to,
        path: dst.clone(),
    })?;
    tracing::info!(side = %to, path = %dst, "wrote");
    changes.push(AppliedChange::Present(written));
    Ok(StepResult::Applied(changes))
}

fn rename(
    side: Side,
    root: &Path,
    from: &RelPath,
    to: &RelPath,
    guard: &Guard,
) -> Result<StepResult, SyncError> {
    let current = snapshot(root, from)?;
    check_guard(side, from, current.as_ref(), guard)?;
    if snapshot(root, to)?.is_some() {
        return Err(SyncError::Diverged {
            side,
            path: to.clone(),
        });
    }

    let mut changes = ensure_parents(root, to)?;
    let from_path = from.to_path(root);
    let to_path = to.to_path(root);
    fs::rename(&from_path, &to_path).map_err(|e| io_err(&from_path, e))?;

    let moved = snapshot(root, to)?.ok_or_else(|| SyncError::Diverged {
        side,
        path: to.clone(),
    })?;
    tracing::info!(side = %side, from = %from, to = %to, "renamed");
    changes.push(AppliedChange::Moved {
        from: from.clone(),
        to: moved,
    });
    Ok(StepResult::Applied(changes))
}

fn remove(side: Side, root: &Path, path: &RelPath, guard: &Guard) -> Result<StepResult, SyncError> {
    let Some(current) = snapshot(root, path)? else {
        return Ok(StepResult::Unchanged);
    };
    check_guard(side, path, Some(&current), guard)?;

    let abs = path.to_path(root);
    if current.is_dir() {
        let occupied = fs::read_dir(&abs)
            .map_err(|e| io_err(&abs, e))?
            .next()
            .is_some();
        if occupied {
            tracing::warn!(side = %side, path = %path, "directory not empty; left in place");
            return Ok(StepResult::Unchanged);
        }
        fs::remove_dir(&abs).map_err(|e| io_err(&abs, e))?;
    } else {
        fs::remove_file(&abs).map_err(|e| io_err(&abs, e))?;
    }
    tracing::info!(side = %side, path = %path, "removed");
    Ok(StepResult::Applied(vec![AppliedChange::Absent(path.clone())]))
}

fn ensure_dir(side: Side, root: &Path, path: &RelPath) -> Result<StepResult, SyncError> {
    match snapshot(root, path)? {
        Some(inode) if inode.is_dir() => return Ok(StepResult::Unchanged),
        Some(_) => {
            return Err(SyncError::Diverged {
                side,
                path: path.clone(),
            })
        }
        None => {}
    }
    let mut changes = ensure_parents(root, path)?;
    let abs = path.to_path(root);
    fs::create_dir(&abs).map_err(|e| io_err(&abs, e))?;
    if let Some(inode) = snapshot(root, path)? {
        changes.push(AppliedChange::Present(inode));
    }
    tracing::info!(side = %side, path = %path, "created directory");
    Ok(StepResult::Applied(changes))
}
