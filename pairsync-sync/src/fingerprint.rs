//! Content fingerprints and on-disk snapshots.
//!
//! A fingerprint is the hex SHA-256 of a file's bytes. Snapshots accept an
//! optional hint (the last known [`Inode`]); when size and mtime agree the
//! hint's fingerprint is reused instead of re-reading the file.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::Path;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use pairsync_core::{GlobFilter, Inode, RelPath};

use crate::error::{io_err, SyncError};

/// Hex SHA-256 of `bytes`.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// Hex SHA-256 of the file at `path`, streamed.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut h = Sha256::new();
    io::copy(&mut file, &mut h)?;
    Ok(hex::encode(h.finalize()))
}

/// Current state of `rel` under `root`, or `None` if nothing is there.
/// Symlinks and other special files are invisible.
pub fn snapshot(root: &Path, rel: &RelPath) -> Result<Option<Inode>, SyncError> {
    snapshot_hinted(root, rel, None)
}

pub fn snapshot_hinted(
    root: &Path,
    rel: &RelPath,
    hint: Option<&Inode>,
) -> Result<Option<Inode>, SyncError> {
    let path = rel.to_path(root);
    let meta = match fs::symlink_metadata(&path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(&path, err)),
    };
    let mod_time: DateTime<Utc> = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .map_err(|e| io_err(&path, e))?;

    if meta.is_dir() {
        return Ok(Some(Inode::directory(rel.clone(), mod_time)));
    }
    if !meta.is_file() {
        return Ok(None);
    }

    if let Some(hint) = hint {
        if !hint.is_dir() && hint.size == meta.len() && hint.mod_time == mod_time {
            return Ok(Some(Inode::file(
                rel.clone(),
                hint.fingerprint.clone(),
                mod_time,
                meta.len(),
            )));
        }
    }

    let fingerprint = match fingerprint_file(&path) {
        Ok(fp) => fp,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(&path, err)),
    };
    Ok(Some(Inode::file(
        rel.clone(),
        fingerprint,
        mod_time,
        meta.len(),
    )))
}

/// Snapshot every filtered entry under `root`. Excluded directories are
/// pruned; with `recursive == false` only direct children are visited.
pub fn walk(
    root: &Path,
    filter: &GlobFilter,
    recursive: bool,
    hints: &BTreeMap<RelPath, Inode>,
) -> Result<BTreeMap<RelPath, Inode>, SyncError> {
    walk_from(root, root, filter, recursive, hints)
}

/// Like [`walk`], but only below `start` (which is not itself included).
pub fn walk_subtree(
    root: &Path,
    start: &RelPath,
    filter: &GlobFilter,
    hints: &BTreeMap<RelPath, Inode>,
) -> Result<BTreeMap<RelPath, Inode>, SyncError> {
    walk_from(root, &start.to_path(root), filter, true, hints)
}

fn walk_from(
    root: &Path,
    start: &Path,
    filter: &GlobFilter,
    recursive: bool,
    hints: &BTreeMap<RelPath, Inode>,
) -> Result<BTreeMap<RelPath, Inode>, SyncError> {
    let mut tree = BTreeMap::new();
    let mut dirs = vec![start.to_path_buf()];
    while let Some(current) = dirs.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound && current != root => continue,
            Err(err) => return Err(io_err(&current, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let path = entry.path();
            let Some(rel) = RelPath::from_root(root, &path) else {
                continue;
            };
            if filter.excludes(&rel) {
                continue;
            }
            let Some(inode) = snapshot_hinted(root, &rel, hints.get(&rel))? else {
                continue;
            };
            if inode.is_dir() && recursive {
                dirs.push(path);
            }
            if filter.matches(&rel) {
                tree.insert(rel, inode);
            }
        }
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    #[test]
    fn fingerprint_matches_known_digest() {
        assert_eq!(
            fingerprint_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn snapshot_file_directory_and_missing() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("docs")).unwrap();
        fs::write(tmp.path().join("docs/a.txt"), "abc").unwrap();

        let file = snapshot(tmp.path(), &rel("docs/a.txt")).unwrap().unwrap();
        assert_eq!(file.size, 3);
        assert_eq!(file.fingerprint, fingerprint_bytes(b"abc"));

        let dir = snapshot(tmp.path(), &rel("docs")).unwrap().unwrap();
        assert!(dir.is_dir());
        assert!(dir.fingerprint.is_empty());

        assert!(snapshot(tmp.path(), &rel("nope")).unwrap().is_none());
    }

    #[test]
    fn matching_hint_skips_rehash() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "abc").unwrap();
        let real = snapshot(tmp.path(), &rel("a.txt")).unwrap().unwrap();
        let mut hint = real.clone();
        hint.fingerprint = "cached".into();
        let hinted = snapshot_hinted(tmp.path(), &rel("a.txt"), Some(&hint))
            .unwrap()
            .unwrap();
        assert_eq!(hinted.fingerprint, "cached");
    }

    #[test]
    fn walk_applies_filter_and_prunes_excluded_dirs() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("docs/sub")).unwrap();
        fs::create_dir_all(tmp.path().join("build")).unwrap();
        fs::write(tmp.path().join("docs/a.md"), "a").unwrap();
        fs::write(tmp.path().join("docs/sub/b.md"), "b").unwrap();
        fs::write(tmp.path().join("docs/c.tmp"), "c").unwrap();
        fs::write(tmp.path().join("build/out.md"), "o").unwrap();

        let filter = GlobFilter::new(Vec::<String>::new(), vec!["*.tmp", "build"]).unwrap();
        let tree = walk(tmp.path(), &filter, true, &BTreeMap::new()).unwrap();
        let paths: Vec<_> = tree.keys().map(RelPath::as_str).collect();
        assert_eq!(paths, vec!["docs", "docs/a.md", "docs/sub", "docs/sub/b.md"]);

        let shallow = walk(tmp.path(), &filter, false, &BTreeMap::new()).unwrap();
        let paths: Vec<_> = shallow.keys().map(RelPath::as_str).collect();
        assert_eq!(paths, vec!["docs"]);
    }

    #[test]
    fn subtree_walk_excludes_its_start() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        fs::write(tmp.path().join("a/b/c.txt"), "c").unwrap();
        fs::write(tmp.path().join("top.txt"), "t").unwrap();
        let tree = walk_subtree(tmp.path(), &rel("a"), &GlobFilter::allow_all(), &BTreeMap::new())
            .unwrap();
        let paths: Vec<_> = tree.keys().map(RelPath::as_str).collect();
        assert_eq!(paths, vec!["a/b", "a/b/c.txt"]);
    }
}
