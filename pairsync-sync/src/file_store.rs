//! File-backed [`LogStore`].
//!
//! Layout under the state directory:
//!
//! ```text
//! <state_dir>/
//!   <workspace>/
//!     changes.jsonl            (one ChangeRecord per line, fsynced on append)
//!     watermarks/<peer>.json   (`.tmp` fsynced, then renamed)
//! ```
//!
//! Each log is loaded into memory on first use and appended to in place. A
//! torn final line (crash mid-append) is truncated away on load; any other
//! unparsable or out-of-order line marks the log corrupt.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use pairsync_core::{ChangeRecord, Sequence, WorkspaceId};

use crate::error::{store_io, StoreError};
use crate::store::{expect_next, LogStore, Watermark};

const LOG_FILE: &str = "changes.jsonl";
const WATERMARK_DIR: &str = "watermarks";

struct LoadedLog {
    path: PathBuf,
    records: Vec<ChangeRecord>,
    /// Bytes this process believes are on disk.
    bytes: u64,
}

/// JSON-lines change logs rooted at one state directory.
pub struct FileStore {
    root: PathBuf,
    logs: Mutex<HashMap<WorkspaceId, LoadedLog>>,
}

impl FileStore {
    /// Open (creating if needed) the state directory at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| store_io(&root, e))?;
        Ok(Self {
            root,
            logs: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_path(&self, workspace: &WorkspaceId) -> PathBuf {
        self.root.join(&workspace.0).join(LOG_FILE)
    }

    pub fn watermark_path(&self, workspace: &WorkspaceId, peer: &WorkspaceId) -> PathBuf {
        self.root
            .join(&workspace.0)
            .join(WATERMARK_DIR)
            .join(format!("{}.json", peer.0))
    }

    fn with_log<T>(
        &self,
        workspace: &WorkspaceId,
        f: impl FnOnce(&mut LoadedLog) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut logs = self
            .logs
            .lock()
            .map_err(|_| StoreError::Unavailable("file store lock poisoned".to_string()))?;
        if !logs.contains_key(workspace) {
            let loaded = load_log(workspace, self.log_path(workspace))?;
            logs.insert(workspace.clone(), loaded);
        }
        match logs.get_mut(workspace) {
            Some(log) => f(log),
            None => Err(StoreError::Unavailable(format!("log {workspace} not loaded"))),
        }
    }
}

fn load_log(workspace: &WorkspaceId, path: PathBuf) -> Result<LoadedLog, StoreError> {
    let contents = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(LoadedLog {
                path,
                records: Vec::new(),
                bytes: 0,
            })
        }
        Err(err) => return Err(store_io(&path, err)),
    };

    let mut records = Vec::new();
    let mut good_bytes = 0u64;
    let mut rest: &[u8] = &contents;
    while !rest.is_empty() {
        let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
            // Torn tail: the append never completed.
            tracing::warn!(
                workspace = %workspace,
                path = %path.display(),
                dropped_bytes = rest.len(),
                "truncating incomplete change-log tail",
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| store_io(&path, e))?;
            file.set_len(good_bytes).map_err(|e| store_io(&path, e))?;
            file.sync_all().map_err(|e| store_io(&path, e))?;
            break;
        };
        let line = &rest[..newline];
        let record: ChangeRecord =
            serde_json::from_slice(line).map_err(|e| StoreError::Corrupt {
                workspace: workspace.clone(),
                detail: format!("line {}: {e}", records.len() + 1),
            })?;
        let last = records
            .last()
            .map(|r: &ChangeRecord| r.sequence)
            .unwrap_or(Sequence::ZERO);
        expect_next(workspace, last, &record).map_err(|e| StoreError::Corrupt {
            workspace: workspace.clone(),
            detail: e.to_string(),
        })?;
        records.push(record);
        good_bytes += newline as u64 + 1;
        rest = &rest[newline + 1..];
    }

    Ok(LoadedLog {
        path,
        records,
        bytes: good_bytes,
    })
}

impl LogStore for FileStore {
    fn append(&self, workspace: &WorkspaceId, record: &ChangeRecord) -> Result<(), StoreError> {
        self.with_log(workspace, |log| {
            let last = log.records.last().map(|r| r.sequence).unwrap_or(Sequence::ZERO);
            expect_next(workspace, last, record)?;

            let mut line = serde_json::to_vec(record).map_err(|e| StoreError::Json {
                path: log.path.clone(),
                source: e,
            })?;
            line.push(b'\n');

            if let Some(dir) = log.path.parent() {
                fs::create_dir_all(dir).map_err(|e| store_io(dir, e))?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log.path)
                .map_err(|e| store_io(&log.path, e))?;
            file.write_all(&line).map_err(|e| store_io(&log.path, e))?;
            file.sync_data().map_err(|e| store_io(&log.path, e))?;

            log.bytes += line.len() as u64;
            log.records.push(record.clone());
            Ok(())
        })
    }

    fn range(
        &self,
        workspace: &WorkspaceId,
        after: Sequence,
        upto: Sequence,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        self.with_log(workspace, |log| {
            let start = usize::try_from(after.0)
                .unwrap_or(usize::MAX)
                .min(log.records.len());
            Ok(log.records[start..]
                .iter()
                .take_while(|r| r.sequence <= upto)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn get(
        &self,
        workspace: &WorkspaceId,
        sequence: Sequence,
    ) -> Result<Option<ChangeRecord>, StoreError> {
        if sequence == Sequence::ZERO {
            return Ok(None);
        }
        self.with_log(workspace, |log| {
            Ok(log.records.get((sequence.0 - 1) as usize).cloned())
        })
    }

    fn last_sequence(&self, workspace: &WorkspaceId) -> Result<Sequence, StoreError> {
        self.with_log(workspace, |log| {
            Ok(log.records.last().map(|r| r.sequence).unwrap_or(Sequence::ZERO))
        })
    }

    fn check(&self, workspace: &WorkspaceId) -> Result<(), StoreError> {
        if !self.root.is_dir() {
            return Err(StoreError::Unavailable(format!(
                "state directory {} is missing",
                self.root.display()
            )));
        }
        self.with_log(workspace, |log| {
            let on_disk = match fs::metadata(&log.path) {
                Ok(meta) => meta.len(),
                Err(err) if err.kind() == ErrorKind::NotFound => 0,
                Err(err) => return Err(store_io(&log.path, err)),
            };
            if on_disk != log.bytes {
                return Err(StoreError::Corrupt {
                    workspace: workspace.clone(),
                    detail: format!(
                        "{} holds {on_disk} bytes, expected {}",
                        log.path.display(),
                        log.bytes
                    ),
                });
            }
            Ok(())
        })
    }

    fn load_watermark(
        &self,
        workspace: &WorkspaceId,
        peer: &WorkspaceId,
    ) -> Result<Watermark, StoreError> {
        let path = self.watermark_path(workspace, peer);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Watermark::default()),
            Err(err) => return Err(store_io(&path, err)),
        };
        serde_json::from_str(&contents).map_err(|e| StoreError::Json { path, source: e })
    }

    /// Writes to `<path>.tmp` then renames to `<path>`.
    fn save_watermark(
        &self,
        workspace: &WorkspaceId,
        peer: &WorkspaceId,
        watermark: &Watermark,
    ) -> Result<(), StoreError> {
        let path = self.watermark_path(workspace, peer);
        let Some(dir) = path.parent() else {
            return Err(store_io(
                path,
                std::io::Error::other("invalid watermark path"),
            ));
        };
        fs::create_dir_all(dir).map_err(|e| store_io(dir, e))?;

        let json = serde_json::to_string_pretty(watermark).map_err(|e| StoreError::Json {
            path: path.clone(),
            source: e,
        })?;
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(|e| store_io(&tmp, e))?;
        file.write_all(json.as_bytes())
            .map_err(|e| store_io(&tmp, e))?;
        file.sync_data().map_err(|e| store_io(&tmp, e))?;
        drop(file);
        fs::rename(&tmp, &path).map_err(|e| store_io(&path, e))?;
        Ok(())
    }
}
