//! Names for preserved conflict losers.
//!
//! `report.txt` losing on the remote side at 2026-03-01 12:00:05 UTC becomes
//! `report (conflict remote 20260301T120005Z).txt`.

use chrono::{DateTime, Utc};

use pairsync_core::{RelPath, Side};

/// Conflict-suffixed sibling of `original`.
pub fn conflict_name(original: &RelPath, loser: Side, stamp: DateTime<Utc>) -> RelPath {
    let tag = format!("conflict {loser} {}", stamp.format("%Y%m%dT%H%M%SZ"));
    original.with_file_name(&decorate(original.file_name(), &tag))
}

/// Like [`conflict_name`], numbering the name until `exists` rejects it.
pub fn unique_conflict_name<F>(
    original: &RelPath,
    loser: Side,
    stamp: DateTime<Utc>,
    mut exists: F,
) -> RelPath
where
    F: FnMut(&RelPath) -> bool,
{
    let candidate = conflict_name(original, loser, stamp);
    if !exists(&candidate) {
        return candidate;
    }
    let base = format!("conflict {loser} {}", stamp.format("%Y%m%dT%H%M%SZ"));
    let mut n = 2u32;
    loop {
        let numbered =
            original.with_file_name(&decorate(original.file_name(), &format!("{base} {n}")));
        if !exists(&numbered) {
            return numbered;
        }
        n += 1;
    }
}

fn decorate(name: &str, tag: &str) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({tag}){}", &name[..dot], &name[dot..]),
        _ => format!("{name} ({tag})"),
    }
}
