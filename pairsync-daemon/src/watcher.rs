//! `notify`-backed [`Watcher`].
//!
//! One OS watcher serves every registration. Events arrive on notify's
//! delivery thread, are mapped to [`RawEvent`]s and fanned out to each
//! handler whose registered path covers them. A failed watch or a vanished
//! root becomes an `Error` event and the registration is retried on
//! [`Watcher::resume`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};

use pairsync_sync::{EventHandler, RawEvent, RawKind, SyncError, Watcher};

struct Registration {
    path: PathBuf,
    handler: Arc<dyn EventHandler>,
    recursive: bool,
    healthy: bool,
}

impl Registration {
    fn covers(&self, path: &Path) -> bool {
        covers(&self.path, self.recursive, path)
    }

    fn mode(&self) -> RecursiveMode {
        if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        }
    }
}

type Registry = Arc<RwLock<Vec<Registration>>>;

pub struct NotifyWatcher {
    inner: RecommendedWatcher,
    registrations: Registry,
}

impl NotifyWatcher {
    pub fn new() -> Result<Self, notify::Error> {
        let registrations: Registry = Arc::new(RwLock::new(Vec::new()));
        let routed = Arc::clone(&registrations);
        let inner = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for kind in map_notify_event(&event) {
                        route(&routed, RawEvent::now(kind));
                    }
                }
                Err(err) => route_error(&routed, &err),
            },
            notify::Config::default(),
        )?;
        Ok(Self {
            inner,
            registrations,
        })
    }
}

impl Watcher for NotifyWatcher {
    fn register(
        &mut self,
        path: &Path,
        handler: Arc<dyn EventHandler>,
        recursive: bool,
    ) -> Result<(), SyncError> {
        let registration = Registration {
            path: path.to_path_buf(),
            handler,
            recursive,
            healthy: true,
        };
        self.inner
            .watch(path, registration.mode())
            .map_err(|err| SyncError::Watch {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        tracing::debug!(path = %path.display(), recursive, "watching");
        self.registrations
            .write()
            .map_err(|_| SyncError::Poisoned("watch registry"))?
            .push(registration);
        Ok(())
    }

    fn resume(&mut self) -> bool {
        let Ok(mut registrations) = self.registrations.write() else {
            return false;
        };
        let mut healthy = true;
        for registration in registrations.iter_mut().filter(|r| !r.healthy) {
            if !registration.path.is_dir() {
                healthy = false;
                continue;
            }
            let _ = self.inner.unwatch(&registration.path);
            match self.inner.watch(&registration.path, registration.mode()) {
                Ok(()) => {
                    registration.healthy = true;
                    tracing::info!(path = %registration.path.display(), "watch resumed");
                    registration
                        .handler
                        .dispatch(&RawEvent::now(RawKind::Resumed(registration.path.clone())));
                }
                Err(err) => {
                    tracing::warn!(
                        path = %registration.path.display(),
                        error = %err,
                        "watch still failing",
                    );
                    healthy = false;
                }
            }
        }
        healthy
    }

    fn unwatch_all(&mut self) {
        let Ok(mut registrations) = self.registrations.write() else {
            return;
        };
        for registration in registrations.drain(..) {
            if let Err(err) = self.inner.unwatch(&registration.path) {
                tracing::debug!(path = %registration.path.display(), error = %err, "unwatch failed");
            }
        }
    }
}

fn route(registry: &Registry, event: RawEvent) {
    let Ok(mut registrations) = registry.write() else {
        return;
    };
    for registration in registrations.iter_mut() {
        if !event.paths().iter().any(|p| registration.covers(p)) {
            continue;
        }
        if let RawKind::Removed(path) = &event.kind {
            if *path == registration.path {
                registration.healthy = false;
            }
        }
        registration.handler.dispatch(&event);
    }
}

fn route_error(registry: &Registry, err: &notify::Error) {
    tracing::warn!(error = %err, "watcher error");
    let Ok(mut registrations) = registry.write() else {
        return;
    };
    for registration in registrations.iter_mut() {
        let hit = err.paths.is_empty() || err.paths.iter().any(|p| registration.covers(p));
        if !hit {
            continue;
        }
        registration.healthy = false;
        registration.handler.dispatch(&RawEvent::now(RawKind::Error {
            path: registration.path.clone(),
            message: err.to_string(),
        }));
    }
}

/// `event` lies under a registration at `root`.
fn covers(root: &Path, recursive: bool, event: &Path) -> bool {
    if recursive {
        event.starts_with(root)
    } else {
        event == root || event.parent() == Some(root)
    }
}

/// Translate one notify event. Access events are ignored; unknown kinds are
/// reported as modifications so the path is re-examined.
fn map_notify_event(event: &notify::Event) -> Vec<RawKind> {
    let paths = &event.paths;
    let first = || paths.first().cloned();
    let kind = match &event.kind {
        EventKind::Access(_) => None,
        EventKind::Create(_) => first().map(RawKind::Created),
        EventKind::Remove(_) => first().map(RawKind::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            Some(RawKind::Renamed {
                from: paths[0].clone(),
                to: paths[1].clone(),
            })
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => first().map(RawKind::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => first().map(RawKind::Created),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
            return paths.iter().cloned().map(RawKind::Modified).collect();
        }
    };
    kind.into_iter().collect()
}
