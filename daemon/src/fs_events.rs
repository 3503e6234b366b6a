/// Event-stream change source.
///
/// Subscribes to the OS file-change facility (FSEvents on macOS, inotify on
/// Linux) for one or more directory trees and reports created, modified and
/// renamed files through a [`ChangeHandler`]. The handler runs on the watcher's
/// own background thread.
///
/// Rapid repeats for the same path are coalesced over a short window. That is
/// a local optimisation; the throttle downstream does not rely on it.
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::error::SourceError;
use crate::source::{ChangeHandler, ChangeKind, ExtensionFilter};

pub const COALESCE_WINDOW: Duration = Duration::from_millis(500);

/// Size at which stale entries are evicted from the coalescing table.
const COALESCE_PRUNE_THRESHOLD: usize = 1024;

type SharedWatcher = Arc<Mutex<RecommendedWatcher>>;

pub struct EventStreamSource {
    roots: Vec<PathBuf>,
    filter: ExtensionFilter,
    handler: ChangeHandler,
    watcher: Option<SharedWatcher>,
}

impl EventStreamSource {
    pub fn new(roots: Vec<PathBuf>, filter: ExtensionFilter, handler: ChangeHandler) -> Self {
        Self {
            roots,
            filter,
            handler,
            watcher: None,
        }
    }

    /// Subscribes to every existing root. Calling `start` on a running source
    /// is a no-op; calling it after [`stop`](Self::stop) re-subscribes.
    ///
    /// Each root's parent is also watched (non-recursively) so that a root
    /// which is removed and recreated, or one that is missing at startup,
    /// gets its subscription re-armed when the directory appears.
    pub fn start(&mut self) -> Result<(), SourceError> {
        if self.watcher.is_some() {
            return Ok(());
        }

        // Event paths come back resolved (e.g. `/private/var` on macOS).
        let roots: Vec<PathBuf> = self
            .roots
            .iter()
            .map(|r| r.canonicalize().unwrap_or_else(|_| r.clone()))
            .collect();
        for missing in roots.iter().filter(|r| !r.is_dir()) {
            tracing::warn!(path = %missing.display(), "watch root does not exist; skipping");
        }
        if !roots.iter().any(|r| r.is_dir()) {
            return Err(SourceError::RootMissing(
                self.roots.first().cloned().unwrap_or_default(),
            ));
        }

        let filter = self.filter.clone();
        let handler = Arc::clone(&self.handler);
        let watched = roots.clone();
        let mut coalescer = Coalescer::new(COALESCE_WINDOW);
        let (rearm_tx, rearm_rx) = mpsc::channel::<PathBuf>();

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let kind = ChangeKind::from_notify(&event.kind);
                    for path in event.paths.iter().filter(|p| watched.contains(*p)) {
                        match kind {
                            ChangeKind::Created | ChangeKind::Renamed if path.is_dir() => {
                                let _ = rearm_tx.send(path.clone());
                            }
                            ChangeKind::Removed => tracing::info!(
                                path = %path.display(),
                                "watch root removed; waiting for it to reappear"
                            ),
                            _ => {}
                        }
                    }
                    if !kind.is_activity() {
                        return;
                    }
                    let now = Instant::now();
                    for path in event.paths {
                        if path.is_dir()
                            || !filter.accepts(&path)
                            || !watched.iter().any(|r| path.starts_with(r))
                        {
                            continue;
                        }
                        if coalescer.admit(&path, now) {
                            handler(path, kind);
                        }
                    }
                }
                Err(e) => tracing::debug!(error = %e, "file event stream error ignored"),
            },
            NotifyConfig::default(),
        )?;
        let watcher = Arc::new(Mutex::new(watcher));

        {
            let mut w = watcher.lock();
            for root in &roots {
                if let Some(parent) = root.parent().filter(|p| p.is_dir()) {
                    if let Err(e) = w.watch(parent, RecursiveMode::NonRecursive) {
                        tracing::debug!(
                            path = %parent.display(),
                            error = %e,
                            "cannot watch root parent"
                        );
                    }
                }
                if root.is_dir() {
                    w.watch(root, RecursiveMode::Recursive)?;
                    tracing::info!(path = %root.display(), "watching for file events");
                }
            }
        }

        spawn_rearm(Arc::downgrade(&watcher), rearm_rx)?;
        self.watcher = Some(watcher);
        Ok(())
    }

    /// Releases the OS subscription. Idempotent.
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            tracing::debug!(roots = ?self.roots, "file event stream stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }
}

/// Re-subscribes roots as they reappear. Runs off the watcher's own thread,
/// which must stay free to acknowledge the new subscription. Exits once the
/// watcher (and with it the sending half held by its callback) is dropped.
fn spawn_rearm(
    watcher: Weak<Mutex<RecommendedWatcher>>,
    rx: mpsc::Receiver<PathBuf>,
) -> Result<(), SourceError> {
    std::thread::Builder::new()
        .name("ccmon-rearm".to_string())
        .spawn(move || {
            while let Ok(root) = rx.recv() {
                let Some(watcher) = watcher.upgrade() else {
                    break;
                };
                let mut w = watcher.lock();
                let _ = w.unwatch(&root);
                match w.watch(&root, RecursiveMode::Recursive) {
                    Ok(()) => {
                        tracing::info!(path = %root.display(), "watch root reappeared; re-armed")
                    }
                    Err(e) => tracing::warn!(
                        path = %root.display(),
                        error = %e,
                        "failed to re-arm watch root"
                    ),
                }
            }
        })
        .map_err(SourceError::Thread)?;
    Ok(())
}

/// Suppresses repeated events for the same path within `window`.
#[derive(Debug)]
struct Coalescer {
    window: Duration,
    last_seen: HashMap<PathBuf, Instant>,
}

impl Coalescer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    /// Returns `true` if an event for `path` at `now` should be reported.
    fn admit(&mut self, path: &Path, now: Instant) -> bool {
        if let Some(seen) = self.last_seen.get(path) {
            if now.saturating_duration_since(*seen) < self.window {
                return false;
            }
        }

        if self.last_seen.len() >= COALESCE_PRUNE_THRESHOLD {
            let window = self.window;
            self.last_seen
                .retain(|_, seen| now.saturating_duration_since(*seen) < window);
        }

        self.last_seen.insert(path.to_path_buf(), now);
        true
    }
}
