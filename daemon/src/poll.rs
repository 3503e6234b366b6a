/// Fixed-interval polling change source.
///
/// On every tick the whole tree under `root` is rescanned into a fresh
/// [`Snapshot`] of `path -> (mtime, size)`. Paths that are new, or whose
/// signature differs from the previous snapshot, are reported once the scan
/// has finished. Deleted files are not reported.
///
/// Used for log directories where file-event delivery is unreliable (files
/// appended to through long-lived handles, network volumes).
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use walkdir::WalkDir;

use crate::error::SourceError;
use crate::source::{ChangeHandler, ChangeKind, ExtensionFilter};

/// What the poll source remembers about a file between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub modified: Option<SystemTime>,
    pub size: u64,
}

/// Every accepted file under a root at one point in time.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: HashMap<PathBuf, Signature>,
}

impl Snapshot {
    /// Recursively scans `root`. Entries that cannot be read are skipped.
    /// A missing root yields an empty snapshot.
    pub fn scan(root: &Path, filter: &ExtensionFilter) -> Self {
        let files = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) if !e.file_type().is_file() || !filter.accepts(e.path()) => None,
                Ok(e) => Some(match e.metadata() {
                    Ok(meta) => Ok((
                        e.into_path(),
                        Signature {
                            modified: meta.modified().ok(),
                            size: meta.len(),
                        },
                    )),
                    Err(err) => Err(err),
                }),
                Err(err) => Some(Err(err)),
            });
        Self::collect(root, files)
    }

    /// Folds scan results into a snapshot, skipping failed entries.
    fn collect<I, E>(root: &Path, files: I) -> Self
    where
        I: IntoIterator<Item = Result<(PathBuf, Signature), E>>,
        E: fmt::Display,
    {
        let mut entries = HashMap::new();
        let mut skipped = 0usize;
        for file in files {
            match file {
                Ok((path, sig)) => {
                    entries.insert(path, sig);
                }
                Err(e) => {
                    skipped += 1;
                    tracing::trace!(error = %e, "scan entry skipped");
                }
            }
        }
        if skipped > 0 {
            tracing::trace!(root = %root.display(), skipped, "scan finished with skipped entries");
        }
        Self { entries }
    }

    /// Paths in `self` that are absent from, or differ from, `previous`.
    /// Sorted by path so a tick's report is deterministic.
    pub fn changed_since(&self, previous: &Snapshot) -> Vec<(PathBuf, ChangeKind)> {
        let mut changed: Vec<(PathBuf, ChangeKind)> = self
            .entries
            .iter()
            .filter_map(|(path, sig)| match previous.entries.get(path) {
                None => Some((path.clone(), ChangeKind::Created)),
                Some(old) if old != sig => Some((path.clone(), ChangeKind::Modified)),
                Some(_) => None,
            })
            .collect();
        changed.sort_by(|a, b| a.0.cmp(&b.0));
        changed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct PollSource {
    root: PathBuf,
    interval: Duration,
    filter: ExtensionFilter,
    handler: ChangeHandler,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl PollSource {
    pub fn new(
        root: PathBuf,
        interval: Duration,
        filter: ExtensionFilter,
        handler: ChangeHandler,
    ) -> Self {
        Self {
            root,
            interval,
            filter,
            handler,
            stop_tx: None,
            task: None,
        }
    }

    /// Takes the priming snapshot (not reported) and spawns the tick loop on
    /// the current tokio runtime.
    pub fn start(&mut self) -> Result<(), SourceError> {
        if self.is_running() {
            return Ok(());
        }
        if !self.root.is_dir() {
            return Err(SourceError::RootMissing(self.root.clone()));
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SourceError::NoRuntime)?;

        let primed = Snapshot::scan(&self.root, &self.filter);
        tracing::info!(
            path = %self.root.display(),
            files = primed.len(),
            interval_ms = self.interval.as_millis() as u64,
            "polling for changes"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        self.task = Some(runtime.spawn(run(
            self.root.clone(),
            self.interval,
            self.filter.clone(),
            self.handler.clone(),
            primed,
            stop_rx,
        )));
        self.stop_tx = Some(stop_tx);
        Ok(())
    }

    /// Signals the tick loop to exit. A scan already in flight finishes on
    /// the blocking pool. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(true);
            tracing::debug!(path = %self.root.display(), "poll source stopped");
        }
        self.task = None;
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.is_some()
    }
}

async fn run(
    root: PathBuf,
    period: Duration,
    filter: ExtensionFilter,
    handler: ChangeHandler,
    mut snapshot: Snapshot,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the priming scan already covered it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => break,
        }

        let previous = snapshot.clone();
        let (root_c, filter_c, handler_c) = (root.clone(), filter.clone(), handler.clone());
        let scanned = tokio::task::spawn_blocking(move || {
            let next = Snapshot::scan(&root_c, &filter_c);
            for (path, kind) in next.changed_since(&previous) {
                handler_c(path, kind);
            }
            next
        })
        .await;

        match scanned {
            Ok(next) => snapshot = next,
            Err(e) => tracing::warn!(path = %root.display(), error = %e, "poll scan aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn collecting_handler() -> (ChangeHandler, Arc<Mutex<Vec<(PathBuf, ChangeKind)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: ChangeHandler = Arc::new(move |path, kind| sink.lock().push((path, kind)));
        (handler, seen)
    }

    // ── Snapshot::scan ────────────────────────────────────────────────────────

    #[test]
    fn scan_recurses_and_applies_extension_filter() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a.jsonl"), "1");
        write(&dir.path().join("nested/deeper/b.jsonl"), "22");
        write(&dir.path().join("notes.txt"), "x");
        std::fs::create_dir_all(dir.path().join("empty.jsonl.d")).unwrap();

        let snap = Snapshot::scan(dir.path(), &ExtensionFilter::new(["jsonl"]));
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.entries.get(&dir.path().join("a.jsonl")).unwrap().size, 1);
        assert_eq!(
            snap.entries.get(&dir.path().join("nested/deeper/b.jsonl")).unwrap().size,
            2
        );
    }

    #[test]
    fn scan_with_empty_filter_accepts_all_files_but_no_directories() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a.jsonl"), "1");
        write(&dir.path().join("b.txt"), "1");
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();

        let snap = Snapshot::scan(dir.path(), &ExtensionFilter::default());
        assert_eq!(snap.len(), 2);
        assert!(snap.entries.get(&dir.path().join("sub")).is_none());
    }

    #[test]
    fn failed_entries_are_skipped_without_aborting_the_scan() {
        let sig = |size| Signature {
            modified: None,
            size,
        };
        let files = vec![
            Ok((PathBuf::from("/r/a.jsonl"), sig(1))),
            Err("permission denied: /r/locked"),
            Ok((PathBuf::from("/r/b.jsonl"), sig(2))),
            Err("stat failed: /r/gone.jsonl"),
            Ok((PathBuf::from("/r/c.jsonl"), sig(3))),
        ];

        let snap = Snapshot::collect(Path::new("/r"), files);
        assert_eq!(snap.len(), 3);
        assert_eq!(snap.entries[Path::new("/r/b.jsonl")].size, 2);
        assert_eq!(snap.entries[Path::new("/r/c.jsonl")].size, 3);
    }

    #[cfg(unix)]
    #[test]
    fn scan_skips_unreadable_entries_and_keeps_the_rest() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a.jsonl"), "1");
        write(&dir.path().join("ok/b.jsonl"), "1");
        write(&dir.path().join("locked/hidden.jsonl"), "1");
        write(&dir.path().join("z.jsonl"), "1");

        let locked = dir.path().join("locked");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        // Permission bits do not bind root; nothing to exercise then.
        if std::fs::read_dir(&locked).is_ok() {
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let snap = Snapshot::scan(dir.path(), &ExtensionFilter::new(["jsonl"]));
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(snap.len(), 3);
        assert!(snap.entries.contains_key(&dir.path().join("a.jsonl")));
        assert!(snap.entries.contains_key(&dir.path().join("ok/b.jsonl")));
        assert!(snap.entries.contains_key(&dir.path().join("z.jsonl")));
        assert!(!snap.entries.contains_key(&dir.path().join("locked/hidden.jsonl")));
    }

    #[test]
    fn scan_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snap = Snapshot::scan(&dir.path().join("gone"), &ExtensionFilter::default());
        assert_eq!(snap.len(), 0);
    }

    // ── Snapshot::changed_since ───────────────────────────────────────────────

    #[test]
    fn mtime_change_is_reported_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.json");
        write(&file, "{}");
        set_file_mtime(&file, FileTime::from_unix_time(100, 0)).unwrap();
        let filter = ExtensionFilter::new(["json"]);
        let first = Snapshot::scan(dir.path(), &filter);

        set_file_mtime(&file, FileTime::from_unix_time(150, 0)).unwrap();
        let second = Snapshot::scan(dir.path(), &filter);
        assert_eq!(
            second.changed_since(&first),
            vec![(file.clone(), ChangeKind::Modified)]
        );

        let third = Snapshot::scan(dir.path(), &filter);
        assert!(third.changed_since(&second).is_empty());
    }

    #[test]
    fn size_change_with_same_mtime_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("log.jsonl");
        write(&file, "a");
        set_file_mtime(&file, FileTime::from_unix_time(100, 0)).unwrap();
        let first = Snapshot::scan(dir.path(), &ExtensionFilter::default());

        write(&file, "abc");
        set_file_mtime(&file, FileTime::from_unix_time(100, 0)).unwrap();
        let second = Snapshot::scan(dir.path(), &ExtensionFilter::default());
        assert_eq!(
            second.changed_since(&first),
            vec![(file, ChangeKind::Modified)]
        );
    }

    #[test]
    fn new_files_are_created_and_deletions_are_silent() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("old.jsonl"), "1");
        let first = Snapshot::scan(dir.path(), &ExtensionFilter::default());

        std::fs::remove_file(dir.path().join("old.jsonl")).unwrap();
        write(&dir.path().join("b.jsonl"), "1");
        write(&dir.path().join("a.jsonl"), "1");
        let second = Snapshot::scan(dir.path(), &ExtensionFilter::default());

        assert_eq!(
            second.changed_since(&first),
            vec![
                (dir.path().join("a.jsonl"), ChangeKind::Created),
                (dir.path().join("b.jsonl"), ChangeKind::Created),
            ]
        );
        // The deleted file is gone from the new snapshot entirely.
        assert!(second.entries.get(&dir.path().join("old.jsonl")).is_none());
    }

    // ── PollSource ────────────────────────────────────────────────────────────

    #[test]
    fn start_outside_runtime_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = collecting_handler();
        let mut source = PollSource::new(
            dir.path().to_path_buf(),
            Duration::from_millis(50),
            ExtensionFilter::default(),
            handler,
        );
        assert!(matches!(source.start(), Err(SourceError::NoRuntime)));
    }

    #[tokio::test]
    async fn start_fails_for_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = collecting_handler();
        let mut source = PollSource::new(
            dir.path().join("missing"),
            Duration::from_millis(50),
            ExtensionFilter::default(),
            handler,
        );
        assert!(matches!(source.start(), Err(SourceError::RootMissing(_))));
        assert!(!source.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reports_new_files_but_not_primed_ones() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("existing.jsonl"), "1");

        let (handler, seen) = collecting_handler();
        let mut source = PollSource::new(
            dir.path().to_path_buf(),
            Duration::from_millis(50),
            ExtensionFilter::new(["jsonl"]),
            handler,
        );
        source.start().unwrap();
        assert!(source.is_running());

        write(&dir.path().join("fresh.jsonl"), "1");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while seen.lock().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        source.stop();
        source.stop();
        assert!(!source.is_running());

        // A scan can land between create and write, so a follow-up Modified
        // for the same file is allowed.
        let seen = seen.lock();
        let fresh = dir.path().join("fresh.jsonl");
        assert_eq!(seen.first(), Some(&(fresh.clone(), ChangeKind::Created)));
        assert!(seen.iter().all(|(p, _)| *p == fresh));
    }
}
