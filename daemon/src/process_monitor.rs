use std::path::Path;
use std::time::Duration;

use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;

use crate::event::DaemonEvent;
use crate::source::{ChangeKind, ChangeSignal, SourceId};

/// Opaque "is the external process busy right now" signal.
pub trait ActivityProbe: Send {
    fn is_active(&mut self) -> bool;
}

/// Decides which processes count as the monitored assistant.
#[derive(Debug, Clone)]
pub struct ProcessMatcher {
    pattern: String,
    exclude: Vec<String>,
}

impl ProcessMatcher {
    pub fn new(pattern: &str, exclude: &[String]) -> Self {
        Self {
            pattern: pattern.to_lowercase(),
            exclude: exclude.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    /// `name` must contain the pattern; neither `name` nor the executable
    /// path may contain an exclusion (so `/Applications/Claude.app/...`
    /// is rejected even though its name is `Claude`).
    pub fn matches(&self, name: &str, exe: Option<&Path>) -> bool {
        let name = name.to_lowercase();
        if self.pattern.is_empty() || !name.contains(&self.pattern) {
            return false;
        }
        let exe = exe
            .map(|p| p.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        !self
            .exclude
            .iter()
            .any(|ex| name.contains(ex.as_str()) || exe.contains(ex.as_str()))
    }
}

/// [`ActivityProbe`] backed by the OS process table.
///
/// A matching process is active when it used more than `cpu_threshold`
/// percent CPU, or did any disk I/O, since the previous refresh.
pub struct ProcessProbe {
    sys: System,
    matcher: ProcessMatcher,
    cpu_threshold: f32,
}

impl ProcessProbe {
    pub fn new(matcher: ProcessMatcher, cpu_threshold: f32) -> Self {
        Self {
            sys: System::new(),
            matcher,
            cpu_threshold,
        }
    }
}

impl ActivityProbe for ProcessProbe {
    fn is_active(&mut self) -> bool {
        self.sys.refresh_processes(ProcessesToUpdate::All, true);

        let matcher = &self.matcher;
        let threshold = self.cpu_threshold;
        self.sys.processes().values().any(|p| {
            if !matcher.matches(&p.name().to_string_lossy(), p.exe()) {
                return false;
            }
            let io = p.disk_usage();
            p.cpu_usage() > threshold || io.read_bytes + io.written_bytes > 0
        })
    }
}

/// Samples `probe` every `period` and posts one [`DaemonEvent::Activity`]
/// for the [`SourceId::Process`] source per active sample. Rising and falling
/// edges are logged. Exits when `stop_rx` changes or the event loop is gone.
///
/// Sampling refreshes the OS process table, so each sample runs on the
/// blocking pool.
pub async fn run<P: ActivityProbe + 'static>(
    mut probe: P,
    period: Duration,
    tx: mpsc::Sender<DaemonEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    let mut was_active = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => break,
        }

        let sampled = tokio::task::spawn_blocking(move || {
            let active = probe.is_active();
            (probe, active)
        })
        .await;
        let active = match sampled {
            Ok((returned, active)) => {
                probe = returned;
                active
            }
            Err(e) => {
                tracing::warn!(error = %e, "process probe sample failed; probe stopped");
                break;
            }
        };
        match (was_active, active) {
            (false, true) => tracing::info!("process activity detected"),
            (true, false) => tracing::info!("process activity ended"),
            _ => {}
        }
        was_active = active;

        if active {
            let signal = ChangeSignal::new(SourceId::Process, None, ChangeKind::Modified);
            if tx.send(DaemonEvent::Activity(signal)).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;

    fn matcher() -> ProcessMatcher {
        ProcessMatcher::new("claude", &["Claude.app".to_string(), "ccmon".to_string()])
    }

    struct ScriptedProbe {
        samples: VecDeque<bool>,
    }

    impl ActivityProbe for ScriptedProbe {
        fn is_active(&mut self) -> bool {
            self.samples.pop_front().unwrap_or(false)
        }
    }

    // ── ProcessMatcher ────────────────────────────────────────────────────────

    #[test]
    fn matches_cli_process_case_insensitively() {
        let m = matcher();
        assert!(m.matches("claude", Some(Path::new("/usr/local/bin/claude"))));
        assert!(m.matches("Claude-Code", None));
    }

    #[test]
    fn rejects_excluded_desktop_app_by_exe_path() {
        let m = matcher();
        let exe = PathBuf::from("/Applications/Claude.app/Contents/MacOS/Claude");
        assert!(!m.matches("Claude", Some(exe.as_path())));
    }

    #[test]
    fn rejects_self_and_unrelated_processes() {
        let m = matcher();
        assert!(!m.matches("ccmon-claude", None));
        assert!(!m.matches("node", Some(Path::new("/usr/bin/node"))));
    }

    #[test]
    fn empty_pattern_matches_nothing() {
        let m = ProcessMatcher::new("", &[]);
        assert!(!m.matches("claude", None));
    }

    // ── run ───────────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn emits_one_signal_per_active_sample() {
        let probe = ScriptedProbe {
            samples: VecDeque::from([false, true, true, false, true]),
        };
        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(probe, Duration::from_secs(3), tx, stop_rx));

        // Five ticks: t = 0, 3, 6, 9, 12.
        tokio::time::sleep(Duration::from_millis(12_500)).await;
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        let mut signals = 0;
        while let Ok(evt) = rx.try_recv() {
            match evt {
                DaemonEvent::Activity(sig) => {
                    assert_eq!(sig.source, SourceId::Process);
                    assert!(sig.path.is_none());
                    signals += 1;
                }
                _ => panic!("unexpected event"),
            }
        }
        assert_eq!(signals, 3);
    }

    struct ThreadRecordingProbe {
        threads: std::sync::Arc<parking_lot::Mutex<Vec<std::thread::ThreadId>>>,
    }

    impl ActivityProbe for ThreadRecordingProbe {
        fn is_active(&mut self) -> bool {
            self.threads.lock().push(std::thread::current().id());
            true
        }
    }

    #[tokio::test]
    async fn samples_run_off_the_event_loop_thread() {
        let threads = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let probe = ThreadRecordingProbe {
            threads: std::sync::Arc::clone(&threads),
        };
        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(probe, Duration::from_millis(10), tx, stop_rx));

        assert!(matches!(rx.recv().await, Some(DaemonEvent::Activity(_))));
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        let loop_thread = std::thread::current().id();
        let threads = threads.lock();
        assert!(!threads.is_empty());
        assert!(threads.iter().all(|t| *t != loop_thread));
    }

    #[tokio::test(start_paused = true)]
    async fn exits_when_event_loop_is_gone() {
        let probe = ScriptedProbe {
            samples: VecDeque::from([true]),
        };
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (_stop_tx, stop_rx) = watch::channel(false);
        run(probe, Duration::from_secs(1), tx, stop_rx).await;
    }
}
