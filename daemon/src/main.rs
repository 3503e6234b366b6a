mod cli;
mod config;
mod error;
mod event;
mod fs_events;
mod paths;
mod poll;
mod process_monitor;
mod sink;
mod source;
mod status;
mod throttle;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::Cli;
use crate::config::{Config, ResolvedSource, WatchKind};
use crate::error::SourceError;
use crate::event::DaemonEvent;
use crate::fs_events::EventStreamSource;
use crate::poll::PollSource;
use crate::process_monitor::{ProcessMatcher, ProcessProbe};
use crate::sink::{BeepSink, NotificationSink, OutputKind};
use crate::source::{ChangeHandler, ChangeSignal, SourceId};
use crate::throttle::{ActivityThrottle, Decision, TokioScheduler};

/// A running directory watcher of either kind.
enum DirectorySource {
    Events(EventStreamSource),
    Poll(PollSource),
}

impl DirectorySource {
    fn build(resolved: &ResolvedSource, handler: ChangeHandler) -> Self {
        match resolved.kind {
            WatchKind::Events => DirectorySource::Events(EventStreamSource::new(
                vec![resolved.root.clone()],
                resolved.filter.clone(),
                handler,
            )),
            WatchKind::Poll => DirectorySource::Poll(PollSource::new(
                resolved.root.clone(),
                resolved.poll_interval,
                resolved.filter.clone(),
                handler,
            )),
        }
    }

    fn start(&mut self) -> Result<(), SourceError> {
        match self {
            DirectorySource::Events(s) => s.start(),
            DirectorySource::Poll(s) => s.start(),
        }
    }

    fn stop(&mut self) {
        match self {
            DirectorySource::Events(s) => s.stop(),
            DirectorySource::Poll(s) => s.stop(),
        }
    }

    fn is_running(&self) -> bool {
        match self {
            DirectorySource::Events(s) => s.is_running(),
            DirectorySource::Poll(s) => s.is_running(),
        }
    }
}

/// Forwards every reported path to the event loop as an activity signal.
/// Sources call this from their own threads, never from async context.
fn activity_handler(id: SourceId, tx: mpsc::Sender<DaemonEvent>) -> ChangeHandler {
    Arc::new(move |path: PathBuf, kind| {
        tracing::trace!(source = %id, path = %path.display(), ?kind, "change");
        let signal = ChangeSignal::new(id, Some(path), kind);
        if tx.blocking_send(DaemonEvent::Activity(signal)).is_err() {
            tracing::trace!(source = %id, "event loop gone; change dropped");
        }
    })
}

/// Converts a monotonic instant into a local wall-clock RFC 3339 timestamp.
fn wall_clock(at: Instant) -> String {
    let ago = chrono::Duration::from_std(Instant::now().saturating_duration_since(at))
        .unwrap_or_else(|_| chrono::Duration::zero());
    (chrono::Local::now() - ago).to_rfc3339()
}

fn output_kind(config: &Config, no_sound: bool) -> OutputKind {
    if no_sound {
        OutputKind::Silent
    } else {
        config.global.output
    }
}

fn resolve_sources(config: &Config) -> Vec<ResolvedSource> {
    SourceId::DIRECTORIES
        .iter()
        .filter_map(|id| config.sources.get(*id).map(|s| s.resolve(*id)))
        .collect()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // ── Logging ───────────────────────────────────────────────────────────────
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = match cli.config.clone().map_or_else(paths::config_file_path, Ok) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "cannot locate config file");
            std::process::exit(1);
        }
    };
    if let Some(dir) = config_path.parent() {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(path = %dir.display(), error = %e, "failed to create config directory");
        }
    }
    let mut active_config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "config error; using defaults");
        Config::default()
    });

    let status_path = match paths::status_file_path() {
        Ok(p) => Some(p),
        Err(e) => {
            tracing::warn!(error = %e, "status file disabled");
            None
        }
    };
    let mut current_status = status::DaemonStatus::new();
    let write_status = |s: &status::DaemonStatus| {
        if let Some(path) = &status_path {
            status::write_status(path, s);
        }
    };

    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(256);

    // ── Notification sink + throttle ──────────────────────────────────────────
    let sink = Arc::new(BeepSink::new(
        output_kind(&active_config, cli.no_sound).build(),
        tokio::runtime::Handle::current(),
    ));
    let mut throttle = ActivityThrottle::new(TokioScheduler::new(event_tx.clone()), sink.clone());
    throttle.set_enabled(active_config.global.notifications_enabled);
    if !throttle.is_enabled() {
        current_status.state = status::DaemonState::Disabled;
    }

    // ── Change sources ────────────────────────────────────────────────────────
    let mut directory_sources = Vec::new();
    for resolved in resolve_sources(&active_config) {
        if !resolved.enabled {
            tracing::info!(source = %resolved.id, "source disabled in config");
            continue;
        }
        let mut source =
            DirectorySource::build(&resolved, activity_handler(resolved.id, event_tx.clone()));
        match source.start() {
            Ok(()) => {
                current_status.source_mut(resolved.id).running = true;
                directory_sources.push(source);
            }
            Err(e) => tracing::warn!(source = %resolved.id, error = %e, "source not started"),
        }
    }

    let (probe_stop_tx, probe_stop_rx) = watch::channel(false);
    if active_config.process.enabled {
        let process = &active_config.process;
        let probe = ProcessProbe::new(
            ProcessMatcher::new(&process.pattern, &process.exclude),
            process.cpu_threshold,
        );
        tokio::spawn(process_monitor::run(
            probe,
            process.effective_interval(),
            event_tx.clone(),
            probe_stop_rx,
        ));
        current_status.source_mut(SourceId::Process).running = true;
    }

    if directory_sources.is_empty() && !active_config.process.enabled {
        current_status.error = Some("no change source is running".to_string());
    }

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(forward_playback(sink.subscribe(), event_tx.clone()));
    tokio::spawn(config::watch_config(config_path, event_tx.clone()));

    // Graceful shutdown on Ctrl+C or SIGTERM.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = tx.send(DaemonEvent::Shutdown).await;
        });
    }
    drop(event_tx);

    write_status(&current_status);
    tracing::info!("ccmon v{} started", env!("CARGO_PKG_VERSION"));

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        match evt {
            DaemonEvent::Activity(signal) => {
                let decision = throttle.signal(signal.source, signal.at);
                tracing::trace!(source = %signal.source, kind = ?signal.kind, ?decision, "signal");
                let entry = current_status.source_mut(signal.source);
                if let Some(path) = &signal.path {
                    entry.last_path = Some(path.display().to_string());
                }
                entry.deferred = throttle.is_deferred(signal.source);
                match decision {
                    Decision::Fired => {
                        entry.last_fired = throttle.last_fired(signal.source).map(wall_clock);
                        write_status(&current_status);
                    }
                    Decision::Deferred(_) => write_status(&current_status),
                    _ => {}
                }
            }

            DaemonEvent::DeferredElapsed(fire) => {
                let fired = throttle.deferred_elapsed(fire, Instant::now());
                let entry = current_status.source_mut(fire.source);
                entry.deferred = throttle.is_deferred(fire.source);
                if fired {
                    entry.last_fired = throttle.last_fired(fire.source).map(wall_clock);
                }
                write_status(&current_status);
            }

            DaemonEvent::PlaybackChanged(playing) => {
                tracing::debug!(playing, "playback changed");
                current_status.playing = playing;
                write_status(&current_status);
            }

            DaemonEvent::ConfigReloaded(new_config) => {
                tracing::info!("config reloaded");
                let enabled = new_config.global.notifications_enabled;
                throttle.set_enabled(enabled);
                if !enabled {
                    sink.stop();
                }
                sink.set_output(output_kind(&new_config, cli.no_sound).build());

                if resolve_sources(&new_config) != resolve_sources(&active_config)
                    || new_config.process != active_config.process
                {
                    tracing::warn!("source settings changed; restart ccmon to apply them");
                }

                current_status.state = if enabled {
                    status::DaemonState::Watching
                } else {
                    status::DaemonState::Disabled
                };
                for id in SourceId::ALL {
                    current_status.source_mut(id).deferred = throttle.is_deferred(id);
                }
                write_status(&current_status);
                active_config = new_config;
            }

            DaemonEvent::Shutdown => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    // ── Teardown: sources first so nothing fires into a stopped sink ──────────
    let running = directory_sources.iter().filter(|s| s.is_running()).count();
    tracing::debug!(running, "stopping directory sources");
    for source in &mut directory_sources {
        source.stop();
    }
    let _ = probe_stop_tx.send(true);
    throttle.cancel_all();
    sink.stop();

    current_status.playing = false;
    for entry in current_status.sources.values_mut() {
        entry.running = false;
        entry.deferred = false;
    }
    write_status(&current_status);
}

/// Relays the sink's playing flag into the event loop so the status file
/// follows every sequence start and end.
async fn forward_playback(mut playing: watch::Receiver<bool>, tx: mpsc::Sender<DaemonEvent>) {
    while playing.changed().await.is_ok() {
        let now = *playing.borrow_and_update();
        if tx.send(DaemonEvent::PlaybackChanged(now)).await.is_err() {
            break;
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn playback(evt: Option<DaemonEvent>) -> bool {
        match evt {
            Some(DaemonEvent::PlaybackChanged(playing)) => playing,
            _ => panic!("expected a playback event"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn playback_changes_reach_the_event_loop() {
        let sink = Arc::new(BeepSink::new(
            OutputKind::Silent.build(),
            tokio::runtime::Handle::current(),
        ));
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(forward_playback(sink.subscribe(), tx));

        let mut status = status::DaemonStatus::new();

        sink.fire();
        status.playing = playback(rx.recv().await);
        assert!(status.playing);

        tokio::time::sleep(sink::SEQUENCE_LENGTH + Duration::from_millis(100)).await;
        status.playing = playback(rx.recv().await);
        assert!(!status.playing);

        sink.fire();
        assert!(playback(rx.recv().await));
        sink.stop();
        assert!(!playback(rx.recv().await));
    }
}
