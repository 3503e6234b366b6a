use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::event::DaemonEvent;
use crate::paths;
use crate::sink::OutputKind;
use crate::source::{ExtensionFilter, SourceId};

pub const MIN_POLL_INTERVAL_MS: u64 = 100;
pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const MIN_PROCESS_INTERVAL_SECS: u64 = 1;
pub const MAX_PROCESS_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_PROCESS_INTERVAL_SECS: u64 = 3;
pub const DEFAULT_PROCESS_PATTERN: &str = "claude";
pub const DEFAULT_CPU_THRESHOLD: f32 = 1.0;

/// Root configuration structure. Deserialized from `<config dir>/ccmon/config.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub process: ProcessConfig,
}

#[derive(Debug, Deserialize)]
pub struct GlobalConfig {
    /// Master switch. Disabling cancels pending deferred notifications.
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    #[serde(default)]
    pub output: OutputKind,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            notifications_enabled: true,
            output: OutputKind::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchKind {
    /// OS file-event stream.
    Events,
    /// Periodic full rescan.
    Poll,
}

/// Per-directory-source overrides. Anything left unset falls back to the
/// built-in default for that source id.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct SourceConfig {
    pub enabled: Option<bool>,
    pub kind: Option<WatchKind>,
    /// Root directory. A leading `~` expands to the home directory.
    pub path: Option<String>,
    pub extensions: Option<Vec<String>>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub claude: SourceConfig,
    #[serde(default)]
    pub codex: SourceConfig,
    #[serde(default)]
    pub gemini: SourceConfig,
}

impl SourcesConfig {
    /// `None` for [`SourceId::Process`], which has no directory.
    pub fn get(&self, id: SourceId) -> Option<&SourceConfig> {
        match id {
            SourceId::Claude => Some(&self.claude),
            SourceId::Codex => Some(&self.codex),
            SourceId::Gemini => Some(&self.gemini),
            SourceId::Process => None,
        }
    }
}

/// A directory source with every default filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    pub id: SourceId,
    pub enabled: bool,
    pub kind: WatchKind,
    pub root: PathBuf,
    pub filter: ExtensionFilter,
    pub poll_interval: Duration,
}

impl SourceConfig {
    pub fn effective_kind(&self, id: SourceId) -> WatchKind {
        self.kind.unwrap_or(match id {
            SourceId::Claude => WatchKind::Events,
            _ => WatchKind::Poll,
        })
    }

    pub fn effective_path(&self, id: SourceId) -> PathBuf {
        match &self.path {
            Some(p) => paths::expand_home(p),
            None => paths::default_source_root(id),
        }
    }

    pub fn effective_extensions(&self, id: SourceId) -> Vec<String> {
        match &self.extensions {
            Some(exts) => exts.clone(),
            None => match id {
                SourceId::Gemini => vec!["json".to_string()],
                _ => vec!["jsonl".to_string()],
            },
        }
    }

    /// Poll interval clamped to [`MIN_POLL_INTERVAL_MS`, `MAX_POLL_INTERVAL_MS`].
    pub fn effective_poll_interval(&self) -> Duration {
        let ms = self
            .poll_interval_ms
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
            .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS);
        Duration::from_millis(ms)
    }

    pub fn resolve(&self, id: SourceId) -> ResolvedSource {
        ResolvedSource {
            id,
            enabled: self.enabled.unwrap_or(true),
            kind: self.effective_kind(id),
            root: self.effective_path(id),
            filter: ExtensionFilter::new(self.effective_extensions(id)),
            poll_interval: self.effective_poll_interval(),
        }
    }
}

/// Settings for the process activity probe.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProcessConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Substring a process name must contain (case-insensitive).
    #[serde(default = "default_process_pattern")]
    pub pattern: String,
    /// Substrings that disqualify a process by name or executable path.
    #[serde(default = "default_process_exclude")]
    pub exclude: Vec<String>,
    #[serde(default = "default_process_interval")]
    pub poll_interval_secs: u64,
    /// CPU percentage above which a matching process counts as busy.
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f32,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pattern: default_process_pattern(),
            exclude: default_process_exclude(),
            poll_interval_secs: DEFAULT_PROCESS_INTERVAL_SECS,
            cpu_threshold: DEFAULT_CPU_THRESHOLD,
        }
    }
}

impl ProcessConfig {
    pub fn effective_interval(&self) -> Duration {
        Duration::from_secs(
            self.poll_interval_secs
                .clamp(MIN_PROCESS_INTERVAL_SECS, MAX_PROCESS_INTERVAL_SECS),
        )
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Watches the parent directory of `path`. Whenever the config file is
/// created or modified, reloads it and sends a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<DaemonEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to create config watcher");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let Some(watch_dir) = path.parent().map(Path::to_path_buf) else {
        tracing::warn!(path = %path.display(), "config path has no parent directory");
        return;
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        tracing::warn!(path = %watch_dir.display(), error = %e, "failed to watch config directory");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    if tx.send(DaemonEvent::ConfigReloaded(config)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to reload config"),
            }
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_process_pattern() -> String {
    DEFAULT_PROCESS_PATTERN.to_string()
}

fn default_process_exclude() -> Vec<String> {
    vec!["Claude.app".to_string(), "ccmon".to_string()]
}

fn default_process_interval() -> u64 {
    DEFAULT_PROCESS_INTERVAL_SECS
}

fn default_cpu_threshold() -> f32 {
    DEFAULT_CPU_THRESHOLD
}
