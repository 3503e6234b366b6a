use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::source::SourceId;

/// Current operational state of the daemon.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    /// Sources are running and notifications are enabled.
    Watching,
    /// Notifications are globally disabled; sources keep running.
    Disabled,
}

/// Per-source view for the menu-bar UI.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SourceStatus {
    /// Whether the change source started successfully.
    pub running: bool,
    /// A catch-up notification is armed for this source.
    #[serde(default)]
    pub deferred: bool,
    /// RFC 3339 timestamp of the last notification fired for this source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fired: Option<String>,
    /// Last file reported by this source, if it reports files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_path: Option<String>,
}

/// Runtime status written by the daemon to `<config dir>/ccmon/status.toml`.
/// The menu-bar UI reads this file (read-only) to display daemon state.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: DaemonState,
    /// A beep sequence is playing right now. Drives the UI's blink indicator.
    #[serde(default)]
    pub playing: bool,
    /// Human-readable error message if the daemon encountered a non-fatal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Keyed by source name (`claude`, `codex`, ...).
    #[serde(default)]
    pub sources: BTreeMap<String, SourceStatus>,
}

impl DaemonStatus {
    /// Constructs the initial status on daemon startup, one entry per source.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: DaemonState::Watching,
            playing: false,
            error: None,
            sources: SourceId::ALL
                .iter()
                .map(|id| (id.to_string(), SourceStatus::default()))
                .collect(),
        }
    }

    pub fn source_mut(&mut self, id: SourceId) -> &mut SourceStatus {
        self.sources.entry(id.to_string()).or_default()
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Failures are logged and otherwise ignored.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!(path = %parent.display(), error = %e, "failed to create status directory");
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                tracing::warn!(error = %e, "failed to write status file");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to serialize status"),
    }
}
