/// Shared vocabulary for change sources: which source a signal belongs to,
/// what kind of change it was, and the extension filter both directory
/// sources apply.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// One monitored activity source. Each id owns exactly one throttle entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    /// Claude Code session logs.
    Claude,
    /// Codex CLI session logs.
    Codex,
    /// Gemini CLI session logs.
    Gemini,
    /// The external process activity probe.
    Process,
}

impl SourceId {
    /// The three log-directory sources, in startup order.
    pub const DIRECTORIES: [SourceId; 3] = [SourceId::Claude, SourceId::Codex, SourceId::Gemini];

    pub const ALL: [SourceId; 4] = [
        SourceId::Claude,
        SourceId::Codex,
        SourceId::Gemini,
        SourceId::Process,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceId::Claude => "claude",
            SourceId::Codex => "codex",
            SourceId::Gemini => "gemini",
            SourceId::Process => "process",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized change flag reported by a change source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Renamed,
    Removed,
    Other,
}

impl ChangeKind {
    /// Maps a raw `notify` event kind onto the flags the daemon cares about.
    pub fn from_notify(kind: &notify::EventKind) -> Self {
        use notify::event::ModifyKind;
        match kind {
            notify::EventKind::Create(_) => ChangeKind::Created,
            notify::EventKind::Modify(ModifyKind::Name(_)) => ChangeKind::Renamed,
            notify::EventKind::Modify(_) => ChangeKind::Modified,
            notify::EventKind::Remove(_) => ChangeKind::Removed,
            _ => ChangeKind::Other,
        }
    }

    /// Whether this change counts as assistant activity.
    pub fn is_activity(self) -> bool {
        matches!(
            self,
            ChangeKind::Created | ChangeKind::Modified | ChangeKind::Renamed
        )
    }
}

/// A single "something changed" observation, posted to the event loop.
#[derive(Debug, Clone)]
pub struct ChangeSignal {
    pub source: SourceId,
    /// File that changed. `None` for the process probe.
    pub path: Option<PathBuf>,
    pub kind: ChangeKind,
    pub at: Instant,
}

impl ChangeSignal {
    pub fn new(source: SourceId, path: Option<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            source,
            path,
            kind,
            at: Instant::now(),
        }
    }
}

/// Callback invoked by a change source for every reported path.
pub type ChangeHandler = std::sync::Arc<dyn Fn(PathBuf, ChangeKind) + Send + Sync>;

/// Case-insensitive file extension filter. An empty filter accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionFilter {
    extensions: Vec<String>,
}

impl ExtensionFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { extensions }
    }

    pub fn accepts(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        match path.extension() {
            Some(ext) => {
                let ext = ext.to_string_lossy().to_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            }
            None => false,
        }
    }
}
