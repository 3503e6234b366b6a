use std::path::PathBuf;
use thiserror::Error;

/// Reasons a change source could not start. None of these are fatal to the
/// daemon: the affected source stays inert and the others keep running.
#[derive(Error, Debug)]
pub enum SourceError {
    /// None of the configured roots exist.
    #[error("watched directory does not exist: {}", .0.display())]
    RootMissing(PathBuf),

    /// The OS file-event facility refused the subscription.
    #[error("failed to watch directory: {0}")]
    Watch(#[from] notify::Error),

    /// A helper thread could not be spawned.
    #[error("failed to spawn source thread: {0}")]
    Thread(std::io::Error),

    /// The source needs a tokio runtime and was started outside one.
    #[error("no tokio runtime available to drive the source")]
    NoRuntime,
}
