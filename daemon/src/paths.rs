/// Canonical file paths for ccmon data files and default watch roots.
///
/// Both data files live under `<config dir>/ccmon/`
/// (`~/Library/Application Support/ccmon` on macOS):
///   - config.toml  Written by the user or the menu-bar UI, read by the daemon.
///   - status.toml  Written by the daemon, read by the menu-bar UI.
use anyhow::{Context, Result};
use directories::BaseDirs;
use std::path::PathBuf;

use crate::source::SourceId;

const APP_DIR_NAME: &str = "ccmon";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Returns the ccmon application data directory.
pub fn app_data_dir() -> Result<PathBuf> {
    let dirs = BaseDirs::new().context("could not determine the user's home directory")?;
    Ok(dirs.config_dir().join(APP_DIR_NAME))
}

pub fn config_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(CONFIG_FILE_NAME))
}

pub fn status_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(STATUS_FILE_NAME))
}

fn home_dir() -> PathBuf {
    BaseDirs::new().map_or_else(|| PathBuf::from("/"), |d| d.home_dir().to_path_buf())
}

/// Expands a leading `~` to the home directory. Other paths pass through.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return home_dir();
    }
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(path),
    }
}

/// Where each assistant keeps its session logs by default.
pub fn default_source_root(id: SourceId) -> PathBuf {
    let home = home_dir();
    match id {
        SourceId::Claude => home.join(".claude").join("projects"),
        SourceId::Codex => home.join(".codex").join("sessions"),
        SourceId::Gemini => home.join(".gemini").join("tmp"),
        SourceId::Process => home,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_ends_with_ccmon() {
        let dir = app_data_dir().unwrap();
        assert_eq!(dir.file_name().unwrap(), APP_DIR_NAME);
    }

    #[test]
    fn config_and_status_share_same_parent_dir() {
        let config = config_file_path().unwrap();
        let status = status_file_path().unwrap();
        assert_eq!(config.file_name().unwrap(), CONFIG_FILE_NAME);
        assert_eq!(status.file_name().unwrap(), STATUS_FILE_NAME);
        assert_eq!(config.parent(), status.parent());
    }

    #[test]
    fn expand_home_handles_tilde_prefix_only() {
        let home = home_dir();
        assert_eq!(expand_home("~"), home);
        assert_eq!(expand_home("~/logs/a"), home.join("logs/a"));
        assert_eq!(expand_home("/abs/~/x"), PathBuf::from("/abs/~/x"));
        assert_eq!(expand_home("~other/x"), PathBuf::from("~other/x"));
    }

    #[test]
    fn default_roots_live_under_home() {
        let home = home_dir();
        for id in SourceId::DIRECTORIES {
            assert!(default_source_root(id).starts_with(&home));
        }
        assert!(default_source_root(SourceId::Claude).ends_with(".claude/projects"));
    }
}
