use clap::Parser;
use std::path::PathBuf;

/// Plays a short burst of beeps whenever an AI coding assistant is busy
#[derive(Parser, Debug)]
#[command(name = "ccmon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: <config dir>/ccmon/config.toml)
    #[arg(short, long, env = "CCMON_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Shorthand for --log-level debug
    #[arg(short, long, default_value_t = false)]
    pub debug: bool,

    /// Never make a sound, regardless of the configured output
    #[arg(long, default_value_t = false)]
    pub no_sound: bool,
}

impl Cli {
    /// Filter directive for `tracing_subscriber::EnvFilter`.
    pub fn log_filter(&self) -> String {
        let level = if self.debug { "debug" } else { &self.log_level };
        format!("ccmon={level}")
    }
}
