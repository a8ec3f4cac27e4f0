//! CLI argument definitions for flowgate-daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Flowgate traffic filtering daemon.
///
/// Accepts newline-delimited JSON traffic events over TCP, evaluates them
/// against the active rule snapshot and writes every verdict to the audit log.
#[derive(Parser, Debug)]
#[command(name = "flowgate-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to flowgate.toml configuration file.
    #[arg(short, long, default_value = "/etc/flowgate/flowgate.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Override the rule directory.
    #[arg(long)]
    pub rule_dir: Option<String>,

    /// Validate configuration and rule files, then exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,

    /// Write the daemon PID to this file while running.
    #[arg(long)]
    pub pid_file: Option<PathBuf>,
}
