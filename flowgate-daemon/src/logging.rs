//! Tracing setup for flowgate-daemon.
//!
//! The base `log_level` applies to every target. Verdict logs
//! (`flowgate::verdict`) and audit logs (`flowgate::audit`) carry their own
//! levels in `[general]`, so per-event output can be raised or silenced
//! without touching the rest of the daemon. When `RUST_LOG` is set it
//! replaces the whole filter.

use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use flowgate_core::config::GeneralConfig;
use flowgate_engine::{AUDIT_LOG_TARGET, VERDICT_LOG_TARGET};

/// Output format for the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line with event fields flattened to the top level.
    Json,
    /// Multi-line human-readable output.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(anyhow!(
                "unknown log format '{other}', expected 'json' or 'pretty'"
            )),
        }
    }
}

/// Filter directives derived from `[general]`.
pub fn filter_directives(config: &GeneralConfig) -> String {
    format!(
        "{},{VERDICT_LOG_TARGET}={},{AUDIT_LOG_TARGET}={}",
        config.log_level, config.verdict_log_level, config.audit_log_level
    )
}

fn build_filter(config: &GeneralConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = filter_directives(config);
    EnvFilter::try_new(&directives).with_context(|| format!("invalid log filter '{directives}'"))
}

/// Install the global tracing subscriber.
///
/// Call once, before the first event is logged.
pub fn init_tracing(config: &GeneralConfig) -> Result<()> {
    let format: LogFormat = config.log_format.parse()?;
    let filter = build_filter(config)?;

    let fmt_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().pretty().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize {format:?} tracing subscriber: {e}"))
}
