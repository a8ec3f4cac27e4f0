//! Rule directory reloading.
//!
//! The rule directory is polled every `reload_interval_secs`. A new snapshot is
//! published only when the set of rule files or their size/mtime changed.
//! A directory that fails to load or validate leaves the active snapshot in
//! place; if there is no active snapshot yet, intake stays halted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowgate_core::pipeline::HealthStatus;
use flowgate_core::types::Action;
use flowgate_engine::{RuleLoader, RuleSnapshot, RuleStore};

/// `(path, length, modified)` for every rule file, in load order.
type Fingerprint = Vec<(PathBuf, u64, Option<SystemTime>)>;

/// Result of one reload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Rule files are unchanged since the last attempt.
    Unchanged,
    /// A new snapshot was published with this version.
    Published(u64),
    /// Loading or validation failed; the active snapshot was kept.
    Rejected(String),
}

#[derive(Default)]
struct ReloadState {
    fingerprint: Option<Fingerprint>,
    last_error: Option<String>,
}

/// Loads the rule directory into a [`RuleStore`] and keeps it current.
pub struct RuleReloader {
    rule_dir: PathBuf,
    default_action: Action,
    store: Arc<RuleStore>,
    state: Mutex<ReloadState>,
}

impl RuleReloader {
    pub fn new(
        rule_dir: impl Into<PathBuf>,
        default_action: Action,
        store: Arc<RuleStore>,
    ) -> Self {
        Self {
            rule_dir: rule_dir.into(),
            default_action,
            store,
            state: Mutex::new(ReloadState::default()),
        }
    }

    /// Load and publish the rule directory if it changed since the last attempt.
    ///
    /// The first call always loads.
    pub async fn reload_if_changed(&self) -> ReloadOutcome {
        let fingerprint = match self.fingerprint().await {
            Ok(fingerprint) => fingerprint,
            Err(e) => return self.reject(format!("{e:#}"), None),
        };

        if self.state.lock().fingerprint.as_ref() == Some(&fingerprint) {
            return ReloadOutcome::Unchanged;
        }

        let set = match RuleLoader::load_directory(&self.rule_dir, self.default_action).await {
            Ok(set) => set,
            Err(e) => return self.reject(e.to_string(), Some(fingerprint)),
        };

        match self.store.publish(set) {
            Ok(version) => {
                let mut state = self.state.lock();
                state.fingerprint = Some(fingerprint);
                state.last_error = None;
                ReloadOutcome::Published(version)
            }
            Err(e) => self.reject(e.to_string(), Some(fingerprint)),
        }
    }

    /// Most recent load error, cleared by the next successful publish.
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn health(&self) -> HealthStatus {
        match self.last_error() {
            Some(reason) => HealthStatus::Degraded(format!("last reload failed: {reason}")),
            None => HealthStatus::Healthy,
        }
    }

    /// Poll the rule directory every `interval` until cancelled.
    pub fn spawn(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let reloader = Arc::clone(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match reloader.reload_if_changed().await {
                            ReloadOutcome::Published(version) => {
                                info!(version, rule_dir = %reloader.rule_dir.display(), "rules reloaded");
                            }
                            ReloadOutcome::Unchanged => {
                                debug!("rule directory unchanged");
                            }
                            ReloadOutcome::Rejected(_) => {}
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!("rule reload task shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn fingerprint(&self) -> Result<Fingerprint> {
        let paths = RuleLoader::rule_files(&self.rule_dir).await?;
        let mut fingerprint = Vec::with_capacity(paths.len());
        for path in paths {
            let metadata = tokio::fs::metadata(&path)
                .await
                .with_context(|| format!("failed to stat {}", path.display()))?;
            fingerprint.push((path, metadata.len(), metadata.modified().ok()));
        }
        Ok(fingerprint)
    }

    fn reject(&self, reason: String, fingerprint: Option<Fingerprint>) -> ReloadOutcome {
        {
            let mut state = self.state.lock();
            // A fingerprint is only recorded for a directory that could be read,
            // so an unreadable directory is retried on every tick.
            if fingerprint.is_some() {
                state.fingerprint = fingerprint;
            }
            state.last_error = Some(reason.clone());
        }

        match self.store.current_version() {
            Some(active_version) => {
                warn!(
                    rule_dir = %self.rule_dir.display(),
                    active_version,
                    error = %reason,
                    "rule reload rejected, keeping active snapshot"
                );
            }
            None => {
                self.store
                    .halt(format!("no valid rule snapshot: {reason}"));
            }
        }

        ReloadOutcome::Rejected(reason)
    }
}

/// Load and compile the rule directory without publishing it.
///
/// Returns the number of rules. Used by `--validate`.
pub async fn validate_rules(rule_dir: &str, default_action: Action) -> Result<usize> {
    let set = RuleLoader::load_directory(rule_dir, default_action)
        .await
        .with_context(|| format!("failed to load rules from {rule_dir}"))?;
    let snapshot =
        RuleSnapshot::from_rule_set(&set, 0).context("rule set failed validation")?;
    Ok(snapshot.len())
}
