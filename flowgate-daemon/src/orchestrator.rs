//! Daemon orchestration -- assembly, channel wiring, and lifecycle management.
//!
//! The [`Orchestrator`] loads the rule directory, opens the audit log,
//! builds the event pipeline, and binds the TCP intake in front of it.
//!
//! # Startup Order (consumers before producers)
//!
//! 1. Event pipeline (router, workers, reaper, audit retry drainer)
//! 2. Traffic intake listener
//! 3. Alert/failure loggers, rule reload, uptime updater
//!
//! # Shutdown Order
//!
//! 1. Traffic intake and rule reload (stop accepting new work)
//! 2. Event pipeline (queued events not yet tracked fail as `cancelled`;
//!    events past tracking complete; final audit retry)
//! 3. Loggers (drain remaining alerts)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use flowgate_core::config::FlowgateConfig;
use flowgate_core::event::AlertEvent;
use flowgate_core::pipeline::Pipeline;
use flowgate_core::types::Severity;
use flowgate_engine::{
    EngineConfig, EventPipeline, EventPipelineBuilder, FailedEvent, JsonlAuditSink,
    LoggingEnforcer, RuleStore,
};

use crate::health::{DaemonHealth, ModuleHealth, aggregate_status};
use crate::intake::IntakeServer;
use crate::metrics_server;
use crate::reload::{ReloadOutcome, RuleReloader};

/// Channel capacity constants.
const ALERT_CHANNEL_CAPACITY: usize = 256;
const FAILURE_CHANNEL_CAPACITY: usize = 1024;

const UPTIME_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

type DaemonPipeline = EventPipeline<JsonlAuditSink, LoggingEnforcer>;

/// The main daemon orchestrator.
pub struct Orchestrator {
    /// Loaded and validated configuration.
    config: FlowgateConfig,
    pipeline: DaemonPipeline,
    store: Arc<RuleStore>,
    reloader: Arc<RuleReloader>,
    alert_rx: Option<mpsc::Receiver<AlertEvent>>,
    failure_rx: Option<mpsc::Receiver<FailedEvent>>,
    /// Stops intake and rule reload.
    cancel: CancellationToken,
    /// Shutdown broadcast for logger tasks.
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    intake_addr: Option<SocketAddr>,
    pid_file: Option<PathBuf>,
    started: bool,
    /// Daemon start time (for uptime reporting).
    start_time: Instant,
}

impl Orchestrator {
    /// Load `flowgate.toml`, apply environment overrides, and build.
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = FlowgateConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config).await
    }

    /// Build from an already-loaded configuration.
    ///
    /// A rule directory that fails to load does not abort the build: intake
    /// stays halted and the reload task keeps retrying.
    pub async fn build_from_config(config: FlowgateConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
        }

        let engine_config = EngineConfig::from_core(&config)
            .map_err(|e| anyhow::anyhow!("invalid engine config: {}", e))?;

        let store = Arc::new(RuleStore::new());
        let reloader = Arc::new(RuleReloader::new(
            &config.rules.rule_dir,
            engine_config.default_action,
            Arc::clone(&store),
        ));
        match reloader.reload_if_changed().await {
            ReloadOutcome::Published(version) => {
                tracing::info!(version, rule_dir = %config.rules.rule_dir, "initial rule snapshot published");
            }
            ReloadOutcome::Rejected(reason) => {
                tracing::error!(
                    rule_dir = %config.rules.rule_dir,
                    error = %reason,
                    "initial rule load failed, intake halted until the rule directory is fixed"
                );
            }
            ReloadOutcome::Unchanged => {}
        }

        let audit = JsonlAuditSink::from_config(&config.audit)
            .await
            .map_err(|e| anyhow::anyhow!("failed to open audit log: {}", e))?;

        let (failure_tx, failure_rx) = mpsc::channel(FAILURE_CHANNEL_CAPACITY);
        let (pipeline, alert_rx) = EventPipelineBuilder::new()
            .config(engine_config)
            .store(Arc::clone(&store))
            .audit_sink(Arc::new(audit))
            .enforcer(Arc::new(LoggingEnforcer::new()))
            .alert_channel_capacity(ALERT_CHANNEL_CAPACITY)
            .failure_sender(failure_tx)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build event pipeline: {}", e))?;

        let (shutdown_tx, _) = broadcast::channel(16);

        if config.metrics.enabled {
            record_daemon_metrics();
        }
        tracing::info!("orchestrator initialized");

        Ok(Self {
            config,
            pipeline,
            store,
            reloader,
            alert_rx,
            failure_rx: Some(failure_rx),
            cancel: CancellationToken::new(),
            shutdown_tx,
            tasks: Vec::new(),
            intake_addr: None,
            pid_file: None,
            started: false,
            start_time: Instant::now(),
        })
    }

    /// Write the daemon PID to `path` while running.
    pub fn with_pid_file(mut self, path: Option<PathBuf>) -> Self {
        self.pid_file = path;
        self
    }

    /// Start the pipeline, bind intake, and spawn background tasks.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(path) = &self.pid_file {
            write_pid_file(path)?;
        }

        if let Err(e) = self.pipeline.start().await {
            tracing::error!(error = %e, "event pipeline failed to start");
            self.cleanup_pid_file();
            return Err(e.into());
        }

        let server = match IntakeServer::bind(
            &self.config.pipeline,
            self.pipeline.intake(),
            Arc::clone(&self.store),
            self.cancel.clone(),
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                tracing::warn!("intake bind failed, rolling back event pipeline");
                if let Err(stop_err) = self.pipeline.stop().await {
                    tracing::error!(
                        startup_error = %e,
                        rollback_error = %stop_err,
                        "rollback also failed during startup failure cleanup"
                    );
                }
                self.cleanup_pid_file();
                return Err(e);
            }
        };
        self.intake_addr = server.local_addr().ok();
        self.tasks.push(server.spawn());
        self.started = true;

        if let Some(alert_rx) = self.alert_rx.take() {
            self.tasks
                .push(spawn_alert_logger(alert_rx, self.shutdown_tx.subscribe()));
        }
        if let Some(failure_rx) = self.failure_rx.take() {
            self.tasks
                .push(spawn_failure_logger(failure_rx, self.shutdown_tx.subscribe()));
        }
        if self.config.rules.reload_interval_secs > 0 {
            let interval = Duration::from_secs(self.config.rules.reload_interval_secs);
            self.tasks
                .push(self.reloader.spawn(interval, self.cancel.clone()));
        }
        if self.config.metrics.enabled {
            self.tasks.push(spawn_uptime_updater(
                self.start_time,
                self.shutdown_tx.subscribe(),
            ));
        }

        tracing::info!(
            intake_addr = ?self.intake_addr,
            snapshot_version = self.store.current_version(),
            "flowgate daemon started"
        );
        Ok(())
    }

    /// Start, wait for SIGTERM/SIGINT, then shut down.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        tracing::info!("entering main event loop");
        let signal = wait_for_shutdown_signal().await?;
        tracing::info!(signal = signal, "shutdown signal received");

        self.shutdown().await
    }

    /// Graceful shutdown.
    ///
    /// Events still queued are reported as `cancelled` failures rather than
    /// evaluated. Events already tracked finish and are audited.
    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.started = false;

        self.cancel.cancel();
        let stop_result = self.pipeline.stop().await;

        let _ = self.shutdown_tx.send(());
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "daemon task ended abnormally");
            }
        }

        self.cleanup_pid_file();
        stop_result.map_err(Into::into)
    }

    /// Current aggregated health status.
    pub async fn health(&self) -> DaemonHealth {
        let modules = vec![
            ModuleHealth::new("event-pipeline", true, self.pipeline.health_check().await),
            ModuleHealth::new(
                "rule-reload",
                self.config.rules.reload_interval_secs > 0,
                self.reloader.health(),
            ),
        ];

        let uptime_secs = self.start_time.elapsed().as_secs();
        if self.config.metrics.enabled {
            use flowgate_core::metrics as m;
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(uptime_secs as f64);
        }

        DaemonHealth {
            status: aggregate_status(&modules),
            uptime_secs,
            snapshot_version: self.store.current_version(),
            modules,
        }
    }

    /// Address the traffic intake is bound to, once started.
    pub fn intake_addr(&self) -> Option<SocketAddr> {
        self.intake_addr
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    pub fn config(&self) -> &FlowgateConfig {
        &self.config
    }

    fn cleanup_pid_file(&self) {
        if let Some(path) = &self.pid_file {
            remove_pid_file(path);
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// Returns the name of the signal that triggered the shutdown.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Write the current process PID to a file.
///
/// `create_new` makes a second daemon with the same PID file fail fast.
fn write_pid_file(path: &Path) -> Result<()> {
    use std::fs::{self, OpenOptions};
    use std::io::{ErrorKind, Write};

    if let Some(parent) = path.parent() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new()
                .mode(0o700)
                .recursive(true)
                .create(parent)?;
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(parent)?;
        }
    }

    let pid = std::process::id();

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing_pid = fs::read_to_string(path).unwrap_or_else(|_| "unknown".to_owned());
            return Err(anyhow::anyhow!(
                "PID file {} already exists with PID: {}. Is another instance running?",
                path.display(),
                existing_pid.trim()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    writeln!(file, "{}", pid)?;

    tracing::info!(pid = pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Remove the PID file. Logs a warning but does not fail.
fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove PID file");
    } else {
        tracing::info!(path = %path.display(), "PID file removed");
    }
}

fn log_alert(alert: &AlertEvent) {
    match alert.severity {
        Severity::Critical | Severity::High => tracing::error!(
            alert_id = %alert.id,
            kind = %alert.kind,
            severity = %alert.severity,
            trace_id = %alert.metadata.trace_id,
            message = %alert.message,
            "operational alert"
        ),
        _ => tracing::warn!(
            alert_id = %alert.id,
            kind = %alert.kind,
            severity = %alert.severity,
            trace_id = %alert.metadata.trace_id,
            message = %alert.message,
            "operational alert"
        ),
    }
}

/// Log operational alerts (audit write failures, dropped retries).
///
/// Alerts still buffered when shutdown arrives are logged before exiting.
fn spawn_alert_logger(
    mut alert_rx: mpsc::Receiver<AlertEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                alert = alert_rx.recv() => {
                    match alert {
                        Some(alert) => log_alert(&alert),
                        None => {
                            tracing::debug!("alert channel closed, exiting logger");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    while let Ok(alert) = alert_rx.try_recv() {
                        log_alert(&alert);
                    }
                    tracing::debug!("alert logger shutting down");
                    break;
                }
            }
        }
    })
}

fn log_failure(failure: &FailedEvent) {
    tracing::warn!(
        event_id = %failure.event_id,
        flow_key = %failure.flow,
        stage = %failure.stage,
        kind = failure.kind,
        reason = %failure.reason,
        "event failed"
    );
}

/// Log events that ended in the FAILED stage.
fn spawn_failure_logger(
    mut failure_rx: mpsc::Receiver<FailedEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                failure = failure_rx.recv() => {
                    match failure {
                        Some(failure) => log_failure(&failure),
                        None => {
                            tracing::debug!("failure channel closed, exiting logger");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    while let Ok(failure) = failure_rx.try_recv() {
                        log_failure(&failure);
                    }
                    tracing::debug!("failure logger shutting down");
                    break;
                }
            }
        }
    })
}

/// Record daemon-level metrics. Called once during initialization.
fn record_daemon_metrics() {
    use flowgate_core::metrics as m;

    metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "daemon metrics recorded");
}

/// Periodically refresh the uptime gauge for Prometheus scrapes.
fn spawn_uptime_updater(
    start_time: Instant,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    use flowgate_core::metrics as m;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPTIME_UPDATE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(start_time.elapsed().as_secs() as f64);
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("uptime updater shutting down");
                    break;
                }
            }
        }
    })
}
