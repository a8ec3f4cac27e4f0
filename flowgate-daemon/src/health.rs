//! Aggregated health reporting.
//!
//! The daemon status is the worst status among its enabled modules:
//!
//! - All Healthy -> Healthy
//! - Any Degraded, none Unhealthy -> Degraded(reasons)
//! - Any Unhealthy -> Unhealthy(reasons)

use serde::Serialize;

use flowgate_core::pipeline::HealthStatus;

/// Aggregated health report for the entire daemon.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonHealth {
    /// Overall daemon health status (worst of all modules).
    pub status: HealthStatus,
    /// Daemon uptime in seconds since start.
    pub uptime_secs: u64,
    /// Active rule snapshot version, if any.
    pub snapshot_version: Option<u64>,
    /// Per-module health reports.
    pub modules: Vec<ModuleHealth>,
}

/// Health status for a single module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleHealth {
    /// Module name (e.g., "event-pipeline", "rule-reload").
    pub name: String,
    /// Whether the module is enabled in configuration.
    pub enabled: bool,
    /// Current health status of the module.
    pub status: HealthStatus,
}

impl ModuleHealth {
    pub fn new(name: impl Into<String>, enabled: bool, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            enabled,
            status,
        }
    }
}

/// Returns the worst status among enabled modules: Unhealthy > Degraded > Healthy.
pub fn aggregate_status(modules: &[ModuleHealth]) -> HealthStatus {
    let mut degraded = Vec::new();
    let mut unhealthy = Vec::new();

    for module in modules.iter().filter(|m| m.enabled) {
        match &module.status {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded(reason) => {
                degraded.push(format!("{}: {}", module.name, reason));
            }
            HealthStatus::Unhealthy(reason) => {
                unhealthy.push(format!("{}: {}", module.name, reason));
            }
        }
    }

    if !unhealthy.is_empty() {
        HealthStatus::Unhealthy(unhealthy.join("; "))
    } else if !degraded.is_empty() {
        HealthStatus::Degraded(degraded.join("; "))
    } else {
        HealthStatus::Healthy
    }
}
