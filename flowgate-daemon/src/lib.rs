//! Flowgate daemon library.
//!
//! Exposes the daemon's modules for integration testing.
//! In production, `flowgate-daemon` is used as a binary (main.rs).

pub mod cli;
pub mod health;
pub mod intake;
pub mod logging;
pub mod metrics_server;
pub mod orchestrator;
pub mod reload;
