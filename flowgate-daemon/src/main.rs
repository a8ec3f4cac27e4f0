use anyhow::Result;
use clap::Parser;

use flowgate_core::config::FlowgateConfig;
use flowgate_daemon::cli::DaemonCli;
use flowgate_daemon::orchestrator::Orchestrator;
use flowgate_daemon::{logging, reload};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    let mut config = FlowgateConfig::load(&cli.config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load config {}: {}", cli.config.display(), e))?;

    // CLI flags take precedence over the file and environment.
    if let Some(level) = cli.log_level {
        config.general.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }
    if let Some(rule_dir) = cli.rule_dir {
        config.rules.rule_dir = rule_dir;
    }

    logging::init_tracing(&config.general)?;

    if cli.validate {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;
        let default_action = config.rules.default_action().ok_or_else(|| {
            anyhow::anyhow!("unknown rules.default_action '{}'", config.rules.default_action)
        })?;
        let count = reload::validate_rules(&config.rules.rule_dir, default_action).await?;
        tracing::info!(
            config = %cli.config.display(),
            rule_dir = %config.rules.rule_dir,
            rules = count,
            "configuration and rules are valid"
        );
        return Ok(());
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "flowgate-daemon starting");

    let mut orchestrator = Orchestrator::build_from_config(config)
        .await?
        .with_pid_file(cli.pid_file);
    orchestrator.run().await?;

    tracing::info!("flowgate-daemon shut down");
    Ok(())
}
