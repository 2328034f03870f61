//! CLI commands.

mod bundles;
mod nodes;
mod watch;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nodeorch_orchestrator::{Config, HttpBackend, Orchestrator};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::output::OutputFormat;

/// nodeorch - install, activate and stop AI compute nodes.
#[derive(Debug, Parser)]
#[command(name = "nodeorch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Backend task-management service URL.
    #[arg(long, global = true, env = "NODEORCH_BACKEND_URL")]
    backend_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, env = "NODEORCH_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List catalog nodes with their status.
    Nodes(nodes::ListArgs),

    /// List installable bundles.
    Bundles,

    /// Activate a node.
    Activate(nodes::ActivateArgs),

    /// Stop a running node.
    Deactivate(nodes::NodeArgs),

    /// Delete a stopped node.
    Delete(nodes::NodeArgs),

    /// Install a bundle.
    Install(bundles::InstallArgs),

    /// Stream notices until interrupted.
    Watch(watch::WatchArgs),
}

/// Shared state handed to every command.
pub struct CommandContext {
    pub orchestrator: Arc<Orchestrator>,
    pub format: OutputFormat,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let mut config = Config::from_env()?;
        if let Some(url) = self.backend_url {
            config.backend_url = url;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        config.log_json |= self.log_json;

        init_tracing(&config);
        info!(backend_url = %config.backend_url, "Configuration loaded");

        let backend = HttpBackend::new(&config).context("Failed to create backend client")?;
        let orchestrator = Arc::new(Orchestrator::new(config, Arc::new(backend)));
        orchestrator.initialize().await;

        let ctx = CommandContext {
            orchestrator: orchestrator.clone(),
            format: self.format,
        };

        let result = match self.command {
            Commands::Nodes(args) => nodes::list(&ctx, args).await,
            Commands::Bundles => bundles::list(&ctx).await,
            Commands::Activate(args) => nodes::activate(&ctx, args).await,
            Commands::Deactivate(args) => nodes::deactivate(&ctx, args).await,
            Commands::Delete(args) => nodes::delete(&ctx, args).await,
            Commands::Install(args) => bundles::install(&ctx, args).await,
            Commands::Watch(args) => watch::run(&ctx, args).await,
        };

        orchestrator.shutdown().await;
        result
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
