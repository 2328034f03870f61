//! Node commands.

use std::time::Duration;

use anyhow::{bail, Result};
use clap::Args;
use nodeorch_orchestrator::{ActivationPath, CommandOutcome, NodeView, Notice};
use serde::Serialize;
use tabled::Tabled;
use tokio::sync::broadcast;

use crate::output::{print_info, print_notice, print_output, print_success, print_warning};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Only show nodes in this category.
    #[arg(long)]
    category: Option<String>,

    /// Only show running nodes.
    #[arg(long)]
    running: bool,
}

#[derive(Debug, Args)]
pub struct NodeArgs {
    /// Node name.
    node: String,
}

#[derive(Debug, Args)]
pub struct ActivateArgs {
    /// Node name.
    node: String,

    /// Factory the backend launches the node with.
    #[arg(long, default_value = "default")]
    factory: String,

    /// Service executable or script (manual activation).
    #[arg(long)]
    service_path: Option<String>,

    /// Environment name (manual activation).
    #[arg(long)]
    env_name: Option<String>,

    /// Dependency file (manual activation).
    #[arg(long)]
    dependency_path: Option<String>,

    /// Python version (manual activation).
    #[arg(long)]
    python_version: Option<String>,

    /// Port (manual activation).
    #[arg(long)]
    port: Option<u16>,

    /// Install dependencies before launching (manual activation).
    #[arg(long)]
    install_dependencies: bool,

    /// Return once the backend accepts instead of waiting for the node.
    #[arg(long)]
    no_wait: bool,

    /// Give up waiting after this many seconds.
    #[arg(long, default_value = "600")]
    timeout: u64,
}

impl ActivateArgs {
    fn has_manual_fields(&self) -> bool {
        self.service_path.is_some()
            || self.env_name.is_some()
            || self.dependency_path.is_some()
            || self.python_version.is_some()
            || self.port.is_some()
            || self.install_dependencies
    }
}

#[derive(Debug, Serialize, Tabled)]
struct NodeRow {
    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "Category")]
    category: String,

    #[tabled(rename = "Status")]
    status: String,

    #[tabled(rename = "Running")]
    running: String,

    #[tabled(rename = "Port")]
    port: String,

    #[tabled(rename = "Bundle")]
    bundle: String,

    #[tabled(rename = "Config")]
    readiness: String,
}

impl From<&NodeView> for NodeRow {
    fn from(view: &NodeView) -> Self {
        let mut status = label(&view.status);
        if let Some(lock) = view.lock {
            status = format!("{status} ({lock})");
        }
        Self {
            name: view.name.clone(),
            category: view.category_id.clone().unwrap_or_else(|| "-".to_string()),
            status,
            running: if view.is_running() { "yes" } else { "no" }.to_string(),
            port: view
                .running
                .as_ref()
                .and_then(|info| info.port)
                .or(view.runtime_config.port)
                .map_or_else(|| "-".to_string(), |p| p.to_string()),
            bundle: if view.bundle_exists { "installed" } else { "-" }.to_string(),
            readiness: label(&view.readiness),
        }
    }
}

/// Serialized name of a unit enum variant, e.g. `missing_service_path`.
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "-".to_string(),
    }
}

pub async fn list(ctx: &CommandContext, args: ListArgs) -> Result<()> {
    let nodes = ctx.orchestrator.nodes().await;
    let rows: Vec<NodeRow> = nodes
        .iter()
        .filter(|view| {
            args.category
                .as_deref()
                .map_or(true, |category| view.category_id.as_deref() == Some(category))
        })
        .filter(|view| !args.running || view.is_running())
        .map(NodeRow::from)
        .collect();

    print_output(&rows, ctx.format);
    Ok(())
}

pub async fn activate(ctx: &CommandContext, args: ActivateArgs) -> Result<()> {
    let orchestrator = &ctx.orchestrator;
    let mut notices = orchestrator.subscribe_notices();

    let outcome = if args.has_manual_fields() {
        let mut form = orchestrator.open_manual_activation(&args.node).await?;
        fill_form(&mut form, &args);
        orchestrator.submit_manual_activation(&form, &args.factory).await?
    } else {
        match orchestrator.activate(&args.node, &args.factory).await? {
            CommandOutcome::Accepted(ActivationPath::NeedsManualInput(form)) => {
                print_info(&format!(
                    "{} has no complete launch configuration; missing {}",
                    args.node,
                    form.missing_fields().join(", ")
                ));
                bail!(nodeorch_orchestrator::OrchestratorError::MissingField {
                    node: args.node.clone(),
                    field: form.missing_fields().first().copied().unwrap_or("servicePath"),
                });
            }
            outcome => outcome,
        }
    };

    match outcome {
        CommandOutcome::Rejected { reason } => bail!(reason),
        CommandOutcome::Accepted(ActivationPath::Refused { message }) => {
            bail!("backend refused to start {}: {message}", args.node)
        }
        CommandOutcome::Accepted(ActivationPath::NeedsManualInput(_)) => {
            bail!("{} needs manual input", args.node)
        }
        CommandOutcome::Accepted(ActivationPath::Started { log_path }) => {
            if let Some(path) = log_path {
                print_info(&format!("Logs: {path}"));
            }
            if args.no_wait {
                print_success(&format!("Activation of {} started", args.node));
                return Ok(());
            }
        }
    }

    wait_for_node(&mut notices, &args.node, ctx, Duration::from_secs(args.timeout)).await
}

fn fill_form(form: &mut nodeorch_orchestrator::ManualActivationForm, args: &ActivateArgs) {
    if let Some(value) = &args.service_path {
        form.service_path = value.clone();
    }
    if let Some(value) = &args.env_name {
        form.env_name = value.clone();
    }
    if let Some(value) = &args.dependency_path {
        form.dependency_path = value.clone();
    }
    if let Some(value) = &args.python_version {
        form.python_version = value.clone();
    }
    if args.port.is_some() {
        form.port = args.port;
    }
    form.install_dependencies |= args.install_dependencies;
}

async fn wait_for_node(
    notices: &mut broadcast::Receiver<Notice>,
    node: &str,
    ctx: &CommandContext,
    timeout: Duration,
) -> Result<()> {
    let wait = async {
        loop {
            let notice = match notices.recv().await {
                Ok(notice) => notice,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("notice channel closed"),
            };
            match &notice {
                Notice::NodeReady { node: n } if n == node => {
                    print_notice(&notice, ctx.format);
                    return Ok(());
                }
                Notice::ActivationFailed { node: n, .. } if n == node => {
                    print_notice(&notice, ctx.format);
                    bail!("activation of {node} failed");
                }
                _ => {}
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => bail!("timed out waiting for {node}"),
    }
}

pub async fn deactivate(ctx: &CommandContext, args: NodeArgs) -> Result<()> {
    match ctx.orchestrator.deactivate(&args.node).await? {
        CommandOutcome::Rejected { reason } => bail!(reason),
        CommandOutcome::Accepted(report) => {
            if report.confirmed {
                print_success(&format!("{} stopped ({})", args.node, report.env_name));
            } else {
                print_warning(&format!(
                    "{} was asked to stop ({}) but is still listed as running",
                    args.node, report.env_name
                ));
            }
            Ok(())
        }
    }
}

pub async fn delete(ctx: &CommandContext, args: NodeArgs) -> Result<()> {
    match ctx.orchestrator.delete(&args.node).await? {
        CommandOutcome::Rejected { reason } => bail!(reason),
        CommandOutcome::Accepted(()) => {
            print_success(&format!("{} deleted", args.node));
            Ok(())
        }
    }
}
