//! Bundle commands.

use std::time::Duration;

use anyhow::{bail, Result};
use clap::Args;
use nodeorch_orchestrator::{CommandOutcome, Notice};
use serde::Serialize;
use tabled::Tabled;
use tokio::sync::broadcast;

use crate::output::{print_notice, print_output, print_single, print_success, OutputFormat};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct InstallArgs {
    /// Bundle reference, as listed by `nodeorch bundles`.
    bundle_ref: String,

    /// Return once the install is started instead of waiting for it.
    #[arg(long)]
    no_wait: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct BundleRow {
    #[tabled(rename = "Bundle")]
    bundle_ref: String,

    #[tabled(rename = "Node")]
    model_name: String,

    #[tabled(rename = "Size")]
    size: String,

    #[tabled(rename = "File")]
    filename: String,
}

fn format_size(bytes: Option<u64>) -> String {
    match bytes {
        Some(bytes) => format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0)),
        None => "-".to_string(),
    }
}

pub async fn list(ctx: &CommandContext) -> Result<()> {
    let rows: Vec<BundleRow> = ctx
        .orchestrator
        .bundles()
        .await
        .into_iter()
        .map(|bundle| BundleRow {
            size: format_size(bundle.size_bytes),
            filename: bundle.filename.unwrap_or_else(|| "-".to_string()),
            bundle_ref: bundle.bundle_ref,
            model_name: bundle.model_name,
        })
        .collect();

    print_output(&rows, ctx.format);
    Ok(())
}

pub async fn install(ctx: &CommandContext, args: InstallArgs) -> Result<()> {
    let mut notices = ctx.orchestrator.subscribe_notices();

    let install_id = match ctx.orchestrator.install(&args.bundle_ref).await? {
        CommandOutcome::Rejected { reason } => bail!(reason),
        CommandOutcome::Accepted(install_id) => install_id,
    };

    if args.no_wait {
        print_success(&format!("Install {install_id} started"));
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last_percent = None;
    loop {
        tokio::select! {
            notice = notices.recv() => {
                let notice = match notice {
                    Ok(notice) => notice,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => bail!("notice channel closed"),
                };
                match &notice {
                    Notice::InstallCompleted { install_id: id, .. } if *id == install_id => {
                        print_notice(&notice, ctx.format);
                        break;
                    }
                    Notice::InstallFailed { install_id: id, .. } if *id == install_id => {
                        print_notice(&notice, ctx.format);
                        if let Some(job) = ctx.orchestrator.install_job().await {
                            if ctx.format == OutputFormat::Json {
                                print_single(&job);
                            }
                        }
                        bail!("install {install_id} failed");
                    }
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                if ctx.format != OutputFormat::Table {
                    continue;
                }
                if let Some(job) = ctx.orchestrator.install_job().await {
                    if job.install_id == install_id && last_percent != Some(job.progress_percent) {
                        last_percent = Some(job.progress_percent);
                        println!(
                            "  {} {:>3}% {}",
                            job.current_step(),
                            job.progress_percent,
                            job.progress_text.as_deref().unwrap_or("")
                        );
                    }
                }
            }
        }
    }

    Ok(())
}
