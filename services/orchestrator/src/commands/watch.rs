//! Tail notices while the background refresh loop runs.

use anyhow::Result;
use clap::Args;
use nodeorch_orchestrator::Notice;
use tokio::sync::broadcast;
use tracing::info;

use crate::output::{print_info, print_notice};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Only show notices about this node.
    #[arg(long)]
    node: Option<String>,
}

pub async fn run(ctx: &CommandContext, args: WatchArgs) -> Result<()> {
    let mut notices = ctx.orchestrator.subscribe_notices();
    let refresh = ctx.orchestrator.spawn_refresh_loop();

    print_info("Watching for notices (Ctrl-C to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            notice = notices.recv() => {
                match notice {
                    Ok(notice) => {
                        let subject = match &notice {
                            Notice::Rejected { subject, .. }
                            | Notice::CommandFailed { subject, .. } => Some(subject),
                            Notice::LogAvailable { node, .. }
                            | Notice::NodeReady { node }
                            | Notice::ActivationFailed { node, .. }
                            | Notice::NodeStopped { node, .. }
                            | Notice::NodeDeleted { node } => Some(node),
                            _ => None,
                        };
                        let wanted = match (&args.node, subject) {
                            (Some(filter), Some(subject)) => filter == subject,
                            (Some(_), None) => false,
                            (None, _) => true,
                        };
                        if wanted {
                            print_notice(&notice, ctx.format);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        info!(skipped, "Notice stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    refresh.abort();
    Ok(())
}
