//! Output formatting for CLI commands.

use colored::Colorize;
use nodeorch_orchestrator::{Notice, OrchestratorError};
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

/// Print rows in the specified format.
pub fn print_output<T: Serialize + Tabled>(data: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No items found.".dimmed());
            } else {
                println!("{}", Table::new(data));
            }
        }
        OutputFormat::Json => println!("{}", format_json(data, "[]")),
    }
}

/// Print a single item as JSON regardless of format.
pub fn print_single<T: Serialize>(data: &T) {
    println!("{}", format_json(data, "{}"));
}

fn format_json<T: Serialize + ?Sized>(data: &T, fallback: &str) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| fallback.to_string())
}

pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "Warning:".yellow().bold(), message);
}

/// Print a notice as a colored one-liner, or as a JSON line.
pub fn print_notice(notice: &Notice, format: OutputFormat) {
    if format == OutputFormat::Json {
        if let Ok(line) = serde_json::to_string(notice) {
            println!("{line}");
        }
        return;
    }

    let line = describe_notice(notice);
    if notice.is_error() {
        println!("{} {}", "✗".red().bold(), line);
    } else if matches!(notice, Notice::Rejected { .. }) {
        println!("{} {}", "!".yellow().bold(), line);
    } else {
        println!("{} {}", "✓".green().bold(), line);
    }
    if let Some(path) = notice.log_path() {
        println!("  {} {}", "logs:".dimmed(), path);
    }
}

fn describe_notice(notice: &Notice) -> String {
    match notice {
        Notice::Rejected { subject, reason } => format!("{subject}: {reason}"),
        Notice::LogAvailable { node, .. } => format!("{node}: registration accepted"),
        Notice::NodeReady { node } => format!("{node} is ready"),
        Notice::ActivationFailed { node, failure } => format!(
            "{node} failed to start: {}",
            failure.message.as_deref().unwrap_or("no message")
        ),
        Notice::NodeStopped { node, confirmed } => {
            if *confirmed {
                format!("{node} stopped")
            } else {
                format!("{node} was asked to stop but is still listed as running")
            }
        }
        Notice::NodeDeleted { node } => format!("{node} deleted"),
        Notice::CommandFailed {
            subject,
            command,
            message,
        } => format!("{command} {subject} failed: {message}"),
        Notice::InstallCompleted {
            install_id,
            bundle_ref,
        } => format!("{bundle_ref} installed ({install_id})"),
        Notice::InstallFailed {
            install_id,
            bundle_ref,
            step,
            message,
        } => format!(
            "{bundle_ref} install {install_id} failed at {}: {message}",
            step.as_deref().unwrap_or("start")
        ),
        Notice::DownloadCompleted { url, file_path } => format!(
            "downloaded {url} to {}",
            file_path.as_deref().unwrap_or("(unknown)")
        ),
        Notice::DownloadInterrupted { url, state } => format!("download of {url} {state:?}"),
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(orchestrator_err) = err.downcast_ref::<OrchestratorError>() {
        match orchestrator_err {
            OrchestratorError::MissingField { field, .. } => {
                let flag = match *field {
                    "servicePath" => "--service-path",
                    "envName" => "--env-name",
                    other => other,
                };
                eprintln!("\n{}", format!("Hint: pass {flag} to activate manually.").yellow());
            }
            OrchestratorError::NodeRunning(node) => {
                eprintln!(
                    "\n{}",
                    format!("Hint: run `nodeorch deactivate {node}` first.").yellow()
                );
            }
            error if error.is_backend() => {
                eprintln!(
                    "\n{}",
                    "Hint: check that the backend is reachable (NODEORCH_BACKEND_URL).".yellow()
                );
            }
            _ => {}
        }
    }
}
