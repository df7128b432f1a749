// Command handlers

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use hostpanel_config::ConfigLoader;
use hostpanel_core::SystemExecutor;
use hostpanel_orchestrator::{Orchestrator, ReconcileReport};

use crate::cli::{Args, Command};

pub mod certs;
pub mod site;
pub mod status;

/// How a command that ran to completion went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// At least one step failed or was skipped
    Partial,
}

impl Outcome {
    pub fn from_success(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::Partial
        }
    }
}

fn orchestrator(args: &Args) -> Result<Orchestrator> {
    let config = ConfigLoader::new()
        .with_path(args.config.clone())
        .load()
        .context("Failed to load configuration")?;
    if let Some(path) = &config.source_path {
        debug!("Using configuration {}", path.display());
    }
    Ok(Orchestrator::with_defaults(config, Arc::new(SystemExecutor::new())))
}

/// Main command dispatcher
pub fn execute_command(args: Args) -> Result<Outcome> {
    let orchestrator = orchestrator(&args)?;
    debug!("Handling {} command", args.command.name());

    match args.command {
        Command::Provision {
            domain,
            site_type,
            runtime_version,
            user,
            pool,
            max_workers,
            engine,
            apps,
            mail_file,
        } => site::handle_provision(
            &orchestrator,
            site::ProvisionOptions {
                domain,
                site_type,
                runtime_version,
                user,
                pool,
                max_workers,
                engine: engine.map(Into::into),
                apps,
                mail_file,
            },
        ),
        Command::Deprovision { domain } => {
            site::print_run(orchestrator.deprovision(&domain).context("Deprovision failed")?)
        }
        Command::Suspend { domain } => {
            site::print_run(orchestrator.suspend(&domain).context("Suspend failed")?)
        }
        Command::Resume { domain } => {
            site::print_run(orchestrator.resume(&domain).context("Resume failed")?)
        }
        Command::Reconcile {
            domain,
            desired,
            all,
        } => {
            if all {
                site::handle_reconcile_all(&orchestrator)
            } else {
                let domain = domain.context("A domain or --all is required")?;
                site::handle_reconcile(&orchestrator, &domain, desired)
            }
        }
        Command::RenewCerts { days } => certs::handle_renew(&orchestrator, days),
        Command::Status { domain, json } => status::handle_status(&orchestrator, &domain, json),
        Command::Users { json } => status::handle_users(&orchestrator, json),
    }
}

/// Human-readable report: one header line and one line per step.
pub fn format_report(report: &ReconcileReport) -> String {
    let mut out = format!(
        "{}: {} -> {}\n",
        report.domain, report.action, report.state
    );
    for step in &report.steps {
        out.push_str(&format!("  {}\n", step));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn degraded_report() -> ReconcileReport {
        serde_json::from_str(
            r#"{
                "domain": "app.example.com",
                "action": "provision",
                "target": "active",
                "state": {"state": "degraded", "target": "active"},
                "steps": [
                    {"step": "system-user", "hard": true, "status": "succeeded", "changed": true},
                    {"step": "runtime-pool", "hard": true, "status": "failed",
                     "kind": "config_validation", "message": "syntax error", "retryable": false},
                    {"step": "proxy-http", "hard": true, "status": "skipped",
                     "reason": "Dependency unmet: runtime-pool did not succeed"}
                ],
                "started_at": "2026-01-01T00:00:00Z",
                "finished_at": "2026-01-01T00:00:01Z"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_format_report_lists_every_step() {
        let text = format_report(&degraded_report());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "app.example.com: provision -> degraded (target active)");
        assert_eq!(lines[1], "  system-user: changed");
        assert_eq!(lines[2], "  runtime-pool: FAILED: syntax error");
        assert_eq!(
            lines[3],
            "  proxy-http: skipped: Dependency unmet: runtime-pool did not succeed"
        );
    }

    #[test]
    fn test_outcome_from_success() {
        assert_eq!(Outcome::from_success(true), Outcome::Success);
        assert_eq!(Outcome::from_success(false), Outcome::Partial);
    }
}
