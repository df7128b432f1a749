// Site lifecycle commands

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use hostpanel_config::DatabaseEngine;
use hostpanel_orchestrator::{
    DesiredStatus, Orchestrator, OrchestratorError, PoolMode, ReconcileReport, SiteRequest,
    SiteState, SiteType,
};
use hostpanel_provision::MailAccount;

use super::{format_report, Outcome};

/// Flags of `hostpanel provision`.
#[derive(Debug, Default)]
pub struct ProvisionOptions {
    pub domain: String,
    pub site_type: Option<SiteType>,
    pub runtime_version: Option<String>,
    pub user: Option<String>,
    pub pool: Option<PoolMode>,
    pub max_workers: Option<u32>,
    pub engine: Option<DatabaseEngine>,
    pub apps: Vec<String>,
    pub mail_file: Option<PathBuf>,
}

pub fn handle_provision(orchestrator: &Orchestrator, options: ProvisionOptions) -> Result<Outcome> {
    let site_type = match options.site_type {
        Some(site_type) => site_type,
        None => stored_site_type(orchestrator, &options.domain)?,
    };
    let mail_accounts = match &options.mail_file {
        Some(path) => Some(read_mail_accounts(path)?),
        None => None,
    };

    let request = SiteRequest {
        domain: options.domain,
        site_type,
        runtime_version: options.runtime_version,
        os_user: options.user,
        pool_mode: options.pool,
        max_workers: options.max_workers,
        database_engine: options.engine,
        apps: options.apps,
        mail_accounts,
    };
    let site = orchestrator
        .register(&request)
        .with_context(|| format!("Cannot register {}", request.domain))?;
    info!(domain = %site.domain, "provisioning");

    let report = orchestrator
        .provision(&site.domain)
        .context("Provision failed")?;
    print_run(report)
}

/// Type of the live stored record, `static` for new domains.
fn stored_site_type(orchestrator: &Orchestrator, domain: &str) -> Result<SiteType> {
    match orchestrator.status(domain) {
        Ok(site) if site.state != SiteState::Deleted => Ok(site.site_type),
        Ok(_) | Err(OrchestratorError::SiteNotFound(_)) => Ok(SiteType::default()),
        Err(e) => Err(e.into()),
    }
}

fn read_mail_accounts(path: &Path) -> Result<Vec<MailAccount>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Cannot read mail accounts from {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid mail accounts in {}", path.display()))
}

pub fn handle_reconcile(
    orchestrator: &Orchestrator,
    domain: &str,
    desired: Option<DesiredStatus>,
) -> Result<Outcome> {
    let desired = match desired {
        Some(desired) => desired,
        None => orchestrator.status(domain)?.desired,
    };
    let report = orchestrator
        .reconcile(domain, desired)
        .with_context(|| format!("Reconcile of {} failed", domain))?;
    print_run(report)
}

pub fn handle_reconcile_all(orchestrator: &Orchestrator) -> Result<Outcome> {
    let runs = orchestrator.reconcile_all()?;
    let mut failed = 0;
    for run in &runs {
        match &run.result {
            Ok(report) => {
                print!("{}", format_report(report));
                if !report.is_success() {
                    failed += 1;
                }
            }
            Err(e) => {
                println!("{}: error: {}", run.domain, e);
                failed += 1;
            }
        }
    }
    println!("{} sites reconciled, {} with failures", runs.len(), failed);
    Ok(Outcome::from_success(failed == 0))
}

pub fn print_run(report: ReconcileReport) -> Result<Outcome> {
    print!("{}", format_report(&report));
    Ok(Outcome::from_success(report.is_success()))
}
