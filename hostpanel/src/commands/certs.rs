// Certificate renewal sweep

use anyhow::{Context, Result};

use hostpanel_orchestrator::{Orchestrator, RenewalSummary};

use super::Outcome;

pub fn handle_renew(orchestrator: &Orchestrator, days: Option<i64>) -> Result<Outcome> {
    let summary = orchestrator
        .renew_certificates(days)
        .context("Certificate renewal failed")?;
    print!("{}", format_summary(&summary));
    Ok(Outcome::from_success(summary.is_clean()))
}

fn format_summary(summary: &RenewalSummary) -> String {
    let mut out = String::new();
    for domain in &summary.renewed {
        out.push_str(&format!("renewed   {}\n", domain));
    }
    for failure in &summary.failed {
        out.push_str(&format!("failed    {}: {}\n", failure.domain, failure.reason));
    }
    for domain in &summary.expired {
        out.push_str(&format!("expired   {}\n", domain));
    }
    for warning in &summary.expiring {
        out.push_str(&format!(
            "expiring  {} in {} days\n",
            warning.domain, warning.days_left
        ));
    }
    out.push_str(&format!(
        "{} renewed, {} not due, {} failed\n",
        summary.renewed.len(),
        summary.not_due.len(),
        summary.failed.len()
    ));
    out
}
