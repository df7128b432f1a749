//! Scheduled certificate renewal over every stored site.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument};

use hostpanel_core::HostError;
use hostpanel_provision::RenewalOutcome;

use crate::error::Result;
use crate::notify::{Notification, Severity};
use crate::orchestrator::Orchestrator;
use crate::site::SiteState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenewalFailure {
    pub domain: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpiryWarning {
    pub domain: String,
    pub days_left: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenewalSummary {
    pub renewed: Vec<String>,
    pub not_due: Vec<String>,
    pub failed: Vec<RenewalFailure>,
    /// Certificates inside the warning threshold after the sweep
    pub expiring: Vec<ExpiryWarning>,
    pub expired: Vec<String>,
}

impl RenewalSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.expired.is_empty()
    }
}

impl Orchestrator {
    /// Renew every active certificate expiring within `within_days`
    /// (default `certificates.renew_within_days`).
    ///
    /// A renewal failure is recorded and the sweep moves on; the site keeps
    /// serving with its current certificate.
    #[instrument(skip(self))]
    pub fn renew_certificates(&self, within_days: Option<i64>) -> Result<RenewalSummary> {
        let days = within_days.unwrap_or_else(|| self.certificates.renew_within_days());
        if days < 0 {
            return Err(HostError::Validation(format!(
                "Renewal window must not be negative, got {}",
                days
            ))
            .into());
        }

        let mut summary = RenewalSummary::default();
        for site in self.store.list()? {
            if matches!(site.state, SiteState::New | SiteState::Deleted) || !site.certificate.is_active() {
                continue;
            }
            if let Err(e) = self.renew_site(&site.domain, days, &mut summary) {
                self.notify(&site.domain, Severity::Error, format!("renewal failed: {}", e));
                summary.failed.push(RenewalFailure {
                    domain: site.domain.clone(),
                    reason: e.to_string(),
                });
            }
        }

        info!(
            renewed = summary.renewed.len(),
            failed = summary.failed.len(),
            expiring = summary.expiring.len(),
            "renewal sweep finished"
        );
        Ok(summary)
    }

    fn renew_site(&self, domain: &str, days: i64, summary: &mut RenewalSummary) -> Result<()> {
        let _guard = self.locks.lock(domain)?;
        let mut site = self.load(domain)?;

        let (certificate, outcome) =
            self.certificates
                .renew_if_expiring_within(domain, days, &site.certificate)?;
        site.certificate = certificate;
        site.touch();
        self.store.save(&site)?;

        match outcome {
            RenewalOutcome::NotDue { .. } => summary.not_due.push(domain.to_string()),
            RenewalOutcome::Renewed { days_left } => {
                self.proxy.reload()?;
                self.notify(
                    domain,
                    Severity::Info,
                    format!("certificate renewed, {} days left", days_left),
                );
                summary.renewed.push(domain.to_string());
            }
            RenewalOutcome::Failed { reason } => {
                self.notify(domain, Severity::Error, format!("renewal failed: {}", reason));
                summary.failed.push(RenewalFailure {
                    domain: domain.to_string(),
                    reason,
                });
            }
        }

        let now = Utc::now();
        if site.certificate.is_expired(now) {
            self.notify(domain, Severity::Error, "certificate has expired".to_string());
            summary.expired.push(domain.to_string());
        } else if let Some(days_left) = site.certificate.days_left(now) {
            if days_left <= self.certificates.warn_within_days() {
                self.notify(
                    domain,
                    Severity::Warning,
                    format!("certificate expires in {} days", days_left),
                );
                summary.expiring.push(ExpiryWarning {
                    domain: domain.to_string(),
                    days_left,
                });
            }
        }
        Ok(())
    }

    fn notify(&self, domain: &str, severity: Severity, message: String) {
        self.notifier.notify(Notification {
            domain: domain.to_string(),
            severity,
            message,
        });
    }
}
