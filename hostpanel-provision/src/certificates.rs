//! ACME certificates through `certbot`'s webroot flow.
//!
//! A failed issuance or renewal never raises: the attempt is recorded on the
//! returned [`Certificate`] and a previously active certificate stays active.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use hostpanel_config::{CertificateSettings, PanelConfig};
use hostpanel_core::validation::validate_domain;
use hostpanel_core::{CommandExecutor, CommandSpec, HostError, Result};

/// `fullchain.pem` and `privkey.pem` for `domain` under `live_dir`.
pub fn certificate_paths(live_dir: &Path, domain: &str) -> (PathBuf, PathBuf) {
    let dir = live_dir.join(domain);
    (dir.join("fullchain.pem"), dir.join("privkey.pem"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    #[default]
    None,
    Pending,
    Active,
    Failed,
}

/// Outcome of the most recent issuance or renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalAttempt {
    pub at: DateTime<Utc>,
    pub succeeded: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub status: CertificateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<RenewalAttempt>,
}

impl Certificate {
    pub fn days_left(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at.map(|at| (at - now).num_days())
    }

    /// Expiry is detected for reporting only; the status is left alone.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_active(&self) -> bool {
        self.status == CertificateStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    NotDue { days_left: i64 },
    Renewed { days_left: i64 },
    Failed { reason: String },
}

pub struct CertificateManager {
    settings: CertificateSettings,
    timeout_secs: u64,
    check_timeout: u64,
    executor: Arc<dyn CommandExecutor>,
}

impl CertificateManager {
    pub fn new(config: &PanelConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            settings: config.certificates.clone(),
            timeout_secs: config.timeouts.certificate_secs,
            check_timeout: config.timeouts.default_secs,
            executor,
        }
    }

    pub fn renew_within_days(&self) -> i64 {
        self.settings.renew_within_days
    }

    pub fn warn_within_days(&self) -> i64 {
        self.settings.warn_within_days
    }

    pub fn certificate_files_present(&self, domain: &str) -> bool {
        let (chain, key) = certificate_paths(&self.settings.live_dir, domain);
        chain.is_file() && key.is_file()
    }

    /// Request a certificate for `domain` proving control through `webroot`.
    ///
    /// Only validation errors are returned as `Err`; a refused or timed out
    /// request yields a certificate with the failure recorded.
    #[instrument(skip(self, previous))]
    pub fn issue(&self, domain: &str, webroot: &Path, previous: &Certificate) -> Result<Certificate> {
        validate_domain(domain)?;
        if !webroot.is_absolute() {
            return Err(HostError::Validation(format!(
                "Webroot must be absolute: {}",
                webroot.display()
            )));
        }

        let email = self
            .settings
            .email
            .clone()
            .unwrap_or_else(|| format!("admin@{}", domain));
        let mut spec = CommandSpec::new(&self.settings.certbot)
            .args(["certonly", "--webroot", "-w"])
            .arg(webroot.to_string_lossy())
            .args(["--cert-name", domain, "-d", domain]);
        if self.settings.include_www && !domain.starts_with("www.") {
            spec = spec.args(["-d".to_string(), format!("www.{}", domain)]);
        }
        spec = spec
            .args([
                "--non-interactive",
                "--agree-tos",
                "--keep-until-expiring",
                "--email",
            ])
            .arg(email)
            .timeout_secs(self.timeout_secs);

        let result = self
            .executor
            .run_checked(&spec)
            .and_then(|_| self.expiry_date(domain));
        Ok(self.record(previous, result, "issued"))
    }

    /// Renew only when the certificate expires within `days`.
    ///
    /// The returned certificate carries the expiry read from the installed
    /// files, whatever the outcome.
    #[instrument(skip(self, current))]
    pub fn renew_if_expiring_within(
        &self,
        domain: &str,
        days: i64,
        current: &Certificate,
    ) -> Result<(Certificate, RenewalOutcome)> {
        validate_domain(domain)?;

        let installed = match self.expiry_date(domain) {
            Ok(at) => at,
            Err(e) => {
                warn!("cannot read certificate expiry: {}", e);
                let reason = e.to_string();
                let updated = self.record(current, Err(e), "renewed");
                return Ok((updated, RenewalOutcome::Failed { reason }));
            }
        };
        let mut current = current.clone();
        current.expires_at = Some(installed);

        let days_left = (installed - Utc::now()).num_days();
        if days_left > days {
            return Ok((current, RenewalOutcome::NotDue { days_left }));
        }

        info!(days_left, "renewing certificate");
        let spec = CommandSpec::new(&self.settings.certbot)
            .args([
                "renew",
                "--cert-name",
                domain,
                "--force-renewal",
                "--non-interactive",
            ])
            .timeout_secs(self.timeout_secs);
        let result = self
            .executor
            .run_checked(&spec)
            .and_then(|_| self.expiry_date(domain));

        let outcome = match &result {
            Ok(at) => RenewalOutcome::Renewed {
                days_left: (*at - Utc::now()).num_days(),
            },
            Err(e) => RenewalOutcome::Failed {
                reason: e.to_string(),
            },
        };
        Ok((self.record(&current, result, "renewed"), outcome))
    }

    /// Days until the installed certificate expires. Read-only.
    pub fn check_expiry(&self, domain: &str) -> Result<i64> {
        let at = self.expiry_date(domain)?;
        Ok((at - Utc::now()).num_days())
    }

    pub fn expiry_date(&self, domain: &str) -> Result<DateTime<Utc>> {
        validate_domain(domain)?;
        let (chain, _) = certificate_paths(&self.settings.live_dir, domain);
        let spec = CommandSpec::new(&self.settings.openssl)
            .args(["x509", "-enddate", "-noout", "-in"])
            .arg(chain.to_string_lossy())
            .timeout_secs(self.check_timeout);
        let output = self.executor.run_checked(&spec)?;
        parse_not_after(&output.stdout)
    }

    fn record(
        &self,
        previous: &Certificate,
        result: Result<DateTime<Utc>>,
        verb: &str,
    ) -> Certificate {
        let now = Utc::now();
        match result {
            Ok(expires_at) => {
                info!(expires_at = %expires_at, "certificate {}", verb);
                Certificate {
                    status: CertificateStatus::Active,
                    issuer: Some(self.settings.issuer.clone()),
                    expires_at: Some(expires_at),
                    last_attempt: Some(RenewalAttempt {
                        at: now,
                        succeeded: true,
                        message: format!("certificate {}", verb),
                    }),
                }
            }
            Err(e) => {
                warn!("certificate request failed: {}", e);
                let mut updated = previous.clone();
                if !previous.is_active() {
                    updated.status = CertificateStatus::Failed;
                }
                updated.last_attempt = Some(RenewalAttempt {
                    at: now,
                    succeeded: false,
                    message: e.to_string(),
                });
                updated
            }
        }
    }
}

/// Parse `openssl x509 -enddate` output: `notAfter=Dec  1 00:00:00 2025 GMT`.
pub fn parse_not_after(output: &str) -> Result<DateTime<Utc>> {
    let line = output
        .lines()
        .find_map(|l| l.trim().strip_prefix("notAfter="))
        .ok_or_else(|| HostError::CommandFailed {
            command: "openssl x509 -enddate".to_string(),
            code: Some(0),
            stderr: format!("no notAfter in output: {}", output.trim()),
        })?;
    let normalized = line.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S %Y GMT")
        .map(|naive| naive.and_utc())
        .map_err(|e| HostError::CommandFailed {
            command: "openssl x509 -enddate".to_string(),
            code: Some(0),
            stderr: format!("unparseable expiry '{}': {}", line, e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    fn manager(config: &PanelConfig) -> (CertificateManager, Arc<FakeHost>) {
        let host = Arc::new(FakeHost::for_config(config));
        (CertificateManager::new(config, host.clone()), host)
    }

    #[test]
    fn test_parse_not_after() {
        let at = parse_not_after("notAfter=Dec  1 00:00:00 2025 GMT\n").unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap());
        let at = parse_not_after("notAfter=Mar 15 08:30:05 2026 GMT").unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2026, 3, 15, 8, 30, 5).unwrap());
        assert!(parse_not_after("garbage").is_err());
    }

    #[test]
    fn test_issue_records_active_certificate() {
        let dir = tempdir().unwrap();
        let config = PanelConfig::rooted_at(dir.path());
        let (manager, host) = manager(&config);
        let webroot = dir.path().join("www/site");

        let cert = manager
            .issue("example.com", &webroot, &Certificate::default())
            .unwrap();
        assert_eq!(cert.status, CertificateStatus::Active);
        assert_eq!(cert.issuer.as_deref(), Some("Let's Encrypt"));
        assert!(cert.days_left(Utc::now()).unwrap() >= 89);
        assert!(manager.certificate_files_present("example.com"));

        let certbot = host.command_lines().into_iter().next().unwrap();
        assert!(certbot.starts_with("certbot certonly --webroot -w "));
        assert!(certbot.contains("-d example.com -d www.example.com"));
        assert!(certbot.contains("--email admin@example.com"));
    }

    #[test]
    fn test_failed_issue_keeps_previous_active_certificate() {
        let dir = tempdir().unwrap();
        let config = PanelConfig::rooted_at(dir.path());
        let (manager, host) = manager(&config);
        let webroot = dir.path().join("www/site");

        host.fail_on("certbot certonly", 1, "Challenge failed");
        let failed = manager
            .issue("example.com", &webroot, &Certificate::default())
            .unwrap();
        assert_eq!(failed.status, CertificateStatus::Failed);
        assert!(!failed.last_attempt.as_ref().unwrap().succeeded);

        let active = Certificate {
            status: CertificateStatus::Active,
            issuer: Some("Let's Encrypt".into()),
            expires_at: Some(Utc::now() + Duration::days(40)),
            last_attempt: None,
        };
        host.clear_failures();
        host.timeout_on("certbot certonly");
        let kept = manager.issue("example.com", &webroot, &active).unwrap();
        assert_eq!(kept.status, CertificateStatus::Active);
        assert_eq!(kept.expires_at, active.expires_at);
        assert!(kept.last_attempt.unwrap().message.contains("timed out"));
    }

    #[test]
    fn test_renew_only_inside_window() {
        let dir = tempdir().unwrap();
        let config = PanelConfig::rooted_at(dir.path());
        let (manager, host) = manager(&config);
        let current = manager
            .issue("example.com", &dir.path().join("www"), &Certificate::default())
            .unwrap();

        let (_, outcome) = manager
            .renew_if_expiring_within("example.com", 30, &current)
            .unwrap();
        assert!(matches!(outcome, RenewalOutcome::NotDue { .. }));
        assert!(!host.command_lines().iter().any(|l| l.starts_with("certbot renew")));

        host.set_certificate_expiry("example.com", Utc::now() + Duration::days(10));
        assert!((9..=10).contains(&manager.check_expiry("example.com").unwrap()));
        let (renewed, outcome) = manager
            .renew_if_expiring_within("example.com", 30, &current)
            .unwrap();
        assert!(matches!(outcome, RenewalOutcome::Renewed { days_left } if days_left >= 89));
        assert!(renewed.last_attempt.unwrap().succeeded);
    }

    #[test]
    fn test_renewal_failure_is_not_fatal() {
        let dir = tempdir().unwrap();
        let config = PanelConfig::rooted_at(dir.path());
        let (manager, host) = manager(&config);
        let current = manager
            .issue("example.com", &dir.path().join("www"), &Certificate::default())
            .unwrap();
        host.set_certificate_expiry("example.com", Utc::now() + Duration::days(3));
        host.fail_on("certbot renew", 1, "rate limited");

        let (after, outcome) = manager
            .renew_if_expiring_within("example.com", 30, &current)
            .unwrap();
        assert!(matches!(outcome, RenewalOutcome::Failed { .. }));
        assert_eq!(after.status, CertificateStatus::Active);
        assert!(after.days_left(Utc::now()).unwrap() <= 3);
    }
}
