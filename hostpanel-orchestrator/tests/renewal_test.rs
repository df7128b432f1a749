mod common;

use chrono::{Duration, Utc};

use common::Harness;
use hostpanel_orchestrator::{Severity, SiteType};

#[test]
fn test_sweep_renews_only_expiring_certificates() {
    let h = Harness::new();
    for domain in ["soon.example.com", "later.example.com"] {
        h.register(domain, SiteType::Static);
        assert!(h.orchestrator.provision(domain).unwrap().is_success());
    }
    h.host
        .set_certificate_expiry("soon.example.com", Utc::now() + Duration::days(5));
    let mark = h.host.command_count();

    let summary = h.orchestrator.renew_certificates(None).unwrap();
    assert_eq!(summary.renewed, vec!["soon.example.com"]);
    assert_eq!(summary.not_due, vec!["later.example.com"]);
    assert!(summary.is_clean());
    assert!(summary.expiring.is_empty());

    let lines: Vec<String> = h
        .host
        .commands_since(mark)
        .iter()
        .map(|c| c.line())
        .collect();
    assert!(lines
        .iter()
        .any(|l| l.starts_with("certbot renew --cert-name soon.example.com")));
    assert!(!lines.iter().any(|l| l.contains("renew --cert-name later.example.com")));
    assert!(lines.iter().any(|l| l == "systemctl reload nginx"));

    let site = h.orchestrator.status("soon.example.com").unwrap();
    let days_left = site.certificate.days_left(Utc::now()).unwrap();
    assert!(days_left > 80, "renewed certificate has {} days", days_left);
    assert!(site.certificate.last_attempt.unwrap().succeeded);
}

#[test]
fn test_sweep_warns_about_expiring_and_expired_certificates() {
    let h = Harness::new();
    for domain in ["warn.example.com", "gone.example.com"] {
        h.register(domain, SiteType::Static);
        h.orchestrator.provision(domain).unwrap();
    }
    h.host
        .set_certificate_expiry("warn.example.com", Utc::now() + Duration::days(3) + Duration::hours(1));
    h.host
        .set_certificate_expiry("gone.example.com", Utc::now() - Duration::days(2));
    h.host.fail_on("certbot renew", 1, "rate limited");
    h.notifier.take();

    let summary = h.orchestrator.renew_certificates(Some(1)).unwrap();
    assert!(summary.renewed.is_empty());
    assert_eq!(summary.not_due, vec!["warn.example.com"]);
    assert_eq!(summary.expiring.len(), 1);
    assert_eq!(summary.expiring[0].domain, "warn.example.com");
    assert_eq!(summary.expiring[0].days_left, 3);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].domain, "gone.example.com");
    assert_eq!(summary.expired, vec!["gone.example.com"]);
    assert!(!summary.is_clean());

    let notifications = h.notifier.take();
    assert!(notifications
        .iter()
        .any(|n| n.domain == "warn.example.com" && n.severity == Severity::Warning));
    assert!(notifications
        .iter()
        .any(|n| n.domain == "gone.example.com" && n.severity == Severity::Error));
}

#[test]
fn test_sweep_skips_sites_without_certificates() {
    let h = Harness::new();
    h.register("new.example.com", SiteType::Static);
    let summary = h.orchestrator.renew_certificates(None).unwrap();
    assert_eq!(summary, Default::default());
    assert_eq!(h.host.command_count(), 0);
    assert!(h.orchestrator.renew_certificates(Some(-1)).is_err());
}
