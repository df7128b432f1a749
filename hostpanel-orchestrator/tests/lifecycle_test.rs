mod common;

use std::fs;

use chrono::{Duration, Utc};
use common::Harness;
use hostpanel_config::DatabaseEngine;
use hostpanel_core::file_system::archive_path;
use hostpanel_core::validation::derive_db_identifier;
use hostpanel_core::ErrorKind;
use hostpanel_orchestrator::{
    Action, DesiredStatus, JsonSiteStore, OrchestratorError, PoolMode, SiteRequest, SiteState,
    SiteStore, SiteType, StepName, StepStatus,
};
use hostpanel_provision::CertificateStatus;

#[test]
fn test_static_site_scenario() {
    let h = Harness::new();
    h.register("app.example.com", SiteType::Static);

    let report = h.orchestrator.provision("app.example.com").unwrap();
    assert!(report.is_success(), "{:#?}", report.steps);
    assert_eq!(report.state, SiteState::Active);
    assert!(h.host.has_user("appexample"));

    let pool = fs::read_to_string(h.pool_path("app.example.com")).unwrap();
    assert!(pool.contains("user = appexample"));
    let site = h.orchestrator.status("app.example.com").unwrap();
    assert_eq!(
        site.pool_socket.as_deref(),
        Some(
            h.config
                .runtime
                .socket_dir
                .join("php8.2-fpm-app.example.com.sock")
                .as_path()
        )
    );
    assert!(site.root.join("index.html").exists());
    assert_eq!(site.certificate.status, CertificateStatus::Active);

    let vhost = h.vhost("app.example.com");
    assert!(vhost.contains("listen 80;"));
    assert!(vhost.contains("listen 443 ssl;"));
    assert!(vhost.contains("php8.2-fpm-app.example.com.sock"));

    let report = h.orchestrator.deprovision("app.example.com").unwrap();
    assert!(report.is_success(), "{:#?}", report.steps);
    assert_eq!(report.state, SiteState::Deleted);
    assert!(!h.vhost_path("app.example.com").exists());
    assert!(!h.pool_path("app.example.com").exists());
    assert!(!h.host.has_user("appexample"));
    assert!(!site.root.exists());

    let site = h.orchestrator.status("app.example.com").unwrap();
    assert_eq!(site.state, SiteState::Deleted);
    assert!(site.last_report.is_some());
}

#[test]
fn test_second_provision_changes_nothing() {
    let h = Harness::new();
    h.register("shop.example.com", SiteType::Cms);
    h.register("plain.example.com", SiteType::Static);

    for domain in ["shop.example.com", "plain.example.com"] {
        let first = h.orchestrator.provision(domain).unwrap();
        assert!(first.is_success(), "{:#?}", first.steps);
        assert!(first.changed_any());
    }
    let vhost = h.vhost("shop.example.com");
    let site = h.orchestrator.status("shop.example.com").unwrap();
    let mark = h.host.command_count();

    for domain in ["shop.example.com", "plain.example.com"] {
        let second = h.orchestrator.provision(domain).unwrap();
        assert!(second.is_success());
        assert!(!second.changed_any(), "{:#?}", second.steps);
    }

    assert_eq!(h.host.mutating_since(mark), Vec::<String>::new());
    assert_eq!(h.vhost("shop.example.com"), vhost);
    let again = h.orchestrator.status("shop.example.com").unwrap();
    assert_eq!(again.database, site.database);
    assert_eq!(again.certificate, site.certificate);
    assert_eq!(again.pool_socket, site.pool_socket);
}

#[test]
fn test_cms_site_gets_database_and_wordpress() {
    let h = Harness::new();
    h.register("shop.example.com", SiteType::Cms);
    let report = h.orchestrator.provision("shop.example.com").unwrap();
    assert!(report.is_success(), "{:#?}", report.steps);

    let site = h.orchestrator.status("shop.example.com").unwrap();
    let grant = site.database.clone().unwrap();
    assert_eq!(grant.engine, DatabaseEngine::Mariadb);
    assert!(h.host.has_database("shop_examp_95162"));
    assert!(h.host.has_principal("shop_examp_95162"));

    let password = fs::read_to_string(&grant.credential_ref).unwrap();
    let password = password.trim();
    let wp_config = fs::read_to_string(site.root.join("wp-config.php")).unwrap();
    assert!(wp_config.contains(password));
    assert!(h
        .host
        .command_lines()
        .iter()
        .all(|line| !line.contains(password)));
    assert!(h
        .host
        .command_lines()
        .iter()
        .any(|line| line.starts_with("chown -R shopexample:www-data")));
}

#[test]
fn test_tenant_app_is_proxied_to_the_application() {
    let h = Harness::new();
    let mut request = SiteRequest::new("erp.example.com", SiteType::TenantApp);
    request.apps = vec!["erpnext".to_string()];
    h.orchestrator.register(&request).unwrap();

    let report = h.orchestrator.provision("erp.example.com").unwrap();
    assert!(report.is_success(), "{:#?}", report.steps);
    assert!(report.step(StepName::RuntimePool).is_none());

    let site = h.orchestrator.status("erp.example.com").unwrap();
    assert_eq!(site.pool_mode, PoolMode::None);
    assert_eq!(site.database.unwrap().engine, DatabaseEngine::Postgresql);
    assert!(h.host.has_principal("erp_exampl_69560"));
    assert!(h.vhost("erp.example.com").contains("proxy_pass http://127.0.0.1:8000;"));

    let installer = h
        .host
        .commands()
        .into_iter()
        .find(|c| c.program.ends_with("tenant-install"))
        .unwrap();
    assert_eq!(
        installer.args,
        vec!["erp.example.com", "erp_exampl_69560", "erp_exampl_69560", "erpnext"]
    );
    assert!(installer.stdin.is_some());
}

#[test]
fn test_shared_account_reference_counting() {
    let h = Harness::new();
    for domain in ["one.example.com", "two.example.com"] {
        let mut request = SiteRequest::new(domain, SiteType::Static);
        request.os_user = Some("tenant".to_string());
        h.orchestrator.register(&request).unwrap();
        assert!(h.orchestrator.provision(domain).unwrap().is_success());
    }
    let references = h.orchestrator.user_references().unwrap();
    assert_eq!(references["tenant"].len(), 2);

    let two_vhost = h.vhost("two.example.com");
    let report = h.orchestrator.deprovision("one.example.com").unwrap();
    assert!(report.is_success(), "{:#?}", report.steps);
    assert!(h.host.has_user("tenant"));
    assert_eq!(h.vhost("two.example.com"), two_vhost);
    assert!(h.pool_path("two.example.com").exists());
    assert_eq!(
        h.orchestrator.user_references().unwrap()["tenant"]
            .iter()
            .collect::<Vec<_>>(),
        vec!["two.example.com"]
    );
    assert!(!h
        .host
        .command_lines()
        .iter()
        .any(|line| line.starts_with("userdel")));

    h.orchestrator.deprovision("two.example.com").unwrap();
    assert!(!h.host.has_user("tenant"));
    assert!(!h.orchestrator.user_references().unwrap().contains_key("tenant"));
}

#[test]
fn test_invalid_domain_touches_nothing() {
    let h = Harness::new();
    let err = h
        .orchestrator
        .register(&SiteRequest::new("Invalid Domain!", SiteType::Static))
        .unwrap_err();
    assert!(err.is_validation());
    assert!(h.orchestrator.provision("Invalid Domain!").unwrap_err().is_validation());

    assert_eq!(h.host.command_count(), 0);
    assert!(!h.config.paths.web_root.exists());
    assert!(!h.config.paths.state_dir.exists());
    assert!(!h.config.proxy.sites_dir.exists());
}

#[test]
fn test_failed_proxy_validation_keeps_previous_vhost() {
    let h = Harness::new();
    h.register("app.example.com", SiteType::Static);
    h.orchestrator.provision("app.example.com").unwrap();
    let before = fs::read(h.vhost_path("app.example.com")).unwrap();

    h.host.fail_on("nginx -t", 1, "nginx: [emerg] unexpected \"}\"");
    let report = h.orchestrator.suspend("app.example.com").unwrap();
    assert_eq!(
        report.state,
        SiteState::Degraded {
            target: DesiredStatus::Suspended
        }
    );
    let step = report.step(StepName::ProxySuspended).unwrap();
    assert_eq!(step.error_kind(), Some(ErrorKind::ConfigValidation));
    assert_eq!(fs::read(h.vhost_path("app.example.com")).unwrap(), before);

    h.host.clear_failures();
    let report = h.orchestrator.suspend("app.example.com").unwrap();
    assert_eq!(report.state, SiteState::Suspended);
}

#[test]
fn test_suspend_resume_round_trip() {
    let h = Harness::new();
    h.register("app.example.com", SiteType::Static);
    h.orchestrator.provision("app.example.com").unwrap();
    let active = h.vhost("app.example.com");
    let pool = fs::read(h.pool_path("app.example.com")).unwrap();

    let report = h.orchestrator.suspend("app.example.com").unwrap();
    assert_eq!(report.state, SiteState::Suspended);
    let suspended = h.vhost("app.example.com");
    assert!(suspended.contains("suspended.html"));
    assert!(!suspended.contains("fastcgi_pass"));
    assert!(h.config.paths.suspended_root.join("suspended.html").exists());
    assert!(h.host.has_user("appexample"));
    assert_eq!(fs::read(h.pool_path("app.example.com")).unwrap(), pool);

    let report = h.orchestrator.reconcile("app.example.com", DesiredStatus::Active).unwrap();
    assert_eq!(report.action, Action::Resume);
    assert_eq!(report.state, SiteState::Active);
    assert_eq!(h.vhost("app.example.com"), active);
}

#[test]
fn test_hard_failure_degrades_and_skips_dependents() {
    let h = Harness::new();
    h.register("app.example.com", SiteType::Static);
    h.host.fail_on("php-fpm8.2 -t", 1, "ERROR: invalid pool");

    let report = h.orchestrator.provision("app.example.com").unwrap();
    assert_eq!(
        report.state,
        SiteState::Degraded {
            target: DesiredStatus::Active
        }
    );
    assert!(report.step(StepName::SystemUser).unwrap().succeeded());
    assert!(report.step(StepName::SiteRoot).unwrap().succeeded());
    assert_eq!(
        report.step(StepName::RuntimePool).unwrap().error_kind(),
        Some(ErrorKind::ConfigValidation)
    );
    for dependent in [StepName::ProxyHttp, StepName::ProxyHttps] {
        assert!(matches!(
            report.step(dependent).unwrap().status,
            StepStatus::Skipped { .. }
        ));
    }
    assert!(!h.pool_path("app.example.com").exists());
    assert!(!h.vhost_path("app.example.com").exists());

    let stored = h.orchestrator.status("app.example.com").unwrap();
    assert_eq!(stored.last_report.as_ref(), Some(&report));

    h.host.clear_failures();
    let report = h.orchestrator.reconcile("app.example.com", DesiredStatus::Active).unwrap();
    assert_eq!(report.action, Action::Provision);
    assert_eq!(report.state, SiteState::Active);
    assert!(h.vhost_path("app.example.com").exists());
}

#[test]
fn test_timeout_is_a_retryable_step_failure() {
    let h = Harness::new();
    h.register("app.example.com", SiteType::Static);
    h.host.timeout_on("useradd");

    let report = h.orchestrator.provision("app.example.com").unwrap();
    let step = report.step(StepName::SystemUser).unwrap();
    assert!(matches!(
        step.status,
        StepStatus::Failed {
            kind: ErrorKind::ExternalTimeout,
            retryable: true,
            ..
        }
    ));
    for dependent in [StepName::RuntimePool, StepName::SiteRoot, StepName::Certificate] {
        assert!(matches!(
            report.step(dependent).unwrap().status,
            StepStatus::Skipped { .. }
        ));
    }
    assert!(!report.reached_target());
}

#[test]
fn test_certificate_failure_keeps_site_available() {
    let h = Harness::new();
    h.register("app.example.com", SiteType::Static);
    h.host.fail_on("certbot certonly", 1, "Challenge failed");

    let report = h.orchestrator.provision("app.example.com").unwrap();
    assert_eq!(report.state, SiteState::Active);
    assert!(report.reached_target());
    assert!(!report.is_success());
    assert!(matches!(
        report.step(StepName::ProxyHttps).unwrap().status,
        StepStatus::Skipped { .. }
    ));

    let site = h.orchestrator.status("app.example.com").unwrap();
    assert_eq!(site.certificate.status, CertificateStatus::Failed);
    assert!(!site.certificate.last_attempt.unwrap().succeeded);
    assert!(!h.vhost("app.example.com").contains("listen 443"));
}

#[test]
fn test_invalid_transitions() {
    let h = Harness::new();
    h.register("app.example.com", SiteType::Static);

    assert!(matches!(
        h.orchestrator.suspend("app.example.com"),
        Err(OrchestratorError::InvalidTransition { .. })
    ));
    assert!(matches!(
        h.orchestrator.resume("app.example.com"),
        Err(OrchestratorError::InvalidTransition { .. })
    ));
    assert_eq!(h.host.command_count(), 0);

    h.orchestrator.provision("app.example.com").unwrap();
    h.orchestrator.deprovision("app.example.com").unwrap();
    let mark = h.host.command_count();

    let report = h.orchestrator.deprovision("app.example.com").unwrap();
    assert_eq!(report.action, Action::None);
    assert!(report.steps.is_empty());
    for desired in [DesiredStatus::Active, DesiredStatus::Suspended] {
        assert!(matches!(
            h.orchestrator.reconcile("app.example.com", desired),
            Err(OrchestratorError::InvalidTransition { .. })
        ));
    }
    assert_eq!(h.host.command_count(), mark);

    assert!(matches!(
        h.orchestrator.provision("unknown.example.com"),
        Err(OrchestratorError::SiteNotFound(_))
    ));
}

#[test]
fn test_deleted_site_can_be_registered_again() {
    let h = Harness::new();
    h.register("app.example.com", SiteType::Static);
    h.orchestrator.provision("app.example.com").unwrap();
    h.orchestrator.deprovision("app.example.com").unwrap();

    h.register("app.example.com", SiteType::Static);
    let site = h.orchestrator.status("app.example.com").unwrap();
    assert_eq!(site.state, SiteState::New);
    let report = h.orchestrator.provision("app.example.com").unwrap();
    assert!(report.is_success(), "{:#?}", report.steps);
    assert!(h.host.has_user("appexample"));
}

#[test]
fn test_database_is_kept_unless_configured() {
    let keep = Harness::new();
    keep.register("shop.example.com", SiteType::Cms);
    keep.orchestrator.provision("shop.example.com").unwrap();
    let report = keep.orchestrator.deprovision("shop.example.com").unwrap();
    assert!(report.step(StepName::DropDatabase).is_none());
    assert!(keep.host.has_database("shop_examp_95162"));

    let drop = Harness::with_config(|config| config.lifecycle.drop_database_on_delete = true);
    drop.register("shop.example.com", SiteType::Cms);
    drop.orchestrator.provision("shop.example.com").unwrap();
    let report = drop.orchestrator.deprovision("shop.example.com").unwrap();
    assert!(report.step(StepName::DropDatabase).unwrap().succeeded());
    assert!(!drop.host.has_database("shop_examp_95162"));
    assert!(!drop.host.has_principal("shop_examp_95162"));
}

#[test]
fn test_runtime_version_change_replaces_pool() {
    let h = Harness::new();
    h.register("app.example.com", SiteType::Static);
    h.orchestrator.provision("app.example.com").unwrap();

    let mut request = SiteRequest::new("app.example.com", SiteType::Static);
    request.runtime_version = Some("8.3".to_string());
    h.orchestrator.register(&request).unwrap();
    let report = h.orchestrator.provision("app.example.com").unwrap();
    assert!(report.is_success(), "{:#?}", report.steps);

    assert!(!h.pool_path("app.example.com").exists());
    let new_pool = h
        .config
        .runtime
        .pool_dir_for("8.3")
        .join("app.example.com.conf");
    assert!(new_pool.exists());
    assert!(h.vhost("app.example.com").contains("php8.3-fpm-app.example.com.sock"));
}

#[test]
fn test_reconcile_all_converges_every_site() {
    let h = Harness::new();
    for domain in ["a.example.com", "b.example.com", "c.example.com"] {
        h.register(domain, SiteType::Static);
    }
    h.orchestrator.provision("c.example.com").unwrap();
    h.orchestrator.suspend("c.example.com").unwrap();

    let runs = h.orchestrator.reconcile_all().unwrap();
    assert_eq!(runs.len(), 3);
    for run in &runs {
        let report = run.result.as_ref().unwrap();
        assert!(report.reached_target(), "{}: {:#?}", run.domain, report.steps);
    }
    assert_eq!(
        h.orchestrator.status("a.example.com").unwrap().state,
        SiteState::Active
    );
    assert_eq!(
        h.orchestrator.status("c.example.com").unwrap().state,
        SiteState::Suspended
    );

    let mark = h.host.command_count();
    let runs = h.orchestrator.reconcile_all().unwrap();
    assert!(runs.iter().all(|run| run.result.is_ok()));
    assert_eq!(h.host.mutating_since(mark), Vec::<String>::new());
}

#[test]
fn test_similar_domains_get_separate_databases() {
    let h = Harness::new();
    h.register("my-site.example.com", SiteType::Cms);
    h.register("my-site.example.org", SiteType::Cms);

    let first = h.orchestrator.provision("my-site.example.com").unwrap();
    assert!(first.is_success(), "{:#?}", first.steps);
    let taken = h
        .orchestrator
        .status("my-site.example.com")
        .unwrap()
        .database
        .unwrap();

    let mark = h.host.command_count();
    let second = h.orchestrator.provision("my-site.example.org").unwrap();
    assert!(second.is_success(), "{:#?}", second.steps);
    let grant = h
        .orchestrator
        .status("my-site.example.org")
        .unwrap()
        .database
        .unwrap();

    assert_ne!(grant.name, taken.name);
    assert_ne!(grant.user, taken.user);
    assert!(h.host.has_database(&taken.name));
    assert!(h.host.has_database(&grant.name));
    assert!(h
        .host
        .commands_since(mark)
        .iter()
        .filter_map(|c| c.stdin.as_deref())
        .all(|sql| !sql.contains(&taken.name)));
}

#[test]
fn test_register_refuses_a_database_held_by_another_site() {
    let h = Harness::new();
    h.register("one.example.com", SiteType::Cms);

    let store = JsonSiteStore::new(h.config.paths.sites_dir());
    let mut one = store.load("one.example.com").unwrap().unwrap();
    let claimed = derive_db_identifier("two.example.com").unwrap();
    let grant = one.database.as_mut().unwrap();
    grant.name = claimed.clone();
    grant.user = claimed;
    store.save(&one).unwrap();

    let err = h
        .orchestrator
        .register(&SiteRequest::new("two.example.com", SiteType::Cms))
        .unwrap_err();
    assert!(err.is_validation(), "{}", err);
    assert!(err.to_string().contains("one.example.com"));
    assert!(store.load("two.example.com").unwrap().is_none());

    h.register("two.example.com", SiteType::Static);
}

#[test]
fn test_failed_chown_of_site_root_converges_on_retry() {
    let h = Harness::new();
    h.register("app.example.com", SiteType::Static);
    h.host.fail_on("chown", 1, "chown: changing ownership: Operation not permitted");

    let report = h.orchestrator.provision("app.example.com").unwrap();
    assert!(!report.reached_target());
    assert!(!report.step(StepName::SiteRoot).unwrap().succeeded());
    let site = h.orchestrator.status("app.example.com").unwrap();
    assert!(site.root.join("index.html").exists());

    h.host.clear_failures();
    let mark = h.host.command_count();
    let report = h.orchestrator.provision("app.example.com").unwrap();
    assert_eq!(report.state, SiteState::Active);
    assert!(report.step(StepName::SiteRoot).unwrap().changed());
    assert!(h
        .host
        .mutating_since(mark)
        .iter()
        .any(|line| line.starts_with("chown -R appexample:www-data")));

    let mark = h.host.command_count();
    let report = h.orchestrator.provision("app.example.com").unwrap();
    assert!(!report.changed_any(), "{:#?}", report.steps);
    assert_eq!(h.host.mutating_since(mark), Vec::<String>::new());
}

#[test]
fn test_failed_chown_after_app_install_converges_on_retry() {
    let h = Harness::new();
    h.register("shop.example.com", SiteType::Cms);
    let root = h.orchestrator.status("shop.example.com").unwrap().root;
    let chown_root = format!("chown -R shopexample:www-data {}", root.display());
    h.host.fail_on(&chown_root, 1, "chown: Operation not permitted");

    let report = h.orchestrator.provision("shop.example.com").unwrap();
    assert!(!report.step(StepName::AppInstall).unwrap().succeeded());
    assert!(root.join("wp-config.php").exists());

    h.host.clear_failures();
    let mark = h.host.command_count();
    let report = h.orchestrator.provision("shop.example.com").unwrap();
    assert_eq!(report.state, SiteState::Active);
    assert!(report.step(StepName::AppInstall).unwrap().changed());
    assert!(h.host.mutating_since(mark).contains(&chown_root));

    let mark = h.host.command_count();
    h.orchestrator.provision("shop.example.com").unwrap();
    assert_eq!(h.host.mutating_since(mark), Vec::<String>::new());
}

#[test]
fn test_account_is_kept_when_archiving_fails() {
    let h = Harness::new();
    h.register("app.example.com", SiteType::Static);
    h.orchestrator.provision("app.example.com").unwrap();
    let root = h.orchestrator.status("app.example.com").unwrap().root;

    // Occupy every archive name the next minute could produce.
    let now = Utc::now();
    let blockers: Vec<_> = (0..60)
        .map(|secs| archive_path(&root, now + Duration::seconds(secs)))
        .collect();
    for blocker in &blockers {
        fs::create_dir_all(blocker).unwrap();
    }

    let report = h.orchestrator.deprovision("app.example.com").unwrap();
    assert!(!report.step(StepName::ArchiveRoot).unwrap().succeeded());
    assert!(matches!(
        report.step(StepName::ReleaseUser).unwrap().status,
        StepStatus::Skipped { .. }
    ));
    assert!(root.exists());
    assert!(h.host.has_user("appexample"));
    assert!(h
        .orchestrator
        .user_references()
        .unwrap()
        .contains_key("appexample"));

    for blocker in &blockers {
        fs::remove_dir_all(blocker).unwrap();
    }
    let report = h.orchestrator.deprovision("app.example.com").unwrap();
    assert_eq!(report.state, SiteState::Deleted);
    assert!(!h.host.has_user("appexample"));
}
