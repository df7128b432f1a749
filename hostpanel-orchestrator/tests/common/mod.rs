#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use hostpanel_config::PanelConfig;
use hostpanel_orchestrator::{
    CollectingNotifier, JsonSiteStore, Orchestrator, SiteRequest, SiteType,
};
use hostpanel_provision::testing::FakeHost;

/// An orchestrator wired to a fake host inside a temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub config: PanelConfig,
    pub host: Arc<FakeHost>,
    pub notifier: Arc<CollectingNotifier>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut PanelConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PanelConfig::rooted_at(dir.path());

        let admin_password = dir.path().join("mysql-admin-password");
        fs::write(&admin_password, "adminpw\n").unwrap();
        config.database.mariadb.admin_password_file = Some(admin_password);
        adjust(&mut config);

        let host = Arc::new(FakeHost::for_config(&config));
        let notifier = Arc::new(CollectingNotifier::new());
        let store = Arc::new(JsonSiteStore::new(config.paths.sites_dir()));
        let orchestrator =
            Orchestrator::new(config.clone(), host.clone(), store, notifier.clone());

        Self {
            dir,
            config,
            host,
            notifier,
            orchestrator,
        }
    }

    pub fn register(&self, domain: &str, site_type: SiteType) {
        self.orchestrator
            .register(&SiteRequest::new(domain, site_type))
            .unwrap();
    }

    pub fn vhost_path(&self, domain: &str) -> PathBuf {
        self.config.proxy.sites_dir.join(format!("{}.conf", domain))
    }

    pub fn vhost(&self, domain: &str) -> String {
        fs::read_to_string(self.vhost_path(domain)).unwrap()
    }

    pub fn pool_path(&self, domain: &str) -> PathBuf {
        self.config
            .runtime
            .pool_dir_for("8.2")
            .join(format!("{}.conf", domain))
    }
}
