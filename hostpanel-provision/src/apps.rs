//! Application installs into a site root: WordPress for CMS sites, an
//! external installer script for Tenant-App sites.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tera::Context as TeraContext;
use tracing::{info, instrument};

use hostpanel_config::{AppSettings, DatabaseEngine, PanelConfig};
use hostpanel_core::file_system::write_atomic;
use hostpanel_core::secrets::generate_random_password;
use hostpanel_core::validation::validate_domain;
use hostpanel_core::{CommandExecutor, CommandSpec, HostError, Result};

use crate::database::DatabaseGrant;
use crate::templates;

const TENANT_MARKER: &str = ".hostpanel-tenant-installed";

const WP_SALT_KEYS: &[&str] = &[
    "AUTH_KEY",
    "SECURE_AUTH_KEY",
    "LOGGED_IN_KEY",
    "NONCE_KEY",
    "AUTH_SALT",
    "SECURE_AUTH_SALT",
    "LOGGED_IN_SALT",
    "NONCE_SALT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    AlreadyInstalled,
    Installed,
}

#[derive(Serialize)]
struct Salt {
    name: &'static str,
    value: String,
}

pub struct AppInstaller {
    settings: AppSettings,
    mariadb_host: String,
    timeout_secs: u64,
    executor: Arc<dyn CommandExecutor>,
}

impl AppInstaller {
    pub fn new(config: &PanelConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            settings: config.apps.clone(),
            mariadb_host: config.database.mariadb.host.clone(),
            timeout_secs: config.timeouts.app_install_secs,
            executor,
        }
    }

    /// Download WordPress into `root` and generate `wp-config.php`.
    ///
    /// A root that already has a `wp-config.php` is considered installed.
    #[instrument(skip(self, grant, db_password))]
    pub fn install_cms(
        &self,
        domain: &str,
        root: &Path,
        grant: &DatabaseGrant,
        db_password: &str,
    ) -> Result<InstallOutcome> {
        validate_domain(domain)?;
        if grant.engine != DatabaseEngine::Mariadb {
            return Err(HostError::Validation(format!(
                "CMS sites need a MariaDB database, got {}",
                grant.engine
            )));
        }

        let wp_config = self.cms_marker(root);
        if wp_config.exists() {
            return Ok(InstallOutcome::AlreadyInstalled);
        }

        if !root.join("wp-load.php").exists() {
            let spec = CommandSpec::new(&self.settings.wp_cli)
                .args(["core", "download"])
                .arg(format!("--path={}", root.display()))
                .args(["--allow-root", "--quiet"])
                .timeout_secs(self.timeout_secs);
            self.executor.run_checked(&spec)?;
        }

        let salts: Vec<Salt> = WP_SALT_KEYS
            .iter()
            .map(|&name| Salt {
                name,
                value: generate_random_password(64),
            })
            .collect();
        let mut context = TeraContext::new();
        context.insert("domain", domain);
        context.insert("db_name", &grant.name);
        context.insert("db_user", &grant.user);
        context.insert("db_password", db_password);
        context.insert("db_host", &self.mariadb_host);
        context.insert("salts", &salts);
        let rendered = templates::render(templates::WP_CONFIG, &context)?;
        write_atomic(&wp_config, rendered.as_bytes(), 0o640)?;

        info!("WordPress installed");
        Ok(InstallOutcome::Installed)
    }

    /// Run the tenant installer once for the site.
    ///
    /// Invoked as `<installer> <domain> <db_name> <db_user> [apps...]` with the
    /// database password on stdin; success is remembered with a marker file
    /// in the site root.
    #[instrument(skip(self, grant, db_password))]
    pub fn install_tenant_app(
        &self,
        domain: &str,
        root: &Path,
        grant: &DatabaseGrant,
        db_password: &str,
        apps: &[String],
    ) -> Result<InstallOutcome> {
        validate_domain(domain)?;
        for app in apps {
            if app.is_empty() || !app.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(HostError::Validation(format!("Invalid app name '{}'", app)));
            }
        }

        let marker = self.tenant_marker(root);
        if marker.exists() {
            return Ok(InstallOutcome::AlreadyInstalled);
        }

        let spec = CommandSpec::new(self.settings.tenant_installer.to_string_lossy())
            .args([domain, grant.name.as_str(), grant.user.as_str()])
            .args(apps.iter().cloned())
            .stdin(format!("{}\n", db_password))
            .cwd(root)
            .timeout_secs(self.timeout_secs);
        self.executor.run_checked(&spec)?;

        write_atomic(&marker, b"installed\n", 0o644)?;
        info!("tenant application installed");
        Ok(InstallOutcome::Installed)
    }

    /// File whose presence means WordPress is configured in `root`.
    pub fn cms_marker(&self, root: &Path) -> PathBuf {
        root.join("wp-config.php")
    }

    /// File written once the tenant installer succeeded in `root`.
    pub fn tenant_marker(&self, root: &Path) -> PathBuf {
        root.join(TENANT_MARKER)
    }
}
