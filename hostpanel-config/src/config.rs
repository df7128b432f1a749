//! Configuration structure for `/etc/hostpanel/config.yaml`.
//!
//! Every section has defaults matching a Debian-style host running nginx,
//! PHP-FPM, certbot, MariaDB/PostgreSQL and Exim, so an empty file is a valid
//! configuration.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Root configuration object injected into every manager.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct PanelConfig {
    pub paths: PathSettings,
    pub users: UserSettings,
    pub runtime: RuntimeSettings,
    pub proxy: ProxySettings,
    pub certificates: CertificateSettings,
    pub database: DatabaseSettings,
    pub mail: MailSettings,
    pub apps: AppSettings,
    pub timeouts: TimeoutSettings,
    pub lifecycle: LifecycleSettings,

    /// File the configuration was read from, if any.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// Directory layout of the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathSettings {
    /// Parent of every OS account's web tree (`<web_root>/<user>/data/www/<domain>`)
    pub web_root: PathBuf,
    /// Site records, the user reference registry, lock files and secrets
    pub state_dir: PathBuf,
    /// Document root serving the suspension page
    pub suspended_root: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            web_root: PathBuf::from("/var/www"),
            state_dir: PathBuf::from("/var/lib/hostpanel"),
            suspended_root: PathBuf::from("/var/www/html"),
        }
    }
}

impl PathSettings {
    pub fn sites_dir(&self) -> PathBuf {
        self.state_dir.join("sites")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.state_dir.join("secrets")
    }

    pub fn user_registry_path(&self) -> PathBuf {
        self.state_dir.join("user-references.json")
    }
}

/// OS account settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UserSettings {
    /// Primary group of every site account (also the web server group)
    pub group: String,
    /// Login shell assigned to site accounts
    pub shell: String,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            group: "www-data".to_string(),
            shell: "/usr/sbin/nologin".to_string(),
        }
    }
}

/// PHP-FPM style runtime pools. `{version}` is substituted in templates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeSettings {
    pub default_version: String,
    pub pool_dir: String,
    pub socket_dir: PathBuf,
    /// Binary used for `-t` syntax checks
    pub binary: String,
    /// Service reloaded after pool changes
    pub service: String,
    /// Socket of the shared (non-isolated) pool
    pub shared_socket: String,
    pub log_dir: PathBuf,
    pub max_workers: u32,
    pub memory_limit: String,
    pub upload_max_filesize: String,
    pub max_execution_time: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            default_version: "8.2".to_string(),
            pool_dir: "/etc/php/{version}/fpm/pool.d".to_string(),
            socket_dir: PathBuf::from("/run/php"),
            binary: "php-fpm{version}".to_string(),
            service: "php{version}-fpm".to_string(),
            shared_socket: "/run/php/php{version}-fpm.sock".to_string(),
            log_dir: PathBuf::from("/var/log"),
            max_workers: 5,
            memory_limit: "256M".to_string(),
            upload_max_filesize: "64M".to_string(),
            max_execution_time: 300,
        }
    }
}

impl RuntimeSettings {
    pub fn pool_dir_for(&self, version: &str) -> PathBuf {
        PathBuf::from(expand_version(&self.pool_dir, version))
    }

    pub fn binary_for(&self, version: &str) -> String {
        expand_version(&self.binary, version)
    }

    pub fn service_for(&self, version: &str) -> String {
        expand_version(&self.service, version)
    }

    pub fn shared_socket_for(&self, version: &str) -> PathBuf {
        PathBuf::from(expand_version(&self.shared_socket, version))
    }
}

fn expand_version(template: &str, version: &str) -> String {
    template.replace("{version}", version)
}

/// Reverse proxy (nginx) settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxySettings {
    /// Directory whose `*.conf` files the proxy includes
    pub sites_dir: PathBuf,
    pub binary: String,
    pub service: String,
    pub log_dir: PathBuf,
    /// File names hostpanel must never write or delete
    pub protected_configs: Vec<String>,
    /// Upstream for Tenant-App sites
    pub tenant_upstream: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            sites_dir: PathBuf::from("/etc/nginx/conf.d"),
            binary: "nginx".to_string(),
            service: "nginx".to_string(),
            log_dir: PathBuf::from("/var/log/nginx"),
            protected_configs: vec![
                "default".to_string(),
                "default.conf".to_string(),
                "frappe-bench-frappe".to_string(),
                "ollama-proxy.conf".to_string(),
            ],
            tenant_upstream: "http://127.0.0.1:8000".to_string(),
        }
    }
}

/// ACME certificate settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CertificateSettings {
    pub certbot: String,
    pub openssl: String,
    /// `<live_dir>/<domain>/fullchain.pem` and `privkey.pem`
    pub live_dir: PathBuf,
    pub issuer: String,
    /// Registration e-mail. Defaults to `admin@<domain>` when unset.
    pub email: Option<String>,
    /// Also request `www.<domain>`
    pub include_www: bool,
    /// Renewal lead window
    pub renew_within_days: i64,
    /// Expiry warning threshold for the renewal sweep
    pub warn_within_days: i64,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            certbot: "certbot".to_string(),
            openssl: "openssl".to_string(),
            live_dir: PathBuf::from("/etc/letsencrypt/live"),
            issuer: "Let's Encrypt".to_string(),
            email: None,
            include_www: true,
            renew_within_days: 30,
            warn_within_days: 7,
        }
    }
}

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    #[serde(alias = "mysql")]
    Mariadb,
    #[serde(alias = "postgres")]
    Postgresql,
}

impl fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseEngine::Mariadb => write!(f, "mariadb"),
            DatabaseEngine::Postgresql => write!(f, "postgresql"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSettings {
    pub default_engine: DatabaseEngine,
    pub password_length: usize,
    pub mariadb: MariaDbSettings,
    pub postgresql: PostgresSettings,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            default_engine: DatabaseEngine::Postgresql,
            password_length: 24,
            mariadb: MariaDbSettings::default(),
            postgresql: PostgresSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MariaDbSettings {
    pub client: String,
    pub admin_user: String,
    /// File holding the admin password; socket authentication when unset
    pub admin_password_file: Option<PathBuf>,
    pub host: String,
}

impl Default for MariaDbSettings {
    fn default() -> Self {
        Self {
            client: "mysql".to_string(),
            admin_user: "root".to_string(),
            admin_password_file: None,
            host: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostgresSettings {
    pub psql: String,
    /// OS account the client runs as (peer authentication)
    pub superuser: String,
    /// Tool used to switch to `superuser`
    pub run_as: String,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            psql: "psql".to_string(),
            superuser: "postgres".to_string(),
            run_as: "runuser".to_string(),
        }
    }
}

/// Exim-style mail routing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MailSettings {
    pub enabled: bool,
    pub passwd_file: PathBuf,
    pub virtual_dir: PathBuf,
    pub maildir_root: PathBuf,
    pub service: String,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            passwd_file: PathBuf::from("/etc/exim4/passwd"),
            virtual_dir: PathBuf::from("/etc/exim4/virtual"),
            maildir_root: PathBuf::from("/var/mail/vhosts"),
            service: "exim4".to_string(),
        }
    }
}

/// Application installers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub wp_cli: String,
    /// Script invoked as `<installer> <domain> <db_name> <db_user> [apps...]`
    /// with the credential on stdin
    pub tenant_installer: PathBuf,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            wp_cli: "wp".to_string(),
            tenant_installer: PathBuf::from("/usr/local/lib/hostpanel/tenant-install"),
        }
    }
}

/// Per-operation external command budgets, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutSettings {
    pub default_secs: u64,
    pub user_secs: u64,
    pub reload_secs: u64,
    pub database_secs: u64,
    pub certificate_secs: u64,
    pub app_install_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            default_secs: 30,
            user_secs: 30,
            reload_secs: 60,
            database_secs: 120,
            certificate_secs: 600,
            app_install_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Drop the database and principal when a site is deleted
    pub drop_database_on_delete: bool,
    /// Worker threads for `reconcile --all`
    pub parallelism: usize,
    /// Service manager used for reloads (`systemctl reload <service>`)
    pub service_manager: String,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            drop_database_on_delete: false,
            parallelism: 4,
            service_manager: "systemctl".to_string(),
        }
    }
}

impl PanelConfig {
    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        let absolute = [
            ("paths.web_root", self.paths.web_root.as_path()),
            ("paths.state_dir", self.paths.state_dir.as_path()),
            ("paths.suspended_root", self.paths.suspended_root.as_path()),
            ("runtime.socket_dir", self.runtime.socket_dir.as_path()),
            ("proxy.sites_dir", self.proxy.sites_dir.as_path()),
            ("certificates.live_dir", self.certificates.live_dir.as_path()),
            ("mail.virtual_dir", self.mail.virtual_dir.as_path()),
            ("mail.maildir_root", self.mail.maildir_root.as_path()),
        ];
        for (name, path) in absolute {
            if !path.is_absolute() {
                return Err(format!("{} must be an absolute path, got {}", name, path.display()));
            }
        }
        if !Path::new(&self.runtime.pool_dir).is_absolute() {
            return Err(format!(
                "runtime.pool_dir must be an absolute path, got {}",
                self.runtime.pool_dir
            ));
        }
        if self.runtime.max_workers == 0 {
            return Err("runtime.max_workers must be at least 1".to_string());
        }
        if self.certificates.renew_within_days <= 0 {
            return Err("certificates.renew_within_days must be positive".to_string());
        }
        if self.lifecycle.parallelism == 0 {
            return Err("lifecycle.parallelism must be at least 1".to_string());
        }
        let t = &self.timeouts;
        if [
            t.default_secs,
            t.user_secs,
            t.reload_secs,
            t.database_secs,
            t.certificate_secs,
            t.app_install_secs,
        ]
        .contains(&0)
        {
            return Err("timeouts must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Defaults rooted under `root`, for tests and sandboxes.
    pub fn rooted_at(root: &Path) -> Self {
        let mut config = PanelConfig::default();
        config.paths.web_root = root.join("www");
        config.paths.state_dir = root.join("state");
        config.paths.suspended_root = root.join("www/html");
        config.runtime.pool_dir = root.join("php/{version}/pool.d").to_string_lossy().into_owned();
        config.runtime.socket_dir = root.join("run/php");
        config.runtime.shared_socket = root
            .join("run/php/php{version}-fpm.sock")
            .to_string_lossy()
            .into_owned();
        config.runtime.log_dir = root.join("log");
        config.proxy.sites_dir = root.join("nginx/conf.d");
        config.proxy.log_dir = root.join("log/nginx");
        config.certificates.live_dir = root.join("letsencrypt/live");
        config.mail.passwd_file = root.join("exim4/passwd");
        config.mail.virtual_dir = root.join("exim4/virtual");
        config.mail.maildir_root = root.join("mail/vhosts");
        config.apps.tenant_installer = root.join("bin/tenant-install");
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let config: PanelConfig = serde_yaml_ng::from_str("{}").unwrap();
        assert_eq!(config, PanelConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let yaml = r#"
runtime:
  default_version: "8.3"
  max_workers: 8
database:
  default_engine: mysql
certificates:
  renew_within_days: 20
"#;
        let config: PanelConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.runtime.default_version, "8.3");
        assert_eq!(config.runtime.max_workers, 8);
        assert_eq!(config.runtime.socket_dir, PathBuf::from("/run/php"));
        assert_eq!(config.database.default_engine, DatabaseEngine::Mariadb);
        assert_eq!(config.certificates.renew_within_days, 20);
        assert_eq!(config.certificates.warn_within_days, 7);
    }

    #[test]
    fn test_version_templates() {
        let runtime = RuntimeSettings::default();
        assert_eq!(runtime.pool_dir_for("8.3"), PathBuf::from("/etc/php/8.3/fpm/pool.d"));
        assert_eq!(runtime.binary_for("8.3"), "php-fpm8.3");
        assert_eq!(runtime.service_for("8.1"), "php8.1-fpm");
        assert_eq!(
            runtime.shared_socket_for("8.2"),
            PathBuf::from("/run/php/php8.2-fpm.sock")
        );
    }

    #[test]
    fn test_validate_rejects_relative_paths_and_zero_values() {
        let mut config = PanelConfig::default();
        config.paths.web_root = PathBuf::from("www");
        assert!(config.validate().unwrap_err().contains("paths.web_root"));

        let mut config = PanelConfig::default();
        config.runtime.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = PanelConfig::default();
        config.timeouts.certificate_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rooted_at_is_valid() {
        let config = PanelConfig::rooted_at(Path::new("/tmp/sandbox"));
        assert!(config.validate().is_ok());
        assert_eq!(
            config.paths.user_registry_path(),
            PathBuf::from("/tmp/sandbox/state/user-references.json")
        );
    }
}
