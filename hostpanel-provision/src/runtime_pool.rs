//! PHP-FPM worker pools, one per site.
//!
//! A pool runs as the site's OS account, listens on its own unix socket and is
//! confined to the account's web tree with `open_basedir`.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tera::Context as TeraContext;
use tracing::{info, instrument, warn};

use hostpanel_config::{PanelConfig, RuntimeSettings};
use hostpanel_core::file_system::{
    read_if_exists, remove_file_if_exists, restore_file, write_atomic,
};
use hostpanel_core::validation::{validate_domain, validate_runtime_version, validate_system_user};
use hostpanel_core::{CommandExecutor, CommandSpec, HostError, Result};

use crate::service::reload_service;
use crate::templates;

/// Functions a tenant's code may not call: process execution and raw sockets.
const DISABLED_FUNCTIONS: &[&str] = &[
    "exec",
    "passthru",
    "shell_exec",
    "system",
    "proc_open",
    "popen",
    "pcntl_exec",
    "curl_exec",
    "curl_multi_exec",
    "parse_ini_file",
    "show_source",
    "fsockopen",
    "pfsockopen",
    "socket_create",
];

/// A pool as configured on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePool {
    pub domain: String,
    pub os_user: String,
    pub version: String,
    pub max_workers: u32,
    pub socket: PathBuf,
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOutcome {
    pub pool: RuntimePool,
    pub changed: bool,
}

pub struct RuntimePoolManager {
    settings: RuntimeSettings,
    web_root: PathBuf,
    group: String,
    service_manager: String,
    check_timeout: u64,
    reload_timeout: u64,
    executor: Arc<dyn CommandExecutor>,
}

impl RuntimePoolManager {
    pub fn new(config: &PanelConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            settings: config.runtime.clone(),
            web_root: config.paths.web_root.clone(),
            group: config.users.group.clone(),
            service_manager: config.lifecycle.service_manager.clone(),
            check_timeout: config.timeouts.default_secs,
            reload_timeout: config.timeouts.reload_secs,
            executor,
        }
    }

    pub fn config_path(&self, domain: &str, version: &str) -> PathBuf {
        self.settings
            .pool_dir_for(version)
            .join(format!("{}.conf", domain))
    }

    pub fn socket_path(&self, domain: &str, version: &str) -> PathBuf {
        self.settings
            .socket_dir
            .join(format!("php{}-fpm-{}.sock", version, domain))
    }

    pub fn pool_exists(&self, domain: &str, version: &str) -> bool {
        self.config_path(domain, version).exists()
    }

    fn describe(&self, domain: &str, os_user: &str, version: &str, max_workers: u32) -> RuntimePool {
        RuntimePool {
            domain: domain.to_string(),
            os_user: os_user.to_string(),
            version: version.to_string(),
            max_workers,
            socket: self.socket_path(domain, version),
            config_path: self.config_path(domain, version),
        }
    }

    pub fn render(&self, pool: &RuntimePool) -> Result<String> {
        let max_spare = pool.max_workers.min(3);
        let start_servers = max_spare.min(2);
        let min_spare = start_servers.min(1);
        let home = self.web_root.join(&pool.os_user);
        let error_log = self
            .settings
            .log_dir
            .join(format!("php{}-fpm-{}.log", pool.version, pool.domain));

        let mut context = TeraContext::new();
        context.insert("domain", &pool.domain);
        context.insert("user", &pool.os_user);
        context.insert("group", &self.group);
        context.insert("socket", &pool.socket);
        context.insert("max_workers", &pool.max_workers);
        context.insert("start_servers", &start_servers);
        context.insert("min_spare", &min_spare);
        context.insert("max_spare", &max_spare);
        context.insert(
            "open_basedir",
            &format!("{}:/tmp:/usr/share/php", home.display()),
        );
        context.insert("disable_functions", &DISABLED_FUNCTIONS.join(","));
        context.insert("memory_limit", &self.settings.memory_limit);
        context.insert("upload_max", &self.settings.upload_max_filesize);
        context.insert("max_execution_time", &self.settings.max_execution_time);
        context.insert("error_log", &error_log);
        templates::render(templates::POOL, &context)
    }

    /// Create or update the pool for `domain`.
    ///
    /// An on-disk config identical to the rendered one is left alone and no
    /// reload happens. A config that fails the runtime's syntax test, or that
    /// the service refuses to reload, is removed again.
    #[instrument(skip(self), fields(domain = %domain))]
    pub fn create_pool(
        &self,
        domain: &str,
        os_user: &str,
        version: &str,
        max_workers: u32,
    ) -> Result<PoolOutcome> {
        validate_domain(domain)?;
        validate_system_user(os_user)?;
        validate_runtime_version(version)?;
        if max_workers == 0 {
            return Err(HostError::Validation(
                "Runtime pool needs at least one worker".to_string(),
            ));
        }

        let pool = self.describe(domain, os_user, version, max_workers);
        let rendered = self.render(&pool)?;

        let previous = read_if_exists(&pool.config_path)?;
        if previous.as_deref() == Some(rendered.as_bytes()) {
            return Ok(PoolOutcome {
                pool,
                changed: false,
            });
        }

        write_atomic(&pool.config_path, rendered.as_bytes(), 0o644)?;

        if let Err(e) = self.check_and_reload(version) {
            warn!("restoring previous pool config: {}", e);
            if let Err(restore) = restore_file(&pool.config_path, previous.as_deref(), 0o644) {
                warn!(path = %pool.config_path.display(), "pool config not restored: {}", restore);
            }
            return Err(e);
        }

        info!(socket = %pool.socket.display(), "runtime pool configured");
        Ok(PoolOutcome {
            pool,
            changed: true,
        })
    }

    /// Remove the pool config and reload. Returns whether a config was removed.
    #[instrument(skip(self), fields(domain = %domain))]
    pub fn delete_pool(&self, domain: &str, version: &str) -> Result<bool> {
        validate_domain(domain)?;
        validate_runtime_version(version)?;
        let path = self.config_path(domain, version);
        if !remove_file_if_exists(&path)? {
            return Ok(false);
        }
        reload_service(
            self.executor.as_ref(),
            &self.service_manager,
            &self.settings.service_for(version),
            self.reload_timeout,
        )?;
        info!("runtime pool removed");
        Ok(true)
    }

    fn check_and_reload(&self, version: &str) -> Result<()> {
        let test = CommandSpec::new(self.settings.binary_for(version))
            .arg("-t")
            .timeout_secs(self.check_timeout);
        let output = self.executor.run(&test)?;
        if !output.success() {
            return Err(HostError::ConfigValidation(format!(
                "{} rejected the pool configuration: {}",
                test.command_line(),
                output.stderr.trim()
            )));
        }
        reload_service(
            self.executor.as_ref(),
            &self.service_manager,
            &self.settings.service_for(version),
            self.reload_timeout,
        )
    }

    /// Socket of the shared pool for sites without a dedicated one.
    pub fn shared_socket(&self, version: &str) -> PathBuf {
        self.settings.shared_socket_for(version)
    }
}
