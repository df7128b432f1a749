//! nginx virtual hosts, one file per domain.
//!
//! Every write regenerates the whole file and is checked with `nginx -t`
//! before the proxy is reloaded. When the check or the reload fails, the
//! previous file is put back exactly as it was (or removed when there was
//! none), so a bad render can never take down the other sites on the host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tera::Context as TeraContext;
use tracing::{debug, info, instrument, warn};

use hostpanel_config::{PanelConfig, ProxySettings};
use hostpanel_core::file_system::{
    read_if_exists, remove_file_if_exists, restore_file, write_atomic,
};
use hostpanel_core::validation::validate_domain;
use hostpanel_core::{CommandExecutor, CommandSpec, HostError, Result};

use crate::certificates::certificate_paths;
use crate::service::reload_service;
use crate::templates;

/// Where a virtual host sends requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpstreamTarget {
    /// PHP through a runtime pool socket
    FastCgi { socket: PathBuf },
    /// Files served straight from the document root
    Static,
    /// HTTP application server
    Proxy { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHostSpec {
    pub domain: String,
    pub root: PathBuf,
    pub upstream: UpstreamTarget,
    /// Serve HTTPS and redirect plain HTTP to it
    pub tls: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

/// What a vhost write did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhostWrite {
    pub path: PathBuf,
    pub outcome: WriteOutcome,
    /// Whether the written file carries a TLS server block
    pub tls: bool,
}

impl VhostWrite {
    pub fn changed(&self) -> bool {
        self.outcome == WriteOutcome::Written
    }
}

pub struct ProxyConfigManager {
    settings: ProxySettings,
    live_dir: PathBuf,
    include_www: bool,
    suspended_root: PathBuf,
    client_max_body_size: String,
    service_manager: String,
    check_timeout: u64,
    reload_timeout: u64,
    executor: Arc<dyn CommandExecutor>,
}

impl ProxyConfigManager {
    pub fn new(config: &PanelConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            settings: config.proxy.clone(),
            live_dir: config.certificates.live_dir.clone(),
            include_www: config.certificates.include_www,
            suspended_root: config.paths.suspended_root.clone(),
            client_max_body_size: config.runtime.upload_max_filesize.clone(),
            service_manager: config.lifecycle.service_manager.clone(),
            check_timeout: config.timeouts.default_secs,
            reload_timeout: config.timeouts.reload_secs,
            executor,
        }
    }

    /// Path of the vhost file for `domain`. Protected file names are refused.
    pub fn config_path(&self, domain: &str) -> Result<PathBuf> {
        validate_domain(domain)?;
        let file_name = format!("{}.conf", domain);
        if self
            .settings
            .protected_configs
            .iter()
            .any(|p| p == domain || *p == file_name)
        {
            return Err(HostError::Validation(format!(
                "Refusing to manage protected proxy config '{}'",
                file_name
            )));
        }
        Ok(self.settings.sites_dir.join(file_name))
    }

    pub fn certificate_files_present(&self, domain: &str) -> bool {
        let (chain, key) = certificate_paths(&self.live_dir, domain);
        chain.is_file() && key.is_file()
    }

    fn server_names(&self, domain: &str) -> String {
        if self.include_www && !domain.starts_with("www.") {
            format!("{} www.{}", domain, domain)
        } else {
            domain.to_string()
        }
    }

    /// TLS is only rendered when both certificate files exist.
    fn effective_tls(&self, domain: &str, wanted: bool) -> bool {
        if wanted && !self.certificate_files_present(domain) {
            warn!(domain, "certificate files missing, serving plain HTTP");
            return false;
        }
        wanted
    }

    fn base_context(&self, domain: &str, tls: bool) -> TeraContext {
        let (chain, key) = certificate_paths(&self.live_dir, domain);
        let mut context = TeraContext::new();
        context.insert("domain", domain);
        context.insert("server_names", &self.server_names(domain));
        context.insert("tls", &tls);
        context.insert("certificate", &chain);
        context.insert("certificate_key", &key);
        context
    }

    /// Render the vhost for `spec`. Returns the content and whether it has TLS.
    pub fn render(&self, spec: &VirtualHostSpec) -> Result<(String, bool)> {
        validate_domain(&spec.domain)?;
        check_config_value("document root", &spec.root.to_string_lossy())?;
        if !spec.root.is_absolute() {
            return Err(HostError::Validation(format!(
                "Document root must be absolute: {}",
                spec.root.display()
            )));
        }
        match &spec.upstream {
            UpstreamTarget::FastCgi { socket } => {
                check_config_value("upstream socket", &socket.to_string_lossy())?
            }
            UpstreamTarget::Proxy { url } => {
                check_config_value("upstream url", url)?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(HostError::Validation(format!(
                        "Upstream url must be http(s): {}",
                        url
                    )));
                }
            }
            UpstreamTarget::Static => {}
        }

        let tls = self.effective_tls(&spec.domain, spec.tls);
        let mut context = self.base_context(&spec.domain, tls);
        context.insert("root", &spec.root);
        context.insert("upstream", &spec.upstream);
        context.insert("log_dir", &self.settings.log_dir);
        context.insert("client_max_body_size", &self.client_max_body_size);
        Ok((templates::render(templates::VHOST, &context)?, tls))
    }

    pub fn render_suspended(&self, domain: &str) -> Result<(String, bool)> {
        validate_domain(domain)?;
        let tls = self.certificate_files_present(domain);
        let mut context = self.base_context(domain, tls);
        context.insert("root", &self.suspended_root);
        Ok((templates::render(templates::SUSPENDED_VHOST, &context)?, tls))
    }

    /// Regenerate, validate and activate the vhost for `spec.domain`.
    #[instrument(skip(self, spec), fields(domain = %spec.domain))]
    pub fn write_virtual_host(&self, spec: &VirtualHostSpec) -> Result<VhostWrite> {
        let path = self.config_path(&spec.domain)?;
        let (content, tls) = self.render(spec)?;
        let outcome = self.install(&path, &content)?;
        Ok(VhostWrite { path, outcome, tls })
    }

    /// Replace the vhost with the fixed suspension placeholder.
    #[instrument(skip(self))]
    pub fn write_suspended_placeholder(&self, domain: &str) -> Result<VhostWrite> {
        let path = self.config_path(domain)?;
        self.ensure_suspended_page()?;
        let (content, tls) = self.render_suspended(domain)?;
        let outcome = self.install(&path, &content)?;
        Ok(VhostWrite { path, outcome, tls })
    }

    /// Remove the vhost and reload. Absence is not an error.
    #[instrument(skip(self))]
    pub fn remove_virtual_host(&self, domain: &str) -> Result<bool> {
        let path = self.config_path(domain)?;
        if !remove_file_if_exists(&path)? {
            debug!("no vhost to remove");
            return Ok(false);
        }
        self.reload()?;
        info!("vhost removed");
        Ok(true)
    }

    pub fn read_virtual_host(&self, domain: &str) -> Result<Option<String>> {
        let path = self.config_path(domain)?;
        Ok(read_if_exists(&path)?.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// `nginx -t` over the full proxy configuration.
    pub fn validate_config(&self) -> Result<()> {
        let spec = CommandSpec::new(&self.settings.binary)
            .arg("-t")
            .timeout_secs(self.check_timeout);
        let output = self.executor.run(&spec)?;
        if output.success() {
            Ok(())
        } else {
            Err(HostError::ConfigValidation(format!(
                "{} failed: {}",
                spec.command_line(),
                output.stderr.trim()
            )))
        }
    }

    pub fn reload(&self) -> Result<()> {
        reload_service(
            self.executor.as_ref(),
            &self.service_manager,
            &self.settings.service,
            self.reload_timeout,
        )
    }

    fn install(&self, path: &Path, content: &str) -> Result<WriteOutcome> {
        let previous = read_if_exists(path)?;
        if previous.as_deref() == Some(content.as_bytes()) {
            debug!(path = %path.display(), "vhost unchanged");
            return Ok(WriteOutcome::Unchanged);
        }

        write_atomic(path, content.as_bytes(), 0o644)?;

        if let Err(e) = self.validate_config().and_then(|_| self.reload()) {
            warn!(path = %path.display(), "restoring previous vhost: {}", e);
            if let Err(restore) = restore_file(path, previous.as_deref(), 0o644) {
                warn!(path = %path.display(), "vhost not restored: {}", restore);
            }
            return Err(e);
        }

        info!(path = %path.display(), "vhost written");
        Ok(WriteOutcome::Written)
    }

    fn ensure_suspended_page(&self) -> Result<()> {
        let page = self.suspended_root.join("suspended.html");
        if !page.exists() {
            write_atomic(&page, templates::SUSPENDED_PAGE.as_bytes(), 0o644)?;
        }
        Ok(())
    }
}

/// Values interpolated into nginx directives must not be able to end the
/// directive or open a block.
fn check_config_value(what: &str, value: &str) -> Result<()> {
    if value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '"' | '\'' | '#'))
    {
        return Err(HostError::Validation(format!(
            "Invalid characters in {}: {:?}",
            what, value
        )));
    }
    Ok(())
}
