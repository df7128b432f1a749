//! Site document roots under `<web_root>/<account>/data/www/<domain>`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tera::Context as TeraContext;
use tracing::{debug, info, instrument};

use hostpanel_config::PanelConfig;
use hostpanel_core::file_system::{archive_dir, ensure_within, set_mode, write_atomic};
use hostpanel_core::validation::{validate_domain, validate_system_user};
use hostpanel_core::{CommandExecutor, CommandSpec, Result};

use crate::templates;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteRoot {
    pub path: PathBuf,
    pub created: bool,
    /// Ownership had to be (re)applied
    pub chowned: bool,
}

impl SiteRoot {
    pub fn changed(&self) -> bool {
        self.created || self.chowned
    }
}

pub struct SiteFilesystem {
    web_root: PathBuf,
    group: String,
    timeout_secs: u64,
    executor: Arc<dyn CommandExecutor>,
}

impl SiteFilesystem {
    pub fn new(config: &PanelConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            web_root: config.paths.web_root.clone(),
            group: config.users.group.clone(),
            timeout_secs: config.timeouts.user_secs,
            executor,
        }
    }

    /// Home of an account's sites.
    pub fn account_dir(&self, os_user: &str) -> Result<PathBuf> {
        validate_system_user(os_user)?;
        ensure_within(&self.web_root, &self.web_root.join(os_user))
    }

    /// Deterministic document root of `domain` owned by `os_user`.
    pub fn site_root(&self, os_user: &str, domain: &str) -> Result<PathBuf> {
        validate_domain(domain)?;
        let account_dir = self.account_dir(os_user)?;
        ensure_within(&account_dir, &account_dir.join("data/www").join(domain))
    }

    /// Create the document root with a welcome page and hand the account's
    /// tree to the account.
    ///
    /// An existing root keeps its content; its ownership is still checked so a
    /// run after a failed `chown` converges.
    #[instrument(skip(self))]
    pub fn ensure_site_root(&self, os_user: &str, domain: &str) -> Result<SiteRoot> {
        let path = self.site_root(os_user, domain)?;
        let created = !path.is_dir();
        if created {
            fs::create_dir_all(&path)?;
            set_mode(&path, 0o755)?;

            let mut context = TeraContext::new();
            context.insert("domain", domain);
            let page = templates::render(templates::WELCOME_PAGE, &context)?;
            write_atomic(&path.join("index.html"), page.as_bytes(), 0o644)?;
            info!(path = %path.display(), "site root created");
        }

        let chowned = self.ensure_owner(os_user, &self.account_dir(os_user)?, &path)?;
        Ok(SiteRoot {
            path,
            created,
            chowned,
        })
    }

    /// `user:group` owning `path`, as reported by `stat`.
    pub fn owner_of(&self, path: &Path) -> Result<String> {
        let path = ensure_within(&self.web_root, path)?;
        let spec = CommandSpec::new("stat")
            .args(["-c", "%U:%G"])
            .arg(path.to_string_lossy())
            .timeout_secs(self.timeout_secs);
        Ok(self.executor.run_checked(&spec)?.stdout.trim().to_string())
    }

    /// Recursively chown `path` unless `marker` already belongs to the account.
    ///
    /// Returns whether `chown` ran.
    pub fn ensure_owner(&self, os_user: &str, path: &Path, marker: &Path) -> Result<bool> {
        validate_system_user(os_user)?;
        if self.owner_of(marker)? == format!("{}:{}", os_user, self.group) {
            return Ok(false);
        }
        self.chown(os_user, path)?;
        debug!(path = %path.display(), "ownership applied");
        Ok(true)
    }

    /// Recursively hand `path` (inside the web root) to the account.
    pub fn chown(&self, os_user: &str, path: &Path) -> Result<()> {
        validate_system_user(os_user)?;
        let path = ensure_within(&self.web_root, path)?;
        let spec = CommandSpec::new("chown")
            .args(["-R".to_string(), format!("{}:{}", os_user, self.group)])
            .arg(path.to_string_lossy())
            .timeout_secs(self.timeout_secs);
        self.executor.run_checked(&spec)?;
        Ok(())
    }

    /// Rename the document root to `<root>_deleted_<timestamp>`.
    #[instrument(skip(self, at))]
    pub fn archive_site_root(
        &self,
        os_user: &str,
        domain: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<PathBuf>> {
        let path = self.site_root(os_user, domain)?;
        let archived = archive_dir(&path, at)?;
        if let Some(target) = &archived {
            info!(archive = %target.display(), "site root archived");
        }
        Ok(archived)
    }
}
