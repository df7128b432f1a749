//! Desired-state store: one JSON record per domain.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use hostpanel_core::file_system::{read_if_exists, write_atomic};
use hostpanel_core::validation::validate_domain;
use hostpanel_core::Result;

use crate::site::Site;

/// Keyed record store for sites. Implementations are shared between the
/// worker threads of `reconcile --all`.
pub trait SiteStore: Send + Sync {
    fn load(&self, domain: &str) -> Result<Option<Site>>;
    fn save(&self, site: &Site) -> Result<()>;
    /// Every stored site, ordered by domain.
    fn list(&self) -> Result<Vec<Site>>;
}

/// Stores `<dir>/<domain>.json`, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonSiteStore {
    dir: PathBuf,
}

impl JsonSiteStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, domain: &str) -> Result<PathBuf> {
        validate_domain(domain)?;
        Ok(self.dir.join(format!("{}.json", domain)))
    }
}

impl SiteStore for JsonSiteStore {
    fn load(&self, domain: &str) -> Result<Option<Site>> {
        let path = self.path(domain)?;
        match read_if_exists(&path)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save(&self, site: &Site) -> Result<()> {
        let path = self.path(&site.domain)?;
        let json = serde_json::to_vec_pretty(site)?;
        write_atomic(&path, &json, 0o600)?;
        debug!(domain = %site.domain, "site record saved");
        Ok(())
    }

    fn list(&self) -> Result<Vec<Site>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut sites = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            match serde_json::from_slice::<Site>(&bytes) {
                Ok(site) => sites.push(site),
                Err(e) => warn!(path = %path.display(), "skipping unreadable site record: {}", e),
            }
        }
        sites.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(sites)
    }
}
