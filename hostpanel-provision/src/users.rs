//! Reference-counted registry of the OS accounts that own site files.
//!
//! Several sites may share one account. The registry maps each account name
//! to the set of domains using it; the account itself is created when the
//! first reference appears and deleted only once the set is empty again.
//!
//! The map lives in a JSON file under the state directory. Every change is a
//! read-modify-write under an exclusive lock, written to a temporary file and
//! renamed into place.

// Standard library
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// External crates
use tracing::{debug, info, instrument};

// Internal imports
use hostpanel_config::PanelConfig;
use hostpanel_core::file_system::write_atomic;
use hostpanel_core::validation::validate_system_user;
use hostpanel_core::{CommandExecutor, CommandSpec, FileLock, HostError, Result};

type ReferenceMap = BTreeMap<String, BTreeSet<String>>;

const ACCOUNT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
const REGISTRY_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of attaching a site to an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub created_account: bool,
    pub added_reference: bool,
    pub count: usize,
}

impl Attachment {
    pub fn changed(&self) -> bool {
        self.created_account || self.added_reference
    }
}

/// Result of detaching a site from an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detachment {
    pub removed_reference: bool,
    pub remaining: usize,
    pub deleted_account: bool,
}

pub struct SystemUserRegistry {
    registry_path: PathBuf,
    locks_dir: PathBuf,
    group: String,
    shell: String,
    timeout_secs: u64,
    executor: Arc<dyn CommandExecutor>,
}

impl SystemUserRegistry {
    pub fn new(config: &PanelConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            registry_path: config.paths.user_registry_path(),
            locks_dir: config.paths.locks_dir(),
            group: config.users.group.clone(),
            shell: config.users.shell.clone(),
            timeout_secs: config.timeouts.user_secs,
            executor,
        }
    }

    /// Whether the OS account exists (`id -u <name>` succeeds).
    pub fn user_exists(&self, name: &str) -> Result<bool> {
        validate_system_user(name)?;
        let spec = CommandSpec::new("id")
            .args(["-u", name])
            .timeout_secs(self.timeout_secs);
        Ok(self.executor.run(&spec)?.success())
    }

    /// Create a no-login, no-home account in the web group unless it exists.
    ///
    /// Returns whether the account was created.
    #[instrument(skip(self))]
    pub fn ensure_user(&self, name: &str) -> Result<bool> {
        if self.user_exists(name)? {
            debug!("account already exists");
            return Ok(false);
        }

        let spec = CommandSpec::new("useradd")
            .args(["-M", "-s", self.shell.as_str(), "-g", self.group.as_str(), name])
            .timeout_secs(self.timeout_secs);
        let output = self.executor.run(&spec)?;
        if !output.success() {
            return Err(HostError::ResourceCreation(format!(
                "useradd {} failed: {}",
                name,
                output.stderr.trim()
            )));
        }
        info!("created system account");
        Ok(true)
    }

    /// Record that `site` uses `name`. Returns `(count, added)`.
    pub fn add_reference(&self, name: &str, site: &str) -> Result<(usize, bool)> {
        validate_system_user(name)?;
        self.atomic_update(|entries| {
            let sites = entries.entry(name.to_string()).or_default();
            let added = sites.insert(site.to_string());
            (sites.len(), added)
        })
    }

    /// Drop the reference of `site` on `name`. Returns `(count, removed)`.
    pub fn remove_reference(&self, name: &str, site: &str) -> Result<(usize, bool)> {
        validate_system_user(name)?;
        self.atomic_update(|entries| {
            let Some(sites) = entries.get_mut(name) else {
                return (0, false);
            };
            let removed = sites.remove(site);
            let count = sites.len();
            if count == 0 {
                entries.remove(name);
            }
            (count, removed)
        })
    }

    pub fn reference_count(&self, name: &str) -> Result<usize> {
        Ok(self.sites_for(name)?.len())
    }

    /// Delete the account when nothing references it. Returns whether it was deleted.
    #[instrument(skip(self))]
    pub fn delete_user_if_unused(&self, name: &str) -> Result<bool> {
        if self.reference_count(name)? > 0 || !self.user_exists(name)? {
            return Ok(false);
        }
        let spec = CommandSpec::new("userdel")
            .arg(name)
            .timeout_secs(self.timeout_secs);
        self.executor.run_checked(&spec)?;
        info!("deleted unused system account");
        Ok(true)
    }

    /// Ensure the account and add the site reference under the account lock.
    pub fn attach(&self, name: &str, site: &str) -> Result<Attachment> {
        let _lock = self.lock_account(name)?;
        let created_account = self.ensure_user(name)?;
        let (count, added_reference) = self.add_reference(name, site)?;
        Ok(Attachment {
            created_account,
            added_reference,
            count,
        })
    }

    /// Remove the site reference and delete the account if it was the last
    /// one, under the account lock.
    ///
    /// The account is only deleted when this call removed a reference, so an
    /// account the registry never tracked for `site` is left alone.
    pub fn detach(&self, name: &str, site: &str) -> Result<Detachment> {
        let _lock = self.lock_account(name)?;
        let (remaining, removed_reference) = self.remove_reference(name, site)?;
        let deleted_account = if removed_reference && remaining == 0 {
            self.delete_user_if_unused(name)?
        } else {
            false
        };
        Ok(Detachment {
            removed_reference,
            remaining,
            deleted_account,
        })
    }

    /// All tracked accounts and the sites using them.
    pub fn list(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        self.read_entries()
    }

    pub fn sites_for(&self, name: &str) -> Result<BTreeSet<String>> {
        Ok(self.read_entries()?.remove(name).unwrap_or_default())
    }

    fn lock_account(&self, name: &str) -> Result<FileLock> {
        validate_system_user(name)?;
        let path = self.locks_dir.join(format!("user-{}.lock", name));
        FileLock::acquire(&path, ACCOUNT_LOCK_TIMEOUT)
    }

    fn read_entries(&self) -> Result<ReferenceMap> {
        match fs::read_to_string(&self.registry_path) {
            Ok(content) if content.trim().is_empty() => Ok(ReferenceMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ReferenceMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write of the registry file under an exclusive lock.
    fn atomic_update<F, T>(&self, update_fn: F) -> Result<T>
    where
        F: FnOnce(&mut ReferenceMap) -> T,
    {
        let _lock = FileLock::acquire(
            &self.registry_path.with_extension("json.lock"),
            REGISTRY_LOCK_TIMEOUT,
        )?;

        let mut entries = self.read_entries()?;
        let result = update_fn(&mut entries);

        let json_content = serde_json::to_string_pretty(&entries)?;
        write_atomic(&self.registry_path, json_content.as_bytes(), 0o600)?;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;
    use std::thread;
    use tempfile::tempdir;

    fn registry(root: &std::path::Path) -> (SystemUserRegistry, Arc<FakeHost>) {
        let config = PanelConfig::rooted_at(root);
        let host = Arc::new(FakeHost::new());
        (SystemUserRegistry::new(&config, host.clone()), host)
    }

    #[test]
    fn test_ensure_user_is_idempotent() {
        let dir = tempdir().unwrap();
        let (registry, host) = registry(dir.path());

        assert!(registry.ensure_user("appexample").unwrap());
        assert!(!registry.ensure_user("appexample").unwrap());
        assert!(host.has_user("appexample"));
        let useradds = host
            .command_lines()
            .into_iter()
            .filter(|l| l.starts_with("useradd"))
            .collect::<Vec<_>>();
        assert_eq!(
            useradds,
            vec!["useradd -M -s /usr/sbin/nologin -g www-data appexample".to_string()]
        );
    }

    #[test]
    fn test_ensure_user_failure_is_resource_creation() {
        let dir = tempdir().unwrap();
        let (registry, host) = registry(dir.path());
        host.fail_on("useradd", 1, "useradd: cannot lock /etc/passwd");
        let err = registry.ensure_user("appexample").unwrap_err();
        assert!(matches!(err, HostError::ResourceCreation(_)));
    }

    #[test]
    fn test_reference_count_matches_sites() {
        let dir = tempdir().unwrap();
        let (registry, _host) = registry(dir.path());

        assert_eq!(registry.add_reference("shared", "a.example.com").unwrap(), (1, true));
        assert_eq!(registry.add_reference("shared", "b.example.com").unwrap(), (2, true));
        assert_eq!(registry.add_reference("shared", "a.example.com").unwrap(), (2, false));
        assert_eq!(registry.reference_count("shared").unwrap(), 2);

        assert_eq!(registry.remove_reference("shared", "a.example.com").unwrap(), (1, true));
        assert_eq!(registry.remove_reference("shared", "a.example.com").unwrap(), (1, false));
        assert_eq!(registry.remove_reference("shared", "b.example.com").unwrap(), (0, true));
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_detach_deletes_only_last_reference() {
        let dir = tempdir().unwrap();
        let (registry, host) = registry(dir.path());

        registry.attach("shared", "a.example.com").unwrap();
        let second = registry.attach("shared", "b.example.com").unwrap();
        assert!(!second.created_account);
        assert_eq!(second.count, 2);

        let first_gone = registry.detach("shared", "a.example.com").unwrap();
        assert_eq!(first_gone.remaining, 1);
        assert!(!first_gone.deleted_account);
        assert!(host.has_user("shared"));

        let last_gone = registry.detach("shared", "b.example.com").unwrap();
        assert!(last_gone.deleted_account);
        assert!(!host.has_user("shared"));
    }

    #[test]
    fn test_detach_leaves_untracked_account() {
        let dir = tempdir().unwrap();
        let config = PanelConfig::rooted_at(dir.path());
        let host = Arc::new(FakeHost::new().with_user("legacy"));
        let registry = SystemUserRegistry::new(&config, host.clone());

        let detached = registry.detach("legacy", "never.example.com").unwrap();
        assert!(!detached.removed_reference);
        assert!(!detached.deleted_account);
        assert!(host.has_user("legacy"));
    }

    #[test]
    fn test_concurrent_references_are_not_lost() {
        let dir = tempdir().unwrap();
        let (registry, _host) = registry(dir.path());
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    registry
                        .attach("shared", &format!("site{}.example.com", i))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.reference_count("shared").unwrap(), 8);
    }

    #[test]
    fn test_rejects_invalid_account_names() {
        let dir = tempdir().unwrap();
        let (registry, host) = registry(dir.path());
        assert!(matches!(
            registry.ensure_user("root;id"),
            Err(HostError::Validation(_))
        ));
        assert_eq!(host.command_count(), 0);
    }
}
