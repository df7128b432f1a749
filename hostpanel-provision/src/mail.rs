//! Exim-style mail routing for hosted domains.
//!
//! Two files are maintained: the shared `passwd` file with one
//! `local@domain:hash` line per mailbox, and one alias file per domain in the
//! virtual directory mapping each local part to a forward address or to its
//! maildir. Both are rewritten wholesale for a domain on every sync.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use hostpanel_config::{MailSettings, PanelConfig};
use hostpanel_core::file_system::{read_if_exists, remove_file_if_exists, write_atomic};
use hostpanel_core::validation::{validate_domain, validate_mail_local_part};
use hostpanel_core::{CommandExecutor, FileLock, HostError, Result};

use crate::proxy::WriteOutcome;
use crate::service::reload_service;

const PASSWD_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// A hosted mailbox. The password hash is authored elsewhere (crypt format).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailAccount {
    pub local_part: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_to: Option<String>,
}

impl MailAccount {
    fn validate(&self) -> Result<()> {
        validate_mail_local_part(&self.local_part)?;
        if let Some(hash) = &self.password_hash {
            if hash.is_empty() || hash.contains([':', '\n', '\r']) {
                return Err(HostError::Validation(format!(
                    "Invalid password hash for mailbox '{}'",
                    self.local_part
                )));
            }
        }
        if let Some(forward) = &self.forward_to {
            let valid = forward.split_once('@').is_some_and(|(local, domain)| {
                !local.is_empty() && validate_domain(domain).is_ok()
            }) && !forward.chars().any(|c| c.is_whitespace() || c == ':' || c == ',');
            if !valid {
                return Err(HostError::Validation(format!(
                    "Invalid forward address '{}' for mailbox '{}'",
                    forward, self.local_part
                )));
            }
        }
        Ok(())
    }
}

pub struct MailRouter {
    settings: MailSettings,
    service_manager: String,
    reload_timeout: u64,
    executor: Arc<dyn CommandExecutor>,
}

impl MailRouter {
    pub fn new(config: &PanelConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            settings: config.mail.clone(),
            service_manager: config.lifecycle.service_manager.clone(),
            reload_timeout: config.timeouts.reload_secs,
            executor,
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Sidecar lock serializing rewrites of the shared `passwd` file.
    fn passwd_lock_path(&self) -> PathBuf {
        self.settings.passwd_file.with_extension("lock")
    }

    fn virtual_path(&self, domain: &str) -> PathBuf {
        self.settings.virtual_dir.join(domain)
    }

    /// `passwd` contents with the lines of `domain` replaced by `entries`.
    fn merge_passwd(&self, domain: &str, entries: &[String]) -> Result<(Option<Vec<u8>>, String)> {
        let current = read_if_exists(&self.settings.passwd_file)?;
        let suffix = format!("@{}:", domain);
        let text = current
            .as_deref()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        let mut lines: Vec<String> = text
            .lines()
            .filter(|line| !line.is_empty() && !line.contains(&suffix))
            .map(str::to_string)
            .collect();
        lines.extend(entries.iter().cloned());
        let mut merged = lines.join("\n");
        if !merged.is_empty() {
            merged.push('\n');
        }
        Ok((current, merged))
    }

    /// Rewrite the routing for `domain` from `accounts`.
    #[instrument(skip(self, accounts), fields(accounts = accounts.len()))]
    pub fn sync_domain(&self, domain: &str, accounts: &[MailAccount]) -> Result<WriteOutcome> {
        validate_domain(domain)?;
        for account in accounts {
            account.validate()?;
        }

        let _lock = FileLock::acquire(&self.passwd_lock_path(), PASSWD_LOCK_TIMEOUT)?;
        let passwd_entries: Vec<String> = accounts
            .iter()
            .filter_map(|a| {
                a.password_hash
                    .as_ref()
                    .map(|hash| format!("{}@{}:{}", a.local_part, domain, hash))
            })
            .collect();
        let (current_passwd, merged_passwd) = self.merge_passwd(domain, &passwd_entries)?;

        let virtual_path = self.virtual_path(domain);
        let current_virtual = read_if_exists(&virtual_path)?;
        let routes: String = accounts
            .iter()
            .map(|a| match &a.forward_to {
                Some(forward) => format!("{}: {}\n", a.local_part, forward),
                None => format!(
                    "{}: {}/\n",
                    a.local_part,
                    self.settings
                        .maildir_root
                        .join(domain)
                        .join(&a.local_part)
                        .display()
                ),
            })
            .collect();

        let mut changed = false;
        if current_passwd.as_deref().unwrap_or_default() != merged_passwd.as_bytes() {
            write_atomic(&self.settings.passwd_file, merged_passwd.as_bytes(), 0o640)?;
            changed = true;
        }
        if accounts.is_empty() {
            changed |= remove_file_if_exists(&virtual_path)?;
        } else if current_virtual.as_deref() != Some(routes.as_bytes()) {
            write_atomic(&virtual_path, routes.as_bytes(), 0o644)?;
            changed = true;
        }

        if !changed {
            return Ok(WriteOutcome::Unchanged);
        }
        self.reload()?;
        info!("mail routing updated");
        Ok(WriteOutcome::Written)
    }

    /// Remove every route and mailbox of `domain`.
    pub fn remove_domain(&self, domain: &str) -> Result<WriteOutcome> {
        self.sync_domain(domain, &[])
    }

    fn reload(&self) -> Result<()> {
        reload_service(
            self.executor.as_ref(),
            &self.service_manager,
            &self.settings.service,
            self.reload_timeout,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;
    use std::fs;
    use std::thread;
    use tempfile::tempdir;

    fn account(local: &str, hash: Option<&str>, forward: Option<&str>) -> MailAccount {
        MailAccount {
            local_part: local.to_string(),
            password_hash: hash.map(str::to_string),
            forward_to: forward.map(str::to_string),
        }
    }

    #[test]
    fn test_sync_writes_passwd_and_routes() {
        let dir = tempdir().unwrap();
        let config = PanelConfig::rooted_at(dir.path());
        fs::create_dir_all(config.mail.passwd_file.parent().unwrap()).unwrap();
        fs::write(&config.mail.passwd_file, "bob@other.org:$6$x\n").unwrap();
        let host = Arc::new(FakeHost::new());
        let router = MailRouter::new(&config, host.clone());

        let accounts = vec![
            account("info", Some("$6$abc"), None),
            account("sales", None, Some("team@partner.org")),
        ];
        assert_eq!(
            router.sync_domain("example.com", &accounts).unwrap(),
            WriteOutcome::Written
        );

        let passwd = fs::read_to_string(&config.mail.passwd_file).unwrap();
        assert_eq!(passwd, "bob@other.org:$6$x\ninfo@example.com:$6$abc\n");
        let routes = fs::read_to_string(config.mail.virtual_dir.join("example.com")).unwrap();
        assert!(routes.contains("sales: team@partner.org\n"));
        assert!(routes.contains("mail/vhosts/example.com/info/\n"));
        assert_eq!(host.command_lines(), vec!["systemctl reload exim4"]);

        assert_eq!(
            router.sync_domain("example.com", &accounts).unwrap(),
            WriteOutcome::Unchanged
        );
        assert_eq!(host.command_count(), 1);
    }

    #[test]
    fn test_parallel_syncs_keep_every_domain() {
        let dir = tempdir().unwrap();
        let config = PanelConfig::rooted_at(dir.path());
        let router = Arc::new(MailRouter::new(&config, Arc::new(FakeHost::new())));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let router = Arc::clone(&router);
                thread::spawn(move || {
                    router
                        .sync_domain(
                            &format!("site{}.example.com", i),
                            &[account("info", Some("$6$hash"), None)],
                        )
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let passwd = fs::read_to_string(&config.mail.passwd_file).unwrap();
        assert_eq!(passwd.lines().count(), 16);
        for i in 0..16 {
            assert!(passwd.contains(&format!("info@site{}.example.com:", i)));
        }
    }

    #[test]
    fn test_remove_domain_keeps_other_domains() {
        let dir = tempdir().unwrap();
        let config = PanelConfig::rooted_at(dir.path());
        let host = Arc::new(FakeHost::new());
        let router = MailRouter::new(&config, host.clone());

        router
            .sync_domain("a.org", &[account("x", Some("h1"), None)])
            .unwrap();
        router
            .sync_domain("b.org", &[account("y", Some("h2"), None)])
            .unwrap();
        router.remove_domain("a.org").unwrap();

        let passwd = fs::read_to_string(&config.mail.passwd_file).unwrap();
        assert_eq!(passwd, "y@b.org:h2\n");
        assert!(!config.mail.virtual_dir.join("a.org").exists());
    }

    #[test]
    fn test_no_accounts_and_nothing_on_disk_is_unchanged() {
        let dir = tempdir().unwrap();
        let config = PanelConfig::rooted_at(dir.path());
        let host = Arc::new(FakeHost::new());
        let router = MailRouter::new(&config, host.clone());
        assert_eq!(
            router.sync_domain("example.com", &[]).unwrap(),
            WriteOutcome::Unchanged
        );
        assert_eq!(host.command_count(), 0);
    }

    #[test]
    fn test_invalid_accounts_are_rejected() {
        let dir = tempdir().unwrap();
        let config = PanelConfig::rooted_at(dir.path());
        let router = MailRouter::new(&config, Arc::new(FakeHost::new()));
        for bad in [
            account("a:b", None, None),
            account("info", Some("x:y"), None),
            account("info", None, Some("not-an-address")),
            account("info", None, Some("a@b.org, root@localhost")),
        ] {
            assert!(matches!(
                router.sync_domain("example.com", &[bad]),
                Err(HostError::Validation(_))
            ));
        }
    }
}
