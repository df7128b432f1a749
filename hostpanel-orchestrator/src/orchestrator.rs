//! The per-site state machine.
//!
//! A reconciliation loads the site record, decides which action brings the
//! recorded state to the desired one, runs that action's steps in dependency
//! order through the leaf managers, and stores the new state together with
//! the per-step report. Step failures never abort the run; only steps that
//! depend on a failed step are skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use rayon::prelude::*;
use tracing::{info, instrument, warn};

use hostpanel_config::PanelConfig;
use hostpanel_core::secrets::read_secret;
use hostpanel_core::validation::validate_domain;
use hostpanel_core::{CommandExecutor, HostError};
use hostpanel_provision::{
    AppInstaller, CertificateManager, CertificateStatus, DatabaseProvisioner, InstallOutcome,
    MailRouter, ProxyConfigManager, RuntimePoolManager, SiteFilesystem, SystemUserRegistry,
    VirtualHostSpec, WriteOutcome,
};

use crate::error::{OrchestratorError, Result};
use crate::locks::DomainLocks;
use crate::notify::{Notification, Notifier, Severity, TracingNotifier};
use crate::report::{Action, Applied, ReconcileReport, StepLog, StepName, StepStatus};
use crate::site::{DesiredStatus, PoolMode, Site, SiteRequest, SiteState, SiteType};
use crate::store::{JsonSiteStore, SiteStore};

type StepResult = hostpanel_core::Result<Applied>;

/// Outcome of one site in [`Orchestrator::reconcile_all`].
#[derive(Debug)]
pub struct SiteRun {
    pub domain: String,
    pub result: Result<ReconcileReport>,
}

/// Action that moves a site from `state` towards `desired`, if any.
pub fn plan(state: SiteState, desired: DesiredStatus) -> Option<Action> {
    match (desired, state) {
        (DesiredStatus::Deleted, SiteState::Deleted) => Some(Action::None),
        (DesiredStatus::Deleted, _) => Some(Action::Deprovision),
        (_, SiteState::Deleted) => None,
        (DesiredStatus::Active, SiteState::Suspended) => Some(Action::Resume),
        (DesiredStatus::Active, _) => Some(Action::Provision),
        (DesiredStatus::Suspended, SiteState::New) => None,
        (DesiredStatus::Suspended, _) => Some(Action::Suspend),
    }
}

pub struct Orchestrator {
    pub(crate) config: PanelConfig,
    pub(crate) store: Arc<dyn SiteStore>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) locks: DomainLocks,
    users: SystemUserRegistry,
    pools: RuntimePoolManager,
    site_fs: SiteFilesystem,
    pub(crate) proxy: ProxyConfigManager,
    databases: DatabaseProvisioner,
    apps: AppInstaller,
    mail: MailRouter,
    pub(crate) certificates: CertificateManager,
}

impl Orchestrator {
    pub fn new(
        config: PanelConfig,
        executor: Arc<dyn CommandExecutor>,
        store: Arc<dyn SiteStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            locks: DomainLocks::new(config.paths.locks_dir()),
            users: SystemUserRegistry::new(&config, Arc::clone(&executor)),
            pools: RuntimePoolManager::new(&config, Arc::clone(&executor)),
            site_fs: SiteFilesystem::new(&config, Arc::clone(&executor)),
            proxy: ProxyConfigManager::new(&config, Arc::clone(&executor)),
            databases: DatabaseProvisioner::new(&config, Arc::clone(&executor)),
            apps: AppInstaller::new(&config, Arc::clone(&executor)),
            mail: MailRouter::new(&config, Arc::clone(&executor)),
            certificates: CertificateManager::new(&config, executor),
            config,
            store,
            notifier,
        }
    }

    /// JSON records under the state directory, notifications to the log.
    pub fn with_defaults(config: PanelConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        let store = Arc::new(JsonSiteStore::new(config.paths.sites_dir()));
        Self::new(config, executor, store, Arc::new(TracingNotifier))
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    /// Accept a hosting request: create the site record, or update the
    /// tunables of an existing one. A deleted site is registered afresh.
    #[instrument(skip(self, request), fields(domain = %request.domain))]
    pub fn register(&self, request: &SiteRequest) -> Result<Site> {
        validate_domain(&request.domain)?;
        let _guard = self.locks.lock(&request.domain)?;

        let site = match self.store.load(&request.domain)? {
            Some(mut existing) if !matches!(existing.state, SiteState::New | SiteState::Deleted) => {
                existing.apply(request, &self.config)?;
                existing
            }
            Some(existing) if existing.state == SiteState::New => {
                let mut site = Site::from_request(request, &self.config)?;
                site.created_at = existing.created_at;
                site
            }
            _ => Site::from_request(request, &self.config)?,
        };
        self.ensure_database_unclaimed(&site)?;
        self.store.save(&site)?;
        info!(site_type = %site.site_type, os_user = %site.os_user, "site registered");
        Ok(site)
    }

    /// Refuse a grant whose database or principal belongs to another live site.
    fn ensure_database_unclaimed(&self, site: &Site) -> Result<()> {
        let Some(grant) = &site.database else {
            return Ok(());
        };
        for other in self.store.list()? {
            if other.domain == site.domain || other.state == SiteState::Deleted {
                continue;
            }
            let Some(taken) = &other.database else {
                continue;
            };
            if taken.name == grant.name || taken.user == grant.user {
                return Err(HostError::Validation(format!(
                    "Database {} is already used by {}",
                    grant.name, other.domain
                ))
                .into());
            }
        }
        Ok(())
    }

    pub fn status(&self, domain: &str) -> Result<Site> {
        validate_domain(domain)?;
        self.load(domain)
    }

    pub fn sites(&self) -> Result<Vec<Site>> {
        Ok(self.store.list()?)
    }

    /// OS accounts and the sites referencing them.
    pub fn user_references(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        Ok(self.users.list()?)
    }

    /// Bring `domain` to `desired`, choosing the action from its recorded state.
    pub fn reconcile(&self, domain: &str, desired: DesiredStatus) -> Result<ReconcileReport> {
        self.execute(domain, desired, |state| plan(state, desired))
    }

    /// Full dependency-ordered creation. Every step checks what already exists.
    pub fn provision(&self, domain: &str) -> Result<ReconcileReport> {
        self.execute(domain, DesiredStatus::Active, |state| match state {
            SiteState::Deleted => None,
            _ => Some(Action::Provision),
        })
    }

    pub fn suspend(&self, domain: &str) -> Result<ReconcileReport> {
        self.reconcile(domain, DesiredStatus::Suspended)
    }

    pub fn resume(&self, domain: &str) -> Result<ReconcileReport> {
        self.execute(domain, DesiredStatus::Active, |state| match state {
            SiteState::New | SiteState::Deleted => None,
            _ => Some(Action::Resume),
        })
    }

    pub fn deprovision(&self, domain: &str) -> Result<ReconcileReport> {
        self.reconcile(domain, DesiredStatus::Deleted)
    }

    /// Reconcile every stored site that is not deleted towards its recorded
    /// desired status, `lifecycle.parallelism` sites at a time.
    pub fn reconcile_all(&self) -> Result<Vec<SiteRun>> {
        let targets: Vec<(String, DesiredStatus)> = self
            .store
            .list()?
            .into_iter()
            .filter(|site| site.state != SiteState::Deleted)
            .map(|site| (site.domain, site.desired))
            .collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.lifecycle.parallelism)
            .thread_name(|i| format!("hostpanel-reconcile-{}", i))
            .build()
            .map_err(|e| OrchestratorError::WorkerPool(e.to_string()))?;

        info!(sites = targets.len(), "reconciling all sites");
        let runs: Vec<SiteRun> = pool.install(|| {
            targets
                .par_iter()
                .map(|(domain, desired)| SiteRun {
                    domain: domain.clone(),
                    result: self.reconcile(domain, *desired),
                })
                .collect()
        });
        Ok(runs)
    }

    pub(crate) fn load(&self, domain: &str) -> Result<Site> {
        self.store
            .load(domain)?
            .ok_or_else(|| OrchestratorError::SiteNotFound(domain.to_string()))
    }

    #[instrument(skip_all, fields(domain = %domain, target = %target))]
    fn execute<F>(&self, domain: &str, target: DesiredStatus, choose: F) -> Result<ReconcileReport>
    where
        F: FnOnce(SiteState) -> Option<Action>,
    {
        validate_domain(domain)?;
        let _guard = self.locks.lock(domain)?;
        let mut site = self.load(domain)?;
        site.validate()?;

        let action = choose(site.state).ok_or_else(|| OrchestratorError::InvalidTransition {
            domain: domain.to_string(),
            from: site.state.to_string(),
            to: target.to_string(),
        })?;
        site.desired = target;

        let started_at = Utc::now();
        let mut log = StepLog::new();
        match action {
            Action::Provision => self.provision_steps(&mut site, &mut log),
            Action::Suspend => self.suspend_steps(&mut site, &mut log),
            Action::Resume => self.resume_steps(&mut site, &mut log),
            Action::Deprovision => self.deprovision_steps(&mut site, &mut log),
            Action::None => {}
        }

        site.state = if log.hard_steps_succeeded() {
            SiteState::reached(target)
        } else {
            SiteState::Degraded { target }
        };
        let report = ReconcileReport {
            domain: domain.to_string(),
            action,
            target,
            state: site.state,
            steps: log.into_steps(),
            started_at,
            finished_at: Utc::now(),
        };
        site.last_report = Some(report.clone());
        site.touch();
        self.store.save(&site)?;

        self.announce(&report);
        Ok(report)
    }

    fn announce(&self, report: &ReconcileReport) {
        for step in &report.steps {
            let severity = match &step.status {
                StepStatus::Succeeded { changed: false } => continue,
                StepStatus::Succeeded { changed: true } => Severity::Info,
                StepStatus::Skipped { .. } => Severity::Warning,
                StepStatus::Failed { .. } if step.hard => Severity::Error,
                StepStatus::Failed { .. } => Severity::Warning,
            };
            self.notifier.notify(Notification {
                domain: report.domain.clone(),
                severity,
                message: step.to_string(),
            });
        }

        let severity = if report.reached_target() {
            Severity::Info
        } else {
            Severity::Error
        };
        self.notifier.notify(Notification {
            domain: report.domain.clone(),
            severity,
            message: format!("{} finished, site is {}", report.action, report.state),
        });
    }

    fn provision_steps(&self, site: &mut Site, log: &mut StepLog) {
        use StepName::*;

        log.run(SystemUser, true, &[], || self.attach_user(site));
        if site.pool_mode != PoolMode::None || site.pool_version.is_some() {
            log.run(RuntimePool, true, &[SystemUser], || self.ensure_pool(site));
        }
        log.run(SiteRoot, true, &[SystemUser], || self.ensure_root(site));
        log.run(ProxyHttp, true, &[SiteRoot, RuntimePool], || {
            self.write_vhost(site, site.certificate.is_active())
        });
        if site.database.is_some() {
            log.run(Database, true, &[], || self.ensure_database(site));
            log.run(AppInstall, true, &[SiteRoot, Database], || self.install_app(site));
        }
        if self.mail.enabled() {
            log.run(MailRouting, false, &[], || {
                let outcome = self.mail.sync_domain(&site.domain, &site.mail_accounts)?;
                Ok(Applied::changed(outcome == WriteOutcome::Written))
            });
        }
        log.run(Certificate, false, &[SiteRoot], || self.ensure_certificate(site));
        log.run(ProxyHttps, false, &[Certificate, ProxyHttp], || {
            self.write_vhost(site, true)
        });
    }

    fn suspend_steps(&self, site: &mut Site, log: &mut StepLog) {
        log.run(StepName::ProxySuspended, true, &[], || {
            let written = self.proxy.write_suspended_placeholder(&site.domain)?;
            Ok(Applied::changed(written.changed()))
        });
    }

    fn resume_steps(&self, site: &mut Site, log: &mut StepLog) {
        log.run(StepName::ProxyHttp, true, &[], || {
            self.write_vhost(site, site.certificate.is_active())
        });
    }

    /// Reverse of provisioning; the shared account reference goes last.
    fn deprovision_steps(&self, site: &mut Site, log: &mut StepLog) {
        use StepName::*;

        log.run(RemoveVhost, true, &[], || {
            Ok(Applied::changed(self.proxy.remove_virtual_host(&site.domain)?))
        });
        if self.mail.enabled() {
            log.run(RemoveMail, false, &[], || {
                let outcome = self.mail.remove_domain(&site.domain)?;
                Ok(Applied::changed(outcome == WriteOutcome::Written))
            });
        }
        if self.config.lifecycle.drop_database_on_delete {
            if let Some(grant) = site.database.clone() {
                log.run(DropDatabase, true, &[], || {
                    self.databases.deprovision(&grant)?;
                    Ok(Applied::changed(true))
                });
            }
        }
        log.run(ArchiveRoot, true, &[], || {
            let archived = self
                .site_fs
                .archive_site_root(&site.os_user, &site.domain, Utc::now())?;
            Ok(match archived {
                Some(path) => {
                    Applied::changed(true).with_detail(format!("archived to {}", path.display()))
                }
                None => Applied::default(),
            })
        });
        let pool_version = site.pool_version.clone().or_else(|| {
            site.needs_dedicated_pool()
                .then(|| site.runtime_version.clone())
        });
        if let Some(version) = pool_version {
            log.run(RemovePool, true, &[], || {
                let removed = self.pools.delete_pool(&site.domain, &version)?;
                site.pool_version = None;
                site.pool_socket = None;
                Ok(Applied::changed(removed))
            });
        }
        log.run(ReleaseUser, true, &[RemovePool, ArchiveRoot], || self.release_user(site));
    }

    fn attach_user(&self, site: &Site) -> StepResult {
        let attachment = self.users.attach(&site.os_user, &site.domain)?;
        let applied = Applied::changed(attachment.changed());
        Ok(if attachment.created_account {
            applied.with_detail(format!("created account {}", site.os_user))
        } else {
            applied
        })
    }

    fn release_user(&self, site: &Site) -> StepResult {
        let detachment = self.users.detach(&site.os_user, &site.domain)?;
        let applied = Applied::changed(detachment.removed_reference || detachment.deleted_account);
        Ok(if detachment.deleted_account {
            applied.with_detail(format!("deleted account {}", site.os_user))
        } else if detachment.remaining > 0 {
            applied.with_detail(format!(
                "account {} kept for {} other site(s)",
                site.os_user, detachment.remaining
            ))
        } else {
            applied
        })
    }

    /// Converge the runtime pool on the site's pool mode and version. A pool
    /// left over from an older version or mode is removed first.
    fn ensure_pool(&self, site: &mut Site) -> StepResult {
        let mut changed = false;
        if let Some(old) = site.pool_version.clone() {
            if !site.needs_dedicated_pool() || old != site.runtime_version {
                changed |= self.pools.delete_pool(&site.domain, &old)?;
                site.pool_version = None;
                site.pool_socket = None;
            }
        }

        match site.pool_mode {
            PoolMode::Dedicated => {
                let outcome = self.pools.create_pool(
                    &site.domain,
                    &site.os_user,
                    &site.runtime_version,
                    site.max_workers,
                )?;
                site.pool_socket = Some(outcome.pool.socket);
                site.pool_version = Some(site.runtime_version.clone());
                Ok(Applied::changed(changed || outcome.changed))
            }
            PoolMode::Shared => {
                site.pool_socket = Some(self.pools.shared_socket(&site.runtime_version));
                Ok(Applied::changed(changed).with_detail("shared pool"))
            }
            PoolMode::None => {
                site.pool_socket = None;
                Ok(Applied::changed(changed))
            }
        }
    }

    fn ensure_root(&self, site: &mut Site) -> StepResult {
        let root = self.site_fs.ensure_site_root(&site.os_user, &site.domain)?;
        let applied = Applied::changed(root.changed());
        site.root = root.path;
        Ok(applied)
    }

    fn write_vhost(&self, site: &Site, tls: bool) -> StepResult {
        let spec = VirtualHostSpec {
            domain: site.domain.clone(),
            root: site.root.clone(),
            upstream: site.upstream(&self.config),
            tls,
        };
        let written = self.proxy.write_virtual_host(&spec)?;
        let applied = Applied::changed(written.changed());
        Ok(if tls && !written.tls {
            applied.with_detail("certificate files missing, serving plain HTTP")
        } else {
            applied
        })
    }

    fn ensure_database(&self, site: &mut Site) -> StepResult {
        let grant = site
            .database
            .clone()
            .ok_or_else(|| HostError::NotFound(format!("database settings of {}", site.domain)))?;
        let (grant, changed) =
            self.databases
                .provision(&site.domain, grant.engine, &grant.name, &grant.user)?;
        site.database = Some(grant);
        Ok(Applied::changed(changed))
    }

    fn install_app(&self, site: &Site) -> StepResult {
        let grant = site
            .database
            .as_ref()
            .ok_or_else(|| HostError::NotFound(format!("database settings of {}", site.domain)))?;
        let password = read_secret(&grant.credential_ref)?.ok_or_else(|| {
            HostError::NotFound(format!(
                "database credential {}",
                grant.credential_ref.display()
            ))
        })?;

        let (outcome, marker) = match site.site_type {
            SiteType::Cms => (
                self.apps
                    .install_cms(&site.domain, &site.root, grant, &password)?,
                self.apps.cms_marker(&site.root),
            ),
            SiteType::TenantApp => (
                self.apps.install_tenant_app(
                    &site.domain,
                    &site.root,
                    grant,
                    &password,
                    &site.apps,
                )?,
                self.apps.tenant_marker(&site.root),
            ),
            SiteType::Static => return Ok(Applied::default()),
        };
        let chowned = self
            .site_fs
            .ensure_owner(&site.os_user, &site.root, &marker)?;
        Ok(Applied::changed(
            outcome == InstallOutcome::Installed || chowned,
        ))
    }

    /// Issue a certificate unless an active one is installed. The pending
    /// status is stored before the request so an interrupted run shows it.
    fn ensure_certificate(&self, site: &mut Site) -> StepResult {
        if site.certificate.is_active() && self.certificates.certificate_files_present(&site.domain)
        {
            return Ok(Applied::default().with_detail("certificate already active"));
        }

        let previous = site.certificate.clone();
        site.certificate.status = CertificateStatus::Pending;
        site.touch();
        self.store.save(site)?;

        site.certificate = self.certificates.issue(&site.domain, &site.root, &previous)?;
        match &site.certificate.last_attempt {
            Some(attempt) if attempt.succeeded => Ok(Applied::changed(true)),
            Some(attempt) => {
                warn!("certificate not issued: {}", attempt.message);
                Err(HostError::ResourceCreation(attempt.message.clone()))
            }
            None => Err(HostError::ResourceCreation(
                "certificate request left no result".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_table() {
        use DesiredStatus as D;
        let degraded = SiteState::Degraded { target: D::Active };

        assert_eq!(plan(SiteState::New, D::Active), Some(Action::Provision));
        assert_eq!(plan(SiteState::Active, D::Active), Some(Action::Provision));
        assert_eq!(plan(degraded, D::Active), Some(Action::Provision));
        assert_eq!(plan(SiteState::Suspended, D::Active), Some(Action::Resume));

        assert_eq!(plan(SiteState::Active, D::Suspended), Some(Action::Suspend));
        assert_eq!(plan(degraded, D::Suspended), Some(Action::Suspend));
        assert_eq!(plan(SiteState::Suspended, D::Suspended), Some(Action::Suspend));
        assert_eq!(plan(SiteState::New, D::Suspended), None);

        assert_eq!(plan(SiteState::Active, D::Deleted), Some(Action::Deprovision));
        assert_eq!(plan(SiteState::New, D::Deleted), Some(Action::Deprovision));
        assert_eq!(plan(SiteState::Deleted, D::Deleted), Some(Action::None));
        assert_eq!(plan(SiteState::Deleted, D::Active), None);
        assert_eq!(plan(SiteState::Deleted, D::Suspended), None);
    }
}
