//! The per-site record: desired status, recorded state and the attributes
//! the resource managers are driven from.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hostpanel_config::{DatabaseEngine, PanelConfig};
use hostpanel_core::validation::{
    derive_db_identifier, derive_system_user, validate_db_identifier, validate_domain,
    validate_runtime_version, validate_system_user,
};
use hostpanel_core::{HostError, Result};
use hostpanel_provision::{Certificate, DatabaseGrant, MailAccount, UpstreamTarget};

use crate::report::ReconcileReport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SiteType {
    #[default]
    Static,
    Cms,
    TenantApp,
}

impl SiteType {
    pub fn needs_database(self) -> bool {
        matches!(self, SiteType::Cms | SiteType::TenantApp)
    }
}

impl fmt::Display for SiteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SiteType::Static => write!(f, "static"),
            SiteType::Cms => write!(f, "cms"),
            SiteType::TenantApp => write!(f, "tenant-app"),
        }
    }
}

impl FromStr for SiteType {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "static" => Ok(SiteType::Static),
            "cms" => Ok(SiteType::Cms),
            "tenant-app" => Ok(SiteType::TenantApp),
            other => Err(HostError::Validation(format!("Unknown site type '{}'", other))),
        }
    }
}

/// How the site's PHP workers are provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    /// Own pool running as the site's account
    Dedicated,
    /// The version's shared pool
    Shared,
    /// No runtime; static files or a proxied application
    None,
}

impl PoolMode {
    pub fn default_for(site_type: SiteType) -> Self {
        match site_type {
            SiteType::TenantApp => PoolMode::None,
            SiteType::Static | SiteType::Cms => PoolMode::Dedicated,
        }
    }
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolMode::Dedicated => write!(f, "dedicated"),
            PoolMode::Shared => write!(f, "shared"),
            PoolMode::None => write!(f, "none"),
        }
    }
}

impl FromStr for PoolMode {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dedicated" => Ok(PoolMode::Dedicated),
            "shared" => Ok(PoolMode::Shared),
            "none" => Ok(PoolMode::None),
            other => Err(HostError::Validation(format!("Unknown pool mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredStatus {
    Active,
    Suspended,
    Deleted,
}

impl fmt::Display for DesiredStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesiredStatus::Active => write!(f, "active"),
            DesiredStatus::Suspended => write!(f, "suspended"),
            DesiredStatus::Deleted => write!(f, "deleted"),
        }
    }
}

impl FromStr for DesiredStatus {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(DesiredStatus::Active),
            "suspended" => Ok(DesiredStatus::Suspended),
            "deleted" => Ok(DesiredStatus::Deleted),
            other => Err(HostError::Validation(format!(
                "Unknown desired status '{}'",
                other
            ))),
        }
    }
}

/// What the last reconciliation actually achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SiteState {
    #[default]
    New,
    Active,
    Suspended,
    Deleted,
    /// A hard step failed on the way to `target`
    Degraded { target: DesiredStatus },
}

impl SiteState {
    pub fn reached(target: DesiredStatus) -> Self {
        match target {
            DesiredStatus::Active => SiteState::Active,
            DesiredStatus::Suspended => SiteState::Suspended,
            DesiredStatus::Deleted => SiteState::Deleted,
        }
    }
}

impl fmt::Display for SiteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SiteState::New => write!(f, "new"),
            SiteState::Active => write!(f, "active"),
            SiteState::Suspended => write!(f, "suspended"),
            SiteState::Deleted => write!(f, "deleted"),
            SiteState::Degraded { target } => write!(f, "degraded (target {})", target),
        }
    }
}

/// A request to host a domain, as accepted from the operator.
#[derive(Debug, Clone, Default)]
pub struct SiteRequest {
    pub domain: String,
    pub site_type: SiteType,
    pub runtime_version: Option<String>,
    pub os_user: Option<String>,
    pub pool_mode: Option<PoolMode>,
    pub max_workers: Option<u32>,
    pub database_engine: Option<DatabaseEngine>,
    pub apps: Vec<String>,
    pub mail_accounts: Option<Vec<MailAccount>>,
}

impl SiteRequest {
    pub fn new(domain: impl Into<String>, site_type: SiteType) -> Self {
        Self {
            domain: domain.into(),
            site_type,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub domain: String,
    pub site_type: SiteType,
    pub desired: DesiredStatus,
    #[serde(default)]
    pub state: SiteState,
    pub runtime_version: String,
    pub os_user: String,
    pub pool_mode: PoolMode,
    pub max_workers: u32,
    pub root: PathBuf,
    /// Endpoint the vhost forwards PHP requests to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_socket: Option<PathBuf>,
    /// Version of the dedicated pool currently configured on the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseGrant>,
    #[serde(default)]
    pub certificate: Certificate,
    #[serde(default)]
    pub mail_accounts: Vec<MailAccount>,
    #[serde(default)]
    pub apps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_report: Option<ReconcileReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Site {
    /// Build a validated record for `request`. Nothing on the host is touched.
    pub fn from_request(request: &SiteRequest, config: &PanelConfig) -> Result<Self> {
        validate_domain(&request.domain)?;
        let domain = request.domain.clone();

        let os_user = match &request.os_user {
            Some(name) => {
                validate_system_user(name)?;
                name.clone()
            }
            None => derive_system_user(&domain)?,
        };

        let runtime_version = request
            .runtime_version
            .clone()
            .unwrap_or_else(|| config.runtime.default_version.clone());
        validate_runtime_version(&runtime_version)?;

        let pool_mode = request
            .pool_mode
            .unwrap_or_else(|| PoolMode::default_for(request.site_type));
        check_pool_mode(request.site_type, pool_mode)?;

        let max_workers = request.max_workers.unwrap_or(config.runtime.max_workers);
        if max_workers == 0 {
            return Err(HostError::Validation(
                "Runtime pool needs at least one worker".to_string(),
            ));
        }

        let database = if request.site_type.needs_database() {
            let engine = database_engine(request.site_type, request.database_engine, config)?;
            let identifier = derive_db_identifier(&domain)?;
            validate_db_identifier("Database name", &identifier)?;
            Some(DatabaseGrant {
                engine,
                name: identifier.clone(),
                user: identifier,
                credential_ref: config.paths.secrets_dir().join(format!("{}.db", domain)),
            })
        } else {
            None
        };

        let root = config
            .paths
            .web_root
            .join(&os_user)
            .join("data/www")
            .join(&domain);
        let now = Utc::now();

        Ok(Self {
            domain,
            site_type: request.site_type,
            desired: DesiredStatus::Active,
            state: SiteState::New,
            runtime_version,
            os_user,
            pool_mode,
            max_workers,
            root,
            pool_socket: None,
            pool_version: None,
            database,
            certificate: Certificate::default(),
            mail_accounts: request.mail_accounts.clone().unwrap_or_default(),
            apps: request.apps.clone(),
            last_report: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply a repeated request to an existing record.
    ///
    /// The account and site type own resources on the host and cannot change
    /// once the site left `New`; tunables are updated in place.
    pub fn apply(&mut self, request: &SiteRequest, config: &PanelConfig) -> Result<()> {
        let fresh = Site::from_request(request, config)?;
        if fresh.site_type != self.site_type {
            return Err(HostError::Validation(format!(
                "Site type of {} is {}, cannot change to {}",
                self.domain, self.site_type, fresh.site_type
            )));
        }
        if request.os_user.is_some() && fresh.os_user != self.os_user {
            return Err(HostError::Validation(format!(
                "Site {} belongs to account {}, cannot move to {}",
                self.domain, self.os_user, fresh.os_user
            )));
        }
        if request.database_engine.is_some()
            && fresh.database.as_ref().map(|g| g.engine) != self.database.as_ref().map(|g| g.engine)
        {
            return Err(HostError::Validation(format!(
                "Database engine of {} cannot change",
                self.domain
            )));
        }

        if request.runtime_version.is_some() {
            self.runtime_version = fresh.runtime_version;
        }
        if request.pool_mode.is_some() {
            self.pool_mode = fresh.pool_mode;
        }
        if request.max_workers.is_some() {
            self.max_workers = fresh.max_workers;
        }
        if !request.apps.is_empty() {
            self.apps = fresh.apps;
        }
        if request.mail_accounts.is_some() {
            self.mail_accounts = fresh.mail_accounts;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Re-check every stored attribute before a reconciliation touches the host.
    pub fn validate(&self) -> Result<()> {
        validate_domain(&self.domain)?;
        validate_system_user(&self.os_user)?;
        validate_runtime_version(&self.runtime_version)?;
        check_pool_mode(self.site_type, self.pool_mode)?;
        if let Some(grant) = &self.database {
            validate_db_identifier("Database name", &grant.name)?;
            validate_db_identifier("Database user", &grant.user)?;
        }
        Ok(())
    }

    pub fn needs_dedicated_pool(&self) -> bool {
        self.pool_mode == PoolMode::Dedicated
    }

    /// Where the vhost sends dynamic requests.
    pub fn upstream(&self, config: &PanelConfig) -> UpstreamTarget {
        match (self.site_type, self.pool_mode) {
            (SiteType::TenantApp, _) => UpstreamTarget::Proxy {
                url: config.proxy.tenant_upstream.clone(),
            },
            (_, PoolMode::None) => UpstreamTarget::Static,
            (_, PoolMode::Shared) => UpstreamTarget::FastCgi {
                socket: self
                    .pool_socket
                    .clone()
                    .unwrap_or_else(|| config.runtime.shared_socket_for(&self.runtime_version)),
            },
            (_, PoolMode::Dedicated) => match &self.pool_socket {
                Some(socket) => UpstreamTarget::FastCgi {
                    socket: socket.clone(),
                },
                None => UpstreamTarget::Static,
            },
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn check_pool_mode(site_type: SiteType, pool_mode: PoolMode) -> Result<()> {
    match (site_type, pool_mode) {
        (SiteType::TenantApp, PoolMode::None) | (SiteType::Static, _) => Ok(()),
        (SiteType::Cms, PoolMode::Dedicated | PoolMode::Shared) => Ok(()),
        (site_type, pool_mode) => Err(HostError::Validation(format!(
            "Pool mode {} is not available for {} sites",
            pool_mode, site_type
        ))),
    }
}

fn database_engine(
    site_type: SiteType,
    requested: Option<DatabaseEngine>,
    config: &PanelConfig,
) -> Result<DatabaseEngine> {
    match (site_type, requested) {
        (SiteType::Cms, None | Some(DatabaseEngine::Mariadb)) => Ok(DatabaseEngine::Mariadb),
        (SiteType::Cms, Some(other)) => Err(HostError::Validation(format!(
            "CMS sites run on MariaDB, {} is not supported",
            other
        ))),
        (_, requested) => Ok(requested.unwrap_or(config.database.default_engine)),
    }
}
