//! Per-site databases and their login principals.
//!
//! Engines implement [`DatabaseBackend`]; the backend is selected once from
//! the site's engine attribute by [`backend_for`]. Identifiers are checked
//! against a strict allow-list before any statement is built, statements go to
//! the client on stdin, and the generated password is kept in a `0600` file
//! whose path is the only thing recorded on the site.

mod mariadb;
mod postgres;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use hostpanel_config::{DatabaseEngine, PanelConfig};
use hostpanel_core::secrets::read_or_generate_secret;
use hostpanel_core::validation::{validate_db_identifier, validate_domain};
use hostpanel_core::{CommandExecutor, Result};

pub use mariadb::MariaDbBackend;
pub use postgres::PostgresBackend;

/// Administrative operations of one database engine.
pub trait DatabaseBackend: Send + Sync {
    fn engine(&self) -> DatabaseEngine;
    fn database_exists(&self, name: &str) -> Result<bool>;
    fn principal_exists(&self, user: &str) -> Result<bool>;
    fn create_database(&self, name: &str) -> Result<()>;
    /// Create the principal, or reset its password when it already exists.
    fn create_principal(&self, user: &str, password: &str) -> Result<()>;
    fn grant_all(&self, name: &str, user: &str) -> Result<()>;
    fn drop_database(&self, name: &str) -> Result<()>;
    fn drop_principal(&self, user: &str) -> Result<()>;
}

pub fn backend_for(
    engine: DatabaseEngine,
    config: &PanelConfig,
    executor: Arc<dyn CommandExecutor>,
) -> Box<dyn DatabaseBackend> {
    match engine {
        DatabaseEngine::Mariadb => Box::new(MariaDbBackend::new(config, executor)),
        DatabaseEngine::Postgresql => Box::new(PostgresBackend::new(config, executor)),
    }
}

/// A provisioned database as recorded on the site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseGrant {
    pub engine: DatabaseEngine,
    pub name: String,
    pub user: String,
    /// Path of the file holding the principal's password
    pub credential_ref: PathBuf,
}

pub struct DatabaseProvisioner {
    config: PanelConfig,
    executor: Arc<dyn CommandExecutor>,
}

impl DatabaseProvisioner {
    pub fn new(config: &PanelConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            config: config.clone(),
            executor,
        }
    }

    pub fn credential_path(&self, domain: &str) -> PathBuf {
        self.config
            .paths
            .secrets_dir()
            .join(format!("{}.db", domain))
    }

    /// Create the database, principal and grant for `domain`.
    ///
    /// Returns the grant and whether anything was changed. When the database
    /// and principal exist and the stored credential is reused, no statement
    /// is executed besides the existence checks.
    #[instrument(skip(self))]
    pub fn provision(
        &self,
        domain: &str,
        engine: DatabaseEngine,
        name: &str,
        user: &str,
    ) -> Result<(DatabaseGrant, bool)> {
        validate_domain(domain)?;
        validate_db_identifier("Database name", name)?;
        validate_db_identifier("Database user", user)?;

        let backend = backend_for(engine, &self.config, Arc::clone(&self.executor));
        let credential_ref = self.credential_path(domain);
        let (password, generated) =
            read_or_generate_secret(&credential_ref, self.config.database.password_length)?;

        let grant = DatabaseGrant {
            engine,
            name: name.to_string(),
            user: user.to_string(),
            credential_ref,
        };

        let database_exists = backend.database_exists(name)?;
        let principal_exists = backend.principal_exists(user)?;
        if database_exists && principal_exists && !generated {
            return Ok((grant, false));
        }

        if !database_exists {
            backend.create_database(name)?;
        }
        backend.create_principal(user, &password)?;
        backend.grant_all(name, user)?;
        info!(engine = %backend.engine(), database = name, "database provisioned");
        Ok((grant, true))
    }

    /// Drop the database and its principal. The credential file is removed too.
    #[instrument(skip(self, grant), fields(database = %grant.name))]
    pub fn deprovision(&self, grant: &DatabaseGrant) -> Result<()> {
        validate_db_identifier("Database name", &grant.name)?;
        validate_db_identifier("Database user", &grant.user)?;

        let backend = backend_for(grant.engine, &self.config, Arc::clone(&self.executor));
        backend.drop_database(&grant.name)?;
        backend.drop_principal(&grant.user)?;
        hostpanel_core::file_system::remove_file_if_exists(&grant.credential_ref)?;
        info!("database dropped");
        Ok(())
    }
}

/// Standard SQL string literal (`'` doubled).
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
