use std::sync::Arc;

use hostpanel_config::{DatabaseEngine, PanelConfig, PostgresSettings};
use hostpanel_core::{CommandExecutor, CommandOutput, CommandSpec, Result};

use super::{quote_literal, DatabaseBackend};

/// PostgreSQL through `psql`, run as the database superuser account with
/// peer authentication so no admin password is involved.
pub struct PostgresBackend {
    settings: PostgresSettings,
    timeout_secs: u64,
    executor: Arc<dyn CommandExecutor>,
}

impl PostgresBackend {
    pub fn new(config: &PanelConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            settings: config.database.postgresql.clone(),
            timeout_secs: config.timeouts.database_secs,
            executor,
        }
    }

    fn execute(&self, sql: &str) -> Result<CommandOutput> {
        let spec = CommandSpec::new(&self.settings.run_as)
            .args(["-u", self.settings.superuser.as_str(), "--", self.settings.psql.as_str()])
            .args(["-v", "ON_ERROR_STOP=1", "-tA", "-d", "postgres"])
            .stdin(sql)
            .timeout_secs(self.timeout_secs);
        self.executor.run_checked(&spec)
    }
}

impl DatabaseBackend for PostgresBackend {
    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::Postgresql
    }

    fn database_exists(&self, name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM pg_database WHERE datname = {};\n",
            quote_literal(name)
        );
        Ok(self.execute(&sql)?.stdout.trim() == "1")
    }

    fn principal_exists(&self, user: &str) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM pg_roles WHERE rolname = {};\n",
            quote_literal(user)
        );
        Ok(self.execute(&sql)?.stdout.trim() == "1")
    }

    fn create_database(&self, name: &str) -> Result<()> {
        // CREATE DATABASE cannot run inside a DO block; existence is checked by the caller.
        self.execute(&format!("CREATE DATABASE \"{}\" ENCODING 'UTF8';\n", name))
            .map(|_| ())
    }

    fn create_principal(&self, user: &str, password: &str) -> Result<()> {
        let secret = quote_literal(password);
        let sql = format!(
            "DO $$\nBEGIN\n  IF NOT EXISTS (SELECT FROM pg_roles WHERE rolname = {role}) THEN\n    \
             CREATE ROLE \"{user}\" LOGIN PASSWORD {secret};\n  ELSE\n    \
             ALTER ROLE \"{user}\" WITH LOGIN PASSWORD {secret};\n  END IF;\nEND\n$$;\n",
            role = quote_literal(user),
        );
        self.execute(&sql).map(|_| ())
    }

    fn grant_all(&self, name: &str, user: &str) -> Result<()> {
        let sql = format!(
            "GRANT ALL PRIVILEGES ON DATABASE \"{name}\" TO \"{user}\";\n\
             ALTER DATABASE \"{name}\" OWNER TO \"{user}\";\n"
        );
        self.execute(&sql).map(|_| ())
    }

    fn drop_database(&self, name: &str) -> Result<()> {
        self.execute(&format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE);\n", name))
            .map(|_| ())
    }

    fn drop_principal(&self, user: &str) -> Result<()> {
        self.execute(&format!("DROP ROLE IF EXISTS \"{}\";\n", user))
            .map(|_| ())
    }
}
