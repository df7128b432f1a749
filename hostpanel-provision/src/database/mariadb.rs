use std::sync::Arc;

use hostpanel_config::{DatabaseEngine, MariaDbSettings, PanelConfig};
use hostpanel_core::secrets::read_secret;
use hostpanel_core::temp_dir::create_private_temp_file;
use hostpanel_core::{CommandExecutor, CommandOutput, CommandSpec, HostError, Result};

use super::{quote_literal, DatabaseBackend};

/// MariaDB/MySQL through the `mysql` client.
///
/// Admin credentials are passed in a private `--defaults-extra-file` that is
/// deleted as soon as the client exits.
pub struct MariaDbBackend {
    settings: MariaDbSettings,
    timeout_secs: u64,
    executor: Arc<dyn CommandExecutor>,
}

impl MariaDbBackend {
    pub fn new(config: &PanelConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            settings: config.database.mariadb.clone(),
            timeout_secs: config.timeouts.database_secs,
            executor,
        }
    }

    fn defaults_file(&self) -> Result<String> {
        let mut contents = format!(
            "[client]\nuser={}\nhost={}\n",
            self.settings.admin_user, self.settings.host
        );
        if let Some(path) = &self.settings.admin_password_file {
            let password = read_secret(path)?.ok_or_else(|| {
                HostError::Config(format!(
                    "MariaDB admin password file is empty or missing: {}",
                    path.display()
                ))
            })?;
            contents.push_str(&format!("password={}\n", password));
        }
        Ok(contents)
    }

    fn execute(&self, sql: &str) -> Result<CommandOutput> {
        let defaults = create_private_temp_file("mysql_", ".cnf", self.defaults_file()?.as_bytes())?;
        let spec = CommandSpec::new(&self.settings.client)
            .arg(format!("--defaults-extra-file={}", defaults.path().display()))
            .args(["--batch", "--skip-column-names"])
            .stdin(sql)
            .timeout_secs(self.timeout_secs);
        let output = self.executor.run_checked(&spec);
        drop(defaults);
        output
    }

    fn account(user: &str) -> String {
        format!("{}@'localhost'", quote_literal(user))
    }
}

/// MariaDB string literal: backslashes are escapes there.
fn mysql_literal(value: &str) -> String {
    quote_literal(&value.replace('\\', "\\\\"))
}

impl DatabaseBackend for MariaDbBackend {
    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::Mariadb
    }

    fn database_exists(&self, name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT SCHEMA_NAME FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME = {};\n",
            quote_literal(name)
        );
        Ok(!self.execute(&sql)?.stdout.trim().is_empty())
    }

    fn principal_exists(&self, user: &str) -> Result<bool> {
        let sql = format!(
            "SELECT User FROM mysql.user WHERE User = {} AND Host = 'localhost';\n",
            quote_literal(user)
        );
        Ok(!self.execute(&sql)?.stdout.trim().is_empty())
    }

    fn create_database(&self, name: &str) -> Result<()> {
        let sql = format!(
            "CREATE DATABASE IF NOT EXISTS `{}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci;\n",
            name
        );
        self.execute(&sql).map(|_| ())
    }

    fn create_principal(&self, user: &str, password: &str) -> Result<()> {
        let account = Self::account(user);
        let secret = mysql_literal(password);
        let sql = format!(
            "CREATE USER IF NOT EXISTS {account} IDENTIFIED BY {secret};\n\
             ALTER USER {account} IDENTIFIED BY {secret};\n"
        );
        self.execute(&sql).map(|_| ())
    }

    fn grant_all(&self, name: &str, user: &str) -> Result<()> {
        let sql = format!(
            "GRANT ALL PRIVILEGES ON `{}`.* TO {};\nFLUSH PRIVILEGES;\n",
            name,
            Self::account(user)
        );
        self.execute(&sql).map(|_| ())
    }

    fn drop_database(&self, name: &str) -> Result<()> {
        self.execute(&format!("DROP DATABASE IF EXISTS `{}`;\n", name))
            .map(|_| ())
    }

    fn drop_principal(&self, user: &str) -> Result<()> {
        let sql = format!(
            "DROP USER IF EXISTS {};\nFLUSH PRIVILEGES;\n",
            Self::account(user)
        );
        self.execute(&sql).map(|_| ())
    }
}
