//! In-memory stand-in for the host, used by unit and integration tests.
//!
//! [`FakeHost`] implements [`CommandExecutor`] by simulating the handful of
//! tools the managers drive (`id`/`useradd`/`userdel`, `chown`/`stat`,
//! syntax checks, `systemctl`, `certbot`, `openssl`, the database clients
//! and `wp`) and
//! recording every invocation so tests can assert on what would have run.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use hostpanel_config::PanelConfig;
use hostpanel_core::{CommandExecutor, CommandOutput, CommandSpec, HostError, Result};

static CREATE_DATABASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"CREATE DATABASE (?:IF NOT EXISTS )?[`"]?(\w+)"#).expect("static regex"));
static DROP_DATABASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"DROP DATABASE (?:IF EXISTS )?[`"]?(\w+)"#).expect("static regex"));
static CREATE_PRINCIPAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"CREATE (?:USER (?:IF NOT EXISTS )?'|ROLE ")(\w+)"#).expect("static regex")
});
static DROP_PRINCIPAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"DROP (?:USER|ROLE) (?:IF EXISTS )?['"](\w+)"#).expect("static regex")
});
static DATABASE_QUERY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:SCHEMA_NAME|datname) = '(\w+)'").expect("static regex")
});
static PRINCIPAL_QUERY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:User|rolname) = '(\w+)'").expect("static regex"));

/// One command as the fake host saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl RecordedCommand {
    pub fn line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Whether running this command would change the host.
    pub fn is_mutating(&self) -> bool {
        let name = program_name(&self.program);
        if name == "id" || name == "openssl" || name == "stat" {
            return false;
        }
        if self.args.len() == 1 && self.args[0] == "-t" {
            return false;
        }
        if is_database_client(name, &self.args) {
            let sql = self.stdin.as_deref().unwrap_or_default();
            return ["CREATE ", "DROP ", "GRANT ", "ALTER "]
                .iter()
                .any(|keyword| sql.contains(keyword));
        }
        true
    }
}

#[derive(Debug, Clone)]
enum FailureMode {
    Exit { code: i32, stderr: String },
    Timeout,
}

#[derive(Debug, Clone)]
struct Failure {
    pattern: String,
    mode: FailureMode,
}

#[derive(Debug, Default)]
struct FakeState {
    users: BTreeSet<String>,
    databases: BTreeSet<String>,
    principals: BTreeSet<String>,
    certificates: BTreeMap<String, DateTime<Utc>>,
    /// `user:group` of every path a `chown -R` reached
    owners: BTreeMap<PathBuf, String>,
    commands: Vec<RecordedCommand>,
    failures: Vec<Failure>,
}

/// Simulated host for tests.
#[derive(Debug)]
pub struct FakeHost {
    state: Mutex<FakeState>,
    live_dir: Option<PathBuf>,
    certificate_validity_days: i64,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            live_dir: None,
            certificate_validity_days: 90,
        }
    }

    /// A fake host whose `certbot` writes certificate files under the
    /// configured live directory.
    pub fn for_config(config: &PanelConfig) -> Self {
        Self {
            live_dir: Some(config.certificates.live_dir.clone()),
            ..Self::new()
        }
    }

    pub fn with_user(self, name: &str) -> Self {
        self.state().users.insert(name.to_string());
        self
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every command whose line or stdin contains `pattern` exit with `code`.
    pub fn fail_on(&self, pattern: &str, code: i32, stderr: &str) {
        self.state().failures.push(Failure {
            pattern: pattern.to_string(),
            mode: FailureMode::Exit {
                code,
                stderr: stderr.to_string(),
            },
        });
    }

    /// Make every command whose line or stdin contains `pattern` time out.
    pub fn timeout_on(&self, pattern: &str) {
        self.state().failures.push(Failure {
            pattern: pattern.to_string(),
            mode: FailureMode::Timeout,
        });
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn set_certificate_expiry(&self, domain: &str, expires_at: DateTime<Utc>) {
        self.state()
            .certificates
            .insert(domain.to_string(), expires_at);
    }

    pub fn has_user(&self, name: &str) -> bool {
        self.state().users.contains(name)
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.state().databases.contains(name)
    }

    pub fn has_principal(&self, name: &str) -> bool {
        self.state().principals.contains(name)
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state().commands.clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.state().commands.iter().map(RecordedCommand::line).collect()
    }

    pub fn command_count(&self) -> usize {
        self.state().commands.len()
    }

    /// Commands recorded after the first `mark` ones.
    pub fn commands_since(&self, mark: usize) -> Vec<RecordedCommand> {
        self.state().commands.iter().skip(mark).cloned().collect()
    }

    /// Lines of the mutating commands recorded after the first `mark` ones.
    pub fn mutating_since(&self, mark: usize) -> Vec<String> {
        self.commands_since(mark)
            .iter()
            .filter(|c| c.is_mutating())
            .map(RecordedCommand::line)
            .collect()
    }

    fn simulate(&self, record: &RecordedCommand) -> CommandOutput {
        let name = program_name(&record.program);
        let args = &record.args;

        if is_database_client(name, args) {
            return self.simulate_sql(record.stdin.as_deref().unwrap_or_default());
        }

        match name {
            "id" => {
                let user = args.last().cloned().unwrap_or_default();
                if self.state().users.contains(&user) {
                    ok("1001\n")
                } else {
                    exit(1, &format!("id: '{}': no such user", user))
                }
            }
            "useradd" => {
                let user = args.last().cloned().unwrap_or_default();
                if self.state().users.insert(user.clone()) {
                    ok("")
                } else {
                    exit(9, &format!("useradd: user '{}' already exists", user))
                }
            }
            "userdel" => {
                let user = args.last().cloned().unwrap_or_default();
                if self.state().users.remove(&user) {
                    ok("")
                } else {
                    exit(6, &format!("userdel: user '{}' does not exist", user))
                }
            }
            "chown" => {
                let (Some(owner), Some(path)) = (args.iter().rev().nth(1), args.last()) else {
                    return exit(1, "chown: missing operand");
                };
                let mut reached = Vec::new();
                collect_tree(Path::new(path), &mut reached);
                let mut state = self.state();
                for path in reached {
                    state.owners.insert(path, owner.clone());
                }
                ok("")
            }
            "stat" => {
                let path = PathBuf::from(args.last().cloned().unwrap_or_default());
                let owner = self.state().owners.get(&path).cloned();
                match owner {
                    Some(owner) => ok(&format!("{}\n", owner)),
                    None if path.exists() => ok("root:root\n"),
                    None => exit(1, "stat: cannot statx: No such file or directory"),
                }
            }
            "certbot" => self.simulate_certbot(args),
            "openssl" => self.simulate_openssl(args),
            "wp" => simulate_wp(args),
            _ => ok(""),
        }
    }

    fn simulate_certbot(&self, args: &[String]) -> CommandOutput {
        let domain = flag_value(args, "--cert-name").or_else(|| flag_value(args, "-d"));
        let Some(domain) = domain else {
            return exit(1, "certbot: no domain given");
        };
        let expires_at = Utc::now() + Duration::days(self.certificate_validity_days);

        match args.first().map(String::as_str) {
            Some("certonly") | Some("renew") => {
                self.state().certificates.insert(domain.clone(), expires_at);
                if let Some(live_dir) = &self.live_dir {
                    let dir = live_dir.join(&domain);
                    let written = fs::create_dir_all(&dir)
                        .and_then(|_| fs::write(dir.join("fullchain.pem"), "CERTIFICATE"))
                        .and_then(|_| fs::write(dir.join("privkey.pem"), "PRIVATE KEY"));
                    if let Err(e) = written {
                        return exit(1, &format!("certbot: {}", e));
                    }
                }
                ok("Successfully received certificate.\n")
            }
            _ => exit(2, "certbot: unsupported subcommand"),
        }
    }

    fn simulate_openssl(&self, args: &[String]) -> CommandOutput {
        let domain = flag_value(args, "-in").and_then(|path| {
            Path::new(&path)
                .parent()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
        });
        let expiry = domain.and_then(|d| self.state().certificates.get(&d).copied());
        match expiry {
            Some(at) => ok(&format!("notAfter={}\n", at.format("%b %e %H:%M:%S %Y GMT"))),
            None => exit(1, "Could not open file or uri for loading certificate"),
        }
    }

    fn simulate_sql(&self, sql: &str) -> CommandOutput {
        let mut state = self.state();
        let mut stdout = String::new();

        for cap in DATABASE_QUERY.captures_iter(sql) {
            if state.databases.contains(&cap[1]) {
                stdout.push_str("1\n");
            }
        }
        for cap in PRINCIPAL_QUERY.captures_iter(sql) {
            if state.principals.contains(&cap[1]) {
                stdout.push_str("1\n");
            }
        }
        for cap in CREATE_DATABASE.captures_iter(sql) {
            state.databases.insert(cap[1].to_string());
        }
        for cap in DROP_DATABASE.captures_iter(sql) {
            state.databases.remove(&cap[1]);
        }
        for cap in CREATE_PRINCIPAL.captures_iter(sql) {
            state.principals.insert(cap[1].to_string());
        }
        for cap in DROP_PRINCIPAL.captures_iter(sql) {
            state.principals.remove(&cap[1]);
        }
        ok(&stdout)
    }
}

impl CommandExecutor for FakeHost {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let record = RecordedCommand {
            program: spec.program.clone(),
            args: spec.args.clone(),
            stdin: spec
                .stdin
                .as_ref()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
        };
        self.state().commands.push(record.clone());

        let haystack = format!("{} {}", record.line(), record.stdin.as_deref().unwrap_or_default());
        let failure = self
            .state()
            .failures
            .iter()
            .find(|f| haystack.contains(&f.pattern))
            .cloned();
        if let Some(failure) = failure {
            return match failure.mode {
                FailureMode::Exit { code, stderr } => Ok(exit(code, &stderr)),
                FailureMode::Timeout => Err(HostError::Timeout {
                    command: spec.command_line(),
                    secs: spec.timeout.as_secs(),
                }),
            };
        }

        Ok(self.simulate(&record))
    }
}

fn program_name(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

fn is_database_client(name: &str, args: &[String]) -> bool {
    name == "mysql" || name == "psql" || args.iter().any(|a| a == "psql")
}

/// `path` and everything below it that exists right now.
fn collect_tree(path: &Path, out: &mut Vec<PathBuf>) {
    if !path.exists() {
        return;
    }
    out.push(path.to_path_buf());
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            collect_tree(&entry.path(), out);
        }
    }
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn simulate_wp(args: &[String]) -> CommandOutput {
    let path = args.iter().find_map(|a| a.strip_prefix("--path="));
    match (args.first().map(String::as_str), path) {
        (Some("core"), Some(path)) => {
            let root = Path::new(path);
            let written = fs::create_dir_all(root)
                .and_then(|_| fs::write(root.join("wp-load.php"), "<?php\n"))
                .and_then(|_| fs::write(root.join("wp-settings.php"), "<?php\n"))
                .and_then(|_| fs::write(root.join("index.php"), "<?php\n"));
            match written {
                Ok(()) => ok("Success: WordPress downloaded.\n"),
                Err(e) => exit(1, &format!("Error: {}", e)),
            }
        }
        _ => ok(""),
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn exit(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}
