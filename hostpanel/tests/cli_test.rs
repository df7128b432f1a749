use anyhow::Result;
use assert_cmd::prelude::*; // For OutputAssertExt
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

use hostpanel_config::ConfigLoader;
use hostpanel_core::SystemExecutor;
use hostpanel_orchestrator::{Orchestrator, SiteRequest, SiteType};

/// A panel configuration whose state and web trees live in a temp dir.
struct CliTestFixture {
    _temp_dir: TempDir,
    root: PathBuf,
    config_path: PathBuf,
}

impl CliTestFixture {
    fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().to_path_buf();
        let config_path = root.join("config.yaml");
        fs::write(
            &config_path,
            format!(
                "paths:\n  web_root: {root}/www\n  state_dir: {root}/state\n  suspended_root: {root}/suspended\n",
                root = root.display()
            ),
        )?;
        Ok(Self {
            _temp_dir: temp_dir,
            root,
            config_path,
        })
    }

    fn hostpanel(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_hostpanel"));
        cmd.arg("--config")
            .arg(&self.config_path)
            .args(args)
            .env_remove("HOSTPANEL_CONFIG")
            .env_remove("RUST_LOG")
            .env("HOSTPANEL_LOG_OUTPUT", "none");
        cmd
    }

    /// Store a site record without touching the host.
    fn register(&self, domain: &str, site_type: SiteType) -> Result<()> {
        let config = ConfigLoader::load_file(&self.config_path)?;
        let orchestrator = Orchestrator::with_defaults(config, Arc::new(SystemExecutor::new()));
        orchestrator.register(&SiteRequest::new(domain, site_type))?;
        Ok(())
    }
}

#[test]
fn test_help_lists_every_command() {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_hostpanel"));
    let assert = cmd.arg("--help").assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    for command in [
        "provision",
        "deprovision",
        "suspend",
        "resume",
        "reconcile",
        "renew-certs",
        "status",
        "users",
    ] {
        assert!(stdout.contains(command), "missing {} in help", command);
    }
}

#[test]
fn test_invalid_domain_is_rejected_before_any_change() -> Result<()> {
    let fixture = CliTestFixture::new()?;

    fixture
        .hostpanel(&["provision", "Invalid Domain!"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Validation error"));

    assert!(!fixture.root.join("state").exists());
    assert!(!fixture.root.join("www").exists());
    Ok(())
}

#[test]
fn test_invalid_pool_mode_for_cms_is_rejected() -> Result<()> {
    let fixture = CliTestFixture::new()?;

    fixture
        .hostpanel(&["provision", "blog.example.com", "--type", "cms", "--pool", "none"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Validation error"));

    assert!(!fixture.root.join("state/sites/blog.example.com.json").exists());
    Ok(())
}

#[test]
fn test_status_of_unknown_site_fails() -> Result<()> {
    let fixture = CliTestFixture::new()?;

    fixture
        .hostpanel(&["status", "unknown.example.com"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Site not found: unknown.example.com"));
    Ok(())
}

#[test]
fn test_status_shows_registered_site() -> Result<()> {
    let fixture = CliTestFixture::new()?;
    fixture.register("blog.example.com", SiteType::Cms)?;

    fixture
        .hostpanel(&["status", "blog.example.com"])
        .assert()
        .success()
        .stdout(predicate::str::contains("type:      cms"))
        .stdout(predicate::str::contains("state:     new"))
        .stdout(predicate::str::contains("database:  mariadb"));

    let output = fixture
        .hostpanel(&["status", "blog.example.com", "--json"])
        .output()?;
    assert!(output.status.success());
    let record: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(record["domain"], "blog.example.com");
    assert_eq!(record["site_type"], "cms");
    assert_eq!(record["state"]["state"], "new");
    Ok(())
}

#[test]
fn test_suspending_a_new_site_is_an_invalid_transition() -> Result<()> {
    let fixture = CliTestFixture::new()?;
    fixture.register("new.example.com", SiteType::Static)?;

    fixture
        .hostpanel(&["suspend", "new.example.com"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid transition"));
    Ok(())
}

#[test]
fn test_empty_host_sweeps_succeed() -> Result<()> {
    let fixture = CliTestFixture::new()?;

    fixture
        .hostpanel(&["users"])
        .assert()
        .success()
        .stdout("No site accounts\n");

    fixture
        .hostpanel(&["reconcile", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 sites reconciled, 0 with failures"));

    fixture
        .hostpanel(&["renew-certs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 renewed, 0 not due, 0 failed"));
    Ok(())
}

#[test]
fn test_missing_config_file_is_an_error() -> Result<()> {
    let fixture = CliTestFixture::new()?;

    Command::new(env!("CARGO_BIN_EXE_hostpanel"))
        .arg("--config")
        .arg(fixture.root.join("absent.yaml"))
        .arg("users")
        .env("HOSTPANEL_LOG_OUTPUT", "none")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to load configuration"));
    Ok(())
}
