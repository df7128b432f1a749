// CLI argument parsing and definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use hostpanel_config::DatabaseEngine;
use hostpanel_orchestrator::{DesiredStatus, PoolMode, SiteType};

#[derive(Debug, Clone, Parser)]
#[command(name = "hostpanel")]
#[command(about = "Keep hosted sites and their OS resources in their desired state")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the panel configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineArg {
    #[value(alias = "mysql")]
    Mariadb,
    #[value(alias = "postgres")]
    Postgresql,
}

impl From<EngineArg> for DatabaseEngine {
    fn from(engine: EngineArg) -> Self {
        match engine {
            EngineArg::Mariadb => DatabaseEngine::Mariadb,
            EngineArg::Postgresql => DatabaseEngine::Postgresql,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Register a site (or update its settings) and bring it to active
    Provision {
        domain: String,

        /// Site type: static, cms or tenant-app (defaults to the stored type, then static)
        #[arg(long = "type")]
        site_type: Option<SiteType>,

        /// Runtime version of the site's pool, e.g. 8.2
        #[arg(long)]
        runtime_version: Option<String>,

        /// OS account owning the site (derived from the domain when omitted)
        #[arg(long)]
        user: Option<String>,

        /// Worker pool: dedicated, shared or none
        #[arg(long)]
        pool: Option<PoolMode>,

        /// Upper bound of the pool's worker processes
        #[arg(long)]
        max_workers: Option<u32>,

        /// Database engine for tenant applications
        #[arg(long, value_enum)]
        engine: Option<EngineArg>,

        /// Tenant application to install (repeatable)
        #[arg(long = "app")]
        apps: Vec<String>,

        /// JSON file with the domain's mailboxes
        #[arg(long)]
        mail_file: Option<PathBuf>,
    },
    /// Remove every resource of a site
    Deprovision { domain: String },
    /// Replace a site's vhost with the suspension page
    Suspend { domain: String },
    /// Restore a suspended site's vhost
    Resume { domain: String },
    /// Converge one site, or every stored site, to its desired status
    Reconcile {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        domain: Option<String>,

        /// Desired status for the site (defaults to the stored one)
        #[arg(long, requires = "domain")]
        desired: Option<DesiredStatus>,

        /// Reconcile every stored site in parallel
        #[arg(long)]
        all: bool,
    },
    /// Renew certificates that expire soon
    RenewCerts {
        /// Renew certificates expiring within this many days
        #[arg(long)]
        days: Option<i64>,
    },
    /// Show a site's record and last report
    Status {
        domain: String,

        /// Print the stored record as JSON
        #[arg(long)]
        json: bool,
    },
    /// List OS accounts and the sites referencing them
    Users {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Provision { .. } => "provision",
            Command::Deprovision { .. } => "deprovision",
            Command::Suspend { .. } => "suspend",
            Command::Resume { .. } => "resume",
            Command::Reconcile { .. } => "reconcile",
            Command::RenewCerts { .. } => "renew-certs",
            Command::Status { .. } => "status",
            Command::Users { .. } => "users",
        }
    }
}
