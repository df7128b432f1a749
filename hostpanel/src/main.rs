// External crates
use clap::Parser;
use tracing::{debug, warn};

// Internal imports
use hostpanel_logging::{init_subscriber, LogSettings};

// Local modules
mod cli;
mod commands;

use cli::Args;
use commands::{execute_command, Outcome};

/// Some steps failed or were skipped; the site record holds the details.
const EXIT_PARTIAL: i32 = 2;

fn main() {
    let args = Args::parse();

    let log_guard = init_subscriber(&LogSettings::from_env(args.debug));
    debug!(command = args.command.name(), "starting hostpanel");

    if !nix::unistd::Uid::effective().is_root() {
        warn!("not running as root; account, service and permission changes will fail");
    }

    let code = match execute_command(args) {
        Ok(Outcome::Success) => 0,
        Ok(Outcome::Partial) => EXIT_PARTIAL,
        Err(e) => {
            eprintln!("hostpanel: {:#}", e);
            1
        }
    };

    // Flush the file appender before exiting.
    drop(log_guard);
    if code != 0 {
        std::process::exit(code);
    }
}
