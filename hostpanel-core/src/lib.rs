//! Foundation primitives shared by every hostpanel crate.
//!
//! Everything that touches the operating system funnels through here: the
//! [`command::CommandExecutor`] choke point for external processes, the
//! filesystem helpers with containment checks, input validation, and the
//! error taxonomy recorded against reconciliation steps.

pub mod command;
pub mod error;
pub mod file_system;
pub mod lock;
pub mod secrets;
pub mod temp_dir;
pub mod validation;

pub use command::{CommandExecutor, CommandOutput, CommandSpec, SystemExecutor};
pub use error::{ErrorKind, HostError, Result};
pub use lock::FileLock;
