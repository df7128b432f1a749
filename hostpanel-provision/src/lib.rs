//! Leaf managers for the resources a hosted site is made of.
//!
//! Each manager owns one kind of OS-level resource, is configured from
//! [`hostpanel_config::PanelConfig`], runs every external process through a
//! shared [`hostpanel_core::CommandExecutor`], and is idempotent: calling a
//! create operation for something that already exists in the desired shape is
//! a no-op.

pub mod apps;
pub mod certificates;
pub mod database;
pub mod mail;
pub mod proxy;
pub mod runtime_pool;
pub mod service;
pub mod site_fs;
mod templates;
pub mod users;

// When the `test-helpers` feature is enabled, include the fake host executor.
#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

pub use apps::{AppInstaller, InstallOutcome};
pub use certificates::{
    Certificate, CertificateManager, CertificateStatus, RenewalAttempt, RenewalOutcome,
};
pub use database::{DatabaseBackend, DatabaseGrant, DatabaseProvisioner};
pub use mail::{MailAccount, MailRouter};
pub use proxy::{ProxyConfigManager, UpstreamTarget, VirtualHostSpec, VhostWrite, WriteOutcome};
pub use runtime_pool::{PoolOutcome, RuntimePool, RuntimePoolManager};
pub use site_fs::{SiteFilesystem, SiteRoot};
pub use users::{Attachment, Detachment, SystemUserRegistry};
