//! Site lifecycle orchestration.
//!
//! The [`Orchestrator`] keeps each hosted site's bundle of OS resources
//! (account, runtime pool, document root, vhost, database, application,
//! mail routing, certificate) consistent with the site's desired status,
//! recording a per-step report on the stored site record.

pub mod error;
pub mod locks;
pub mod notify;
pub mod orchestrator;
pub mod renewals;
pub mod report;
pub mod site;
pub mod store;

pub use error::{OrchestratorError, Result};
pub use notify::{CollectingNotifier, Notification, Notifier, Severity, TracingNotifier};
pub use orchestrator::{plan, Orchestrator, SiteRun};
pub use renewals::{ExpiryWarning, RenewalFailure, RenewalSummary};
pub use report::{Action, ReconcileReport, StepName, StepOutcome, StepStatus};
pub use site::{DesiredStatus, PoolMode, Site, SiteRequest, SiteState, SiteType};
pub use store::{JsonSiteStore, SiteStore};
