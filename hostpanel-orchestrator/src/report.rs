//! Per-step outcomes of one reconciliation, persisted on the site record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hostpanel_core::{ErrorKind, HostError};

use crate::site::{DesiredStatus, SiteState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepName {
    SystemUser,
    RuntimePool,
    SiteRoot,
    ProxyHttp,
    Database,
    AppInstall,
    MailRouting,
    Certificate,
    ProxyHttps,
    ProxySuspended,
    RemoveVhost,
    RemoveMail,
    DropDatabase,
    ArchiveRoot,
    RemovePool,
    ReleaseUser,
}

impl StepName {
    pub fn as_str(self) -> &'static str {
        match self {
            StepName::SystemUser => "system-user",
            StepName::RuntimePool => "runtime-pool",
            StepName::SiteRoot => "site-root",
            StepName::ProxyHttp => "proxy-http",
            StepName::Database => "database",
            StepName::AppInstall => "app-install",
            StepName::MailRouting => "mail-routing",
            StepName::Certificate => "certificate",
            StepName::ProxyHttps => "proxy-https",
            StepName::ProxySuspended => "proxy-suspended",
            StepName::RemoveVhost => "remove-vhost",
            StepName::RemoveMail => "remove-mail",
            StepName::DropDatabase => "drop-database",
            StepName::ArchiveRoot => "archive-root",
            StepName::RemovePool => "remove-pool",
            StepName::ReleaseUser => "release-user",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded {
        changed: bool,
    },
    Failed {
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
    /// Not attempted because a step it depends on did not succeed
    Skipped {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: StepName,
    /// Required for the target state
    pub hard: bool,
    #[serde(flatten)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, StepStatus::Succeeded { .. })
    }

    pub fn changed(&self) -> bool {
        matches!(self.status, StepStatus::Succeeded { changed: true })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.status {
            StepStatus::Succeeded { .. } => None,
            StepStatus::Failed { kind, .. } => Some(*kind),
            StepStatus::Skipped { .. } => Some(ErrorKind::DependencyUnmet),
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            StepStatus::Succeeded { changed: true } => write!(f, "{}: changed", self.step)?,
            StepStatus::Succeeded { changed: false } => write!(f, "{}: ok", self.step)?,
            StepStatus::Failed { message, retryable, .. } => {
                write!(f, "{}: FAILED", self.step)?;
                if *retryable {
                    write!(f, " (retryable)")?;
                }
                write!(f, ": {}", message)?;
            }
            StepStatus::Skipped { reason } => write!(f, "{}: skipped: {}", self.step, reason)?,
        }
        if let Some(detail) = &self.detail {
            write!(f, " [{}]", detail)?;
        }
        Ok(())
    }
}

/// What the orchestrator did for one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Provision,
    Suspend,
    Resume,
    Deprovision,
    /// Nothing to do, e.g. deleting a deleted site
    None,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Provision => "provision",
            Action::Suspend => "suspend",
            Action::Resume => "resume",
            Action::Deprovision => "deprovision",
            Action::None => "none",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub domain: String,
    pub action: Action,
    pub target: DesiredStatus,
    pub state: SiteState,
    pub steps: Vec<StepOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReconcileReport {
    /// Every step succeeded.
    pub fn is_success(&self) -> bool {
        self.steps.iter().all(StepOutcome::succeeded)
    }

    /// The site reached its target state, soft failures aside.
    pub fn reached_target(&self) -> bool {
        self.state == SiteState::reached(self.target)
    }

    pub fn changed_any(&self) -> bool {
        self.steps.iter().any(StepOutcome::changed)
    }

    pub fn step(&self, name: StepName) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == name)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| !s.succeeded())
    }
}

/// Result of a step body that ran to completion.
#[derive(Debug, Clone, Default)]
pub(crate) struct Applied {
    pub changed: bool,
    pub detail: Option<String>,
}

impl Applied {
    pub fn changed(changed: bool) -> Self {
        Self {
            changed,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Collects step outcomes and enforces hard dependencies between them.
#[derive(Debug, Default)]
pub(crate) struct StepLog {
    steps: Vec<StepOutcome>,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dependency that ran and did not succeed. Steps that never ran do
    /// not block.
    fn unmet(&self, depends_on: &[StepName]) -> Option<StepName> {
        depends_on.iter().copied().find(|dep| {
            self.steps
                .iter()
                .any(|outcome| outcome.step == *dep && !outcome.succeeded())
        })
    }

    /// Run `body` for `step` unless a dependency failed.
    pub fn run<F>(&mut self, step: StepName, hard: bool, depends_on: &[StepName], body: F)
    where
        F: FnOnce() -> hostpanel_core::Result<Applied>,
    {
        let span = tracing::info_span!("step", step = %step);
        let _entered = span.enter();

        if let Some(dep) = self.unmet(depends_on) {
            let reason = HostError::DependencyUnmet(format!("{} did not succeed", dep)).to_string();
            tracing::warn!("{}", reason);
            self.steps.push(StepOutcome {
                step,
                hard,
                status: StepStatus::Skipped { reason },
                detail: None,
            });
            return;
        }

        let outcome = match body() {
            Ok(applied) => {
                tracing::debug!(changed = applied.changed, "step succeeded");
                StepOutcome {
                    step,
                    hard,
                    status: StepStatus::Succeeded {
                        changed: applied.changed,
                    },
                    detail: applied.detail,
                }
            }
            Err(e) => {
                tracing::error!(kind = ?e.kind(), "step failed: {}", e);
                StepOutcome {
                    step,
                    hard,
                    status: StepStatus::Failed {
                        kind: e.kind(),
                        message: e.to_string(),
                        retryable: e.is_retryable(),
                    },
                    detail: None,
                }
            }
        };
        self.steps.push(outcome);
    }

    pub fn hard_steps_succeeded(&self) -> bool {
        self.steps.iter().filter(|s| s.hard).all(StepOutcome::succeeded)
    }

    pub fn into_steps(self) -> Vec<StepOutcome> {
        self.steps
    }
}
