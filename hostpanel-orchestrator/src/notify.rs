//! Human-readable messages about what happened to a site.

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub domain: String,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.domain, self.message)
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Default sink: every notification becomes a log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        let domain = notification.domain.as_str();
        match notification.severity {
            Severity::Info => info!(target: "hostpanel::notify", domain, "{}", notification.message),
            Severity::Warning => warn!(target: "hostpanel::notify", domain, "{}", notification.message),
            Severity::Error => error!(target: "hostpanel::notify", domain, "{}", notification.message),
        }
    }
}

/// Keeps notifications in memory; used by tests and the CLI summary.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    collected: Mutex<Vec<Notification>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.collected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.collected.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, notification: Notification) {
        TracingNotifier.notify(notification.clone());
        self.collected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
    }
}
