//! Configuration for hostpanel.
//!
//! One [`PanelConfig`] value is loaded at startup and handed to every manager;
//! nothing reads directory conventions or credentials from ambient state.

pub mod config;
pub mod loader;

pub use config::{
    AppSettings, CertificateSettings, DatabaseEngine, DatabaseSettings, LifecycleSettings,
    MailSettings, MariaDbSettings, PanelConfig, PathSettings, PostgresSettings, ProxySettings,
    RuntimeSettings, TimeoutSettings, UserSettings,
};
pub use loader::{ConfigError, ConfigLoader};
