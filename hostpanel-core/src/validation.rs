//! Centralized validation for tenant-influenced inputs.
//!
//! Every value that ends up in a command line, a generated configuration file
//! or an administrative SQL statement passes through one of these functions
//! before any side effect happens.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{HostError, Result};

/// Maximum length of a derived OS account name.
pub const SYSTEM_USER_MAX_LEN: usize = 16;

/// Maximum length of a derived database name or principal.
pub const DB_IDENTIFIER_MAX_LEN: usize = 16;

const DB_IDENTIFIER_PREFIX_LEN: usize = 10;
const DB_IDENTIFIER_DIGEST_LEN: usize = DB_IDENTIFIER_MAX_LEN - DB_IDENTIFIER_PREFIX_LEN - 1;

static DOMAIN_CHARSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9.-]+$").expect("static regex"));
static SYSTEM_USER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]{0,31}$").expect("static regex"));
static DB_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]{1,63}$").expect("static regex"));
static RUNTIME_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{1,2}\.[0-9]{1,2}$").expect("static regex"));
static MAIL_LOCAL_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]{0,63}$").expect("static regex"));

/// Validate a site domain.
///
/// Only lowercase alphanumerics, dots and hyphens are accepted, and the name
/// must additionally be a well-formed DNS hostname (RFC 1123 labels).
pub fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() || domain.len() > 253 {
        return Err(HostError::Validation(
            "Domain must be between 1 and 253 characters".to_string(),
        ));
    }

    if !DOMAIN_CHARSET.is_match(domain) {
        return Err(HostError::Validation(format!(
            "Invalid domain '{}': only lowercase alphanumeric characters, dots, and hyphens are allowed",
            domain
        )));
    }

    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(HostError::Validation(
            "Domain cannot start or end with a dot".to_string(),
        ));
    }

    for label in domain.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(HostError::Validation(
                "Domain labels must be between 1 and 63 characters".to_string(),
            ));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(HostError::Validation(format!(
                "Domain label '{}' cannot start or end with a hyphen",
                label
            )));
        }
    }

    Ok(())
}

/// Derive the OS account name for a domain.
///
/// The final label (TLD) is dropped when there is more than one label, every
/// non-alphanumeric character is removed and the result is capped at
/// [`SYSTEM_USER_MAX_LEN`]. Names that would start with a digit get a `u`
/// prefix so they remain valid account names.
pub fn derive_system_user(domain: &str) -> Result<String> {
    validate_domain(domain)?;

    let labels: Vec<&str> = domain.split('.').collect();
    let significant = if labels.len() > 1 {
        &labels[..labels.len() - 1]
    } else {
        &labels[..]
    };

    let mut name: String = significant
        .iter()
        .flat_map(|label| label.chars())
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, 'u');
    }
    name.truncate(SYSTEM_USER_MAX_LEN);

    if name.is_empty() {
        return Err(HostError::Validation(format!(
            "Cannot derive a system user name from domain '{}'",
            domain
        )));
    }

    Ok(name)
}

/// Validate an explicitly assigned OS account name.
pub fn validate_system_user(name: &str) -> Result<()> {
    if SYSTEM_USER.is_match(name) {
        Ok(())
    } else {
        Err(HostError::Validation(format!(
            "Invalid system user '{}': must start with a lowercase letter and contain only [a-z0-9_-] (max 32)",
            name
        )))
    }
}

/// Derive the default database name (and principal) for a domain.
///
/// A readable prefix of the domain followed by a short SHA-256 digest of the
/// whole domain, e.g. `my_site_ex_cc098`. Domains that only differ past the
/// prefix, or in punctuation, still get distinct identifiers.
pub fn derive_db_identifier(domain: &str) -> Result<String> {
    use sha2::{Digest, Sha256};

    validate_domain(domain)?;
    let prefix: String = domain
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(DB_IDENTIFIER_PREFIX_LEN)
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    Ok(format!("{}_{}", prefix, &digest[..DB_IDENTIFIER_DIGEST_LEN]))
}

/// Validate a database name or principal against the strict allow-list.
///
/// `what` is used in the error message ("Database name", "Database user").
pub fn validate_db_identifier(what: &str, value: &str) -> Result<()> {
    if DB_IDENTIFIER.is_match(value) {
        Ok(())
    } else {
        Err(HostError::Validation(format!(
            "{} '{}' can only contain alphanumeric characters and underscores",
            what, value
        )))
    }
}

/// Validate a runtime version such as `8.2`.
pub fn validate_runtime_version(version: &str) -> Result<()> {
    if RUNTIME_VERSION.is_match(version) {
        Ok(())
    } else {
        Err(HostError::Validation(format!(
            "Invalid runtime version '{}': expected MAJOR.MINOR",
            version
        )))
    }
}

/// Validate the local part of a hosted mailbox (`info` in `info@example.com`).
pub fn validate_mail_local_part(local_part: &str) -> Result<()> {
    if MAIL_LOCAL_PART.is_match(local_part) {
        Ok(())
    } else {
        Err(HostError::Validation(format!(
            "Invalid mailbox name '{}'",
            local_part
        )))
    }
}
