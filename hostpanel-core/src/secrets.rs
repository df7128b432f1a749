//! Credential generation and storage.
//!
//! Generated passwords are kept in `0600` files under the state directory; site
//! records only hold the path to the file, never the secret itself.

use std::fs;
use std::path::Path;

use rand::prelude::*;

use crate::error::Result;
use crate::file_system::write_atomic;

/// Generate a random alphanumeric password.
pub fn generate_random_password(length: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ\
                            abcdefghijklmnopqrstuvwxyz\
                            0123456789";
    let mut rng = rand::rng();
    (0..length)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Read the secret stored at `path`, or generate and persist a new one.
///
/// Returns the secret and whether it was freshly generated.
pub fn read_or_generate_secret(path: &Path, length: usize) -> Result<(String, bool)> {
    if path.exists() {
        let secret = fs::read_to_string(path)?;
        let secret = secret.trim().to_string();
        if !secret.is_empty() {
            return Ok((secret, false));
        }
    }

    let secret = generate_random_password(length);
    write_atomic(path, secret.as_bytes(), 0o600)?;
    Ok((secret, true))
}

/// Read an existing secret without generating one.
pub fn read_secret(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let secret = fs::read_to_string(path)?.trim().to_string();
    Ok(if secret.is_empty() { None } else { Some(secret) })
}
