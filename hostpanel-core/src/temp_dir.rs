use std::io::Write;

use tempfile::{Builder, NamedTempFile};

use crate::error::Result;
use crate::file_system::set_mode;

/// Creates a temporary file readable only by the current user and fills it
/// with `contents`.
///
/// Used for client credential files handed to command-line tools by path. The
/// file is deleted when the returned handle is dropped.
pub fn create_private_temp_file(prefix: &str, suffix: &str, contents: &[u8]) -> Result<NamedTempFile> {
    let mut file = Builder::new().prefix(prefix).suffix(suffix).tempfile()?;
    set_mode(file.path(), 0o600)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    Ok(file)
}
