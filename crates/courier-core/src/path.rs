//! File name validation and on-disk naming
//!
//! Names on the wire are single path components. Every name is checked here
//! before it is joined onto a directory, on both the server and the client.

use std::path::{Path, PathBuf};

use crate::error::ProtocolError;
use crate::types::SessionId;
use crate::MAX_FILENAME_LEN;

/// Suffix of in-progress staging files
pub const STAGING_SUFFIX: &str = ".part";

/// Validate a filename (single path component)
pub fn validate_filename(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::InvalidName("empty filename".into()));
    }

    if name.len() > MAX_FILENAME_LEN {
        return Err(ProtocolError::NameTooLong {
            len: name.len(),
            max: MAX_FILENAME_LEN,
        });
    }

    if name.contains('\0') {
        return Err(ProtocolError::InvalidName(
            "filename contains null byte".into(),
        ));
    }

    if name == "." || name == ".." {
        return Err(ProtocolError::InvalidName(
            "special directory names not allowed".into(),
        ));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(ProtocolError::InvalidName(
            "filename contains path separator".into(),
        ));
    }

    Ok(())
}

/// Join a validated name onto a base directory
pub fn resolve(base: &Path, name: &str) -> Result<PathBuf, ProtocolError> {
    validate_filename(name)?;
    Ok(base.join(name))
}

/// Hidden, session-unique name used while a file is still arriving
///
/// Two sessions receiving the same declared name never share a staging file.
/// Long names are shortened so the result still fits in `MAX_FILENAME_LEN`.
pub fn staging_name(name: &str, session: SessionId) -> String {
    // dot + dot + 16 hex digits + suffix
    let overhead = 2 + 16 + STAGING_SUFFIX.len();
    let mut end = name.len().min(MAX_FILENAME_LEN - overhead);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    format!(".{}.{}{}", &name[..end], session, STAGING_SUFFIX)
}

/// Whether a name has the shape `staging_name` produces
///
/// Such names are reserved: they are never served and never accepted
/// as an upload target.
pub fn is_staging_name(name: &str) -> bool {
    let Some(stem) = name
        .strip_prefix('.')
        .and_then(|rest| rest.strip_suffix(STAGING_SUFFIX))
    else {
        return false;
    };
    match stem.rsplit_once('.') {
        Some((_, id)) => id.len() == 16 && id.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}

/// The `attempt`-th alternative for a taken name: `a.txt` -> `a-1.txt`
///
/// Attempt 0 is the name itself. The extension is kept so the file still
/// opens with the right program.
pub fn conflict_candidate(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }

    // A leading dot is part of the stem (".bashrc" has no extension)
    match name.rfind('.') {
        Some(idx) if idx > 0 => {
            let (stem, ext) = name.split_at(idx);
            format!("{}-{}{}", stem, attempt, ext)
        }
        _ => format!("{}-{}", name, attempt),
    }
}

/// Final component of a local path, as a wire name
pub fn wire_name(path: &Path) -> Result<String, ProtocolError> {
    let name = path
        .file_name()
        .ok_or_else(|| ProtocolError::InvalidName(format!("{:?} has no file name", path)))?
        .to_str()
        .ok_or_else(|| ProtocolError::InvalidName(format!("{:?} is not valid UTF-8", path)))?;
    validate_filename(name)?;
    Ok(name.to_string())
}
