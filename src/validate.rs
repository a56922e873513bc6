use crate::error::{Error, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Required filename suffix for evidence containers.
pub const CONTAINER_SUFFIX: &str = ".sfs";
/// Suffix of the sidecar mount directory, `<container>.sfs.d`.
pub const SIDECAR_SUFFIX: &str = ".sfs.d";
/// SquashFS superblock magic, little-endian.
pub const SQUASHFS_MAGIC: [u8; 4] = *b"hsqs";

/// Check that `path` is a genuine, well-formed container: it exists, carries
/// the required suffix, and its content probe matches the format signature.
///
/// Pure and side-effect-free. Failures carry a human-readable reason; batch
/// callers treat them as skip-not-abort.
pub fn validate(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(Error::Validation(format!(
            "{}: no such file",
            path.display()
        )));
    }
    if !has_container_suffix(path) {
        return Err(Error::Validation(format!(
            "{}: missing {CONTAINER_SUFFIX} suffix",
            path.display()
        )));
    }
    let mut file = File::open(path)?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).map_err(|_| {
        Error::Validation(format!("{}: too short to be a container", path.display()))
    })?;
    if magic != SQUASHFS_MAGIC {
        return Err(Error::Validation(format!(
            "{}: not a squashfs container",
            path.display()
        )));
    }
    Ok(())
}

/// True if the filename carries the container suffix with a non-empty stem.
pub fn has_container_suffix(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(CONTAINER_SUFFIX) && n.len() > CONTAINER_SUFFIX.len())
}
