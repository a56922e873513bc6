//! Append-only container growth.
//!
//! New entries are added through the archive tool's native incremental
//! update; existing entries are never rewritten. Note that the container
//! file's own modification time changes on append even though prior entry
//! bytes are untouched.

use crate::builder::{append_command, close_workdir};
use crate::config::Profile;
use crate::error::{Error, Result};
use crate::exec;
use crate::validate;
use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Append `files` to an existing container. The destination must validate;
/// unusable sources are reported and skipped. Appending nothing (every
/// source skipped) is a no-op, not an error. Appended entries carry the
/// profile mode, forced onto staged copies so the originals stay untouched.
pub fn append(files: &[PathBuf], dest: &Path, profile: &Profile) -> Result<()> {
    validate::validate(dest)?;
    let (selected, skipped) = select_sources(files, dest);
    for (file, reason) in &skipped {
        eprintln!("{}: skipped: {reason}", file.display());
    }
    if selected.is_empty() {
        return Ok(());
    }
    let (staging, staged) = stage_sources(&selected, dest, profile)?;
    let argv = append_command(&staged, dest, profile);
    let run = exec::run_status(&argv);
    close_workdir(staging)?;
    let status = run?;
    if !status.success() {
        return Err(Error::process(
            argv.join(" "),
            format!("append failed ({status})"),
        ));
    }
    for file in &selected {
        println!("appended {} to {}", file.display(), dest.display());
    }
    Ok(())
}

/// Copy the sources into a staging directory beside the container and force
/// the profile mode on each copy. The archive tool reads entry modes off the
/// files it is given, so the copies are what gets appended.
pub fn stage_sources(
    files: &[PathBuf],
    dest: &Path,
    profile: &Profile,
) -> Result<(TempDir, Vec<PathBuf>)> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let staging = tempfile::Builder::new()
        .prefix(".custos-")
        .tempdir_in(parent)?;
    let mut staged = Vec::with_capacity(files.len());
    for file in files {
        let Some(name) = file.file_name() else {
            return Err(Error::Validation(format!(
                "{}: no usable file name",
                file.display()
            )));
        };
        let copy = staging.path().join(name);
        fs::copy(file, &copy)?;
        fs::set_permissions(&copy, Permissions::from_mode(profile.entry_mode))?;
        staged.push(copy);
    }
    Ok((staging, staged))
}

/// Partition the source arguments into appendable files and skips with
/// reasons: the destination itself is never appended, and only regular
/// files qualify.
pub fn select_sources(
    files: &[PathBuf],
    dest: &Path,
) -> (Vec<PathBuf>, Vec<(PathBuf, String)>) {
    let mut selected = Vec::new();
    let mut skipped = Vec::new();
    for file in files {
        if same_path(file, dest) {
            skipped.push((
                file.clone(),
                "refusing to append the container to itself".to_string(),
            ));
        } else if !file.is_file() {
            skipped.push((file.clone(), "not a regular file".to_string()));
        } else {
            selected.push(file.clone());
        }
    }
    (selected, skipped)
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => false,
    }
}
