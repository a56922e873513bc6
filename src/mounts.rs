//! Mount lifecycle for evidence containers.
//!
//! The sidecar directory `<container>.sfs.d` is both the mount target and
//! the in-use marker. Exclusive directory creation is the lock: a second
//! mount attempt fails on `AlreadyExists` instead of racing a separate
//! existence check.

use crate::config::Profile;
use crate::error::{Error, Result};
use crate::exec;
use crate::validate::{self, SIDECAR_SUFFIX};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Live mount table, one line per mount.
pub const MOUNT_TABLE: &str = "/proc/mounts";
/// Filesystem type of mounted containers.
pub const FSTYPE: &str = "squashfs";

/// One mounted container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub target: PathBuf,
}

/// Scan the live mount table for container mounts: squashfs entries whose
/// mount path carries the sidecar suffix.
pub fn list_mounted() -> Result<Vec<MountEntry>> {
    let table = fs::read_to_string(MOUNT_TABLE)?;
    Ok(parse_mount_table(&table))
}

/// Parse container mounts out of mount-table text.
pub fn parse_mount_table(table: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(device), Some(target), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if fstype != FSTYPE {
            continue;
        }
        let target = unescape_mount_path(target);
        if target.ends_with(SIDECAR_SUFFIX) {
            entries.push(MountEntry {
                device: device.to_string(),
                target: PathBuf::from(target),
            });
        }
    }
    entries
}

/// All mount targets in the table, any filesystem type.
fn parse_mount_targets(table: &str) -> Vec<String> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_path)
        .collect()
}

/// The kernel escapes space, tab, newline, and backslash in mount paths as
/// `\0NN` octal sequences.
pub fn unescape_mount_path(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' && i + 3 < chars.len() {
            let octal: Option<u32> = chars[i + 1..i + 4]
                .iter()
                .map(|c| c.to_digit(8))
                .try_fold(0u32, |acc, d| Some(acc * 8 + d?));
            if let Some(value) = octal
                && let Some(c) = char::from_u32(value)
            {
                out.push(c);
                i += 4;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Sidecar mount directory for a container: the container path plus `.d`.
pub fn sidecar_path(container: &Path) -> PathBuf {
    let mut name = container.as_os_str().to_os_string();
    name.push(".d");
    PathBuf::from(name)
}

/// Mount each container in turn. A failing target is reported and skipped;
/// the batch only fails as a whole when nothing could be mounted.
pub fn mount_all(containers: &[PathBuf], profile: &Profile) -> Result<()> {
    let mut mounted = 0usize;
    let mut skipped = 0usize;
    for container in containers {
        match mount_one(container, profile) {
            Ok(target) => {
                println!("mounted {} at {}", container.display(), target.display());
                mounted += 1;
            }
            Err(e) => {
                eprintln!("{}: skipped: {e}", container.display());
                skipped += 1;
            }
        }
    }
    if mounted == 0 && skipped > 0 {
        return Err(Error::Validation("no container could be mounted".into()));
    }
    Ok(())
}

fn mount_one(container: &Path, profile: &Profile) -> Result<PathBuf> {
    validate::validate(container)?;
    let target = sidecar_path(container);
    match fs::create_dir(&target) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(Error::Conflict(format!(
                "{} exists, container already mounted or mount in progress",
                target.display()
            )));
        }
        Err(e) => return Err(e.into()),
    }
    let argv = profile.privileged(&[
        "mount".into(),
        "-t".into(),
        FSTYPE.into(),
        "-o".into(),
        "loop,ro".into(),
        container.display().to_string(),
        target.display().to_string(),
    ]);
    let status = match exec::run_status(&argv) {
        Ok(status) => status,
        Err(e) => {
            remove_sidecar(&target)?;
            return Err(e);
        }
    };
    if !status.success() {
        remove_sidecar(&target)?;
        return Err(Error::process(
            argv.join(" "),
            format!("mount failed ({status})"),
        ));
    }
    tracing::debug!(target = %target.display(), "mounted");
    Ok(target)
}

fn remove_sidecar(target: &Path) -> Result<()> {
    fs::remove_dir(target).map_err(|e| {
        Error::Cleanup(format!(
            "mount failed and {} could not be removed: {e}",
            target.display()
        ))
    })
}

/// Unmount each target in turn, removing the now-empty sidecar directory.
/// Failing preconditions skip the target; the batch continues.
pub fn unmount_all(targets: &[String], profile: &Profile) -> Result<()> {
    let mut unmounted = 0usize;
    let mut skipped = 0usize;
    for raw in targets {
        match unmount_one(raw, profile) {
            Ok(UnmountOutcome::Removed(path)) => {
                println!("unmounted {}", path.display());
                unmounted += 1;
            }
            Ok(UnmountOutcome::LeftInPlace(path)) => {
                // Still in use; report rather than delete forcibly.
                eprintln!(
                    "{}: unmounted but not empty, leaving directory in place",
                    path.display()
                );
                unmounted += 1;
            }
            Err(e) => {
                eprintln!("{raw}: skipped: {e}");
                skipped += 1;
            }
        }
    }
    if unmounted == 0 && skipped > 0 {
        return Err(Error::Validation("no mount point could be unmounted".into()));
    }
    Ok(())
}

enum UnmountOutcome {
    Removed(PathBuf),
    LeftInPlace(PathBuf),
}

/// A target must exist, carry the compound sidecar suffix, and currently be
/// a mountpoint before it is unmounted.
pub fn check_unmount_target(raw: &str, mount_table: &str) -> Result<PathBuf> {
    let trimmed = raw.trim_end_matches('/');
    let path = Path::new(trimmed);
    if !path.exists() {
        return Err(Error::Validation(format!("{trimmed}: no such mount point")));
    }
    if !trimmed.ends_with(SIDECAR_SUFFIX) {
        return Err(Error::Validation(format!(
            "{trimmed}: missing {SIDECAR_SUFFIX} suffix"
        )));
    }
    let canon = fs::canonicalize(path)?;
    let canon_str = canon.display().to_string();
    if !parse_mount_targets(mount_table).iter().any(|t| t == &canon_str) {
        return Err(Error::Validation(format!(
            "{trimmed}: not currently a mountpoint"
        )));
    }
    Ok(canon)
}

fn unmount_one(raw: &str, profile: &Profile) -> Result<UnmountOutcome> {
    let table = fs::read_to_string(MOUNT_TABLE)?;
    let path = check_unmount_target(raw, &table)?;
    let argv = profile.privileged(&["umount".into(), path.display().to_string()]);
    let status = exec::run_status(&argv)?;
    if !status.success() {
        return Err(Error::process(
            argv.join(" "),
            format!("umount failed ({status})"),
        ));
    }
    tracing::debug!(target = %path.display(), "unmounted");
    match fs::remove_dir(&path) {
        Ok(()) => Ok(UnmountOutcome::Removed(path)),
        Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => {
            Ok(UnmountOutcome::LeftInPlace(path))
        }
        Err(e) => Err(Error::Cleanup(format!(
            "could not remove {}: {e}",
            path.display()
        ))),
    }
}
