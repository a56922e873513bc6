//! Read-only content listing.

use crate::config::Profile;
use crate::error::{Error, Result};
use crate::exec;
use crate::validate;
use std::path::{Path, PathBuf};

/// List each container passing validation: a per-container banner followed
/// by the entry table. Invalid containers are reported and skipped.
pub fn list_all(containers: &[PathBuf], profile: &Profile) -> Result<()> {
    let mut listed = 0usize;
    let mut skipped = 0usize;
    for container in containers {
        match list_one(container, profile) {
            Ok(body) => {
                println!("{}", banner(container));
                println!("{body}");
                listed += 1;
            }
            Err(e) => {
                eprintln!("{}: skipped: {e}", container.display());
                skipped += 1;
            }
        }
    }
    if listed == 0 && skipped > 0 {
        return Err(Error::Validation("no container could be listed".into()));
    }
    Ok(())
}

fn list_one(container: &Path, profile: &Profile) -> Result<String> {
    validate::validate(container)?;
    let argv = vec![
        profile.unsquashfs.clone(),
        "-lls".into(),
        container.display().to_string(),
    ];
    let output = exec::run_output(&argv)?;
    Ok(filter_listing(&String::from_utf8_lossy(&output)))
}

pub fn banner(container: &Path) -> String {
    format!("=== {} ===", container.display())
}

/// Keep only the entry table, dropping the listing tool's own summary
/// header lines and blank lines.
pub fn filter_listing(raw: &str) -> String {
    raw.lines()
        .filter(|line| is_entry_line(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Entry lines carry a path rooted at the extraction directory name. The
/// path is not always the last field: symlink lines end in `-> target`.
fn is_entry_line(line: &str) -> bool {
    line.split_whitespace()
        .any(|field| field == "squashfs-root" || field.starts_with("squashfs-root/"))
}
