use crate::error::{Error, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// System-wide override file, lowest precedence.
pub const SYSTEM_CONFIG: &str = "/etc/custos.json";
/// Per-user override file name, resolved under `$HOME`.
pub const USER_CONFIG: &str = ".custos.json";
/// Working-directory override file, highest precedence.
pub const LOCAL_CONFIG: &str = ".custos.json";

/// Digest algorithm used by the acquisition stream tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgo {
    Md5,
    Sha256,
}

impl HashAlgo {
    pub fn label(&self) -> &'static str {
        match self {
            HashAlgo::Md5 => "md5",
            HashAlgo::Sha256 => "sha256",
        }
    }
}

/// Resolved operating profile.
///
/// Built once at startup from the defaults plus the layered override files,
/// then passed explicitly into every component. Immutable for the duration
/// of one invocation.
#[derive(Debug, Clone)]
pub struct Profile {
    /// Data-mover command template; `{source}` is replaced with the
    /// resolved source path before spawning.
    pub data_mover: Vec<String>,
    /// Privilege-escalation prefix for device access and mount calls.
    pub privilege: Vec<String>,
    /// Owner forced onto every archive entry.
    pub owner_uid: u32,
    pub owner_gid: u32,
    /// Mode forced onto every regular archive entry.
    pub entry_mode: u32,
    pub hash: HashAlgo,
    pub mksquashfs: String,
    pub unsquashfs: String,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            data_mover: vec!["dd".into(), "if={source}".into(), "bs=1M".into()],
            privilege: vec!["sudo".into()],
            owner_uid: 0,
            owner_gid: 0,
            entry_mode: 0o444,
            hash: HashAlgo::Md5,
            mksquashfs: "mksquashfs".into(),
            unsquashfs: "unsquashfs".into(),
        }
    }
}

/// One override file. Every field is optional; absent fields keep the
/// value from the previous layer.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Overlay {
    data_mover: Option<Vec<String>>,
    privilege: Option<Vec<String>>,
    owner_uid: Option<u32>,
    owner_gid: Option<u32>,
    /// Octal string, e.g. "444".
    entry_mode: Option<String>,
    hash: Option<HashAlgo>,
    mksquashfs: Option<String>,
    unsquashfs: Option<String>,
}

impl Profile {
    /// Resolve the profile from the three standard override locations.
    pub fn load() -> Result<Self> {
        let mut paths = vec![PathBuf::from(SYSTEM_CONFIG)];
        if let Some(home) = env::var_os("HOME") {
            paths.push(Path::new(&home).join(USER_CONFIG));
        }
        paths.push(PathBuf::from(LOCAL_CONFIG));
        Self::load_from(&paths)
    }

    /// Resolve the profile from an explicit list of override files, applied
    /// in order (later files win). Missing files are skipped.
    pub fn load_from(paths: &[PathBuf]) -> Result<Self> {
        let mut profile = Profile::default();
        for path in paths {
            if !path.exists() {
                continue;
            }
            let text = fs::read_to_string(path)?;
            let overlay: Overlay = serde_json::from_str(&text).map_err(|e| {
                Error::Validation(format!("bad config file {}: {e}", path.display()))
            })?;
            profile.apply(overlay, path)?;
        }
        Ok(profile)
    }

    fn apply(&mut self, overlay: Overlay, origin: &Path) -> Result<()> {
        if let Some(v) = overlay.data_mover {
            if v.is_empty() {
                return Err(Error::Validation(format!(
                    "bad config file {}: data_mover must not be empty",
                    origin.display()
                )));
            }
            self.data_mover = v;
        }
        if let Some(v) = overlay.privilege {
            self.privilege = v;
        }
        if let Some(v) = overlay.owner_uid {
            self.owner_uid = v;
        }
        if let Some(v) = overlay.owner_gid {
            self.owner_gid = v;
        }
        if let Some(v) = overlay.entry_mode {
            self.entry_mode = u32::from_str_radix(&v, 8).map_err(|_| {
                Error::Validation(format!(
                    "bad config file {}: entry_mode must be octal, got {v:?}",
                    origin.display()
                ))
            })?;
        }
        if let Some(v) = overlay.hash {
            self.hash = v;
        }
        if let Some(v) = overlay.mksquashfs {
            self.mksquashfs = v;
        }
        if let Some(v) = overlay.unsquashfs {
            self.unsquashfs = v;
        }
        Ok(())
    }

    /// Instantiate the data-mover template for one source.
    pub fn mover_command(&self, source: &str) -> Vec<String> {
        self.data_mover
            .iter()
            .map(|t| t.replace("{source}", source))
            .collect()
    }

    /// Wrap a command in the privilege-escalation prefix.
    pub fn privileged(&self, command: &[String]) -> Vec<String> {
        let mut argv = self.privilege.clone();
        argv.extend(command.iter().cloned());
        argv
    }
}
