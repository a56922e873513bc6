//! Two-phase container builder.
//!
//! Phase 1 (`begin_with_streamed_entry`) starts the archive tool with a
//! single pseudo entry whose bytes arrive through a FIFO, so the raw
//! acquisition is never materialized as an intermediate file. Phase 2
//! (`seal_with_entries`) appends the custody and log files once the
//! acquisition has finished. Both phases force the configured ownership and
//! mode onto every entry.

use crate::config::Profile;
use crate::error::{Error, Result};
use crate::exec;
use rustix::fs::{self as rfs, FileType, Mode, OFlags};
use std::env;
use std::fs::{self, File, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;

/// Name of the streamed acquisition entry inside every container.
pub const IMAGE_ENTRY: &str = "image.raw";

/// An archive build in progress: the archive tool is running and consuming
/// the streamed entry through `writer`.
#[derive(Debug)]
pub struct ContainerBuild {
    dest: PathBuf,
    profile: Profile,
    workdir: TempDir,
    archiver: Child,
    writer: File,
}

impl ContainerBuild {
    /// Phase 1: create the archive at `dest` with one streamed entry.
    ///
    /// A throwaway anchor directory gives the archive tool the real
    /// filesystem operand pseudo entries require; the entry content is
    /// whatever the caller writes into [`ContainerBuild::writer`].
    pub fn begin_with_streamed_entry(dest: &Path, entry: &str, profile: &Profile) -> Result<Self> {
        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let workdir = tempfile::Builder::new()
            .prefix(".custos-")
            .tempdir_in(parent)?;

        let anchor = workdir.path().join("anchor");
        fs::create_dir(&anchor)?;
        let fifo = workdir.path().join("stream.fifo");
        rfs::mknodat(
            rfs::CWD,
            &fifo,
            FileType::Fifo,
            Mode::from_raw_mode(0o600),
            0,
        )
        .map_err(|e| Error::Io(e.into()))?;

        let args = phase_one_args(&anchor, dest, entry, &fifo, profile);
        tracing::debug!(command = %format!("{} {}", profile.mksquashfs, args.join(" ")), "phase 1");
        let mut archiver = Command::new(&profile.mksquashfs)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| Error::process(&profile.mksquashfs, e.to_string()))?;

        let writer = match open_fifo_writer(&fifo, &mut archiver, &profile.mksquashfs) {
            Ok(writer) => writer,
            Err(e) => {
                let _ = archiver.kill();
                let _ = archiver.wait();
                remove_partial(dest)?;
                close_workdir(workdir)?;
                return Err(e);
            }
        };

        Ok(Self {
            dest: dest.to_path_buf(),
            profile: profile.clone(),
            workdir,
            archiver,
            writer,
        })
    }

    /// Staging directory for side files (hash log, error log, custody log).
    pub fn staging_dir(&self) -> &Path {
        self.workdir.path()
    }

    /// Write end of the streamed entry.
    pub fn writer(&mut self) -> &mut File {
        &mut self.writer
    }

    /// Close the stream and wait for the archive tool to finish phase 1.
    pub fn finish_stream(self) -> Result<SealedBuild> {
        let ContainerBuild {
            dest,
            profile,
            workdir,
            mut archiver,
            writer,
        } = self;
        drop(writer);
        let status = archiver.wait()?;
        if !status.success() {
            remove_partial(&dest)?;
            close_workdir(workdir)?;
            return Err(Error::process(
                &profile.mksquashfs,
                format!("archive build failed ({status})"),
            ));
        }
        Ok(SealedBuild {
            dest,
            profile,
            workdir,
        })
    }

    /// Tear down a failed build: stop the archive tool, remove any partial
    /// container, and remove the working directory.
    pub fn abort(self) -> Result<()> {
        let ContainerBuild {
            dest,
            workdir,
            mut archiver,
            writer,
            ..
        } = self;
        drop(writer);
        let _ = archiver.kill();
        let _ = archiver.wait();
        remove_partial(&dest)?;
        close_workdir(workdir)
    }
}

/// A container whose streamed entry is complete, awaiting its log entries.
pub struct SealedBuild {
    dest: PathBuf,
    profile: Profile,
    workdir: TempDir,
}

impl SealedBuild {
    pub fn staging_dir(&self) -> &Path {
        self.workdir.path()
    }

    /// Phase 2, run exactly once per creation: force the configured mode on
    /// the staged files, append them through the archive tool's incremental
    /// update, and hand the container back to the invoking user when running
    /// under sudo. The working directory is removed on success and failure;
    /// failure to remove it is itself fatal.
    pub fn seal_with_entries(self, files: &[PathBuf]) -> Result<()> {
        let SealedBuild {
            dest,
            profile,
            workdir,
        } = self;
        for file in files {
            fs::set_permissions(file, Permissions::from_mode(profile.entry_mode))?;
        }
        let argv = append_command(files, &dest, &profile);
        let status = exec::run_status(&argv)?;
        if !status.success() {
            remove_partial(&dest)?;
            close_workdir(workdir)?;
            return Err(Error::process(
                argv.join(" "),
                format!("sealing failed ({status})"),
            ));
        }
        if let Some((uid, gid)) = invoking_user() {
            std::os::unix::fs::chown(&dest, Some(uid), Some(gid))?;
        }
        close_workdir(workdir)
    }

    /// Tear down after a failure between the phases.
    pub fn abort(self) -> Result<()> {
        let SealedBuild { dest, workdir, .. } = self;
        remove_partial(&dest)?;
        close_workdir(workdir)
    }
}

/// Arguments for the phase-1 archive build.
pub fn phase_one_args(
    anchor: &Path,
    dest: &Path,
    entry: &str,
    fifo: &Path,
    profile: &Profile,
) -> Vec<String> {
    vec![
        anchor.display().to_string(),
        dest.display().to_string(),
        "-quiet".into(),
        "-no-progress".into(),
        "-noappend".into(),
        "-force-uid".into(),
        profile.owner_uid.to_string(),
        "-force-gid".into(),
        profile.owner_gid.to_string(),
        "-p".into(),
        pseudo_definition(entry, fifo, profile),
    ]
}

/// Pseudo-file definition binding the streamed entry to the FIFO.
pub fn pseudo_definition(entry: &str, fifo: &Path, profile: &Profile) -> String {
    format!(
        "{entry} f {:o} {} {} cat {}",
        profile.entry_mode,
        profile.owner_uid,
        profile.owner_gid,
        fifo.display()
    )
}

/// Full argv for appending real files to an existing container, used both by
/// phase 2 and by the append operation. Ownership is forced on the command
/// line; modes are read off the files, which callers chmod to the profile
/// mode before appending.
pub fn append_command(files: &[PathBuf], dest: &Path, profile: &Profile) -> Vec<String> {
    let mut argv = vec![profile.mksquashfs.clone()];
    argv.extend(files.iter().map(|f| f.display().to_string()));
    argv.push(dest.display().to_string());
    argv.extend([
        "-quiet".into(),
        "-no-progress".into(),
        "-force-uid".into(),
        profile.owner_uid.to_string(),
        "-force-gid".into(),
        profile.owner_gid.to_string(),
    ]);
    argv
}

/// Open the FIFO's write end. It can only open once the archiver's reader
/// side is up, so poll with `O_NONBLOCK` and watch the child: an archiver
/// that died early must surface as an error instead of blocking forever.
fn open_fifo_writer(fifo: &Path, archiver: &mut Child, tool: &str) -> Result<File> {
    loop {
        match rfs::open(fifo, OFlags::WRONLY | OFlags::NONBLOCK, Mode::empty()) {
            Ok(fd) => {
                let flags = rfs::fcntl_getfl(&fd).map_err(|e| Error::Io(e.into()))?;
                rfs::fcntl_setfl(&fd, flags.difference(OFlags::NONBLOCK))
                    .map_err(|e| Error::Io(e.into()))?;
                return Ok(File::from(fd));
            }
            Err(e) if e == rustix::io::Errno::NXIO => {
                if let Some(status) = archiver.try_wait()? {
                    return Err(Error::process(
                        tool,
                        format!("exited before reading the entry stream ({status})"),
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(Error::Io(e.into())),
        }
    }
}

/// No partial container may be left addressable as evidence.
fn remove_partial(dest: &Path) -> Result<()> {
    match fs::remove_file(dest) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Cleanup(format!(
            "could not remove partial container {}: {e}",
            dest.display()
        ))),
    }
}

pub(crate) fn close_workdir(workdir: TempDir) -> Result<()> {
    let path = workdir.path().to_path_buf();
    workdir.close().map_err(|e| {
        Error::Cleanup(format!(
            "could not remove working directory {}: {e}",
            path.display()
        ))
    })
}

/// Under sudo the finished container should belong to the invoking user,
/// not to root.
fn invoking_user() -> Option<(u32, u32)> {
    let uid = env::var("SUDO_UID").ok()?.parse().ok()?;
    let gid = env::var("SUDO_GID").ok()?.parse().ok()?;
    Some((uid, gid))
}
