//! Acquisition pipeline: stream a source through the data mover into the
//! container's streamed entry, with an integrity digest and a progress
//! callback as parallel taps on the same byte stream.

use crate::builder::{ContainerBuild, IMAGE_ENTRY};
use crate::config::{HashAlgo, Profile};
use crate::custody::{CustodyRecord, version_string};
use crate::error::{Error, Result};
use crate::validate::{CONTAINER_SUFFIX, has_container_suffix};
use chrono::{SecondsFormat, Utc};
use md5::{Digest, Md5};
use sha2::Sha256;
use std::env;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Chunk size for the copy loop between the data mover and the archive.
pub const COPY_CHUNK: usize = 1024 * 1024;
/// Side-file and container entry names.
pub const HASH_LOG: &str = "hashlog.txt";
pub const ERROR_LOG: &str = "errorlog.txt";
pub const CUSTODY_LOG: &str = "sfsimagelog.txt";

/// A resolved acquisition source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Stdin,
    File(PathBuf),
    Device(PathBuf),
}

impl Source {
    /// Classify a source argument. Anything other than `-`, a readable
    /// regular file, or a block device is rejected before any side effect.
    pub fn resolve(arg: &str) -> Result<Self> {
        if arg == "-" {
            return Ok(Source::Stdin);
        }
        let path = Path::new(arg);
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(Source::File(path.to_path_buf())),
            Ok(meta) if meta.file_type().is_block_device() => {
                Ok(Source::Device(path.to_path_buf()))
            }
            Ok(_) => Err(Error::Validation(format!(
                "{arg}: not a regular file or block device"
            ))),
            // A device node we may not stat unprivileged still counts; the
            // mover runs under the privilege command anyway.
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && arg.starts_with("/dev/") => {
                Ok(Source::Device(path.to_path_buf()))
            }
            Err(e) => Err(Error::Validation(format!("{arg}: {e}"))),
        }
    }

    /// Identifier recorded in the custody log.
    pub fn id(&self) -> String {
        match self {
            Source::Stdin => "-".into(),
            Source::File(p) | Source::Device(p) => p.display().to_string(),
        }
    }

    pub fn requires_privilege(&self) -> bool {
        matches!(self, Source::Device(_))
    }

    /// Total size when discoverable: file via stat, device via a privileged
    /// size query, stdin unknown (progress degrades to byte count only).
    pub fn size(&self, profile: &Profile) -> Result<Option<u64>> {
        match self {
            Source::Stdin => Ok(None),
            Source::File(p) => Ok(Some(fs::metadata(p)?.len())),
            Source::Device(p) => device_size(p, profile).map(Some),
        }
    }

    /// Path substituted into the data-mover template.
    fn mover_source(&self) -> String {
        match self {
            Source::Stdin => "/dev/stdin".into(),
            Source::File(p) | Source::Device(p) => p.display().to_string(),
        }
    }
}

fn device_size(path: &Path, profile: &Profile) -> Result<u64> {
    let argv = profile.privileged(&[
        "blockdev".to_string(),
        "--getsize64".to_string(),
        path.display().to_string(),
    ]);
    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::process(argv.join(" "), e.to_string()))?;
    if !output.status.success() {
        return Err(Error::process(
            argv.join(" "),
            format!("size query failed ({})", output.status),
        ));
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .map_err(|e| {
            Error::Validation(format!(
                "{}: unparseable device size: {e}",
                path.display()
            ))
        })
}

/// Integrity digest running as a tap on the acquisition stream.
enum StreamTap {
    Md5(Md5),
    Sha256(Sha256),
}

impl StreamTap {
    fn new(algo: HashAlgo) -> Self {
        match algo {
            HashAlgo::Md5 => StreamTap::Md5(Md5::new()),
            HashAlgo::Sha256 => StreamTap::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            StreamTap::Md5(h) => h.update(chunk),
            StreamTap::Sha256(h) => h.update(chunk),
        }
    }

    fn finish(self) -> String {
        match self {
            StreamTap::Md5(h) => hex::encode(h.finalize()),
            StreamTap::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Outcome of one acquisition stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    pub bytes_copied: u64,
    /// Hex digest of every byte that reached the container entry.
    pub digest: String,
    /// The exact mover command line, privilege prefix included.
    pub command_line: String,
}

/// Spawn the data mover for `source` and pump its stdout into `sink`,
/// updating the digest tap and the progress callback per chunk. The mover's
/// stderr is captured into `errorlog`. A non-zero mover exit is fatal.
pub fn stream_source<W: Write>(
    source: &Source,
    profile: &Profile,
    errorlog: &Path,
    sink: &mut W,
    progress: Option<&dyn Fn(u64)>,
) -> Result<Acquisition> {
    let mut argv = profile.mover_command(&source.mover_source());
    if source.requires_privilege() {
        argv = profile.privileged(&argv);
    }
    let command_line = argv.join(" ");
    tracing::debug!(command = %command_line, "starting data mover");

    let stderr_file = File::create(errorlog)?;
    let mut mover = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(match source {
            Source::Stdin => Stdio::inherit(),
            _ => Stdio::null(),
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::from(stderr_file))
        .spawn()
        .map_err(|e| Error::process(&command_line, e.to_string()))?;

    let mut out = mover
        .stdout
        .take()
        .ok_or_else(|| Error::process(&command_line, "no stdout handle"))?;

    let copied = (|| -> Result<(u64, String)> {
        let mut tap = StreamTap::new(profile.hash);
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut copied = 0u64;
        loop {
            let n = out.read(&mut buf)?;
            if n == 0 {
                break;
            }
            tap.update(&buf[..n]);
            sink.write_all(&buf[..n])?;
            copied += n as u64;
            if let Some(cb) = progress {
                cb(copied);
            }
        }
        Ok((copied, tap.finish()))
    })();

    let (bytes_copied, digest) = match copied {
        Ok(v) => v,
        Err(e) => {
            let _ = mover.kill();
            let _ = mover.wait();
            return Err(e);
        }
    };

    let status = mover.wait()?;
    if !status.success() {
        return Err(Error::process(
            &command_line,
            format!("data mover failed ({status})"),
        ));
    }

    Ok(Acquisition {
        bytes_copied,
        digest,
        command_line,
    })
}

/// Destination preconditions, checked before any side effect: required
/// suffix, and refusal to overwrite an existing path.
pub fn check_destination(dest: &Path) -> Result<()> {
    if !has_container_suffix(dest) {
        return Err(Error::Validation(format!(
            "{}: destination must carry the {CONTAINER_SUFFIX} suffix",
            dest.display()
        )));
    }
    if dest.exists() {
        return Err(Error::Validation(format!(
            "{}: already exists, refusing to overwrite",
            dest.display()
        )));
    }
    Ok(())
}

/// Creation preflight for callers that need the source and its size ahead of
/// the acquisition itself. Destination checks run first, so a doomed run
/// never classifies the source or issues a privileged size query.
pub fn preflight(source_arg: &str, dest: &Path, profile: &Profile) -> Result<(Source, Option<u64>)> {
    check_destination(dest)?;
    let source = Source::resolve(source_arg)?;
    let total = source.size(profile)?;
    Ok((source, total))
}

/// Hash-log text for one acquisition.
pub fn format_hash_log(algo: HashAlgo, acq: &Acquisition, entry: &str) -> String {
    format!(
        "{} ({entry}) = {}\nbytes copied: {}\n",
        algo.label(),
        acq.digest,
        acq.bytes_copied
    )
}

fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Create one evidence container: acquisition, hashing, custody logging, and
/// the two-phase archive build as a single fail-fast transaction.
pub fn create_container(
    source_arg: &str,
    dest: &Path,
    profile: &Profile,
    invocation: &str,
    progress: Option<&dyn Fn(u64)>,
) -> Result<Acquisition> {
    check_destination(dest)?;
    let source = Source::resolve(source_arg)?;
    // Captured up front: nothing fallible may sit between the finished
    // stream and sealing without routing through abort.
    let working_dir = env::current_dir()?.display().to_string();
    let started = now_stamp();

    let mut build = ContainerBuild::begin_with_streamed_entry(dest, IMAGE_ENTRY, profile)?;
    let errorlog = build.staging_dir().join(ERROR_LOG);

    let acq = match stream_source(&source, profile, &errorlog, build.writer(), progress) {
        Ok(acq) => acq,
        Err(e) => {
            // Cleanup failure outranks the stream error: residue is worse.
            build.abort()?;
            return Err(e);
        }
    };

    let sealed = build.finish_stream()?;
    let finished = now_stamp();

    let hashlog = sealed.staging_dir().join(HASH_LOG);
    let custodylog = sealed.staging_dir().join(CUSTODY_LOG);
    let record = CustodyRecord {
        started,
        finished,
        version: version_string(),
        invocation: invocation.to_string(),
        working_dir,
        source: source.id(),
        destination: dest.display().to_string(),
        entry: IMAGE_ENTRY.to_string(),
        mover_command: acq.command_line.clone(),
    };

    let staged = (|| -> Result<()> {
        fs::write(&hashlog, format_hash_log(profile.hash, &acq, IMAGE_ENTRY))?;
        fs::write(&custodylog, record.render())?;
        Ok(())
    })();
    if let Err(e) = staged {
        sealed.abort()?;
        return Err(e);
    }

    sealed.seal_with_entries(&[custodylog, hashlog, errorlog])?;
    tracing::info!(dest = %dest.display(), bytes = acq.bytes_copied, "container sealed");
    Ok(acq)
}
