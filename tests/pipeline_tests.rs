use custos::config::{HashAlgo, Profile};
use custos::error::Error;
use custos::pipeline::{
    Acquisition, Source, check_destination, create_container, format_hash_log, preflight,
    stream_source,
};
use std::cell::Cell;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::TempDir;

const MD5_ABC: &str = "900150983cd24fb0d6963f7d28e17f72";
const SHA256_ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

/// Stand-in for the archive tool: phase 1 (a `-p` pseudo definition) drains
/// the FIFO into the destination, phase 2 concatenates the staged files onto
/// it. Lets creation run end to end without mksquashfs or root.
const FAKE_ARCHIVER: &str = r#"#!/bin/sh
case " $* " in
*" -p "*)
    dest=$2
    for a in "$@"; do pseudo=$a; done
    fifo=${pseudo##* }
    cat "$fifo" > "$dest"
    ;;
*)
    prev=""
    files=""
    dest=""
    for a in "$@"; do
        case "$a" in
        -quiet) dest=$prev; break ;;
        *) if [ -n "$prev" ]; then files="$files $prev"; fi; prev=$a ;;
        esac
    done
    for f in $files; do cat "$f" >> "$dest"; done
    ;;
esac
"#;

fn install_fake_archiver(dir: &Path) -> String {
    let path = dir.join("fake-mksquashfs");
    fs::write(&path, FAKE_ARCHIVER).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

fn cat_profile() -> Profile {
    Profile {
        data_mover: vec!["cat".into(), "{source}".into()],
        privilege: vec![],
        ..Profile::default()
    }
}

#[test]
fn resolve_stdin_marker() {
    assert_eq!(Source::resolve("-").unwrap(), Source::Stdin);
    assert_eq!(Source::resolve("-").unwrap().id(), "-");
}

#[test]
fn resolve_regular_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk.img");
    fs::write(&path, b"data").unwrap();
    let source = Source::resolve(&path.display().to_string()).unwrap();
    assert!(matches!(source, Source::File(_)));
    assert!(!source.requires_privilege());
}

#[test]
fn resolve_rejects_missing_and_directories() {
    assert!(matches!(
        Source::resolve("/nonexistent/disk.img"),
        Err(Error::Validation(_))
    ));
    let dir = TempDir::new().unwrap();
    let err = Source::resolve(&dir.path().display().to_string()).unwrap_err();
    assert!(err.to_string().contains("not a regular file"));
}

#[test]
fn file_size_is_discovered_and_stdin_is_unknown() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk.img");
    fs::write(&path, vec![0u8; 4096]).unwrap();
    let profile = cat_profile();
    let source = Source::resolve(&path.display().to_string()).unwrap();
    assert_eq!(source.size(&profile).unwrap(), Some(4096));
    assert_eq!(Source::Stdin.size(&profile).unwrap(), None);
}

#[test]
fn destination_must_carry_suffix_and_not_exist() {
    let dir = TempDir::new().unwrap();
    let err = check_destination(&dir.path().join("case01.img")).unwrap_err();
    assert!(err.to_string().contains(".sfs"));

    let existing = dir.path().join("case01.sfs");
    fs::write(&existing, b"prior evidence").unwrap();
    let err = check_destination(&existing).unwrap_err();
    assert!(err.to_string().contains("refusing to overwrite"));
    // the existing file is untouched
    assert_eq!(fs::read(&existing).unwrap(), b"prior evidence");
}

#[test]
fn preflight_refuses_the_destination_before_touching_the_source() {
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("case01.sfs");
    fs::write(&dest, b"prior evidence").unwrap();

    // The source does not even exist: the destination refusal must come
    // first, before any source classification or size query.
    let err = preflight("/nonexistent/disk.img", &dest, &cat_profile()).unwrap_err();
    assert!(err.to_string().contains("refusing to overwrite"));

    let src = dir.path().join("disk.img");
    fs::write(&src, vec![0u8; 4096]).unwrap();
    let fresh = dir.path().join("case02.sfs");
    let (source, total) = preflight(&src.display().to_string(), &fresh, &cat_profile()).unwrap();
    assert!(matches!(source, Source::File(_)));
    assert_eq!(total, Some(4096));
}

#[test]
fn stream_tap_hashes_and_counts() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("disk.img");
    fs::write(&src, b"abc").unwrap();
    let errorlog = dir.path().join("errorlog.txt");
    let profile = cat_profile();
    let source = Source::resolve(&src.display().to_string()).unwrap();

    let last = Cell::new(0u64);
    let progress = |n: u64| last.set(n);
    let mut sink = Vec::new();
    let acq = stream_source(&source, &profile, &errorlog, &mut sink, Some(&progress)).unwrap();

    assert_eq!(sink, b"abc");
    assert_eq!(acq.bytes_copied, 3);
    assert_eq!(acq.digest, MD5_ABC);
    assert_eq!(last.get(), 3);
    assert!(acq.command_line.starts_with("cat "));
    assert!(errorlog.exists());
}

#[test]
fn stream_tap_supports_sha256() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("disk.img");
    fs::write(&src, b"abc").unwrap();
    let errorlog = dir.path().join("errorlog.txt");
    let profile = Profile {
        hash: HashAlgo::Sha256,
        ..cat_profile()
    };
    let source = Source::resolve(&src.display().to_string()).unwrap();

    let mut sink = Vec::new();
    let acq = stream_source(&source, &profile, &errorlog, &mut sink, None).unwrap();
    assert_eq!(acq.digest, SHA256_ABC);
}

#[test]
fn mover_stderr_is_captured() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("disk.img");
    fs::write(&src, b"abc").unwrap();
    let errorlog = dir.path().join("errorlog.txt");
    let profile = Profile {
        data_mover: vec![
            "sh".into(),
            "-c".into(),
            "echo 'read error at sector 9' >&2; cat {source}".into(),
        ],
        privilege: vec![],
        ..Profile::default()
    };
    let source = Source::resolve(&src.display().to_string()).unwrap();

    let mut sink = Vec::new();
    let acq = stream_source(&source, &profile, &errorlog, &mut sink, None).unwrap();
    assert_eq!(sink, b"abc");
    assert_eq!(acq.digest, MD5_ABC);
    assert!(
        fs::read_to_string(&errorlog)
            .unwrap()
            .contains("read error at sector 9")
    );
}

#[test]
fn mover_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("disk.img");
    fs::write(&src, b"abc").unwrap();
    let errorlog = dir.path().join("errorlog.txt");
    let profile = Profile {
        data_mover: vec!["sh".into(), "-c".into(), "cat {source}; exit 3".into()],
        privilege: vec![],
        ..Profile::default()
    };
    let source = Source::resolve(&src.display().to_string()).unwrap();

    let mut sink = Vec::new();
    let err = stream_source(&source, &profile, &errorlog, &mut sink, None).unwrap_err();
    assert!(matches!(err, Error::Process { .. }));
}

#[test]
fn hash_log_names_algorithm_entry_and_count() {
    let acq = Acquisition {
        bytes_copied: 3,
        digest: MD5_ABC.into(),
        command_line: "cat disk.img".into(),
    };
    let text = format_hash_log(HashAlgo::Md5, &acq, "image.raw");
    assert!(text.contains(&format!("md5 (image.raw) = {MD5_ABC}")));
    assert!(text.contains("bytes copied: 3"));
}

#[test]
fn create_container_end_to_end() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("disk.img");
    fs::write(&src, b"abc").unwrap();
    let dest = dir.path().join("case01.sfs");
    let profile = Profile {
        mksquashfs: install_fake_archiver(dir.path()),
        ..cat_profile()
    };

    let acq = create_container(
        &src.display().to_string(),
        &dest,
        &profile,
        "custos -i disk.img case01.sfs",
        None,
    )
    .unwrap();

    assert_eq!(acq.bytes_copied, 3);
    assert_eq!(acq.digest, MD5_ABC);

    // the fake archiver concatenates: image bytes, custody log, hash log,
    // error log
    let sealed = fs::read_to_string(&dest).unwrap();
    assert!(sealed.starts_with("abc"));
    assert!(sealed.contains("Started: "));
    assert!(sealed.contains("Completed: "));
    assert!(sealed.contains("Invocation: custos -i disk.img case01.sfs"));
    assert!(sealed.contains(&format!("Source: {}", src.display())));
    assert!(sealed.contains(&format!("Destination: {}", dest.display())));
    assert!(sealed.contains("Entry: image.raw"));
    assert!(sealed.contains("Working directory: "));
    assert!(sealed.contains(&format!("Acquisition command: {}", acq.command_line)));
    assert!(sealed.contains(&format!("md5 (image.raw) = {MD5_ABC}")));

    // the staging working directory is gone
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".custos-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn create_container_refuses_existing_destination() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("disk.img");
    fs::write(&src, b"abc").unwrap();
    let dest = dir.path().join("case01.sfs");
    fs::write(&dest, b"prior evidence").unwrap();
    let profile = Profile {
        mksquashfs: install_fake_archiver(dir.path()),
        ..cat_profile()
    };

    let err = create_container(&src.display().to_string(), &dest, &profile, "custos", None)
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(fs::read(&dest).unwrap(), b"prior evidence");
}

#[test]
fn create_container_fails_fast_on_mover_error() {
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("case01.sfs");
    let profile = Profile {
        data_mover: vec!["false".into()],
        privilege: vec![],
        mksquashfs: install_fake_archiver(dir.path()),
        ..Profile::default()
    };
    let src = dir.path().join("disk.img");
    fs::write(&src, b"abc").unwrap();

    let err = create_container(&src.display().to_string(), &dest, &profile, "custos", None)
        .unwrap_err();
    assert!(matches!(err, Error::Process { .. }));
    // no partial container left addressable, no staging residue
    assert!(!dest.exists());
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".custos-"))
        .collect();
    assert!(leftovers.is_empty());
}
