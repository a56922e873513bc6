use custos::error::Error;
use custos::validate::{CONTAINER_SUFFIX, SQUASHFS_MAGIC, has_container_suffix, validate};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

#[test]
fn missing_path_is_rejected() {
    let err = validate(Path::new("/nonexistent/evidence.sfs")).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(err.to_string().contains("no such file"));
}

#[test]
fn wrong_suffix_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("evidence.img");
    fs::write(&path, b"hsqs....").unwrap();
    let err = validate(&path).unwrap_err();
    assert!(err.to_string().contains(CONTAINER_SUFFIX));
}

#[test]
fn bad_magic_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("evidence.sfs");
    fs::write(&path, b"not a squashfs image").unwrap();
    let err = validate(&path).unwrap_err();
    assert!(err.to_string().contains("not a squashfs container"));
}

#[test]
fn short_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("evidence.sfs");
    fs::write(&path, b"hs").unwrap();
    let err = validate(&path).unwrap_err();
    assert!(err.to_string().contains("too short"));
}

#[test]
fn good_magic_validates() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("evidence.sfs");
    let mut content = SQUASHFS_MAGIC.to_vec();
    content.extend_from_slice(&[0u8; 64]);
    fs::write(&path, &content).unwrap();
    assert!(validate(&path).is_ok());
}

#[test]
fn validation_is_pure() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("evidence.sfs");
    let mut content = SQUASHFS_MAGIC.to_vec();
    content.extend_from_slice(&[0u8; 16]);
    fs::write(&path, &content).unwrap();

    assert!(validate(&path).is_ok());
    assert!(validate(&path).is_ok());
    assert_eq!(fs::read(&path).unwrap(), content);
}

#[test]
fn suffix_requires_nonempty_stem() {
    assert!(has_container_suffix(Path::new("case01.sfs")));
    assert!(has_container_suffix(Path::new("/evidence/case01.sfs")));
    assert!(!has_container_suffix(Path::new(".sfs")));
    assert!(!has_container_suffix(Path::new("case01.sfsx")));
    assert!(!has_container_suffix(Path::new("case01.img")));
}
