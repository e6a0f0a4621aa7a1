//! Atomic bundle application on the node
//!
//! ## Overview
//! - Validate the blob with the same rules the control plane uses
//! - Extract into a staging sibling of the target directory
//! - Swap old for new with a single rename; roll back on failure
//!
//! An observer of the target path sees either the complete old tree or the
//! complete new tree, never a mix. Staging and backup directories live
//! next to the target as `<target>.staging.<nonce>` and
//! `<target>.backup.<nonce>` and are gone by the time an apply returns.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

use crate::bundle::{BundleError, REQUIRED_MEMBERS, validate_bundle};

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error(transparent)]
    Validation(#[from] BundleError),

    #[error("bundle member has an unsafe path: {0}")]
    UnsafePath(String),

    #[error("extraction failed: {0}")]
    Extract(io::Error),

    #[error("member {0} missing after extraction")]
    MissingAfterExtract(&'static str),

    #[error("directory swap failed: {0}")]
    Swap(io::Error),
}

fn write_mode_0600(path: &Path, mut reader: impl Read) -> io::Result<()> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    std::fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Extract archive members into `staging`. Only plain relative paths are
/// accepted; anything with `..` or an absolute component fails the apply.
fn extract_to_staging(data: &[u8], staging: &Path) -> Result<(), ApplyError> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(staging).map_err(ApplyError::Extract)?;

    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let entries = archive
        .entries()
        .map_err(|e| ApplyError::Validation(BundleError::Format(e.to_string())))?;
    for entry in entries {
        let entry = entry.map_err(|e| ApplyError::Validation(BundleError::Format(e.to_string())))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| ApplyError::Validation(BundleError::Format(e.to_string())))?
            .into_owned();
        let mut name = PathBuf::new();
        for comp in path.components() {
            match comp {
                std::path::Component::Normal(p) => name.push(p),
                std::path::Component::CurDir => {}
                _ => return Err(ApplyError::UnsafePath(path.display().to_string())),
            }
        }
        if name.components().count() != 1 {
            // Nested members are allowed but must stay inside the staging
            // tree; parents are created as needed.
            if let Some(parent) = name.parent() {
                std::fs::create_dir_all(staging.join(parent)).map_err(ApplyError::Extract)?;
            }
        }
        write_mode_0600(&staging.join(&name), entry).map_err(ApplyError::Extract)?;
    }

    for required in REQUIRED_MEMBERS {
        if !staging.join(required).is_file() {
            return Err(ApplyError::MissingAfterExtract(required));
        }
    }
    Ok(())
}

fn sibling(target: &Path, kind: &str, nonce: u64) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    target.with_file_name(format!("{name}.{kind}.{nonce:016x}"))
}

/// Move `staging` into place at `target`, backing up and restoring any
/// previous tree when the swap fails.
fn swap_into_place(staging: &Path, target: &Path, nonce: u64) -> Result<(), ApplyError> {
    let backup = sibling(target, "backup", nonce);
    let had_previous = target.exists();

    if had_previous {
        std::fs::rename(target, &backup).map_err(ApplyError::Swap)?;
    }

    match std::fs::rename(staging, target) {
        Ok(()) => {
            if had_previous {
                let _ = std::fs::remove_dir_all(&backup);
            }
            Ok(())
        }
        Err(e) => {
            if had_previous {
                if let Err(restore) = std::fs::rename(&backup, target) {
                    warn!(
                        target = %target.display(),
                        error = %restore,
                        "could not restore previous config tree"
                    );
                }
            }
            Err(ApplyError::Swap(e))
        }
    }
}

/// Validate `data` and atomically install it as the tree at `target`.
///
/// On success the caller signals the process supervisor to restart. On any
/// failure the previous tree (if one existed) is intact and no staging or
/// backup residue remains.
pub fn apply_bundle(data: &[u8], target: &Path) -> Result<(), ApplyError> {
    validate_bundle(data)?;

    let nonce: u64 = rand::thread_rng().r#gen();
    let staging = sibling(target, "staging", nonce);

    let result = extract_to_staging(data, &staging)
        .and_then(|()| swap_into_place(&staging, target, nonce));

    if result.is_err() {
        let _ = std::fs::remove_dir_all(&staging);
    }

    match &result {
        Ok(()) => info!(target = %target.display(), "bundle applied"),
        Err(e) => warn!(target = %target.display(), error = %e, "bundle apply failed"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn build_bundle(members: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in members {
            let mut header = tar::Header::new_gnu();
            let name_bytes = name.as_bytes();
            header.as_old_mut().name[..name_bytes.len()].copy_from_slice(name_bytes);
            header.set_size(data.len() as u64);
            header.set_mode(0o600);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn complete_bundle(config: &str) -> Vec<u8> {
        build_bundle(&[
            ("config.yml", config.as_bytes()),
            ("ca.crt", b"ca"),
            ("crl.pem", b"crl"),
            ("host.crt", b"cert"),
            ("host.key", b"key"),
        ])
    }

    fn residue(parent: &Path) -> Vec<String> {
        std::fs::read_dir(parent)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".staging.") || n.contains(".backup."))
            .collect()
    }

    #[test]
    fn fresh_apply_creates_target_without_residue() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("edge");

        apply_bundle(&complete_bundle("v: 1\n"), &target).unwrap();

        for member in REQUIRED_MEMBERS {
            assert!(target.join(member).is_file(), "missing {member}");
        }
        assert!(residue(dir.path()).is_empty());
    }

    #[test]
    fn reapply_replaces_tree_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("edge");

        apply_bundle(&complete_bundle("v: 1\n"), &target).unwrap();
        apply_bundle(&complete_bundle("v: 2\n"), &target).unwrap();

        let text = std::fs::read_to_string(target.join("config.yml")).unwrap();
        assert_eq!(text, "v: 2\n");
        assert!(residue(dir.path()).is_empty());
    }

    #[test]
    fn invalid_bundle_leaves_previous_tree_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("edge");
        apply_bundle(&complete_bundle("v: 1\n"), &target).unwrap();

        // Missing host.key.
        let broken = build_bundle(&[
            ("config.yml", b"v: 2\n"),
            ("ca.crt", b"ca"),
            ("crl.pem", b"crl"),
            ("host.crt", b"cert"),
        ]);
        let err = apply_bundle(&broken, &target).unwrap_err();
        assert!(matches!(err, ApplyError::Validation(_)));

        let text = std::fs::read_to_string(target.join("config.yml")).unwrap();
        assert_eq!(text, "v: 1\n");
        assert!(residue(dir.path()).is_empty());
    }

    #[test]
    fn traversal_members_fail_and_clean_up() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("edge");

        let mut members = vec![
            ("config.yml", b"v: 1\n".as_slice()),
            ("ca.crt", b"ca".as_slice()),
            ("crl.pem", b"crl".as_slice()),
            ("host.crt", b"cert".as_slice()),
            ("host.key", b"key".as_slice()),
        ];
        members.push(("../escape.txt", b"nope".as_slice()));
        let blob = build_bundle(&members);

        let err = apply_bundle(&blob, &target).unwrap_err();
        assert!(matches!(err, ApplyError::UnsafePath(_)));
        assert!(!target.exists());
        assert!(residue(dir.path()).is_empty());
    }

    #[test]
    fn failed_swap_restores_backup() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("edge");
        apply_bundle(&complete_bundle("v: 1\n"), &target).unwrap();

        // Missing staging directory forces the second rename to fail.
        let missing = dir.path().join("edge.staging.does-not-exist");
        let err = swap_into_place(&missing, &target, 42).unwrap_err();
        assert!(matches!(err, ApplyError::Swap(_)));

        let text = std::fs::read_to_string(target.join("config.yml")).unwrap();
        assert_eq!(text, "v: 1\n");
        assert!(residue(dir.path()).is_empty());
    }
}
