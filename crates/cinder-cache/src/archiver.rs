//! Tar packing of workspace paths.

use cinder_core::{Error, Result};
use std::path::{Component, Path};
use tracing::debug;

/// Pack `paths` (relative to `base_dir`, or absolute inside it) into an uncompressed tar
/// archive. Missing paths are skipped.
pub fn pack(paths: &[String], base_dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    for raw in paths {
        let requested = Path::new(raw.trim_end_matches('/'));
        let absolute = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            base_dir.join(requested)
        };
        let name = absolute.strip_prefix(base_dir).map_err(|_| {
            Error::Infrastructure(format!("path '{raw}' is outside the workspace"))
        })?;
        if name.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(Error::Infrastructure(format!(
                "path '{raw}' escapes the workspace"
            )));
        }

        if !absolute.exists() {
            debug!(path = %raw, "Skipping missing path");
            continue;
        }
        if absolute.is_dir() {
            builder.append_dir_all(name, &absolute)?;
        } else {
            builder.append_path_with_name(&absolute, name)?;
        }
    }

    Ok(builder.into_inner()?)
}

/// Unpack an archive produced by [`pack`] into `dest`.
pub fn unpack(archive: &[u8], dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(archive);
    archive.set_overwrite(true);
    archive.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_unpack_tree() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("target/debug")).unwrap();
        std::fs::write(src.path().join("target/debug/app"), b"binary").unwrap();
        std::fs::write(src.path().join("Cargo.lock"), b"lock").unwrap();

        let archive = pack(
            &["target/".into(), "Cargo.lock".into(), "missing".into()],
            src.path(),
        )
        .unwrap();

        let dest = tempfile::tempdir().unwrap();
        unpack(&archive, dest.path()).unwrap();
        assert_eq!(std::fs::read(dest.path().join("target/debug/app")).unwrap(), b"binary");
        assert_eq!(std::fs::read(dest.path().join("Cargo.lock")).unwrap(), b"lock");
        assert!(!dest.path().join("missing").exists());
    }

    #[test]
    fn test_parent_paths_are_rejected() {
        let src = tempfile::tempdir().unwrap();
        assert!(pack(&["../etc".into()], src.path()).is_err());
    }
}
