//! Restore a directly-mounted storage directory from its clean backup.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::cmd::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertOutcome {
    Restored,
    /// No backup existed; storage was reset to an empty directory.
    EmptyStorage,
}

/// Copy a directory tree, keeping VM disk files sparse.
///
/// `dest` must not exist yet; `cp -r` would otherwise nest `src` inside it.
pub fn copy_sparse(src: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        bail!("Refusing to copy over existing path {}", dest.display());
    }
    let src_arg = src.display().to_string();
    let dest_arg = dest.display().to_string();
    let args: Vec<&str> = if cfg!(target_os = "linux") {
        vec!["-r", "--sparse=always", src_arg.as_str(), dest_arg.as_str()]
    } else {
        vec!["-R", src_arg.as_str(), dest_arg.as_str()]
    };
    Cmd::new("cp")
        .args(args)
        .run()
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
    Ok(())
}

/// Replace `storage` with a fresh copy of `backup`.
///
/// The sandbox using `storage` must already be reaped.
pub fn revert(storage: &Path, backup: &Path) -> Result<RevertOutcome> {
    let storage_abs = storage
        .canonicalize()
        .unwrap_or_else(|_| storage.to_path_buf());
    let backup_abs = backup
        .canonicalize()
        .unwrap_or_else(|_| backup.to_path_buf());
    if storage_abs == backup_abs
        || backup_abs.starts_with(&storage_abs)
        || storage_abs.starts_with(&backup_abs)
    {
        bail!(
            "Storage {} and backup {} overlap",
            storage.display(),
            backup.display()
        );
    }

    if storage.exists() {
        info!(storage = %storage.display(), "snapshot:clearing storage");
        fs::remove_dir_all(storage)
            .with_context(|| format!("Failed to clear storage {}", storage.display()))?;
    }

    if backup.is_dir() {
        info!(backup = %backup.display(), storage = %storage.display(), "snapshot:restoring");
        copy_sparse(backup, storage)?;
        Ok(RevertOutcome::Restored)
    } else {
        fs::create_dir_all(storage)
            .with_context(|| format!("Failed to create storage {}", storage.display()))?;
        warn!(backup = %backup.display(), "snapshot:backup not found, initialized empty storage");
        Ok(RevertOutcome::EmptyStorage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_revert_restores_backup_contents() {
        let temp = TempDir::new().unwrap();
        let backup = temp.path().join("storage_backup");
        let storage = temp.path().join("storage");
        fs::create_dir_all(&backup).unwrap();
        fs::write(backup.join("data.img"), b"clean").unwrap();
        fs::create_dir_all(&storage).unwrap();
        fs::write(storage.join("data.img"), b"dirty").unwrap();
        fs::write(storage.join("extra.log"), b"junk").unwrap();

        assert_eq!(revert(&storage, &backup).unwrap(), RevertOutcome::Restored);
        assert_eq!(fs::read(storage.join("data.img")).unwrap(), b"clean");
        assert!(!storage.join("extra.log").exists());
        assert!(!storage.join("storage_backup").exists());
        assert!(backup.join("data.img").exists());
    }

    #[test]
    fn test_revert_without_backup_leaves_empty_storage() {
        let temp = TempDir::new().unwrap();
        let storage = temp.path().join("storage");
        fs::create_dir_all(&storage).unwrap();
        fs::write(storage.join("data.img"), b"dirty").unwrap();

        let outcome = revert(&storage, &temp.path().join("missing")).unwrap();
        assert_eq!(outcome, RevertOutcome::EmptyStorage);
        assert!(storage.is_dir());
        assert_eq!(fs::read_dir(&storage).unwrap().count(), 0);
    }

    #[test]
    fn test_revert_refuses_overlap() {
        let temp = TempDir::new().unwrap();
        let storage = temp.path().join("storage");
        fs::create_dir_all(storage.join("backup")).unwrap();
        assert!(revert(&storage, &storage.join("backup")).is_err());
        assert!(storage.join("backup").exists());
    }

    #[test]
    fn test_copy_sparse_refuses_existing_dest() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        assert!(copy_sparse(&src, temp.path()).is_err());
    }
}
