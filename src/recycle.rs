//! Batched recycle-bin access.
//!
//! Items are first staged inside the base folder (same volume, so staging is
//! a cheap rename) and moved into the platform trash location in one batch
//! after the sync.

use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::errors::{io_ctx, SyncError, SyncResult};

/// Batched interface to the recycle bin, one session per base folder.
/// Implementations are internally synchronized.
pub trait RecycleSession: Send + Sync {
    /// Stages one item for recycling; returns whether the item existed.
    fn recycle_item(&self, path: &Path, logical_rel_path: &Path) -> SyncResult<bool>;

    /// Flushes the staged items into the recycle bin. `notify` receives the
    /// display path of each item being moved.
    fn try_cleanup(&self, notify: &mut dyn FnMut(&str) -> SyncResult<()>) -> SyncResult<()>;
}

/// Platform trash folder, if the platform has a usable one.
pub fn platform_trash_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        dirs::home_dir().map(|home| home.join(".Trash"))
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        dirs::data_local_dir().map(|data| data.join("Trash/files"))
    }
    #[cfg(not(unix))]
    {
        None
    }
}

pub struct NativeRecycleSession {
    base_folder: PathBuf,
    /// Lazily created staging directory inside the base folder.
    staging: Mutex<Option<PathBuf>>,
}

impl NativeRecycleSession {
    pub fn new(base_folder: PathBuf) -> Self {
        Self {
            base_folder,
            staging: Mutex::new(None),
        }
    }

    fn get_or_create_staging(&self) -> SyncResult<PathBuf> {
        let mut staging = self.staging.lock();
        if let Some(dir) = staging.as_ref() {
            return Ok(dir.clone());
        }
        let tag = Uuid::new_v4().simple().to_string();
        let dir = self.base_folder.join(format!(".tws_recycle.{}", &tag[..8]));
        fs::create_dir_all(&dir)
            .map_err(io_ctx(format!("Cannot create folder {}", dir.display())))?;
        *staging = Some(dir.clone());
        Ok(dir)
    }
}

impl RecycleSession for NativeRecycleSession {
    fn recycle_item(&self, path: &Path, logical_rel_path: &Path) -> SyncResult<bool> {
        if !item_exists(path) {
            return Ok(false);
        }
        let staging = self.get_or_create_staging()?;
        let mut target = staging.join(logical_rel_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(io_ctx(format!("Cannot create folder {}", parent.display())))?;
        }
        // avoid clobbering when the same relative path is staged twice
        let mut attempt = 0;
        while item_exists(&target) {
            attempt += 1;
            target = staging.join(format!(
                "{}.{}",
                logical_rel_path.display(),
                attempt
            ));
        }
        fs::rename(path, &target).map_err(io_ctx(format!(
            "Cannot move {} to {}",
            path.display(),
            target.display()
        )))?;
        Ok(true)
    }

    fn try_cleanup(&self, notify: &mut dyn FnMut(&str) -> SyncResult<()>) -> SyncResult<()> {
        let staging = {
            let mut guard = self.staging.lock();
            guard.take()
        };
        let Some(staging) = staging else {
            return Ok(());
        };
        let result = flush_staging(&staging, notify);
        if result.is_err() {
            // keep the staging dir for a later retry
            *self.staging.lock() = Some(staging);
        }
        result
    }
}

fn flush_staging(staging: &Path, notify: &mut dyn FnMut(&str) -> SyncResult<()>) -> SyncResult<()> {
    let trash = platform_trash_dir()
        .ok_or_else(|| SyncError::Other("The recycle bin is not available".to_string()))?;
    fs::create_dir_all(&trash)
        .map_err(io_ctx(format!("Cannot create folder {}", trash.display())))?;

    let entries = fs::read_dir(staging)
        .map_err(io_ctx(format!("Cannot read folder {}", staging.display())))?;
    for entry in entries {
        let entry = entry.map_err(io_ctx(format!("Cannot read folder {}", staging.display())))?;
        let name = entry.file_name();
        notify(&entry.path().display().to_string())?;

        let mut target = trash.join(&name);
        let mut attempt = 0;
        while item_exists(&target) {
            attempt += 1;
            target = trash.join(format!("{}.{}", name.to_string_lossy(), attempt));
        }
        fs::rename(entry.path(), &target).map_err(io_ctx(format!(
            "Cannot move {} to {}",
            entry.path().display(),
            target.display()
        )))?;
    }
    fs::remove_dir_all(staging)
        .map_err(io_ctx(format!("Cannot delete folder {}", staging.display())))?;
    Ok(())
}

fn item_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recycle_missing_item_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let session = NativeRecycleSession::new(dir.path().to_path_buf());
        let existed = session
            .recycle_item(&dir.path().join("nope"), Path::new("nope"))
            .unwrap();
        assert!(!existed);
        // no staging dir created for a no-op
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_recycle_stages_items_inside_base_folder() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("doomed.txt");
        fs::write(&victim, b"bye").unwrap();

        let session = NativeRecycleSession::new(dir.path().to_path_buf());
        assert!(session.recycle_item(&victim, Path::new("doomed.txt")).unwrap());
        assert!(!victim.exists());

        // the item now lives in a hidden staging dir under the base folder
        let staged: Vec<_> = walkdir::WalkDir::new(dir.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .collect();
        assert_eq!(staged.len(), 1);
        assert_eq!(fs::read(staged[0].path()).unwrap(), b"bye");
    }

    #[test]
    fn test_cleanup_without_staged_items_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let session = NativeRecycleSession::new(dir.path().to_path_buf());
        session.try_cleanup(&mut |_| Ok(())).unwrap();
    }
}
