//! Deletion policy dispatch for one base folder.
//!
//! Encapsulates permanent deletion, batched recycling and versioning behind
//! a single interface. Recycle session and versioner are created lazily on
//! first use and are internally synchronized, so callers only need the
//! global tree lock for tree mutations, not for deletions themselves.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::actor::ItemStatReporter;
use crate::config::{DeletionPolicy, VersioningStyle};
use crate::errors::SyncResult;
use crate::file_ops::{display_path, FileSystem, TEMP_FILE_ENDING};
use crate::hierarchy::FileDescriptor;
use crate::parallel::{self, PairGuard};
use crate::progress::ProcessCallback;
use crate::recycle::RecycleSession;
use crate::versioning::FileVersioner;

pub struct DeletionHandler {
    fs: Arc<dyn FileSystem>,
    policy: DeletionPolicy,
    base_folder_path: PathBuf,
    versioning_folder_path: PathBuf,
    versioning_style: VersioningStyle,
    timestamp: String,

    recycler_session: Mutex<Option<Arc<dyn RecycleSession>>>,
    versioner: Mutex<Option<Arc<FileVersioner>>>,

    txt_removing_file: String,
    txt_removing_symlink: String,
    txt_removing_folder: String,
    txt_moving_file: String,
    txt_moving_folder: String,
}

impl DeletionHandler {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        base_folder_path: PathBuf,
        policy: DeletionPolicy,
        versioning_folder_path: PathBuf,
        versioning_style: VersioningStyle,
        timestamp: String,
    ) -> Self {
        let versioning_display = display_path(&versioning_folder_path);
        let (txt_file, txt_link, txt_folder) = match policy {
            DeletionPolicy::Permanent => (
                "Deleting file %x".to_string(),
                "Deleting symbolic link %x".to_string(),
                "Deleting folder %x".to_string(),
            ),
            DeletionPolicy::Recycler => (
                "Moving file %x to the recycle bin".to_string(),
                "Moving symbolic link %x to the recycle bin".to_string(),
                "Moving folder %x to the recycle bin".to_string(),
            ),
            DeletionPolicy::Versioning => (
                format!("Moving file %x to {}", versioning_display),
                format!("Moving symbolic link %x to {}", versioning_display),
                format!("Moving folder %x to {}", versioning_display),
            ),
        };
        Self {
            fs,
            policy,
            base_folder_path,
            versioning_folder_path,
            versioning_style,
            timestamp,
            recycler_session: Mutex::new(None),
            versioner: Mutex::new(None),
            txt_removing_file: txt_file,
            txt_removing_symlink: txt_link,
            txt_removing_folder: txt_folder,
            txt_moving_file: "Moving file %x to %y".to_string(),
            txt_moving_folder: "Moving folder %x to %y".to_string(),
        }
    }

    pub fn policy(&self) -> DeletionPolicy {
        self.policy
    }

    pub fn txt_removing_file(&self) -> &str {
        &self.txt_removing_file
    }

    pub fn txt_removing_symlink(&self) -> &str {
        &self.txt_removing_symlink
    }

    pub fn txt_removing_folder(&self) -> &str {
        &self.txt_removing_folder
    }

    fn get_or_create_recycler(&self) -> SyncResult<Arc<dyn RecycleSession>> {
        debug_assert_eq!(self.policy, DeletionPolicy::Recycler);
        let mut session = self.recycler_session.lock();
        match session.as_ref() {
            Some(existing) => Ok(existing.clone()),
            None => {
                let created: Arc<dyn RecycleSession> =
                    Arc::from(self.fs.create_recycler_session(&self.base_folder_path)?);
                *session = Some(created.clone());
                Ok(created)
            }
        }
    }

    fn get_or_create_versioner(&self) -> SyncResult<Arc<FileVersioner>> {
        debug_assert_eq!(self.policy, DeletionPolicy::Versioning);
        let mut versioner = self.versioner.lock();
        match versioner.as_ref() {
            Some(existing) => Ok(existing.clone()),
            None => {
                let created = Arc::new(FileVersioner::new(
                    self.versioning_folder_path.clone(),
                    self.versioning_style,
                    self.timestamp.clone(),
                ));
                *versioner = Some(created.clone());
                Ok(created)
            }
        }
    }

    /// Removes one file according to the configured policy. Engine-owned
    /// temp files are always deleted permanently.
    pub fn remove_file_with_callback(
        &self,
        file: &FileDescriptor,
        rel_path: &Path,
        stat: &ItemStatReporter,
        guard: &mut PairGuard,
    ) -> SyncResult<()> {
        if rel_path.to_string_lossy().ends_with(TEMP_FILE_ENDING) {
            parallel::remove_file_if_exists(&*self.fs, &file.path, guard)?;
        } else {
            match self.policy {
                DeletionPolicy::Permanent => {
                    parallel::remove_file_if_exists(&*self.fs, &file.path, guard)?;
                }
                DeletionPolicy::Recycler => {
                    let session = self.get_or_create_recycler()?;
                    parallel::recycle_item(&*session, &file.path, rel_path, guard)?;
                }
                DeletionPolicy::Versioning => {
                    let versioner = self.get_or_create_versioner()?;
                    // byte progress runs outside the tree lock
                    parallel::revision_file(&versioner, file, rel_path, &mut |bytes| {
                        stat.report_delta(0, bytes)
                    }, guard)?;
                }
            }
        }
        // significant I/O work was done even if the item had vanished
        stat.report_delta(1, 0)
    }

    pub fn remove_link_with_callback(
        &self,
        link_path: &Path,
        rel_path: &Path,
        stat: &ItemStatReporter,
        guard: &mut PairGuard,
    ) -> SyncResult<()> {
        match self.policy {
            DeletionPolicy::Permanent => {
                parallel::remove_symlink_if_exists(&*self.fs, link_path, guard)?;
            }
            DeletionPolicy::Recycler => {
                let session = self.get_or_create_recycler()?;
                parallel::recycle_item(&*session, link_path, rel_path, guard)?;
            }
            DeletionPolicy::Versioning => {
                let versioner = self.get_or_create_versioner()?;
                parallel::revision_symlink(&versioner, link_path, rel_path, guard)?;
            }
        }
        stat.report_delta(1, 0)
    }

    /// Removes a folder subtree. Permanent deletion reports every child;
    /// recycling is one logical operation for the whole subtree.
    pub fn remove_dir_with_callback(
        &self,
        dir_path: &Path,
        rel_path: &Path,
        stat: &ItemStatReporter,
        guard: &mut PairGuard,
    ) -> SyncResult<()> {
        match self.policy {
            DeletionPolicy::Permanent => {
                let txt_file = self.txt_removing_file.clone();
                let txt_folder = self.txt_removing_folder.clone();
                parallel::remove_folder_if_exists_recursion(
                    &*self.fs,
                    dir_path,
                    &mut |display| {
                        stat.report_status(&txt_file.replace("%x", display))?;
                        stat.report_delta(1, 0)
                    },
                    &mut |display| {
                        stat.report_status(&txt_folder.replace("%x", display))?;
                        stat.report_delta(1, 0)
                    },
                    guard,
                )?;
                Ok(())
            }
            DeletionPolicy::Recycler => {
                let session = self.get_or_create_recycler()?;
                parallel::recycle_item(&*session, dir_path, rel_path, guard)?;
                stat.report_delta(1, 0)
            }
            DeletionPolicy::Versioning => {
                let versioner = self.get_or_create_versioner()?;
                let txt_file = self.txt_moving_file.clone();
                let txt_folder = self.txt_moving_folder.clone();
                parallel::revision_folder(
                    &versioner,
                    dir_path,
                    rel_path,
                    &mut |from, to| {
                        stat.report_status(&txt_file.replace("%x", from).replace("%y", to))?;
                        stat.report_delta(1, 0)
                    },
                    &mut |from, to| {
                        stat.report_status(&txt_folder.replace("%x", from).replace("%y", to))?;
                        stat.report_delta(1, 0)
                    },
                    &mut |bytes| stat.report_delta(0, bytes),
                    guard,
                )
            }
        }
    }

    /// Post-sync cleanup on the main thread. For the recycler policy this
    /// flushes the whole staged batch in one go. Callback exceptions may be
    /// suppressed so a best-effort cleanup cannot mask the original error.
    pub fn try_cleanup(
        &self,
        cb: &mut dyn ProcessCallback,
        allow_callback_exception: bool,
    ) -> SyncResult<()> {
        match self.policy {
            DeletionPolicy::Permanent => Ok(()),
            DeletionPolicy::Recycler => {
                let session = {
                    let guard = self.recycler_session.lock();
                    guard.clone()
                };
                let Some(session) = session else {
                    return Ok(());
                };
                let txt = self.txt_removing_file.clone();
                session.try_cleanup(&mut |display| {
                    let status = cb.report_status(&txt.replace("%x", display));
                    match status {
                        Ok(()) => Ok(()),
                        Err(e) if allow_callback_exception => Err(e),
                        Err(_) => Ok(()),
                    }
                })
            }
            // versioning has no post-sync cleanup step
            DeletionPolicy::Versioning => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::AsyncCallback;
    use crate::file_ops::NativeFileSystem;
    use crate::hierarchy::{BaseFolderPair, FileAttributes};
    use parking_lot::Mutex as PlMutex;
    use std::fs;

    fn make_handler(base: &Path, policy: DeletionPolicy, versions: &Path) -> DeletionHandler {
        DeletionHandler::new(
            Arc::new(NativeFileSystem::new()),
            base.to_path_buf(),
            policy,
            versions.to_path_buf(),
            VersioningStyle::Replace,
            "2024-03-01 120000".into(),
        )
    }

    fn descriptor(path: &Path) -> FileDescriptor {
        FileDescriptor {
            path: path.to_path_buf(),
            attrs: FileAttributes::default(),
        }
    }

    #[test]
    fn test_permanent_delete_reports_one_item() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("x.txt");
        fs::write(&victim, b"x").unwrap();

        let handler = make_handler(dir.path(), DeletionPolicy::Permanent, dir.path());
        let acb = AsyncCallback::new(1);
        let pair_lock = PlMutex::new(BaseFolderPair::default());
        let mut guard = PairGuard::new(&pair_lock);

        let stat = ItemStatReporter::new(1, 0, 0, &acb);
        handler
            .remove_file_with_callback(&descriptor(&victim), Path::new("x.txt"), &stat, &mut guard)
            .unwrap();
        stat.finish();
        assert!(!victim.exists());
    }

    #[test]
    fn test_temp_suffix_bypasses_versioning() {
        let dir = tempfile::tempdir().unwrap();
        let versions = dir.path().join("versions");
        let victim = dir.path().join(format!("x.1a2b{}", TEMP_FILE_ENDING));
        fs::write(&victim, b"tmp").unwrap();

        let handler = make_handler(dir.path(), DeletionPolicy::Versioning, &versions);
        let acb = AsyncCallback::new(1);
        let pair_lock = PlMutex::new(BaseFolderPair::default());
        let mut guard = PairGuard::new(&pair_lock);

        let stat = ItemStatReporter::new(1, 0, 0, &acb);
        let rel = PathBuf::from(format!("x.1a2b{}", TEMP_FILE_ENDING));
        handler
            .remove_file_with_callback(&descriptor(&victim), &rel, &stat, &mut guard)
            .unwrap();
        stat.finish();

        // permanently deleted, never versioned
        assert!(!victim.exists());
        assert!(!versions.exists());
    }

    #[test]
    fn test_versioning_moves_file_into_versioning_folder() {
        let dir = tempfile::tempdir().unwrap();
        let versions = dir.path().join("versions");
        let victim = dir.path().join("data.txt");
        fs::write(&victim, b"old").unwrap();

        let handler = make_handler(dir.path(), DeletionPolicy::Versioning, &versions);
        let acb = AsyncCallback::new(1);
        let pair_lock = PlMutex::new(BaseFolderPair::default());
        let mut guard = PairGuard::new(&pair_lock);

        let stat = ItemStatReporter::new(1, 3, 0, &acb);
        handler
            .remove_file_with_callback(&descriptor(&victim), Path::new("data.txt"), &stat, &mut guard)
            .unwrap();
        stat.finish();
        assert!(!victim.exists());
        assert_eq!(fs::read(versions.join("data.txt")).unwrap(), b"old");
    }

    #[test]
    fn test_recycler_session_created_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let handler = make_handler(dir.path(), DeletionPolicy::Recycler, dir.path());
        assert!(handler.recycler_session.lock().is_none());

        let victim = dir.path().join("y.txt");
        fs::write(&victim, b"y").unwrap();

        let acb = AsyncCallback::new(1);
        let pair_lock = PlMutex::new(BaseFolderPair::default());
        let mut guard = PairGuard::new(&pair_lock);
        let stat = ItemStatReporter::new(1, 0, 0, &acb);
        handler
            .remove_file_with_callback(&descriptor(&victim), Path::new("y.txt"), &stat, &mut guard)
            .unwrap();
        stat.finish();
        assert!(handler.recycler_session.lock().is_some());
        assert!(!victim.exists());
    }
}
