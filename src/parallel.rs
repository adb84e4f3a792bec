//! Parallel I/O façade.
//!
//! All in-memory state of one folder pair is guarded by a single mutex; a
//! worker holds it while mutating the tree and releases it for the duration
//! of every blocking filesystem call. `PairGuard` owns that bracket, and
//! each wrapper below runs exactly one `FileSystem` primitive outside the
//! lock.
//!
//! Callbacks passed through these wrappers also run outside the lock; a
//! callback that needs to touch the tree must re-acquire it through a fresh
//! `PairGuard`.

use parking_lot::{Mutex, MutexGuard};
use std::path::{Path, PathBuf};

use crate::errors::SyncResult;
use crate::file_ops::{self, FileCopyResult, FileSystem, ItemType};
use crate::hierarchy::{BaseFolderPair, FileAttributes, FileDescriptor};
use crate::recycle::RecycleSession;
use crate::versioning::{FileVersioner, NotifyMove};

/// Lock handle over one folder pair. Normally held; temporarily released
/// around blocking I/O via [`PairGuard::unlocked`].
pub struct PairGuard<'m> {
    mutex: &'m Mutex<BaseFolderPair>,
    guard: Option<MutexGuard<'m, BaseFolderPair>>,
}

impl<'m> PairGuard<'m> {
    pub fn new(mutex: &'m Mutex<BaseFolderPair>) -> Self {
        Self {
            mutex,
            guard: Some(mutex.lock()),
        }
    }

    /// Access to the guarded tree; re-locks if currently released.
    pub fn pair(&mut self) -> &mut BaseFolderPair {
        self.guard.get_or_insert_with(|| self.mutex.lock())
    }

    /// Runs `f` with the lock released, then re-acquires it.
    pub fn unlocked<T>(&mut self, f: impl FnOnce() -> T) -> T {
        self.guard = None;
        let result = f();
        self.guard = Some(self.mutex.lock());
        result
    }
}

pub fn get_item_type(
    fs: &dyn FileSystem,
    path: &Path,
    guard: &mut PairGuard,
) -> SyncResult<ItemType> {
    guard.unlocked(|| fs.get_item_type(path))
}

pub fn get_item_type_if_exists(
    fs: &dyn FileSystem,
    path: &Path,
    guard: &mut PairGuard,
) -> SyncResult<Option<ItemType>> {
    guard.unlocked(|| fs.get_item_type_if_exists(path))
}

pub fn remove_file_if_exists(
    fs: &dyn FileSystem,
    path: &Path,
    guard: &mut PairGuard,
) -> SyncResult<bool> {
    guard.unlocked(|| fs.remove_file_if_exists(path))
}

pub fn remove_symlink_if_exists(
    fs: &dyn FileSystem,
    path: &Path,
    guard: &mut PairGuard,
) -> SyncResult<bool> {
    guard.unlocked(|| fs.remove_symlink_if_exists(path))
}

pub fn remove_file_plain(
    fs: &dyn FileSystem,
    path: &Path,
    guard: &mut PairGuard,
) -> SyncResult<()> {
    guard.unlocked(|| fs.remove_file_plain(path))
}

pub fn rename_item(
    fs: &dyn FileSystem,
    from: &Path,
    to: &Path,
    guard: &mut PairGuard,
) -> SyncResult<()> {
    guard.unlocked(|| fs.rename_item(from, to))
}

pub fn get_symlink_resolved_path(
    fs: &dyn FileSystem,
    path: &Path,
    guard: &mut PairGuard,
) -> SyncResult<PathBuf> {
    guard.unlocked(|| fs.get_symlink_resolved_path(path))
}

pub fn copy_symlink(
    fs: &dyn FileSystem,
    from: &Path,
    to: &Path,
    copy_permissions: bool,
    guard: &mut PairGuard,
) -> SyncResult<()> {
    guard.unlocked(|| fs.copy_symlink(from, to, copy_permissions))
}

pub fn copy_new_folder(
    fs: &dyn FileSystem,
    from: &Path,
    to: &Path,
    copy_permissions: bool,
    guard: &mut PairGuard,
) -> SyncResult<()> {
    guard.unlocked(|| fs.copy_new_folder(from, to, copy_permissions))
}

pub fn remove_folder_if_exists_recursion(
    fs: &dyn FileSystem,
    path: &Path,
    on_before_file_deletion: &mut dyn FnMut(&str) -> SyncResult<()>,
    on_before_folder_deletion: &mut dyn FnMut(&str) -> SyncResult<()>,
    guard: &mut PairGuard,
) -> SyncResult<()> {
    guard.unlocked(|| {
        fs.remove_folder_if_exists_recursion(path, on_before_file_deletion, on_before_folder_deletion)
    })
}

#[allow(clippy::too_many_arguments)]
pub fn copy_file_transactional(
    fs: &dyn FileSystem,
    source: &Path,
    source_attrs: &FileAttributes,
    target: &Path,
    copy_permissions: bool,
    transactional_copy: bool,
    on_delete_target: Option<&mut dyn FnMut() -> SyncResult<()>>,
    notify_io: &mut dyn FnMut(i64) -> SyncResult<()>,
    guard: &mut PairGuard,
) -> SyncResult<FileCopyResult> {
    guard.unlocked(|| {
        fs.copy_file_transactional(
            source,
            source_attrs,
            target,
            copy_permissions,
            transactional_copy,
            on_delete_target,
            notify_io,
        )
    })
}

pub fn recycle_item(
    session: &dyn RecycleSession,
    path: &Path,
    logical_rel_path: &Path,
    guard: &mut PairGuard,
) -> SyncResult<bool> {
    guard.unlocked(|| session.recycle_item(path, logical_rel_path))
}

pub fn revision_file(
    versioner: &FileVersioner,
    file: &FileDescriptor,
    rel_path: &Path,
    notify_io: &mut dyn FnMut(i64) -> SyncResult<()>,
    guard: &mut PairGuard,
) -> SyncResult<bool> {
    guard.unlocked(|| versioner.revision_file(file, rel_path, notify_io))
}

pub fn revision_symlink(
    versioner: &FileVersioner,
    link_path: &Path,
    rel_path: &Path,
    guard: &mut PairGuard,
) -> SyncResult<bool> {
    guard.unlocked(|| versioner.revision_symlink(link_path, rel_path))
}

pub fn revision_folder(
    versioner: &FileVersioner,
    folder_path: &Path,
    rel_path: &Path,
    on_before_file_move: NotifyMove,
    on_before_folder_move: NotifyMove,
    notify_io: &mut dyn FnMut(i64) -> SyncResult<()>,
    guard: &mut PairGuard,
) -> SyncResult<()> {
    guard.unlocked(|| {
        versioner.revision_folder(
            folder_path,
            rel_path,
            on_before_file_move,
            on_before_folder_move,
            notify_io,
        )
    })
}

pub fn verify_files(
    fs: &dyn FileSystem,
    source: &Path,
    target: &Path,
    notify_io: &mut dyn FnMut(i64) -> SyncResult<()>,
    guard: &mut PairGuard,
) -> SyncResult<()> {
    guard.unlocked(|| file_ops::verify_files(fs, source, target, notify_io))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_guard_releases_and_reacquires() {
        let mutex = Mutex::new(BaseFolderPair::new(
            PathBuf::from("/l"),
            PathBuf::from("/r"),
        ));
        let mut guard = PairGuard::new(&mutex);
        assert!(mutex.try_lock().is_none());

        guard.unlocked(|| {
            // lock is free during the I/O section
            let reentrant = mutex.try_lock();
            assert!(reentrant.is_some());
        });

        // re-acquired afterwards
        assert!(mutex.try_lock().is_none());
        assert_eq!(guard.pair().left_path, PathBuf::from("/l"));
    }
}
