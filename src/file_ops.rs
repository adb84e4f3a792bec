//! File system boundary of the sync engine.
//!
//! `FileSystem` is the abstract surface the engine drives; `NativeFileSystem`
//! implements it on top of `std::fs` for local volumes.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::errors::{io_ctx, SyncError, SyncResult};
use crate::hierarchy::FileAttributes;
use crate::recycle::{platform_trash_dir, NativeRecycleSession, RecycleSession};

pub const COPY_BUFFER_SIZE: usize = 8 * 1024 * 1024;
pub const COMPARE_BUFFER_SIZE: usize = 1024 * 1024;

/// Reserved suffix for engine-owned temporary files. Items carrying it are
/// always deleted permanently, bypassing recycler and versioning.
pub const TEMP_FILE_ENDING: &str = ".tws_tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    File,
    Folder,
    Symlink,
}

/// Outcome of a transactional file copy.
#[derive(Debug, Clone)]
pub struct FileCopyResult {
    pub file_size: u64,
    pub mod_time: i64,
    pub source_file_id: u64,
    pub target_file_id: u64,
    /// Failure to carry over the modification time is collected, not fatal.
    pub error_mod_time: Option<String>,
}

/// Byte-progress callback; may signal cancellation through its error.
pub type IoProgress<'a> = &'a mut dyn FnMut(i64) -> SyncResult<()>;

/// Per-item notification callback used by recursive operations.
pub type NotifyItem<'a> = &'a mut dyn FnMut(&str) -> SyncResult<()>;

/// Abstract filesystem operations required by the engine. Implementations
/// must be callable from multiple worker threads; all callbacks run on the
/// calling thread.
pub trait FileSystem: Send + Sync {
    fn get_item_type(&self, path: &Path) -> SyncResult<ItemType>;
    fn get_item_type_if_exists(&self, path: &Path) -> SyncResult<Option<ItemType>>;
    fn remove_file_if_exists(&self, path: &Path) -> SyncResult<bool>;
    fn remove_symlink_if_exists(&self, path: &Path) -> SyncResult<bool>;
    fn remove_file_plain(&self, path: &Path) -> SyncResult<()>;
    fn rename_item(&self, from: &Path, to: &Path) -> SyncResult<()>;
    fn get_symlink_resolved_path(&self, path: &Path) -> SyncResult<PathBuf>;
    fn copy_symlink(&self, from: &Path, to: &Path, copy_permissions: bool) -> SyncResult<()>;
    /// Shallow copy of the folder itself, no children.
    fn copy_new_folder(&self, from: &Path, to: &Path, copy_permissions: bool) -> SyncResult<()>;
    fn create_folder_if_missing_recursion(&self, path: &Path) -> SyncResult<()>;

    fn remove_folder_if_exists_recursion(
        &self,
        path: &Path,
        on_before_file_deletion: NotifyItem,
        on_before_folder_deletion: NotifyItem,
    ) -> SyncResult<()>;

    /// Copies `source` over `target`. With `transactional_copy` the data is
    /// written to a sibling temp file first and renamed over the target, so
    /// the target is either fully old or fully new. `on_delete_target` runs
    /// at the point where the old target has to give way.
    #[allow(clippy::too_many_arguments)]
    fn copy_file_transactional(
        &self,
        source: &Path,
        source_attrs: &FileAttributes,
        target: &Path,
        copy_permissions: bool,
        transactional_copy: bool,
        on_delete_target: Option<&mut dyn FnMut() -> SyncResult<()>>,
        notify_io: IoProgress,
    ) -> SyncResult<FileCopyResult>;

    fn create_recycler_session(&self, base_folder: &Path) -> SyncResult<Box<dyn RecycleSession>>;
    fn supports_recycle_bin(
        &self,
        path: &Path,
        ui_refresh: &mut dyn FnMut() -> SyncResult<()>,
    ) -> SyncResult<bool>;

    /// Free space in bytes; 0 means "not available".
    fn get_free_disk_space(&self, path: &Path) -> SyncResult<u64>;
    fn support_permission_copy(&self, left: &Path, right: &Path) -> SyncResult<bool>;

    fn files_have_same_content(
        &self,
        lhs: &Path,
        rhs: &Path,
        notify_io: IoProgress,
    ) -> SyncResult<bool>;
    fn flush_file_buffers(&self, path: &Path) -> SyncResult<()>;
}

//---- pure path helpers ---------------------------------------------------

/// An empty path denotes "no folder configured".
pub fn is_null_path(path: &Path) -> bool {
    path.as_os_str().is_empty()
}

pub fn equal_abstract_path(a: &Path, b: &Path) -> bool {
    a.components().eq(b.components())
}

pub fn display_path(path: &Path) -> String {
    path.display().to_string()
}

/// Filesystem root a path belongs to, for the per-device parallelism map.
pub fn path_root(path: &Path) -> PathBuf {
    path.ancestors()
        .last()
        .unwrap_or_else(|| Path::new(""))
        .to_path_buf()
}

#[derive(Debug, Clone)]
pub struct PathDependency {
    pub base_path_parent: PathBuf,
    pub base_path_child: PathBuf,
    pub rel_path: PathBuf,
}

/// Detects whether one folder contains (or equals) the other.
pub fn path_dependency(a: &Path, b: &Path) -> Option<PathDependency> {
    if equal_abstract_path(a, b) {
        return Some(PathDependency {
            base_path_parent: a.to_path_buf(),
            base_path_child: b.to_path_buf(),
            rel_path: PathBuf::new(),
        });
    }
    if let Ok(rel) = b.strip_prefix(a) {
        return Some(PathDependency {
            base_path_parent: a.to_path_buf(),
            base_path_child: b.to_path_buf(),
            rel_path: rel.to_path_buf(),
        });
    }
    if let Ok(rel) = a.strip_prefix(b) {
        return Some(PathDependency {
            base_path_parent: b.to_path_buf(),
            base_path_child: a.to_path_buf(),
            rel_path: rel.to_path_buf(),
        });
    }
    None
}

//---- metadata helpers ----------------------------------------------------

pub fn mod_time_secs(metadata: &fs::Metadata) -> i64 {
    match metadata.modified() {
        Ok(t) => match t.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        },
        Err(_) => 0,
    }
}

#[cfg(unix)]
pub fn file_id_of(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
pub fn file_id_of(_metadata: &fs::Metadata) -> u64 {
    0
}

fn is_cross_device(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    const CROSS_DEVICE: i32 = 18; // EXDEV
    #[cfg(windows)]
    const CROSS_DEVICE: i32 = 17; // ERROR_NOT_SAME_DEVICE
    #[cfg(not(any(unix, windows)))]
    const CROSS_DEVICE: i32 = -1;
    err.raw_os_error() == Some(CROSS_DEVICE)
}

#[cfg(unix)]
fn is_locked_error(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(26) // ETXTBSY
}

#[cfg(not(unix))]
fn is_locked_error(err: &std::io::Error) -> bool {
    matches!(err.kind(), std::io::ErrorKind::PermissionDenied)
}

/// Best-effort fsync of a file's parent directory after a rename.
pub fn sync_parent_directory(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

//---- native implementation -----------------------------------------------

/// Local filesystem backend.
#[derive(Debug, Default)]
pub struct NativeFileSystem;

impl NativeFileSystem {
    pub fn new() -> Self {
        NativeFileSystem
    }

    /// Streaming copy with per-chunk progress reporting. Returns the number
    /// of bytes written.
    fn copy_stream(&self, source: &Path, target: &Path, notify_io: IoProgress) -> SyncResult<u64> {
        let src_file = File::open(source).map_err(|e| {
            if is_locked_error(&e) {
                SyncError::FileLocked(display_path(source))
            } else {
                io_ctx(format!("Cannot open file {}", source.display()))(e)
            }
        })?;
        let dst_file = File::create(target)
            .map_err(io_ctx(format!("Cannot write file {}", target.display())))?;

        let mut reader = BufReader::with_capacity(COPY_BUFFER_SIZE, src_file);
        let mut writer = BufWriter::with_capacity(COPY_BUFFER_SIZE, &dst_file);
        let mut buffer = vec![0u8; COMPARE_BUFFER_SIZE]; // chunk size bounds progress granularity
        let mut bytes_copied: u64 = 0;

        loop {
            let n = reader
                .read(&mut buffer)
                .map_err(io_ctx(format!("Cannot read file {}", source.display())))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buffer[..n])
                .map_err(io_ctx(format!("Cannot write file {}", target.display())))?;
            bytes_copied += n as u64;
            notify_io(n as i64)?;
        }
        writer
            .flush()
            .map_err(io_ctx(format!("Cannot write file {}", target.display())))?;
        drop(writer);
        dst_file
            .sync_all()
            .map_err(io_ctx(format!("Cannot write file {}", target.display())))?;
        Ok(bytes_copied)
    }

    /// Applies mod time and (optionally) permissions to a freshly copied
    /// file. Mod-time failures are returned as a message, not an error.
    fn finalize_copy(
        &self,
        source: &Path,
        target: &Path,
        source_attrs: &FileAttributes,
        copy_permissions: bool,
    ) -> SyncResult<Option<String>> {
        let mut error_mod_time = None;
        if let Err(e) = filetime::set_file_mtime(
            target,
            filetime::FileTime::from_unix_time(source_attrs.mod_time, 0),
        ) {
            error_mod_time = Some(format!(
                "Cannot write modification time of {}: {}",
                target.display(),
                e
            ));
        }
        if copy_permissions {
            let src_meta = fs::symlink_metadata(source)
                .map_err(io_ctx(format!("Cannot read file attributes of {}", source.display())))?;
            fs::set_permissions(target, src_meta.permissions())
                .map_err(io_ctx(format!("Cannot write permissions of {}", target.display())))?;
        }
        Ok(error_mod_time)
    }
}

impl FileSystem for NativeFileSystem {
    fn get_item_type(&self, path: &Path) -> SyncResult<ItemType> {
        let meta = fs::symlink_metadata(path)
            .map_err(io_ctx(format!("Cannot find {}", path.display())))?;
        Ok(if meta.file_type().is_symlink() {
            ItemType::Symlink
        } else if meta.is_dir() {
            ItemType::Folder
        } else {
            ItemType::File
        })
    }

    fn get_item_type_if_exists(&self, path: &Path) -> SyncResult<Option<ItemType>> {
        match fs::symlink_metadata(path) {
            Ok(meta) => Ok(Some(if meta.file_type().is_symlink() {
                ItemType::Symlink
            } else if meta.is_dir() {
                ItemType::Folder
            } else {
                ItemType::File
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_ctx(format!("Cannot access {}", path.display()))(e)),
        }
    }

    fn remove_file_if_exists(&self, path: &Path) -> SyncResult<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_ctx(format!("Cannot delete file {}", path.display()))(e)),
        }
    }

    fn remove_symlink_if_exists(&self, path: &Path) -> SyncResult<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_ctx(format!("Cannot delete symbolic link {}", path.display()))(e)),
        }
    }

    fn remove_file_plain(&self, path: &Path) -> SyncResult<()> {
        fs::remove_file(path).map_err(io_ctx(format!("Cannot delete file {}", path.display())))
    }

    fn rename_item(&self, from: &Path, to: &Path) -> SyncResult<()> {
        fs::rename(from, to).map_err(|e| {
            if is_cross_device(&e) {
                SyncError::DifferentVolume(display_path(from))
            } else {
                io_ctx(format!(
                    "Cannot move {} to {}",
                    from.display(),
                    to.display()
                ))(e)
            }
        })
    }

    fn get_symlink_resolved_path(&self, path: &Path) -> SyncResult<PathBuf> {
        fs::canonicalize(path).map_err(io_ctx(format!("Cannot resolve {}", path.display())))
    }

    fn copy_symlink(&self, from: &Path, to: &Path, _copy_permissions: bool) -> SyncResult<()> {
        let target = fs::read_link(from)
            .map_err(io_ctx(format!("Cannot read symbolic link {}", from.display())))?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, to)
            .map_err(io_ctx(format!("Cannot create symbolic link {}", to.display())))?;
        #[cfg(windows)]
        {
            if target.is_dir() {
                std::os::windows::fs::symlink_dir(&target, to)
                    .map_err(io_ctx(format!("Cannot create symbolic link {}", to.display())))?;
            } else {
                std::os::windows::fs::symlink_file(&target, to)
                    .map_err(io_ctx(format!("Cannot create symbolic link {}", to.display())))?;
            }
        }
        // carry over the link's own modification time, best effort
        if let Ok(meta) = fs::symlink_metadata(from) {
            let mtime = filetime::FileTime::from_unix_time(mod_time_secs(&meta), 0);
            let _ = filetime::set_symlink_file_times(to, mtime, mtime);
        }
        Ok(())
    }

    fn copy_new_folder(&self, from: &Path, to: &Path, copy_permissions: bool) -> SyncResult<()> {
        fs::create_dir(to).map_err(io_ctx(format!("Cannot create folder {}", to.display())))?;
        if copy_permissions {
            let src_meta = fs::metadata(from)
                .map_err(io_ctx(format!("Cannot read folder attributes of {}", from.display())))?;
            fs::set_permissions(to, src_meta.permissions())
                .map_err(io_ctx(format!("Cannot write permissions of {}", to.display())))?;
        }
        Ok(())
    }

    fn create_folder_if_missing_recursion(&self, path: &Path) -> SyncResult<()> {
        fs::create_dir_all(path)
            .map_err(io_ctx(format!("Cannot create folder {}", path.display())))
    }

    fn remove_folder_if_exists_recursion(
        &self,
        path: &Path,
        on_before_file_deletion: NotifyItem,
        on_before_folder_deletion: NotifyItem,
    ) -> SyncResult<()> {
        if self.get_item_type_if_exists(path)?.is_none() {
            return Ok(());
        }
        // contents-first so children are removed before their parent folders
        for entry in walkdir::WalkDir::new(path).contents_first(true) {
            let entry =
                entry.map_err(|e| SyncError::Other(format!("Cannot traverse {}: {}", path.display(), e)))?;
            let entry_path = entry.path();
            if entry.file_type().is_dir() {
                on_before_folder_deletion(&display_path(entry_path))?;
                fs::remove_dir(entry_path)
                    .map_err(io_ctx(format!("Cannot delete folder {}", entry_path.display())))?;
            } else {
                on_before_file_deletion(&display_path(entry_path))?;
                fs::remove_file(entry_path)
                    .map_err(io_ctx(format!("Cannot delete file {}", entry_path.display())))?;
            }
        }
        Ok(())
    }

    fn copy_file_transactional(
        &self,
        source: &Path,
        source_attrs: &FileAttributes,
        target: &Path,
        copy_permissions: bool,
        transactional_copy: bool,
        on_delete_target: Option<&mut dyn FnMut() -> SyncResult<()>>,
        notify_io: IoProgress,
    ) -> SyncResult<FileCopyResult> {
        let file_size;
        let error_mod_time;

        if transactional_copy {
            let tmp_name = format!(
                "{}{}",
                target.file_name().and_then(|n| n.to_str()).unwrap_or("target"),
                TEMP_FILE_ENDING
            );
            let tmp_target = target.with_file_name(tmp_name);

            let copied = (|| -> SyncResult<(u64, Option<String>)> {
                let size = self.copy_stream(source, &tmp_target, notify_io)?;
                let mod_time_err =
                    self.finalize_copy(source, &tmp_target, source_attrs, copy_permissions)?;
                Ok((size, mod_time_err))
            })();
            let (size, mod_time_err) = match copied {
                Ok(v) => v,
                Err(e) => {
                    let _ = fs::remove_file(&tmp_target);
                    return Err(e);
                }
            };

            if let Some(cb) = on_delete_target {
                if let Err(e) = cb() {
                    let _ = fs::remove_file(&tmp_target);
                    return Err(e);
                }
            }
            if let Err(e) = fs::rename(&tmp_target, target) {
                let _ = fs::remove_file(&tmp_target);
                return Err(io_ctx(format!(
                    "Cannot move {} to {}",
                    tmp_target.display(),
                    target.display()
                ))(e));
            }
            file_size = size;
            error_mod_time = mod_time_err;
        } else {
            if let Some(cb) = on_delete_target {
                cb()?;
            }
            file_size = self.copy_stream(source, target, notify_io)?;
            error_mod_time = self.finalize_copy(source, target, source_attrs, copy_permissions)?;
        }

        let source_meta = fs::symlink_metadata(source)
            .map_err(io_ctx(format!("Cannot read file attributes of {}", source.display())))?;
        let target_meta = fs::symlink_metadata(target)
            .map_err(io_ctx(format!("Cannot read file attributes of {}", target.display())))?;

        Ok(FileCopyResult {
            file_size,
            mod_time: source_attrs.mod_time,
            source_file_id: file_id_of(&source_meta),
            target_file_id: file_id_of(&target_meta),
            error_mod_time,
        })
    }

    fn create_recycler_session(&self, base_folder: &Path) -> SyncResult<Box<dyn RecycleSession>> {
        Ok(Box::new(NativeRecycleSession::new(base_folder.to_path_buf())))
    }

    fn supports_recycle_bin(
        &self,
        _path: &Path,
        ui_refresh: &mut dyn FnMut() -> SyncResult<()>,
    ) -> SyncResult<bool> {
        ui_refresh()?;
        Ok(platform_trash_dir().is_some())
    }

    fn get_free_disk_space(&self, path: &Path) -> SyncResult<u64> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let mut best: Option<(usize, u64)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if path.starts_with(mount) {
                let depth = mount.components().count();
                if best.map_or(true, |(d, _)| depth >= d) {
                    best = Some((depth, disk.available_space()));
                }
            }
        }
        Ok(best.map(|(_, space)| space).unwrap_or(0))
    }

    fn support_permission_copy(&self, _left: &Path, _right: &Path) -> SyncResult<bool> {
        Ok(cfg!(unix))
    }

    fn files_have_same_content(
        &self,
        lhs: &Path,
        rhs: &Path,
        notify_io: IoProgress,
    ) -> SyncResult<bool> {
        let mut reader_l = BufReader::with_capacity(
            COMPARE_BUFFER_SIZE,
            File::open(lhs).map_err(io_ctx(format!("Cannot open file {}", lhs.display())))?,
        );
        let mut reader_r = BufReader::with_capacity(
            COMPARE_BUFFER_SIZE,
            File::open(rhs).map_err(io_ctx(format!("Cannot open file {}", rhs.display())))?,
        );
        let mut buf_l = vec![0u8; COMPARE_BUFFER_SIZE];
        let mut buf_r = vec![0u8; COMPARE_BUFFER_SIZE];
        loop {
            let n_l = read_full(&mut reader_l, &mut buf_l)
                .map_err(io_ctx(format!("Cannot read file {}", lhs.display())))?;
            let n_r = read_full(&mut reader_r, &mut buf_r)
                .map_err(io_ctx(format!("Cannot read file {}", rhs.display())))?;
            if n_l != n_r || buf_l[..n_l] != buf_r[..n_r] {
                return Ok(false);
            }
            if n_l == 0 {
                return Ok(true);
            }
            notify_io((n_l + n_r) as i64)?;
        }
    }

    fn flush_file_buffers(&self, path: &Path) -> SyncResult<()> {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(io_ctx(format!("Cannot open file {}", path.display())))?;
        file.sync_all()
            .map_err(io_ctx(format!("Cannot read file {}", path.display())))
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Post-copy verification: flush OS buffers on the target, then compare
/// source and target byte for byte.
pub fn verify_files(
    fs: &dyn FileSystem,
    source: &Path,
    target: &Path,
    notify_io: IoProgress,
) -> SyncResult<()> {
    fs.flush_file_buffers(target)?;
    if !fs.files_have_same_content(source, target, notify_io)? {
        return Err(SyncError::VerificationFailed(
            display_path(source),
            display_path(target),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(path: &Path, content: &[u8]) {
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_path_helpers() {
        assert!(is_null_path(Path::new("")));
        assert!(!is_null_path(Path::new("/a")));
        assert!(equal_abstract_path(Path::new("/a/b"), Path::new("/a/b/")));

        let dep = path_dependency(Path::new("/a"), Path::new("/a/b/c")).unwrap();
        assert_eq!(dep.base_path_parent, PathBuf::from("/a"));
        assert_eq!(dep.rel_path, PathBuf::from("b/c"));
        assert!(path_dependency(Path::new("/a/b"), Path::new("/a/c")).is_none());
    }

    #[test]
    fn test_copy_transactional_content_and_progress() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        write_file(&src, b"hello world");

        let fs_impl = NativeFileSystem::new();
        let attrs = FileAttributes {
            size: 11,
            mod_time: 1_600_000_000,
            file_id: 0,
            is_followed_symlink: false,
        };
        let mut bytes_seen = 0i64;
        let result = fs_impl
            .copy_file_transactional(&src, &attrs, &dst, false, true, None, &mut |d| {
                bytes_seen += d;
                Ok(())
            })
            .unwrap();

        assert_eq!(result.file_size, 11);
        assert_eq!(bytes_seen, 11);
        assert_eq!(fs::read(&dst).unwrap(), b"hello world");
        assert_eq!(mod_time_secs(&fs::metadata(&dst).unwrap()), 1_600_000_000);
        // no temp file left behind
        assert!(!dir.path().join(format!("dst.bin{}", TEMP_FILE_ENDING)).exists());
    }

    #[test]
    fn test_copy_calls_delete_target_before_rename() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write_file(&src, b"new");
        write_file(&dst, b"old");

        let fs_impl = NativeFileSystem::new();
        let attrs = FileAttributes::default();
        let mut deleted = false;
        let dst_cb = dst.clone();
        let mut on_delete = || {
            deleted = true;
            fs::remove_file(&dst_cb).map_err(SyncError::Io)
        };
        fs_impl
            .copy_file_transactional(
                &src,
                &attrs,
                &dst,
                false,
                true,
                Some(&mut on_delete),
                &mut |_| Ok(()),
            )
            .unwrap();
        assert!(deleted);
        assert_eq!(fs::read(&dst).unwrap(), b"new");
    }

    #[test]
    fn test_verify_detects_difference() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_file(&a, b"same length 1");
        write_file(&b, b"same length 2");

        let fs_impl = NativeFileSystem::new();
        let err = verify_files(&fs_impl, &a, &b, &mut |_| Ok(())).unwrap_err();
        assert!(matches!(err, SyncError::VerificationFailed(_, _)));

        write_file(&b, b"same length 1");
        verify_files(&fs_impl, &a, &b, &mut |_| Ok(())).unwrap();
    }

    #[test]
    fn test_remove_folder_recursion_reports_children() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("victim");
        fs::create_dir_all(root.join("sub")).unwrap();
        write_file(&root.join("sub/file.txt"), b"x");

        let fs_impl = NativeFileSystem::new();
        let mut files = 0;
        let mut folders = 0;
        fs_impl
            .remove_folder_if_exists_recursion(
                &root,
                &mut |_| {
                    files += 1;
                    Ok(())
                },
                &mut |_| {
                    folders += 1;
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(files, 1);
        assert_eq!(folders, 2); // "sub" and "victim" itself
        assert!(!root.exists());

        // removing a non-existing folder is a no-op
        fs_impl
            .remove_folder_if_exists_recursion(&root, &mut |_| Ok(()), &mut |_| Ok(()))
            .unwrap();
    }
}
