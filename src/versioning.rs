//! Moves deleted and overwritten items into a versioning folder so they can
//! be recovered later.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::config::VersioningStyle;
use crate::errors::{io_ctx, SyncResult};
use crate::file_ops::COMPARE_BUFFER_SIZE;
use crate::hierarchy::FileDescriptor;

/// Callback invoked before an item is moved: `(from, to)` display paths.
pub type NotifyMove<'a> = &'a mut dyn FnMut(&str, &str) -> SyncResult<()>;

pub struct FileVersioner {
    versioning_folder: PathBuf,
    style: VersioningStyle,
    /// Timestamp of the sync start, shared by all revisions of one run.
    timestamp: String,
}

impl FileVersioner {
    pub fn new(versioning_folder: PathBuf, style: VersioningStyle, timestamp: String) -> Self {
        Self {
            versioning_folder,
            style,
            timestamp,
        }
    }

    /// Target path for one revision. With `AddTimestamp` the original file
    /// name is kept and the timestamp plus the original extension are
    /// appended: `file.txt` becomes `file.txt 2024-03-01 120000.txt`.
    fn revision_path(&self, rel_path: &Path) -> PathBuf {
        match self.style {
            VersioningStyle::Replace => self.versioning_folder.join(rel_path),
            VersioningStyle::AddTimestamp => {
                let name = rel_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let ext = rel_path
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy()))
                    .unwrap_or_default();
                let stamped = format!("{} {}{}", name, self.timestamp, ext);
                match rel_path.parent() {
                    Some(parent) => self.versioning_folder.join(parent).join(stamped),
                    None => self.versioning_folder.join(stamped),
                }
            }
        }
    }

    /// Moves one file into the versioning folder; returns whether the
    /// source existed.
    pub fn revision_file(
        &self,
        file: &FileDescriptor,
        rel_path: &Path,
        notify_io: &mut dyn FnMut(i64) -> SyncResult<()>,
    ) -> SyncResult<bool> {
        if fs::symlink_metadata(&file.path).is_err() {
            return Ok(false);
        }
        let target = self.revision_path(rel_path);
        self.move_item(&file.path, &target, notify_io)?;
        Ok(true)
    }

    pub fn revision_symlink(&self, link_path: &Path, rel_path: &Path) -> SyncResult<bool> {
        if fs::symlink_metadata(link_path).is_err() {
            return Ok(false);
        }
        let target = self.revision_path(rel_path);
        self.move_item(link_path, &target, &mut |_| Ok(()))?;
        Ok(true)
    }

    /// Moves a whole folder into the versioning folder, calling back before
    /// each file and folder move.
    pub fn revision_folder(
        &self,
        folder_path: &Path,
        rel_path: &Path,
        on_before_file_move: NotifyMove,
        on_before_folder_move: NotifyMove,
        notify_io: &mut dyn FnMut(i64) -> SyncResult<()>,
    ) -> SyncResult<()> {
        if fs::symlink_metadata(folder_path).is_err() {
            return Ok(());
        }

        // top-down: announce folders and create their revision targets,
        // move files as they are encountered
        for entry in walkdir::WalkDir::new(folder_path) {
            let entry = entry.map_err(|e| {
                crate::errors::SyncError::Other(format!(
                    "Cannot traverse {}: {}",
                    folder_path.display(),
                    e
                ))
            })?;
            let sub_rel = entry
                .path()
                .strip_prefix(folder_path)
                .unwrap_or(Path::new(""));
            let item_rel = rel_path.join(sub_rel);

            if entry.file_type().is_dir() {
                let target = self.versioning_folder.join(&item_rel);
                on_before_folder_move(
                    &entry.path().display().to_string(),
                    &target.display().to_string(),
                )?;
                fs::create_dir_all(&target)
                    .map_err(io_ctx(format!("Cannot create folder {}", target.display())))?;
            } else {
                let target = self.revision_path(&item_rel);
                on_before_file_move(
                    &entry.path().display().to_string(),
                    &target.display().to_string(),
                )?;
                self.move_item(entry.path(), &target, notify_io)?;
            }
        }

        // bottom-up: drop the emptied source folders
        for entry in walkdir::WalkDir::new(folder_path).contents_first(true) {
            let entry = entry.map_err(|e| {
                crate::errors::SyncError::Other(format!(
                    "Cannot traverse {}: {}",
                    folder_path.display(),
                    e
                ))
            })?;
            if entry.file_type().is_dir() {
                fs::remove_dir(entry.path())
                    .map_err(io_ctx(format!("Cannot delete folder {}", entry.path().display())))?;
            }
        }
        Ok(())
    }

    /// Rename into the versioning folder; falls back to copy + delete when
    /// the versioning folder lives on a different volume.
    fn move_item(
        &self,
        from: &Path,
        to: &Path,
        notify_io: &mut dyn FnMut(i64) -> SyncResult<()>,
    ) -> SyncResult<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .map_err(io_ctx(format!("Cannot create folder {}", parent.display())))?;
        }
        if matches!(self.style, VersioningStyle::Replace) && fs::symlink_metadata(to).is_ok() {
            if fs::symlink_metadata(to).map(|m| m.is_dir()).unwrap_or(false) {
                fs::remove_dir_all(to)
                    .map_err(io_ctx(format!("Cannot delete folder {}", to.display())))?;
            } else {
                fs::remove_file(to)
                    .map_err(io_ctx(format!("Cannot delete file {}", to.display())))?;
            }
        }
        match fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(_) => {
                // cross-volume fallback
                let src = File::open(from)
                    .map_err(io_ctx(format!("Cannot open file {}", from.display())))?;
                let dst = File::create(to)
                    .map_err(io_ctx(format!("Cannot write file {}", to.display())))?;
                let mut reader = BufReader::with_capacity(COMPARE_BUFFER_SIZE, src);
                let mut writer = BufWriter::with_capacity(COMPARE_BUFFER_SIZE, dst);
                let mut buffer = vec![0u8; COMPARE_BUFFER_SIZE];
                loop {
                    let n = reader
                        .read(&mut buffer)
                        .map_err(io_ctx(format!("Cannot read file {}", from.display())))?;
                    if n == 0 {
                        break;
                    }
                    writer
                        .write_all(&buffer[..n])
                        .map_err(io_ctx(format!("Cannot write file {}", to.display())))?;
                    notify_io(n as i64)?;
                }
                writer
                    .flush()
                    .map_err(io_ctx(format!("Cannot write file {}", to.display())))?;
                drop(writer);
                fs::remove_file(from)
                    .map_err(io_ctx(format!("Cannot delete file {}", from.display())))
            }
        }
    }
}
