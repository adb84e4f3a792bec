//! Last-synchronous-state snapshot.
//!
//! After a folder pair completes, a JSON snapshot of the tree is written
//! into each base folder. The next comparison uses it to tell genuine
//! changes from one-sided edits.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{io_ctx, SyncResult};
use crate::file_ops::{display_path, is_null_path, sync_parent_directory};
use crate::hierarchy::{BaseFolderPair, ContainerRef, Side};

pub const SYNC_DB_FILE_NAME: &str = "sync.tws_db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DbItemKind {
    File,
    Symlink,
    Folder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbSideMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    mod_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbEntry {
    kind: DbItemKind,
    rel_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    left: Option<DbSideMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    right: Option<DbSideMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbSnapshot {
    left_path: PathBuf,
    right_path: PathBuf,
    entries: Vec<DbEntry>,
}

fn collect_entries(pair: &BaseFolderPair, container: ContainerRef, out: &mut Vec<DbEntry>) {
    let (files, links, folders) = pair.container_children(container);
    let (files, links, folders) = (files.to_vec(), links.to_vec(), folders.to_vec());

    for id in files {
        out.push(DbEntry {
            kind: DbItemKind::File,
            rel_path: pair.file_rel_path(id),
            left: pair.file_attrs(id, Side::Left).map(|a| DbSideMeta {
                size: Some(a.size),
                mod_time: a.mod_time,
            }),
            right: pair.file_attrs(id, Side::Right).map(|a| DbSideMeta {
                size: Some(a.size),
                mod_time: a.mod_time,
            }),
        });
    }
    for id in links {
        out.push(DbEntry {
            kind: DbItemKind::Symlink,
            rel_path: pair.link_rel_path(id),
            left: pair.link_attrs(id, Side::Left).map(|a| DbSideMeta {
                size: None,
                mod_time: a.mod_time,
            }),
            right: pair.link_attrs(id, Side::Right).map(|a| DbSideMeta {
                size: None,
                mod_time: a.mod_time,
            }),
        });
    }
    for id in folders {
        out.push(DbEntry {
            kind: DbItemKind::Folder,
            rel_path: pair.folder_rel_path(id),
            left: pair.folder_attrs(id, Side::Left).map(|_| DbSideMeta {
                size: None,
                mod_time: 0,
            }),
            right: pair.folder_attrs(id, Side::Right).map(|_| DbSideMeta {
                size: None,
                mod_time: 0,
            }),
        });
        collect_entries(pair, ContainerRef::Folder(id), out);
    }
}

fn write_db_file(path: &Path, snapshot: &DbSnapshot) -> SyncResult<()> {
    let content = serde_json::to_string_pretty(snapshot)?;
    let tmp_path = path.with_extension("tws_db.tmp");
    std::fs::write(&tmp_path, content)
        .map_err(io_ctx(format!("Cannot write file {}", tmp_path.display())))?;
    std::fs::rename(&tmp_path, path).map_err(io_ctx(format!(
        "Cannot move {} to {}",
        tmp_path.display(),
        path.display()
    )))?;
    // the rename is durable only after the parent directory is synced
    if let Err(e) = sync_parent_directory(path) {
        log::warn!("Parent directory sync failed for database file: {:?}", e);
    }
    Ok(())
}

/// Writes the snapshot into every non-null base folder of the pair.
pub fn save_last_synchronous_state(
    pair: &BaseFolderPair,
    status: &mut dyn FnMut(&str) -> SyncResult<()>,
) -> SyncResult<()> {
    let mut entries = Vec::new();
    collect_entries(pair, ContainerRef::Root, &mut entries);
    let snapshot = DbSnapshot {
        left_path: pair.left_path.clone(),
        right_path: pair.right_path.clone(),
        entries,
    };

    for side in [Side::Left, Side::Right] {
        let base = pair.base_path(side);
        if is_null_path(base) {
            continue;
        }
        let db_path = base.join(SYNC_DB_FILE_NAME);
        status(&format!("Writing database file {}", display_path(&db_path)))?;
        write_db_file(&db_path, &snapshot)?;
    }
    Ok(())
}

/// Loads a snapshot, mainly for tests and external tooling.
pub fn load_last_synchronous_state(base_folder: &Path) -> SyncResult<Option<serde_json::Value>> {
    let db_path = base_folder.join(SYNC_DB_FILE_NAME);
    match std::fs::read_to_string(&db_path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_ctx(format!("Cannot read file {}", db_path.display()))(e)),
    }
}
