//! Arena-backed comparison tree: the in-memory model of one base folder pair.
//!
//! Items are addressed through stable ids so that move pairs can reference
//! each other and new items can be inserted while work lists are in flight.

use std::path::{Path, PathBuf};

/// One of the two sides of a folder pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// Per-item synchronization operation, as annotated by the comparison engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOperation {
    CreateNewLeft,
    CreateNewRight,
    DeleteLeft,
    DeleteRight,
    OverwriteLeft,
    OverwriteRight,
    CopyMetadataToLeft,
    CopyMetadataToRight,
    MoveLeftFrom,
    MoveLeftTo,
    MoveRightFrom,
    MoveRightTo,
    DoNothing,
    Equal,
    UnresolvedConflict,
}

impl SyncOperation {
    /// The side that will be modified by this operation, if any.
    pub fn target_side(self) -> Option<Side> {
        use SyncOperation::*;
        match self {
            CreateNewLeft | DeleteLeft | OverwriteLeft | CopyMetadataToLeft | MoveLeftFrom
            | MoveLeftTo => Some(Side::Left),
            CreateNewRight | DeleteRight | OverwriteRight | CopyMetadataToRight
            | MoveRightFrom | MoveRightTo => Some(Side::Right),
            DoNothing | Equal | UnresolvedConflict => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderId(pub usize);

/// A folder-level container: either the base folder root or a sub-folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRef {
    Root,
    Folder(FolderId),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileAttributes {
    pub size: u64,
    /// Modification time in seconds since the Unix epoch.
    pub mod_time: i64,
    pub file_id: u64,
    pub is_followed_symlink: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkAttributes {
    pub mod_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FolderAttributes {
    pub is_followed_symlink: bool,
}

#[derive(Debug, Clone)]
pub struct FileSide {
    pub name: String,
    pub attrs: FileAttributes,
}

#[derive(Debug, Clone)]
pub struct LinkSide {
    pub name: String,
    pub attrs: LinkAttributes,
}

#[derive(Debug, Clone)]
pub struct FolderSide {
    pub name: String,
    pub attrs: FolderAttributes,
}

/// Absolute path plus file attributes, handed to filesystem primitives.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub attrs: FileAttributes,
}

#[derive(Debug)]
pub struct FileItem {
    pub parent: Option<FolderId>,
    pub left: Option<FileSide>,
    pub right: Option<FileSide>,
    pub op: SyncOperation,
    pub conflict_msg: Option<String>,
    pub move_ref: Option<FileId>,
}

#[derive(Debug)]
pub struct LinkItem {
    pub parent: Option<FolderId>,
    pub left: Option<LinkSide>,
    pub right: Option<LinkSide>,
    pub op: SyncOperation,
    pub conflict_msg: Option<String>,
}

#[derive(Debug)]
pub struct FolderItem {
    pub parent: Option<FolderId>,
    pub left: Option<FolderSide>,
    pub right: Option<FolderSide>,
    pub op: SyncOperation,
    pub conflict_msg: Option<String>,
    pub files: Vec<FileId>,
    pub links: Vec<LinkId>,
    pub folders: Vec<FolderId>,
}

/// One configured base folder pair together with its comparison tree.
#[derive(Debug, Default)]
pub struct BaseFolderPair {
    pub left_path: PathBuf,
    pub right_path: PathBuf,
    pub left_available: bool,
    pub right_available: bool,
    files: Vec<FileItem>,
    links: Vec<LinkItem>,
    folders: Vec<FolderItem>,
    root_files: Vec<FileId>,
    root_links: Vec<LinkId>,
    root_folders: Vec<FolderId>,
}

/// Compares item names under the platform's case sensitivity policy.
pub fn equal_item_name(a: &str, b: &str) -> bool {
    if cfg!(windows) {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

impl BaseFolderPair {
    pub fn new(left_path: PathBuf, right_path: PathBuf) -> Self {
        Self {
            left_path,
            right_path,
            left_available: true,
            right_available: true,
            ..Default::default()
        }
    }

    pub fn base_path(&self, side: Side) -> &Path {
        match side {
            Side::Left => &self.left_path,
            Side::Right => &self.right_path,
        }
    }

    pub fn is_available(&self, side: Side) -> bool {
        match side {
            Side::Left => self.left_available,
            Side::Right => self.right_available,
        }
    }

    pub fn set_available(&mut self, side: Side, available: bool) {
        match side {
            Side::Left => self.left_available = available,
            Side::Right => self.right_available = available,
        }
    }

    //---- item accessors ------------------------------------------------

    pub fn file(&self, id: FileId) -> &FileItem {
        &self.files[id.0]
    }

    pub fn file_mut(&mut self, id: FileId) -> &mut FileItem {
        &mut self.files[id.0]
    }

    pub fn link(&self, id: LinkId) -> &LinkItem {
        &self.links[id.0]
    }

    pub fn link_mut(&mut self, id: LinkId) -> &mut LinkItem {
        &mut self.links[id.0]
    }

    pub fn folder(&self, id: FolderId) -> &FolderItem {
        &self.folders[id.0]
    }

    pub fn folder_mut(&mut self, id: FolderId) -> &mut FolderItem {
        &mut self.folders[id.0]
    }

    pub fn container_children(&self, c: ContainerRef) -> (&[FileId], &[LinkId], &[FolderId]) {
        match c {
            ContainerRef::Root => (&self.root_files, &self.root_links, &self.root_folders),
            ContainerRef::Folder(id) => {
                let f = self.folder(id);
                (&f.files, &f.links, &f.folders)
            }
        }
    }

    pub fn file_parent_container(&self, id: FileId) -> ContainerRef {
        match self.file(id).parent {
            None => ContainerRef::Root,
            Some(p) => ContainerRef::Folder(p),
        }
    }

    pub fn folder_parent_container(&self, id: FolderId) -> ContainerRef {
        match self.folder(id).parent {
            None => ContainerRef::Root,
            Some(p) => ContainerRef::Folder(p),
        }
    }

    //---- name and path resolution --------------------------------------

    fn file_side(&self, id: FileId, side: Side) -> Option<&FileSide> {
        let item = self.file(id);
        match side {
            Side::Left => item.left.as_ref(),
            Side::Right => item.right.as_ref(),
        }
    }

    fn link_side(&self, id: LinkId, side: Side) -> Option<&LinkSide> {
        let item = self.link(id);
        match side {
            Side::Left => item.left.as_ref(),
            Side::Right => item.right.as_ref(),
        }
    }

    fn folder_side(&self, id: FolderId, side: Side) -> Option<&FolderSide> {
        let item = self.folder(id);
        match side {
            Side::Left => item.left.as_ref(),
            Side::Right => item.right.as_ref(),
        }
    }

    /// Item name on `side`, falling back to the other side's name when the
    /// item does not exist there yet (e.g. a create target).
    pub fn file_name(&self, id: FileId, side: Side) -> &str {
        self.file_side(id, side)
            .or_else(|| self.file_side(id, side.other()))
            .map(|s| s.name.as_str())
            .unwrap_or("")
    }

    pub fn link_name(&self, id: LinkId, side: Side) -> &str {
        self.link_side(id, side)
            .or_else(|| self.link_side(id, side.other()))
            .map(|s| s.name.as_str())
            .unwrap_or("")
    }

    pub fn folder_name(&self, id: FolderId, side: Side) -> &str {
        self.folder_side(id, side)
            .or_else(|| self.folder_side(id, side.other()))
            .map(|s| s.name.as_str())
            .unwrap_or("")
    }

    /// Name on the requested side only, without fallback.
    pub fn file_own_name(&self, id: FileId, side: Side) -> Option<&str> {
        self.file_side(id, side).map(|s| s.name.as_str())
    }

    pub fn file_size(&self, id: FileId, side: Side) -> u64 {
        self.file_side(id, side).map(|s| s.attrs.size).unwrap_or(0)
    }

    pub fn file_attrs(&self, id: FileId, side: Side) -> Option<&FileAttributes> {
        self.file_side(id, side).map(|s| &s.attrs)
    }

    pub fn link_attrs(&self, id: LinkId, side: Side) -> Option<&LinkAttributes> {
        self.link_side(id, side).map(|s| &s.attrs)
    }

    pub fn folder_attrs(&self, id: FolderId, side: Side) -> Option<&FolderAttributes> {
        self.folder_side(id, side).map(|s| &s.attrs)
    }

    pub fn file_exists(&self, id: FileId, side: Side) -> bool {
        self.file_side(id, side).is_some()
    }

    pub fn link_exists(&self, id: LinkId, side: Side) -> bool {
        self.link_side(id, side).is_some()
    }

    pub fn folder_exists(&self, id: FolderId, side: Side) -> bool {
        self.folder_side(id, side).is_some()
    }

    /// Absolute directory path of a container on one side.
    pub fn container_dir_path(&self, c: ContainerRef, side: Side) -> PathBuf {
        match c {
            ContainerRef::Root => self.base_path(side).to_path_buf(),
            ContainerRef::Folder(id) => self.folder_abs_path(id, side),
        }
    }

    fn parent_dir_path(&self, parent: Option<FolderId>, side: Side) -> PathBuf {
        match parent {
            None => self.base_path(side).to_path_buf(),
            Some(id) => self.folder_abs_path(id, side),
        }
    }

    pub fn folder_abs_path(&self, id: FolderId, side: Side) -> PathBuf {
        self.parent_dir_path(self.folder(id).parent, side)
            .join(self.folder_name(id, side))
    }

    pub fn file_abs_path(&self, id: FileId, side: Side) -> PathBuf {
        self.parent_dir_path(self.file(id).parent, side)
            .join(self.file_name(id, side))
    }

    pub fn link_abs_path(&self, id: LinkId, side: Side) -> PathBuf {
        self.parent_dir_path(self.link(id).parent, side)
            .join(self.link_name(id, side))
    }

    fn parent_rel_path(&self, parent: Option<FolderId>) -> PathBuf {
        match parent {
            None => PathBuf::new(),
            Some(id) => self.folder_rel_path(id),
        }
    }

    pub fn folder_rel_path(&self, id: FolderId) -> PathBuf {
        self.parent_rel_path(self.folder(id).parent)
            .join(self.folder_name(id, Side::Left))
    }

    pub fn file_rel_path(&self, id: FileId) -> PathBuf {
        self.parent_rel_path(self.file(id).parent)
            .join(self.file_name(id, Side::Left))
    }

    pub fn link_rel_path(&self, id: LinkId) -> PathBuf {
        self.parent_rel_path(self.link(id).parent)
            .join(self.link_name(id, Side::Left))
    }

    //---- construction and mutation -------------------------------------

    pub fn add_file(
        &mut self,
        parent: ContainerRef,
        left: Option<FileSide>,
        right: Option<FileSide>,
        op: SyncOperation,
    ) -> FileId {
        let id = FileId(self.files.len());
        let parent_id = match parent {
            ContainerRef::Root => None,
            ContainerRef::Folder(p) => Some(p),
        };
        self.files.push(FileItem {
            parent: parent_id,
            left,
            right,
            op,
            conflict_msg: None,
            move_ref: None,
        });
        match parent {
            ContainerRef::Root => self.root_files.push(id),
            ContainerRef::Folder(p) => self.folder_mut(p).files.push(id),
        }
        id
    }

    pub fn add_link(
        &mut self,
        parent: ContainerRef,
        left: Option<LinkSide>,
        right: Option<LinkSide>,
        op: SyncOperation,
    ) -> LinkId {
        let id = LinkId(self.links.len());
        let parent_id = match parent {
            ContainerRef::Root => None,
            ContainerRef::Folder(p) => Some(p),
        };
        self.links.push(LinkItem {
            parent: parent_id,
            left,
            right,
            op,
            conflict_msg: None,
        });
        match parent {
            ContainerRef::Root => self.root_links.push(id),
            ContainerRef::Folder(p) => self.folder_mut(p).links.push(id),
        }
        id
    }

    pub fn add_folder(
        &mut self,
        parent: ContainerRef,
        left: Option<FolderSide>,
        right: Option<FolderSide>,
        op: SyncOperation,
    ) -> FolderId {
        let id = FolderId(self.folders.len());
        let parent_id = match parent {
            ContainerRef::Root => None,
            ContainerRef::Folder(p) => Some(p),
        };
        self.folders.push(FolderItem {
            parent: parent_id,
            left,
            right,
            op,
            conflict_msg: None,
            files: Vec::new(),
            links: Vec::new(),
            folders: Vec::new(),
        });
        match parent {
            ContainerRef::Root => self.root_folders.push(id),
            ContainerRef::Folder(p) => self.folder_mut(p).folders.push(id),
        }
        id
    }

    pub fn set_conflict(&mut self, id: FileId, msg: impl Into<String>) {
        let item = self.file_mut(id);
        item.op = SyncOperation::UnresolvedConflict;
        item.conflict_msg = Some(msg.into());
    }

    /// Links two file items as a move pair; `from` and `to` must carry the
    /// matching `MOVE_*_FROM` / `MOVE_*_TO` operations for the same side.
    pub fn set_move_pair(&mut self, from: FileId, to: FileId) {
        debug_assert!(matches!(
            (self.file(from).op, self.file(to).op),
            (SyncOperation::MoveLeftFrom, SyncOperation::MoveLeftTo)
                | (SyncOperation::MoveRightFrom, SyncOperation::MoveRightTo)
        ));
        self.file_mut(from).move_ref = Some(to);
        self.file_mut(to).move_ref = Some(from);
    }

    /// Drops one side of a file item; the item no longer has pending work.
    pub fn remove_file_side(&mut self, id: FileId, side: Side) {
        let item = self.file_mut(id);
        match side {
            Side::Left => item.left = None,
            Side::Right => item.right = None,
        }
        item.op = SyncOperation::DoNothing;
    }

    pub fn remove_link_side(&mut self, id: LinkId, side: Side) {
        let item = self.link_mut(id);
        match side {
            Side::Left => item.left = None,
            Side::Right => item.right = None,
        }
        item.op = SyncOperation::DoNothing;
    }

    pub fn remove_folder_side(&mut self, id: FolderId, side: Side) {
        let item = self.folder_mut(id);
        match side {
            Side::Left => item.left = None,
            Side::Right => item.right = None,
        }
        item.op = SyncOperation::DoNothing;
    }

    /// Marks a file in sync after a successful operation, updating both
    /// sides' metadata; the target side takes over the source item name.
    #[allow(clippy::too_many_arguments)]
    pub fn set_synced_file(
        &mut self,
        id: FileId,
        target_side: Side,
        item_name: String,
        file_size: u64,
        mod_time_target: i64,
        mod_time_source: i64,
        file_id_target: u64,
        file_id_source: u64,
        followed_target: bool,
        followed_source: bool,
    ) {
        let source_name = self.file_name(id, target_side.other()).to_string();
        let item = self.file_mut(id);
        let target = FileSide {
            name: item_name,
            attrs: FileAttributes {
                size: file_size,
                mod_time: mod_time_target,
                file_id: file_id_target,
                is_followed_symlink: followed_target,
            },
        };
        let source = FileSide {
            name: source_name,
            attrs: FileAttributes {
                size: file_size,
                mod_time: mod_time_source,
                file_id: file_id_source,
                is_followed_symlink: followed_source,
            },
        };
        match target_side {
            Side::Left => {
                item.left = Some(target);
                item.right = Some(source);
            }
            Side::Right => {
                item.right = Some(target);
                item.left = Some(source);
            }
        }
        item.op = SyncOperation::Equal;
        item.move_ref = None;
    }

    pub fn set_synced_link(
        &mut self,
        id: LinkId,
        target_side: Side,
        item_name: String,
        mod_time_target: i64,
        mod_time_source: i64,
    ) {
        let source_name = self.link_name(id, target_side.other()).to_string();
        let item = self.link_mut(id);
        let target = LinkSide {
            name: item_name,
            attrs: LinkAttributes {
                mod_time: mod_time_target,
            },
        };
        let source = LinkSide {
            name: source_name,
            attrs: LinkAttributes {
                mod_time: mod_time_source,
            },
        };
        match target_side {
            Side::Left => {
                item.left = Some(target);
                item.right = Some(source);
            }
            Side::Right => {
                item.right = Some(target);
                item.left = Some(source);
            }
        }
        item.op = SyncOperation::Equal;
    }

    pub fn set_synced_folder(
        &mut self,
        id: FolderId,
        target_side: Side,
        item_name: String,
        followed_target: bool,
        followed_source: bool,
    ) {
        let source_name = self.folder_name(id, target_side.other()).to_string();
        let item = self.folder_mut(id);
        let target = FolderSide {
            name: item_name,
            attrs: FolderAttributes {
                is_followed_symlink: followed_target,
            },
        };
        let source = FolderSide {
            name: source_name,
            attrs: FolderAttributes {
                is_followed_symlink: followed_source,
            },
        };
        match target_side {
            Side::Left => {
                item.left = Some(target);
                item.right = Some(source);
            }
            Side::Right => {
                item.right = Some(target);
                item.left = Some(source);
            }
        }
        item.op = SyncOperation::Equal;
    }

    /// Detaches all children of a folder (used after the physical subtree
    /// was removed or found missing).
    pub fn clear_folder_subtree(&mut self, id: FolderId) {
        let folder = self.folder_mut(id);
        folder.files.clear();
        folder.links.clear();
        folder.folders.clear();
    }

    /// Prunes items that lost both sides, recursively.
    pub fn remove_empty(&mut self) {
        fn prune(pair: &mut BaseFolderPair, c: ContainerRef) {
            let (files, links, folders) = {
                let (f, l, d) = pair.container_children(c);
                (f.to_vec(), l.to_vec(), d.to_vec())
            };
            for id in &folders {
                prune(pair, ContainerRef::Folder(*id));
            }
            let keep_files: Vec<FileId> = files
                .into_iter()
                .filter(|&id| pair.file(id).left.is_some() || pair.file(id).right.is_some())
                .collect();
            let keep_links: Vec<LinkId> = links
                .into_iter()
                .filter(|&id| pair.link(id).left.is_some() || pair.link(id).right.is_some())
                .collect();
            let keep_folders: Vec<FolderId> = folders
                .into_iter()
                .filter(|&id| pair.folder(id).left.is_some() || pair.folder(id).right.is_some())
                .collect();
            match c {
                ContainerRef::Root => {
                    pair.root_files = keep_files;
                    pair.root_links = keep_links;
                    pair.root_folders = keep_folders;
                }
                ContainerRef::Folder(id) => {
                    let folder = pair.folder_mut(id);
                    folder.files = keep_files;
                    folder.links = keep_links;
                    folder.folders = keep_folders;
                }
            }
        }
        prune(self, ContainerRef::Root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_side(name: &str, size: u64) -> Option<FileSide> {
        Some(FileSide {
            name: name.to_string(),
            attrs: FileAttributes {
                size,
                mod_time: 1000,
                file_id: 0,
                is_followed_symlink: false,
            },
        })
    }

    #[test]
    fn test_paths_with_fallback_names() {
        let mut pair =
            BaseFolderPair::new(PathBuf::from("/left"), PathBuf::from("/right"));
        let folder = pair.add_folder(
            ContainerRef::Root,
            Some(FolderSide {
                name: "sub".into(),
                attrs: FolderAttributes::default(),
            }),
            None,
            SyncOperation::CreateNewRight,
        );
        let file = pair.add_file(
            ContainerRef::Folder(folder),
            file_side("a.txt", 42),
            None,
            SyncOperation::CreateNewRight,
        );

        // The right side does not exist yet: names fall back to the left.
        assert_eq!(pair.file_abs_path(file, Side::Right), PathBuf::from("/right/sub/a.txt"));
        assert_eq!(pair.file_abs_path(file, Side::Left), PathBuf::from("/left/sub/a.txt"));
        assert_eq!(pair.file_rel_path(file), PathBuf::from("sub/a.txt"));
    }

    #[test]
    fn test_move_pair_links_both_ways() {
        let mut pair = BaseFolderPair::new(PathBuf::from("/l"), PathBuf::from("/r"));
        let from = pair.add_file(
            ContainerRef::Root,
            file_side("old", 1),
            None,
            SyncOperation::MoveLeftFrom,
        );
        let to = pair.add_file(
            ContainerRef::Root,
            None,
            file_side("new", 1),
            SyncOperation::MoveLeftTo,
        );
        pair.set_move_pair(from, to);
        assert_eq!(pair.file(from).move_ref, Some(to));
        assert_eq!(pair.file(to).move_ref, Some(from));
    }

    #[test]
    fn test_remove_side_and_prune() {
        let mut pair = BaseFolderPair::new(PathBuf::from("/l"), PathBuf::from("/r"));
        let file = pair.add_file(
            ContainerRef::Root,
            file_side("x", 1),
            None,
            SyncOperation::DeleteLeft,
        );
        pair.remove_file_side(file, Side::Left);
        assert_eq!(pair.file(file).op, SyncOperation::DoNothing);
        pair.remove_empty();
        let (files, _, _) = pair.container_children(ContainerRef::Root);
        assert!(files.is_empty());
    }

    #[test]
    fn test_set_synced_file_updates_both_sides() {
        let mut pair = BaseFolderPair::new(PathBuf::from("/l"), PathBuf::from("/r"));
        let file = pair.add_file(
            ContainerRef::Root,
            file_side("A.txt", 42),
            None,
            SyncOperation::CreateNewRight,
        );
        pair.set_synced_file(file, Side::Right, "A.txt".into(), 42, 1000, 1000, 7, 8, false, false);
        assert_eq!(pair.file(file).op, SyncOperation::Equal);
        assert!(pair.file_exists(file, Side::Right));
        assert_eq!(pair.file_size(file, Side::Right), 42);
        assert_eq!(pair.file_attrs(file, Side::Right).unwrap().file_id, 7);
        assert_eq!(pair.file_attrs(file, Side::Left).unwrap().file_id, 8);
    }
}
