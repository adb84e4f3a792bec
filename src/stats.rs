//! Statistics over a comparison tree: workload counts, disk space needs and
//! sanity checks used by the pre-flight validation.

use std::path::PathBuf;

use crate::hierarchy::{
    BaseFolderPair, ContainerRef, FileId, FolderId, LinkId, Side, SyncOperation,
};

#[derive(Debug, Clone)]
pub struct ConflictInfo {
    pub rel_path: PathBuf,
    pub msg: String,
}

/// Logical workload of a (sub-)tree. Counting recurses into folders even
/// when their deletion is a single physical operation.
#[derive(Debug, Clone, Default)]
pub struct SyncStatistics {
    create_left: i64,
    create_right: i64,
    update_left: i64,
    update_right: i64,
    delete_left: i64,
    delete_right: i64,
    physical_delete_left: bool,
    physical_delete_right: bool,
    bytes_to_process: i64,
    rows_total: usize,
    conflicts: Vec<ConflictInfo>,
}

impl SyncStatistics {
    pub fn from_base_folder(pair: &BaseFolderPair) -> Self {
        let mut stats = Self::default();
        stats.recurse(pair, ContainerRef::Root);
        stats
    }

    pub fn from_container(pair: &BaseFolderPair, container: ContainerRef) -> Self {
        let mut stats = Self::default();
        stats.recurse(pair, container);
        stats
    }

    pub fn from_file(pair: &BaseFolderPair, id: FileId) -> Self {
        let mut stats = Self::default();
        stats.process_file(pair, id);
        stats.rows_total += 1;
        stats
    }

    /// Sub-object statistics of one folder (the folder row itself excluded).
    pub fn from_folder_subtree(pair: &BaseFolderPair, id: FolderId) -> Self {
        let mut stats = Self::default();
        stats.recurse(pair, ContainerRef::Folder(id));
        stats
    }

    fn recurse(&mut self, pair: &BaseFolderPair, container: ContainerRef) {
        let (files, links, folders) = pair.container_children(container);
        let (files, links, folders) = (files.to_vec(), links.to_vec(), folders.to_vec());

        for id in files {
            self.process_file(pair, id);
        }
        for id in links {
            self.process_link(pair, id);
        }
        for id in &folders {
            self.process_folder(pair, *id);
        }
        let (f, l, d) = pair.container_children(container);
        self.rows_total += f.len() + l.len() + d.len();
        for id in folders {
            self.recurse(pair, ContainerRef::Folder(id));
        }
    }

    fn process_file(&mut self, pair: &BaseFolderPair, id: FileId) {
        use SyncOperation::*;
        match pair.file(id).op {
            CreateNewLeft => {
                self.create_left += 1;
                self.bytes_to_process += pair.file_size(id, Side::Right) as i64;
            }
            CreateNewRight => {
                self.create_right += 1;
                self.bytes_to_process += pair.file_size(id, Side::Left) as i64;
            }
            DeleteLeft => {
                self.delete_left += 1;
                self.physical_delete_left = true;
            }
            DeleteRight => {
                self.delete_right += 1;
                self.physical_delete_right = true;
            }
            MoveLeftTo => self.update_left += 1,
            MoveRightTo => self.update_right += 1,
            // already counted on the paired TO item
            MoveLeftFrom | MoveRightFrom => {}
            OverwriteLeft => {
                self.update_left += 1;
                self.bytes_to_process += pair.file_size(id, Side::Right) as i64;
                self.physical_delete_left = true;
            }
            OverwriteRight => {
                self.update_right += 1;
                self.bytes_to_process += pair.file_size(id, Side::Left) as i64;
                self.physical_delete_right = true;
            }
            CopyMetadataToLeft => self.update_left += 1,
            CopyMetadataToRight => self.update_right += 1,
            UnresolvedConflict => self.conflicts.push(ConflictInfo {
                rel_path: pair.file_rel_path(id),
                msg: pair
                    .file(id)
                    .conflict_msg
                    .clone()
                    .unwrap_or_else(|| "Unresolved conflict".to_string()),
            }),
            DoNothing | Equal => {}
        }
    }

    fn process_link(&mut self, pair: &BaseFolderPair, id: LinkId) {
        use SyncOperation::*;
        match pair.link(id).op {
            CreateNewLeft => self.create_left += 1,
            CreateNewRight => self.create_right += 1,
            DeleteLeft => {
                self.delete_left += 1;
                self.physical_delete_left = true;
            }
            DeleteRight => {
                self.delete_right += 1;
                self.physical_delete_right = true;
            }
            OverwriteLeft => {
                self.update_left += 1;
                self.physical_delete_left = true;
            }
            OverwriteRight => {
                self.update_right += 1;
                self.physical_delete_right = true;
            }
            CopyMetadataToLeft => self.update_left += 1,
            CopyMetadataToRight => self.update_right += 1,
            UnresolvedConflict => self.conflicts.push(ConflictInfo {
                rel_path: pair.link_rel_path(id),
                msg: pair
                    .link(id)
                    .conflict_msg
                    .clone()
                    .unwrap_or_else(|| "Unresolved conflict".to_string()),
            }),
            // moves are not defined for symlinks
            MoveLeftFrom | MoveRightFrom | MoveLeftTo | MoveRightTo => {
                debug_assert!(false);
            }
            DoNothing | Equal => {}
        }
    }

    fn process_folder(&mut self, pair: &BaseFolderPair, id: FolderId) {
        use SyncOperation::*;
        match pair.folder(id).op {
            CreateNewLeft => self.create_left += 1,
            CreateNewRight => self.create_right += 1,
            DeleteLeft => {
                self.delete_left += 1;
                self.physical_delete_left = true;
            }
            DeleteRight => {
                self.delete_right += 1;
                self.physical_delete_right = true;
            }
            OverwriteLeft | CopyMetadataToLeft => self.update_left += 1,
            OverwriteRight | CopyMetadataToRight => self.update_right += 1,
            UnresolvedConflict => self.conflicts.push(ConflictInfo {
                rel_path: pair.folder_rel_path(id),
                msg: pair
                    .folder(id)
                    .conflict_msg
                    .clone()
                    .unwrap_or_else(|| "Unresolved conflict".to_string()),
            }),
            MoveLeftFrom | MoveRightFrom | MoveLeftTo | MoveRightTo => {
                debug_assert!(false);
            }
            DoNothing | Equal => {}
        }
    }

    pub fn create_count_side(&self, side: Side) -> i64 {
        match side {
            Side::Left => self.create_left,
            Side::Right => self.create_right,
        }
    }

    pub fn update_count_side(&self, side: Side) -> i64 {
        match side {
            Side::Left => self.update_left,
            Side::Right => self.update_right,
        }
    }

    pub fn delete_count_side(&self, side: Side) -> i64 {
        match side {
            Side::Left => self.delete_left,
            Side::Right => self.delete_right,
        }
    }

    pub fn create_count(&self) -> i64 {
        self.create_left + self.create_right
    }

    pub fn update_count(&self) -> i64 {
        self.update_left + self.update_right
    }

    pub fn delete_count(&self) -> i64 {
        self.delete_left + self.delete_right
    }

    /// create + update + delete: the number of items with pending work.
    pub fn cud(&self) -> i64 {
        self.create_count() + self.update_count() + self.delete_count()
    }

    pub fn expect_physical_deletion(&self, side: Side) -> bool {
        match side {
            Side::Left => self.physical_delete_left,
            Side::Right => self.physical_delete_right,
        }
    }

    pub fn bytes_to_process(&self) -> i64 {
        self.bytes_to_process
    }

    pub fn row_count(&self) -> usize {
        self.rows_total
    }

    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    pub fn conflicts(&self) -> &[ConflictInfo] {
        &self.conflicts
    }
}

/// Lower bound of additional disk space required per side. Deletions are
/// assumed to free space; folders are not counted.
pub fn minimum_disk_space_needed(pair: &BaseFolderPair) -> (i64, i64) {
    fn recurse(pair: &BaseFolderPair, container: ContainerRef, left: &mut i64, right: &mut i64) {
        use SyncOperation::*;
        let (files, _, folders) = pair.container_children(container);
        let (files, folders) = (files.to_vec(), folders.to_vec());
        for id in files {
            match pair.file(id).op {
                CreateNewLeft => *left += pair.file_size(id, Side::Right) as i64,
                CreateNewRight => *right += pair.file_size(id, Side::Left) as i64,
                DeleteLeft => *left -= pair.file_size(id, Side::Left) as i64,
                DeleteRight => *right -= pair.file_size(id, Side::Right) as i64,
                OverwriteLeft => {
                    *left -= pair.file_size(id, Side::Left) as i64;
                    *left += pair.file_size(id, Side::Right) as i64;
                }
                OverwriteRight => {
                    *right -= pair.file_size(id, Side::Right) as i64;
                    *right += pair.file_size(id, Side::Left) as i64;
                }
                _ => {}
            }
        }
        for id in folders {
            recurse(pair, ContainerRef::Folder(id), left, right);
        }
    }
    let (mut left, mut right) = (0, 0);
    recurse(pair, ContainerRef::Root, &mut left, &mut right);
    (left, right)
}

/// Heuristic for "user accidentally selected the wrong folders": many rows
/// would change, excluding the initial-copy case.
pub fn significant_difference_detected(stats: &SyncStatistics) -> bool {
    if (stats.create_count_side(Side::Left) == 0 || stats.create_count_side(Side::Right) == 0)
        && stats.update_count() == 0
        && stats.delete_count() == 0
        && stats.conflict_count() == 0
    {
        return false;
    }
    let non_matching_rows = stats.create_count() + stats.delete_count();
    non_matching_rows >= 10 && non_matching_rows as f64 > 0.5 * stats.row_count() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{FileAttributes, FileSide};
    use std::path::PathBuf;

    fn side(name: &str, size: u64) -> Option<FileSide> {
        Some(FileSide {
            name: name.to_string(),
            attrs: FileAttributes {
                size,
                mod_time: 0,
                file_id: 0,
                is_followed_symlink: false,
            },
        })
    }

    fn pair() -> BaseFolderPair {
        BaseFolderPair::new(PathBuf::from("/l"), PathBuf::from("/r"))
    }

    #[test]
    fn test_create_counts_source_side_bytes() {
        let mut p = pair();
        p.add_file(ContainerRef::Root, side("a", 100), None, SyncOperation::CreateNewRight);
        let stats = SyncStatistics::from_base_folder(&p);
        assert_eq!(stats.create_count_side(Side::Right), 1);
        assert_eq!(stats.bytes_to_process(), 100);
        assert_eq!(stats.row_count(), 1);
        assert!(!stats.expect_physical_deletion(Side::Right));
    }

    #[test]
    fn test_overwrite_counts_update_and_physical_delete() {
        let mut p = pair();
        p.add_file(
            ContainerRef::Root,
            side("a", 10),
            side("a", 25),
            SyncOperation::OverwriteLeft,
        );
        let stats = SyncStatistics::from_base_folder(&p);
        assert_eq!(stats.update_count_side(Side::Left), 1);
        assert_eq!(stats.bytes_to_process(), 25);
        assert!(stats.expect_physical_deletion(Side::Left));
        assert!(!stats.expect_physical_deletion(Side::Right));
    }

    #[test]
    fn test_move_pair_counted_once() {
        let mut p = pair();
        let from = p.add_file(ContainerRef::Root, side("old", 5), None, SyncOperation::MoveLeftFrom);
        let to = p.add_file(ContainerRef::Root, None, side("new", 5), SyncOperation::MoveLeftTo);
        p.set_move_pair(from, to);
        let stats = SyncStatistics::from_base_folder(&p);
        assert_eq!(stats.update_count_side(Side::Left), 1);
        assert_eq!(stats.cud(), 1);
        assert_eq!(stats.bytes_to_process(), 0);
    }

    #[test]
    fn test_conflicts_are_collected_in_order() {
        let mut p = pair();
        let a = p.add_file(ContainerRef::Root, side("a", 1), side("a", 2), SyncOperation::DoNothing);
        let b = p.add_file(ContainerRef::Root, side("b", 1), side("b", 2), SyncOperation::DoNothing);
        p.set_conflict(a, "both sides changed");
        p.set_conflict(b, "type mismatch");
        let stats = SyncStatistics::from_base_folder(&p);
        assert_eq!(stats.conflict_count(), 2);
        assert_eq!(stats.conflicts()[0].rel_path, PathBuf::from("a"));
        assert_eq!(stats.conflicts()[1].msg, "type mismatch");
        assert_eq!(stats.cud(), 0);
    }

    #[test]
    fn test_rows_recurse_into_folders() {
        let mut p = pair();
        let folder = p.add_folder(
            ContainerRef::Root,
            Some(crate::hierarchy::FolderSide {
                name: "sub".into(),
                attrs: Default::default(),
            }),
            None,
            SyncOperation::CreateNewRight,
        );
        p.add_file(ContainerRef::Folder(folder), side("x", 7), None, SyncOperation::CreateNewRight);
        let stats = SyncStatistics::from_base_folder(&p);
        assert_eq!(stats.row_count(), 2);
        assert_eq!(stats.create_count_side(Side::Right), 2);
        assert_eq!(stats.bytes_to_process(), 7);
    }

    #[test]
    fn test_minimum_disk_space() {
        let mut p = pair();
        p.add_file(ContainerRef::Root, side("a", 100), None, SyncOperation::CreateNewRight);
        assert_eq!(minimum_disk_space_needed(&p), (0, 100));

        let mut p2 = pair();
        p2.add_file(
            ContainerRef::Root,
            side("b", 1000),
            side("b", 10),
            SyncOperation::OverwriteLeft,
        );
        // left: -1000 (old) + 10 (new)
        assert_eq!(minimum_disk_space_needed(&p2), (-990, 0));
    }

    #[test]
    fn test_significant_difference_excludes_initial_copy() {
        let mut p = pair();
        for i in 0..20 {
            p.add_file(
                ContainerRef::Root,
                side(&format!("f{}", i), 1),
                None,
                SyncOperation::CreateNewRight,
            );
        }
        // pure initial copy: creates only on one side
        let stats = SyncStatistics::from_base_folder(&p);
        assert!(!significant_difference_detected(&stats));
    }

    #[test]
    fn test_significant_difference_detected() {
        let mut p = pair();
        for i in 0..6 {
            p.add_file(
                ContainerRef::Root,
                side(&format!("l{}", i), 1),
                None,
                SyncOperation::CreateNewRight,
            );
            p.add_file(
                ContainerRef::Root,
                None,
                side(&format!("r{}", i), 1),
                SyncOperation::CreateNewLeft,
            );
        }
        let stats = SyncStatistics::from_base_folder(&p);
        // 12 creates, 12 rows: >= 10 non-matching and > 50% of rows
        assert!(significant_difference_detected(&stats));
    }

    #[test]
    fn test_below_threshold_not_significant() {
        let mut p = pair();
        p.add_file(ContainerRef::Root, side("a", 1), None, SyncOperation::CreateNewRight);
        p.add_file(ContainerRef::Root, None, side("b", 1), SyncOperation::CreateNewLeft);
        for i in 0..30 {
            p.add_file(
                ContainerRef::Root,
                side(&format!("e{}", i), 1),
                side(&format!("e{}", i), 1),
                SyncOperation::Equal,
            );
        }
        let stats = SyncStatistics::from_base_folder(&p);
        assert!(!significant_difference_detected(&stats));
    }
}
