//! End-to-end synchronization scenarios on real directories.

use chrono::Local;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use twinsync::file_ops::{mod_time_secs, FileCopyResult, ItemType, NotifyItem};
use twinsync::hierarchy::{FileAttributes, FileSide, FolderSide};
use twinsync::recycle::RecycleSession;
use twinsync::{
    synchronize, BaseFolderPair, ContainerRef, DeletionPolicy, DirectionVariant, FileSystem,
    FolderPairSyncCfg, NativeFileSystem, Phase, ProcessCallback, Response, Side, SyncOperation,
    SyncOptions, SyncResult, VersioningStyle, Warnings,
};

#[derive(Default)]
struct TestCallback {
    phase: Option<(i64, i64, Phase)>,
    items_processed: i64,
    bytes_processed: i64,
    warnings: Vec<String>,
    infos: Vec<String>,
    logs: Vec<String>,
    errors: Vec<String>,
    fatal_errors: Vec<String>,
}

impl ProcessCallback for TestCallback {
    fn init_new_phase(&mut self, items_total: i64, bytes_total: i64, phase: Phase) {
        self.phase = Some((items_total, bytes_total, phase));
    }
    fn update_data_processed(&mut self, items_delta: i64, bytes_delta: i64) {
        self.items_processed += items_delta;
        self.bytes_processed += bytes_delta;
    }
    fn update_data_total(&mut self, _items_delta: i64, _bytes_delta: i64) {}
    fn report_status(&mut self, _text: &str) -> SyncResult<()> {
        Ok(())
    }
    fn report_info(&mut self, text: &str) -> SyncResult<()> {
        self.infos.push(text.to_string());
        Ok(())
    }
    fn log_info(&mut self, text: &str) {
        self.logs.push(text.to_string());
    }
    fn report_warning(&mut self, text: &str, _warning_active: &mut bool) -> SyncResult<()> {
        self.warnings.push(text.to_string());
        Ok(())
    }
    fn report_error(&mut self, text: &str, _retry_number: usize) -> SyncResult<Response> {
        self.errors.push(text.to_string());
        Ok(Response::IgnoreError)
    }
    fn report_fatal_error(&mut self, text: &str) {
        self.fatal_errors.push(text.to_string());
    }
    fn request_ui_refresh(&mut self) -> SyncResult<()> {
        Ok(())
    }
    fn force_ui_refresh(&mut self) {}
    fn abort_process_now(&mut self) {}
}

fn default_cfg() -> FolderPairSyncCfg {
    FolderPairSyncCfg {
        detect_moved_files: true,
        handle_deletion: DeletionPolicy::Permanent,
        versioning_style: VersioningStyle::Replace,
        versioning_folder: PathBuf::new(),
        direction_variant: DirectionVariant::TwoWay,
        save_sync_db: false,
    }
}

fn file_attrs(path: &Path) -> FileAttributes {
    let meta = fs::metadata(path).unwrap();
    FileAttributes {
        size: meta.len(),
        mod_time: mod_time_secs(&meta),
        file_id: 0,
        is_followed_symlink: false,
    }
}

fn file_side(name: &str, attrs: FileAttributes) -> Option<FileSide> {
    Some(FileSide {
        name: name.to_string(),
        attrs,
    })
}

fn folder_side(name: &str) -> Option<FolderSide> {
    Some(FolderSide {
        name: name.to_string(),
        attrs: Default::default(),
    })
}

fn run(
    pairs: &mut Vec<BaseFolderPair>,
    cfgs: &[FolderPairSyncCfg],
    options: &SyncOptions,
    fs_impl: Arc<dyn FileSystem>,
) -> (TestCallback, SyncResult<()>) {
    let mut callback = TestCallback::default();
    let mut warnings = Warnings::default();
    let result = synchronize(
        Local::now(),
        options,
        cfgs,
        pairs,
        &HashMap::new(),
        &mut warnings,
        fs_impl,
        &mut callback,
    );
    (callback, result)
}

fn setup_dirs() -> (tempfile::TempDir, PathBuf, PathBuf) {
    let root = tempfile::tempdir().unwrap();
    let left = root.path().join("left");
    let right = root.path().join("right");
    fs::create_dir(&left).unwrap();
    fs::create_dir(&right).unwrap();
    (root, left, right)
}

#[test]
fn simple_create_copies_file_and_reports_stats() {
    let (_root, left, right) = setup_dirs();
    let content = vec![7u8; 42];
    fs::write(left.join("a.txt"), &content).unwrap();

    let mut pair = BaseFolderPair::new(left.clone(), right.clone());
    pair.add_file(
        ContainerRef::Root,
        file_side("a.txt", file_attrs(&left.join("a.txt"))),
        None,
        SyncOperation::CreateNewRight,
    );

    let mut pairs = vec![pair];
    let (callback, result) = run(
        &mut pairs,
        &[default_cfg()],
        &SyncOptions::default(),
        Arc::new(NativeFileSystem::new()),
    );

    result.unwrap();
    assert_eq!(callback.phase, Some((1, 42, Phase::Synchronizing)));
    assert!(callback.errors.is_empty(), "errors: {:?}", callback.errors);
    assert_eq!(fs::read(right.join("a.txt")).unwrap(), content);
    assert_eq!(callback.items_processed, 1);
    assert_eq!(callback.bytes_processed, 42);

    // item metadata was updated on both sides
    let file_id = {
        let (files, _, _) = pairs[0].container_children(ContainerRef::Root);
        files[0]
    };
    assert!(pairs[0].file_exists(file_id, Side::Right));
    assert_eq!(pairs[0].file(file_id).op, SyncOperation::Equal);
}

#[test]
fn overwrite_with_verification_replaces_content() {
    let (_root, left, right) = setup_dirs();
    fs::write(left.join("b.bin"), vec![1u8; 1000]).unwrap();
    fs::write(right.join("b.bin"), vec![2u8; 10]).unwrap();

    let mut pair = BaseFolderPair::new(left.clone(), right.clone());
    pair.add_file(
        ContainerRef::Root,
        file_side("b.bin", file_attrs(&left.join("b.bin"))),
        file_side("b.bin", file_attrs(&right.join("b.bin"))),
        SyncOperation::OverwriteRight,
    );

    let options = SyncOptions {
        verify_copied_files: true,
        ..Default::default()
    };
    let mut pairs = vec![pair];
    let (callback, result) = run(
        &mut pairs,
        &[default_cfg()],
        &options,
        Arc::new(NativeFileSystem::new()),
    );

    result.unwrap();
    assert!(callback.errors.is_empty(), "errors: {:?}", callback.errors);
    assert_eq!(fs::read(right.join("b.bin")).unwrap(), vec![1u8; 1000]);
}

#[test]
fn shrinking_overwrite_frees_space_before_growing_one() {
    let (_root, left, right) = setup_dirs();
    fs::write(left.join("big.bin"), vec![1u8; 1000]).unwrap();
    fs::write(right.join("big.bin"), vec![2u8; 10]).unwrap();
    fs::write(left.join("small.bin"), vec![3u8; 10]).unwrap();
    fs::write(right.join("small.bin"), vec![4u8; 500]).unwrap();

    let mut pair = BaseFolderPair::new(left.clone(), right.clone());
    // left shrinks: 1000 -> 10 (pass 1); left grows: 10 -> 500 (pass 2)
    pair.add_file(
        ContainerRef::Root,
        file_side("big.bin", file_attrs(&left.join("big.bin"))),
        file_side("big.bin", file_attrs(&right.join("big.bin"))),
        SyncOperation::OverwriteLeft,
    );
    pair.add_file(
        ContainerRef::Root,
        file_side("small.bin", file_attrs(&left.join("small.bin"))),
        file_side("small.bin", file_attrs(&right.join("small.bin"))),
        SyncOperation::OverwriteLeft,
    );

    let mut pairs = vec![pair];
    let (callback, result) = run(
        &mut pairs,
        &[default_cfg()],
        &SyncOptions::default(),
        Arc::new(NativeFileSystem::new()),
    );

    result.unwrap();
    assert!(callback.errors.is_empty(), "errors: {:?}", callback.errors);
    assert_eq!(fs::read(left.join("big.bin")).unwrap(), vec![2u8; 10]);
    assert_eq!(fs::read(left.join("small.bin")).unwrap(), vec![4u8; 500]);
    // the shrinking overwrite is logged before the growing one
    let big_pos = callback
        .logs
        .iter()
        .position(|l| l.contains("big.bin"))
        .unwrap();
    let small_pos = callback
        .logs
        .iter()
        .position(|l| l.contains("small.bin") && l.contains("Updating"))
        .unwrap();
    assert!(big_pos < small_pos, "logs: {:?}", callback.logs);
}

#[test]
fn two_step_move_survives_deleted_source_folder_and_name_clash() {
    let (_root, left, right) = setup_dirs();
    // left: sub/y (move source, folder scheduled for deletion) and a
    // clashing folder named "x"; right already holds the renamed file
    fs::create_dir(left.join("sub")).unwrap();
    fs::write(left.join("sub/y"), b"ydata").unwrap();
    fs::create_dir(left.join("x")).unwrap();
    fs::write(right.join("x"), b"ydata").unwrap();

    let mut pair = BaseFolderPair::new(left.clone(), right.clone());
    let sub = pair.add_folder(
        ContainerRef::Root,
        folder_side("sub"),
        None,
        SyncOperation::DeleteLeft,
    );
    let move_from = pair.add_file(
        ContainerRef::Folder(sub),
        file_side("y", file_attrs(&left.join("sub/y"))),
        None,
        SyncOperation::MoveLeftFrom,
    );
    pair.add_folder(
        ContainerRef::Root,
        folder_side("x"),
        None,
        SyncOperation::DeleteLeft,
    );
    let move_to = pair.add_file(
        ContainerRef::Root,
        None,
        file_side("x", file_attrs(&right.join("x"))),
        SyncOperation::MoveLeftTo,
    );
    pair.set_move_pair(move_from, move_to);

    let mut pairs = vec![pair];
    let (callback, result) = run(
        &mut pairs,
        &[default_cfg()],
        &SyncOptions::default(),
        Arc::new(NativeFileSystem::new()),
    );

    result.unwrap();
    assert!(callback.errors.is_empty(), "errors: {:?}", callback.errors);

    // pass 0 renamed the source to a temp name at the base folder root
    let temp_log = callback
        .logs
        .iter()
        .find(|l| l.contains(".tws_tmp"))
        .expect("expected a two-step move through a temp file");
    assert!(temp_log.contains("Moving file"), "log: {}", temp_log);

    // final state: single file "x" with the source content, no leftovers
    assert_eq!(fs::read(left.join("x")).unwrap(), b"ydata");
    assert!(!left.join("sub").exists());
    let leftovers: Vec<_> = fs::read_dir(&left)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".tws_tmp"))
        .collect();
    assert!(leftovers.is_empty(), "temp files left behind: {:?}", leftovers);
}

#[test]
fn vanished_source_is_pruned_without_error() {
    let (_root, left, right) = setup_dirs();
    // the comparison saw c.dat, but it is gone by sync time
    let mut pair = BaseFolderPair::new(left.clone(), right.clone());
    pair.add_file(
        ContainerRef::Root,
        file_side(
            "c.dat",
            FileAttributes {
                size: 5,
                mod_time: 1_600_000_000,
                ..Default::default()
            },
        ),
        None,
        SyncOperation::CreateNewRight,
    );

    let mut pairs = vec![pair];
    let (callback, result) = run(
        &mut pairs,
        &[default_cfg()],
        &SyncOptions::default(),
        Arc::new(NativeFileSystem::new()),
    );

    result.unwrap();
    assert!(callback.errors.is_empty(), "errors: {:?}", callback.errors);
    assert!(callback.logs.iter().any(|l| l.contains("not found")));
    assert_eq!(callback.items_processed, 1);
    assert!(!right.join("c.dat").exists());

    // the item lost its only side and was pruned from the tree
    let (files, _, _) = pairs[0].container_children(ContainerRef::Root);
    assert!(files.is_empty());
}

//---- recycler downgrade ---------------------------------------------------

/// Native filesystem with the recycle bin reported as unavailable.
struct NoRecycleBinFs(NativeFileSystem);

impl FileSystem for NoRecycleBinFs {
    fn get_item_type(&self, path: &Path) -> SyncResult<ItemType> {
        self.0.get_item_type(path)
    }
    fn get_item_type_if_exists(&self, path: &Path) -> SyncResult<Option<ItemType>> {
        self.0.get_item_type_if_exists(path)
    }
    fn remove_file_if_exists(&self, path: &Path) -> SyncResult<bool> {
        self.0.remove_file_if_exists(path)
    }
    fn remove_symlink_if_exists(&self, path: &Path) -> SyncResult<bool> {
        self.0.remove_symlink_if_exists(path)
    }
    fn remove_file_plain(&self, path: &Path) -> SyncResult<()> {
        self.0.remove_file_plain(path)
    }
    fn rename_item(&self, from: &Path, to: &Path) -> SyncResult<()> {
        self.0.rename_item(from, to)
    }
    fn get_symlink_resolved_path(&self, path: &Path) -> SyncResult<PathBuf> {
        self.0.get_symlink_resolved_path(path)
    }
    fn copy_symlink(&self, from: &Path, to: &Path, copy_permissions: bool) -> SyncResult<()> {
        self.0.copy_symlink(from, to, copy_permissions)
    }
    fn copy_new_folder(&self, from: &Path, to: &Path, copy_permissions: bool) -> SyncResult<()> {
        self.0.copy_new_folder(from, to, copy_permissions)
    }
    fn create_folder_if_missing_recursion(&self, path: &Path) -> SyncResult<()> {
        self.0.create_folder_if_missing_recursion(path)
    }
    fn remove_folder_if_exists_recursion(
        &self,
        path: &Path,
        on_before_file_deletion: NotifyItem,
        on_before_folder_deletion: NotifyItem,
    ) -> SyncResult<()> {
        self.0
            .remove_folder_if_exists_recursion(path, on_before_file_deletion, on_before_folder_deletion)
    }
    fn copy_file_transactional(
        &self,
        source: &Path,
        source_attrs: &FileAttributes,
        target: &Path,
        copy_permissions: bool,
        transactional_copy: bool,
        on_delete_target: Option<&mut dyn FnMut() -> SyncResult<()>>,
        notify_io: &mut dyn FnMut(i64) -> SyncResult<()>,
    ) -> SyncResult<FileCopyResult> {
        self.0.copy_file_transactional(
            source,
            source_attrs,
            target,
            copy_permissions,
            transactional_copy,
            on_delete_target,
            notify_io,
        )
    }
    fn create_recycler_session(&self, base_folder: &Path) -> SyncResult<Box<dyn RecycleSession>> {
        self.0.create_recycler_session(base_folder)
    }
    fn supports_recycle_bin(
        &self,
        _path: &Path,
        _ui_refresh: &mut dyn FnMut() -> SyncResult<()>,
    ) -> SyncResult<bool> {
        Ok(false)
    }
    fn get_free_disk_space(&self, path: &Path) -> SyncResult<u64> {
        self.0.get_free_disk_space(path)
    }
    fn support_permission_copy(&self, left: &Path, right: &Path) -> SyncResult<bool> {
        self.0.support_permission_copy(left, right)
    }
    fn files_have_same_content(
        &self,
        lhs: &Path,
        rhs: &Path,
        notify_io: &mut dyn FnMut(i64) -> SyncResult<()>,
    ) -> SyncResult<bool> {
        self.0.files_have_same_content(lhs, rhs, notify_io)
    }
    fn flush_file_buffers(&self, path: &Path) -> SyncResult<()> {
        self.0.flush_file_buffers(path)
    }
}

#[test]
fn recycler_falls_back_to_permanent_when_unsupported() {
    let (_root, left, right) = setup_dirs();
    fs::write(right.join("doomed.txt"), b"bye").unwrap();

    let mut pair = BaseFolderPair::new(left.clone(), right.clone());
    pair.add_file(
        ContainerRef::Root,
        None,
        file_side("doomed.txt", file_attrs(&right.join("doomed.txt"))),
        SyncOperation::DeleteRight,
    );

    let cfg = FolderPairSyncCfg {
        handle_deletion: DeletionPolicy::Recycler,
        ..default_cfg()
    };
    let mut pairs = vec![pair];
    let (callback, result) = run(
        &mut pairs,
        &[cfg],
        &SyncOptions::default(),
        Arc::new(NoRecycleBinFs(NativeFileSystem::new())),
    );

    result.unwrap();
    assert!(callback
        .warnings
        .iter()
        .any(|w| w.contains("recycle bin is not supported")));
    assert!(callback.errors.is_empty(), "errors: {:?}", callback.errors);
    assert!(!right.join("doomed.txt").exists());

    // permanent deletion was used: no recycle staging folder appeared
    let staging: Vec<_> = fs::read_dir(&right)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".tws_recycle"))
        .collect();
    assert!(staging.is_empty(), "staging dirs: {:?}", staging);
}

#[test]
fn dependent_base_folders_produce_one_warning() {
    let (_root, left, right) = setup_dirs();
    let nested = left.join("nested");
    fs::create_dir(&nested).unwrap();
    let other = right.clone();
    fs::write(left.join("a"), b"a").unwrap();
    fs::write(nested.join("b"), b"b").unwrap();

    let mut pair_outer = BaseFolderPair::new(left.clone(), other.clone());
    pair_outer.add_file(
        ContainerRef::Root,
        file_side("a", file_attrs(&left.join("a"))),
        None,
        SyncOperation::CreateNewRight,
    );
    let second_right = _root.path().join("right2");
    fs::create_dir(&second_right).unwrap();
    let mut pair_inner = BaseFolderPair::new(nested.clone(), second_right.clone());
    pair_inner.add_file(
        ContainerRef::Root,
        None,
        file_side(
            "c",
            FileAttributes {
                size: 1,
                mod_time: 1_600_000_000,
                ..Default::default()
            },
        ),
        SyncOperation::CreateNewLeft,
    );
    fs::write(second_right.join("c"), b"c").unwrap();
    // refresh attrs from disk for the real file
    let mut pairs = vec![pair_outer, pair_inner];

    let (callback, result) = run(
        &mut pairs,
        &[default_cfg(), default_cfg()],
        &SyncOptions::default(),
        Arc::new(NativeFileSystem::new()),
    );

    result.unwrap();
    let dependent: Vec<_> = callback
        .warnings
        .iter()
        .filter(|w| w.contains("multiple base folders"))
        .collect();
    assert_eq!(dependent.len(), 1, "warnings: {:?}", callback.warnings);
    // execution still proceeds normally
    assert!(other.join("a").exists());
    assert!(nested.join("c").exists());
}

#[test]
fn already_in_sync_pair_performs_no_writes() {
    let (_root, left, right) = setup_dirs();
    let pair = BaseFolderPair::new(left.clone(), right.clone());

    let cfg = default_cfg();
    let mut pairs = vec![pair];
    let (callback, result) = run(
        &mut pairs,
        &[cfg],
        &SyncOptions::default(),
        Arc::new(NativeFileSystem::new()),
    );

    result.unwrap();
    assert!(callback.errors.is_empty());
    assert_eq!(callback.items_processed, 0);
    assert_eq!(fs::read_dir(&left).unwrap().count(), 0);
    assert_eq!(fs::read_dir(&right).unwrap().count(), 0);
}

#[test]
fn already_in_sync_still_writes_database_when_configured() {
    let (_root, left, right) = setup_dirs();
    let pair = BaseFolderPair::new(left.clone(), right.clone());

    let cfg = FolderPairSyncCfg {
        save_sync_db: true,
        ..default_cfg()
    };
    let mut pairs = vec![pair];
    let (_callback, result) = run(
        &mut pairs,
        &[cfg],
        &SyncOptions::default(),
        Arc::new(NativeFileSystem::new()),
    );

    result.unwrap();
    assert!(left.join("sync.tws_db").exists());
    assert!(right.join("sync.tws_db").exists());
}

#[test]
fn versioning_policy_archives_deleted_files() {
    let (_root, left, right) = setup_dirs();
    let versions = _root.path().join("versions");
    fs::create_dir(left.join("old")).unwrap();
    fs::write(left.join("old/data.txt"), b"precious").unwrap();

    let mut pair = BaseFolderPair::new(left.clone(), right.clone());
    let folder = pair.add_folder(
        ContainerRef::Root,
        folder_side("old"),
        None,
        SyncOperation::DeleteLeft,
    );
    pair.add_file(
        ContainerRef::Folder(folder),
        file_side("data.txt", file_attrs(&left.join("old/data.txt"))),
        None,
        SyncOperation::DeleteLeft,
    );

    let cfg = FolderPairSyncCfg {
        handle_deletion: DeletionPolicy::Versioning,
        versioning_folder: versions.clone(),
        ..default_cfg()
    };
    let mut pairs = vec![pair];
    let (callback, result) = run(
        &mut pairs,
        &[cfg],
        &SyncOptions::default(),
        Arc::new(NativeFileSystem::new()),
    );

    result.unwrap();
    assert!(callback.errors.is_empty(), "errors: {:?}", callback.errors);
    assert!(!left.join("old").exists());
    assert_eq!(fs::read(versions.join("old/data.txt")).unwrap(), b"precious");
}

#[test]
fn conflicts_are_reported_not_executed() {
    let (_root, left, right) = setup_dirs();
    fs::write(left.join("clash.txt"), b"left").unwrap();
    fs::write(right.join("clash.txt"), b"right").unwrap();
    fs::write(left.join("ok.txt"), b"okdata").unwrap();

    let mut pair = BaseFolderPair::new(left.clone(), right.clone());
    let conflict = pair.add_file(
        ContainerRef::Root,
        file_side("clash.txt", file_attrs(&left.join("clash.txt"))),
        file_side("clash.txt", file_attrs(&right.join("clash.txt"))),
        SyncOperation::DoNothing,
    );
    pair.set_conflict(conflict, "both sides changed since last sync");
    pair.add_file(
        ContainerRef::Root,
        file_side("ok.txt", file_attrs(&left.join("ok.txt"))),
        None,
        SyncOperation::CreateNewRight,
    );

    let mut pairs = vec![pair];
    let (callback, result) = run(
        &mut pairs,
        &[default_cfg()],
        &SyncOptions::default(),
        Arc::new(NativeFileSystem::new()),
    );

    result.unwrap();
    assert!(callback
        .warnings
        .iter()
        .any(|w| w.contains("unresolved conflicts") && w.contains("clash.txt")));
    // the conflict item was untouched, the healthy one synchronized
    assert_eq!(fs::read(left.join("clash.txt")).unwrap(), b"left");
    assert_eq!(fs::read(right.join("clash.txt")).unwrap(), b"right");
    assert_eq!(fs::read(right.join("ok.txt")).unwrap(), b"okdata");
}

#[test]
fn folder_create_recurses_into_children() {
    let (_root, left, right) = setup_dirs();
    fs::create_dir_all(left.join("tree/inner")).unwrap();
    fs::write(left.join("tree/inner/leaf.txt"), b"leaf").unwrap();

    let mut pair = BaseFolderPair::new(left.clone(), right.clone());
    let tree = pair.add_folder(
        ContainerRef::Root,
        folder_side("tree"),
        None,
        SyncOperation::CreateNewRight,
    );
    let inner = pair.add_folder(
        ContainerRef::Folder(tree),
        folder_side("inner"),
        None,
        SyncOperation::CreateNewRight,
    );
    pair.add_file(
        ContainerRef::Folder(inner),
        file_side("leaf.txt", file_attrs(&left.join("tree/inner/leaf.txt"))),
        None,
        SyncOperation::CreateNewRight,
    );

    let mut pairs = vec![pair];
    let (callback, result) = run(
        &mut pairs,
        &[default_cfg()],
        &SyncOptions::default(),
        Arc::new(NativeFileSystem::new()),
    );

    result.unwrap();
    assert!(callback.errors.is_empty(), "errors: {:?}", callback.errors);
    assert_eq!(fs::read(right.join("tree/inner/leaf.txt")).unwrap(), b"leaf");
}
