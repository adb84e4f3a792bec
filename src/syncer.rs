//! Three-pass synchronization of one base folder pair.
//!
//! Pass 0 resolves file moves (including the two-step fallback for name
//! clashes), pass 1 runs deletions and shrinking overwrites to free disk
//! space early, pass 2 everything else. Each pass drives a pool of worker
//! threads over the `Workload` scheduler; all tree access happens under the
//! pair lock, all blocking I/O outside of it.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

use crate::actor::{try_reporting_error, AsyncCallback, ItemStatReporter};
use crate::deletion::DeletionHandler;
use crate::errors::{SyncError, SyncResult};
use crate::file_ops::{display_path, FileCopyResult, FileSystem, ItemType, TEMP_FILE_ENDING};
use crate::hierarchy::{
    equal_item_name, BaseFolderPair, ContainerRef, FileDescriptor, FileId, FileSide, FolderId,
    LinkId, Side, SyncOperation,
};
use crate::parallel::{self, PairGuard};
use crate::progress::ProcessCallback;
use crate::stats::SyncStatistics;
use crate::workload::Workload;

const UI_TICK_INTERVAL: Duration = Duration::from_millis(50);

const TXT_CREATING_FILE: &str = "Creating file %x";
const TXT_CREATING_LINK: &str = "Creating symbolic link %x";
const TXT_CREATING_FOLDER: &str = "Creating folder %x";
const TXT_UPDATING_FILE: &str = "Updating file %x";
const TXT_UPDATING_LINK: &str = "Updating symbolic link %x";
const TXT_VERIFYING_FILE: &str = "Verifying file %x";
const TXT_UPDATING_ATTRIBUTES: &str = "Updating attributes of %x";
const TXT_MOVING_FILE: &str = "Moving file %x to %y";
const TXT_SOURCE_NOT_FOUND: &str = "Source item %x not found";

/// Shared context of one folder-pair synchronization.
pub struct SyncCtx<'a> {
    pub verify_copied_files: bool,
    pub copy_file_permissions: bool,
    pub fail_safe_file_copy: bool,
    pub errors_mod_time: &'a Mutex<Vec<String>>,
    pub del_handling_left: &'a DeletionHandler,
    pub del_handling_right: &'a DeletionHandler,
    pub thread_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassNo {
    /// Prepare file moves.
    Zero,
    /// Deletions and shrinking overwrites.
    One,
    /// Creates, growing overwrites, metadata.
    Two,
    /// Item is not executed at all.
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    PrepareMove(FileId),
    SyncFile(FileId),
    SyncLink(LinkId),
    SyncFolder(FolderId),
}

/// Runs all three passes over one base folder pair.
pub fn run_sync(
    ctx: &SyncCtx,
    fs: &Arc<dyn FileSystem>,
    pair: &mut BaseFolderPair,
    cb: &mut dyn ProcessCallback,
) -> SyncResult<()> {
    let pair_lock = Mutex::new(std::mem::take(pair));
    let result = (|| {
        run_pass(PassNo::Zero, ctx, fs, &pair_lock, cb)?;
        run_pass(PassNo::One, ctx, fs, &pair_lock, cb)?;
        run_pass(PassNo::Two, ctx, fs, &pair_lock, cb)
    })();
    *pair = pair_lock.into_inner();
    result
}

fn run_pass(
    pass: PassNo,
    ctx: &SyncCtx,
    fs: &Arc<dyn FileSystem>,
    pair_lock: &Mutex<BaseFolderPair>,
    cb: &mut dyn ProcessCallback,
) -> SyncResult<()> {
    let thread_count = ctx.thread_count.max(1);
    let acb = AsyncCallback::new(thread_count);
    let workload = Workload::new(pass, thread_count);

    std::thread::scope(|scope| {
        for thread_idx in 0..thread_count {
            let acb = &acb;
            let workload = &workload;
            scope.spawn(move || {
                let syncer = FolderPairSyncer {
                    ctx,
                    fs,
                    pair_lock,
                    workload,
                    acb,
                    thread_idx,
                };
                syncer.worker_loop();
            });
        }

        let result = acb.wait_until_done(UI_TICK_INTERVAL, cb);
        // shut the pass down: interrupt all workers, then scope exit joins
        acb.interrupt().set();
        workload.notify_interrupt();
        acb.notify_interrupt();
        result
    })
}

/// Generates the folder-level work items of one container for `pass`.
/// Folder items come first so parallelism is exposed promptly; the result is
/// reversed because buckets are LIFO.
pub(crate) fn folder_level_work_items(
    pass: PassNo,
    pair: &BaseFolderPair,
    container: ContainerRef,
) -> (Vec<WorkItem>, Vec<ContainerRef>) {
    let (files, links, folders) = pair.container_children(container);
    let mut items = Vec::new();
    let mut to_expand = Vec::new();

    for &folder in folders {
        if pass == get_pass_folder(pair.folder(folder).op) {
            items.push(WorkItem::SyncFolder(folder));
        } else {
            to_expand.push(ContainerRef::Folder(folder));
        }
    }
    for &file in files {
        if pass == PassNo::Zero {
            items.push(WorkItem::PrepareMove(file));
        } else if pass == get_pass_file(pair, file) {
            items.push(WorkItem::SyncFile(file));
        }
    }
    for &link in links {
        if pass == get_pass_link(pair.link(link).op) {
            items.push(WorkItem::SyncLink(link));
        }
    }

    items.reverse();
    to_expand.reverse();
    (items, to_expand)
}

/// Pass assignment for files: deletions first; an overwrite that shrinks the
/// target runs in pass 1 so disk space is freed before large writes.
pub(crate) fn get_pass_file(pair: &BaseFolderPair, id: FileId) -> PassNo {
    use SyncOperation::*;
    match pair.file(id).op {
        DeleteLeft | DeleteRight => PassNo::One,
        OverwriteLeft => {
            if pair.file_size(id, Side::Left) > pair.file_size(id, Side::Right) {
                PassNo::One
            } else {
                PassNo::Two
            }
        }
        OverwriteRight => {
            if pair.file_size(id, Side::Right) > pair.file_size(id, Side::Left) {
                PassNo::One
            } else {
                PassNo::Two
            }
        }
        // executed via the paired TO item
        MoveLeftFrom | MoveRightFrom => PassNo::Never,
        // after the target parent folder exists
        MoveLeftTo | MoveRightTo => PassNo::Two,
        CreateNewLeft | CreateNewRight | CopyMetadataToLeft | CopyMetadataToRight => PassNo::Two,
        DoNothing | Equal | UnresolvedConflict => PassNo::Never,
    }
}

pub(crate) fn get_pass_link(op: SyncOperation) -> PassNo {
    use SyncOperation::*;
    match op {
        // delete links in pass 1, create the equally named file in pass 2:
        // supports replacing a symlink by a regular file
        DeleteLeft | DeleteRight => PassNo::One,
        OverwriteLeft | OverwriteRight | CreateNewLeft | CreateNewRight | CopyMetadataToLeft
        | CopyMetadataToRight => PassNo::Two,
        MoveLeftFrom | MoveRightFrom | MoveLeftTo | MoveRightTo => {
            debug_assert!(false);
            PassNo::Never
        }
        DoNothing | Equal | UnresolvedConflict => PassNo::Never,
    }
}

pub(crate) fn get_pass_folder(op: SyncOperation) -> PassNo {
    use SyncOperation::*;
    match op {
        DeleteLeft | DeleteRight => PassNo::One,
        CreateNewLeft | CreateNewRight | OverwriteLeft | OverwriteRight | CopyMetadataToLeft
        | CopyMetadataToRight => PassNo::Two,
        MoveLeftFrom | MoveRightFrom | MoveLeftTo | MoveRightTo => {
            debug_assert!(false);
            PassNo::Never
        }
        DoNothing | Equal | UnresolvedConflict => PassNo::Never,
    }
}

fn file_has_name_clash(pair: &BaseFolderPair, id: FileId) -> bool {
    let name = pair.file_name(id, Side::Left);
    let (_, links, folders) = pair.container_children(pair.file_parent_container(id));
    links
        .iter()
        .any(|&l| equal_item_name(pair.link_name(l, Side::Left), name))
        || folders
            .iter()
            .any(|&f| equal_item_name(pair.folder_name(f, Side::Left), name))
}

fn folder_has_name_clash(pair: &BaseFolderPair, id: FolderId) -> bool {
    let name = pair.folder_name(id, Side::Left);
    let (files, links, _) = pair.container_children(pair.folder_parent_container(id));
    links
        .iter()
        .any(|&l| equal_item_name(pair.link_name(l, Side::Left), name))
        || files
            .iter()
            .any(|&f| equal_item_name(pair.file_name(f, Side::Left), name))
}

struct FolderPairSyncer<'e> {
    ctx: &'e SyncCtx<'e>,
    fs: &'e Arc<dyn FileSystem>,
    pair_lock: &'e Mutex<BaseFolderPair>,
    workload: &'e Workload,
    acb: &'e AsyncCallback,
    thread_idx: usize,
}

impl<'e> FolderPairSyncer<'e> {
    fn worker_loop(&self) {
        self.acb.notify_work_begin(self.thread_idx);
        loop {
            let item = match self.workload.get_next(self.thread_idx, self.pair_lock, self.acb) {
                Ok(item) => item,
                Err(_) => break,
            };
            if self.execute(item).is_err() {
                break;
            }
        }
        self.acb.notify_work_end(self.thread_idx);
    }

    /// Runs one work item; only `Interrupted` escapes.
    fn execute(&self, item: WorkItem) -> SyncResult<()> {
        match item {
            WorkItem::PrepareMove(id) => self.prepare_file_move(id)?,
            WorkItem::SyncFile(id) => {
                try_reporting_error(self.thread_idx, self.acb, || self.synchronize_file(id))?;
            }
            WorkItem::SyncLink(id) => {
                try_reporting_error(self.thread_idx, self.acb, || self.synchronize_link(id))?;
            }
            WorkItem::SyncFolder(id) => {
                try_reporting_error(self.thread_idx, self.acb, || self.synchronize_folder(id))?;
                // children become available once the folder itself is done
                self.workload.add_folder_to_process(ContainerRef::Folder(id));
            }
        }
        self.acb.interrupt().check()
    }

    fn del_handler(&self, side: Side) -> &'e DeletionHandler {
        match side {
            Side::Left => self.ctx.del_handling_left,
            Side::Right => self.ctx.del_handling_right,
        }
    }

    fn report_info(&self, template: &str, path: &str) -> SyncResult<()> {
        self.acb
            .report_info(&template.replace("%x", path), self.thread_idx)
    }

    fn report_info2(&self, template: &str, from: &str, to: &str) -> SyncResult<()> {
        self.acb.report_info(
            &template.replace("%x", from).replace("%y", to),
            self.thread_idx,
        )
    }

    //---- pass 0: move preparation --------------------------------------

    /// Resolves one move pair ahead of execution. If the move cannot be
    /// performed (even after retries), the pair is reverted to an ordinary
    /// copy + delete and the statistics total is patched to match.
    fn prepare_file_move(&self, file: FileId) -> SyncResult<()> {
        let (op, move_ref) = {
            let tree = self.pair_lock.lock();
            (tree.file(file).op, tree.file(file).move_ref)
        };
        let side = match op {
            SyncOperation::MoveLeftFrom => Side::Left,
            SyncOperation::MoveRightFrom => Side::Right,
            _ => return Ok(()),
        };
        let Some(target) = move_ref else {
            debug_assert!(false);
            return Ok(());
        };

        let ignored_error = try_reporting_error(self.thread_idx, self.acb, || {
            self.resolve_move_conflicts(side, file, target)
        })?;

        if ignored_error.is_some() {
            // the move source's parent may be deleted in pass 1; continuing
            // with a broken move pair would corrupt the statistics
            let mut tree = self.pair_lock.lock();
            let stats_of = |tree: &BaseFolderPair| {
                let src = SyncStatistics::from_file(tree, file);
                let trg = SyncStatistics::from_file(tree, target);
                (src.cud() + trg.cud(), src.bytes_to_process() + trg.bytes_to_process())
            };
            let before = stats_of(&tree);
            tree.file_mut(file).move_ref = None;
            tree.file_mut(target).move_ref = None;
            tree.file_mut(file).op = match side {
                Side::Left => SyncOperation::DeleteLeft,
                Side::Right => SyncOperation::DeleteRight,
            };
            tree.file_mut(target).op = match side {
                Side::Left => SyncOperation::CreateNewLeft,
                Side::Right => SyncOperation::CreateNewRight,
            };
            let after = stats_of(&tree);
            drop(tree);
            self.acb.update_data_total(after.0 - before.0, after.1 - before.1);
        }
        Ok(())
    }

    fn resolve_move_conflicts(
        &self,
        side: Side,
        source: FileId,
        target: FileId,
    ) -> SyncResult<()> {
        let mut guard = PairGuard::new(self.pair_lock);
        let (source_will_be_deleted, source_clash, target_clash) = {
            let tree = guard.pair();
            let deleted = match tree.file(source).parent {
                Some(parent) => matches!(
                    tree.folder(parent).op,
                    SyncOperation::DeleteLeft | SyncOperation::DeleteRight
                ),
                None => false,
            };
            (
                deleted,
                file_has_name_clash(tree, source),
                file_has_name_clash(tree, target),
            )
        };

        if !source_will_be_deleted && !source_clash {
            // source is neither in the way nor about to vanish: delay the
            // move to pass 2 (this also covers freshly created temp items)
            return Ok(());
        }

        if target_clash || !self.create_parent_folders_of_file(target, &mut guard)? {
            return self.setup_2step_move(side, source, target, &mut guard);
        }

        // this should work now; the move executes through the TO item
        self.synchronize_file_with_guard(target, &mut guard)
    }

    fn create_parent_folders_of_file(
        &self,
        file: FileId,
        guard: &mut PairGuard,
    ) -> SyncResult<bool> {
        match guard.pair().file(file).parent {
            None => Ok(true),
            Some(folder) => self.create_parent_folder(folder, guard),
        }
    }

    /// Recursively synchronizes missing parent folders; returns `false` on a
    /// name clash with a sibling file or symlink.
    fn create_parent_folder(&self, folder: FolderId, guard: &mut PairGuard) -> SyncResult<bool> {
        if let Some(parent) = guard.pair().folder(folder).parent {
            if !self.create_parent_folder(parent, guard)? {
                return Ok(false);
            }
        }
        if folder_has_name_clash(guard.pair(), folder) {
            return Ok(false);
        }
        debug_assert!(!matches!(
            guard.pair().folder(folder).op,
            SyncOperation::DeleteLeft | SyncOperation::DeleteRight
        ));
        self.synchronize_folder_with_guard(folder, guard)?;
        Ok(true)
    }

    /// Renames the move source to a reserved temp name at the base-folder
    /// root and relinks the move pair so pass 2 finishes the move.
    fn setup_2step_move(
        &self,
        side: Side,
        source: FileId,
        target: FileId,
        guard: &mut PairGuard,
    ) -> SyncResult<()> {
        let (file_name, source_path, base_path, attrs) = {
            let tree = guard.pair();
            (
                tree.file_name(source, side).to_string(),
                tree.file_abs_path(source, side),
                tree.base_path(side).to_path_buf(),
                tree.file_attrs(source, side).cloned(),
            )
        };
        let Some(attrs) = attrs else {
            debug_assert!(false);
            return Ok(());
        };

        // unique-enough tag to avoid clashing with some remnant temp file
        let short_tag = format!("{:04x}", xxh3_64(Uuid::new_v4().as_bytes()) & 0xffff);
        let stem = match file_name.rfind('.') {
            Some(pos) => &file_name[..pos],
            None => file_name.as_str(),
        };
        let tmp_name = format!("{}.{}{}", stem, short_tag, TEMP_FILE_ENDING);
        let tmp_path = base_path.join(&tmp_name);

        self.report_info2(
            TXT_MOVING_FILE,
            &display_path(&source_path),
            &display_path(&tmp_path),
        )?;

        parallel::rename_item(&**self.fs, &source_path, &tmp_path, guard)?;

        let tree = guard.pair();
        let temp_side = FileSide {
            name: tmp_name,
            attrs,
        };
        let (left, right) = match side {
            Side::Left => (Some(temp_side), None),
            Side::Right => (None, Some(temp_side)),
        };
        let temp_op = match side {
            Side::Left => SyncOperation::MoveLeftFrom,
            Side::Right => SyncOperation::MoveRightFrom,
        };
        let temp_item = tree.add_file(ContainerRef::Root, left, right, temp_op);
        tree.remove_file_side(source, side);
        tree.file_mut(source).move_ref = None;
        tree.file_mut(temp_item).move_ref = Some(target);
        tree.file_mut(target).move_ref = Some(temp_item);

        // no statistics update: the move is still one pending operation
        self.acb.interrupt().check()
    }

    //---- file dispatch -------------------------------------------------

    fn synchronize_file(&self, file: FileId) -> SyncResult<()> {
        let mut guard = PairGuard::new(self.pair_lock);
        self.synchronize_file_with_guard(file, &mut guard)
    }

    fn synchronize_file_with_guard(&self, file: FileId, guard: &mut PairGuard) -> SyncResult<()> {
        let op = guard.pair().file(file).op;
        let Some(target_side) = op.target_side() else {
            return Ok(());
        };
        use SyncOperation::*;
        match op {
            CreateNewLeft | CreateNewRight => self.file_create(file, target_side, guard)?,
            DeleteLeft | DeleteRight => self.file_delete(file, target_side, guard)?,
            MoveLeftTo | MoveRightTo => self.file_move(file, target_side, guard)?,
            OverwriteLeft | OverwriteRight => self.file_overwrite(file, target_side, guard)?,
            CopyMetadataToLeft | CopyMetadataToRight => {
                self.file_copy_metadata(file, target_side, guard)?
            }
            MoveLeftFrom | MoveRightFrom | DoNothing | Equal | UnresolvedConflict => {
                debug_assert!(false);
                return Ok(());
            }
        }
        self.acb.interrupt().check()
    }

    fn file_create(&self, file: FileId, target_side: Side, guard: &mut PairGuard) -> SyncResult<()> {
        let source_side = target_side.other();
        let (skip, target_path, source_path, source_attrs, source_name) = {
            let tree = guard.pair();
            let skip = match tree.file(file).parent {
                // parent folder creation failed: no reason for more errors
                Some(parent) => !tree.folder_exists(parent, target_side),
                None => false,
            };
            (
                skip,
                tree.file_abs_path(file, target_side),
                tree.file_abs_path(file, source_side),
                tree.file_attrs(file, source_side).cloned(),
                tree.file_name(file, source_side).to_string(),
            )
        };
        if skip {
            return Ok(());
        }
        let Some(source_attrs) = source_attrs else {
            debug_assert!(false);
            return Ok(());
        };

        self.report_info(TXT_CREATING_FILE, &display_path(&target_path))?;
        let stat = ItemStatReporter::new(1, source_attrs.size as i64, self.thread_idx, self.acb);

        let source_descr = FileDescriptor {
            path: source_path.clone(),
            attrs: source_attrs.clone(),
        };
        match self.copy_file_with_callback(&source_descr, &target_path, None, &stat, guard) {
            Ok(result) => {
                if let Some(msg) = result.error_mod_time {
                    self.ctx.errors_mod_time.lock().push(msg);
                }
                stat.report_delta(1, 0)?;
                guard.pair().set_synced_file(
                    file,
                    target_side,
                    source_name,
                    result.file_size,
                    result.mod_time,
                    result.mod_time,
                    result.target_file_id,
                    result.source_file_id,
                    false,
                    source_attrs.is_followed_symlink,
                );
                stat.finish();
                Ok(())
            }
            Err(SyncError::Interrupted) => Err(SyncError::Interrupted),
            Err(e) => {
                let source_gone = matches!(
                    parallel::get_item_type_if_exists(&**self.fs, &source_path, guard),
                    Ok(None)
                );
                if source_gone {
                    // nothing was done from a logical point of view, but
                    // significant I/O work happened
                    stat.report_delta(1, 0)?;
                    self.report_info(TXT_SOURCE_NOT_FOUND, &display_path(&source_path))?;
                    guard.pair().remove_file_side(file, source_side);
                    stat.finish();
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    fn file_delete(&self, file: FileId, target_side: Side, guard: &mut PairGuard) -> SyncResult<()> {
        let (path, attrs, rel_path) = {
            let tree = guard.pair();
            (
                tree.file_abs_path(file, target_side),
                tree.file_attrs(file, target_side).cloned().unwrap_or_default(),
                tree.file_rel_path(file),
            )
        };
        let del = self.del_handler(target_side);
        self.report_info(del.txt_removing_file(), &display_path(&path))?;

        let stat = ItemStatReporter::new(1, 0, self.thread_idx, self.acb);
        del.remove_file_with_callback(&FileDescriptor { path, attrs }, &rel_path, &stat, guard)?;
        guard.pair().remove_file_side(file, target_side);
        stat.finish();
        Ok(())
    }

    fn file_move(&self, file: FileId, target_side: Side, guard: &mut PairGuard) -> SyncResult<()> {
        let source_side = target_side.other();
        let Some(move_from) = guard.pair().file(file).move_ref else {
            debug_assert!(false);
            return Ok(());
        };
        let (path_from, path_to) = {
            let tree = guard.pair();
            (
                tree.file_abs_path(move_from, target_side),
                tree.file_abs_path(file, target_side),
            )
        };
        self.report_info2(
            TXT_MOVING_FILE,
            &display_path(&path_from),
            &display_path(&path_to),
        )?;

        let stat = ItemStatReporter::new(1, 0, self.thread_idx, self.acb);
        parallel::rename_item(&**self.fs, &path_from, &path_to, guard)?;
        stat.report_delta(1, 0)?;

        let tree = guard.pair();
        let name = tree.file_name(file, source_side).to_string();
        let size = tree.file_size(file, source_side);
        let from_attrs = tree.file_attrs(move_from, target_side).cloned().unwrap_or_default();
        let to_attrs = tree.file_attrs(file, source_side).cloned().unwrap_or_default();
        tree.set_synced_file(
            file,
            target_side,
            name,
            size,
            from_attrs.mod_time,
            to_attrs.mod_time,
            from_attrs.file_id,
            to_attrs.file_id,
            from_attrs.is_followed_symlink,
            to_attrs.is_followed_symlink,
        );
        tree.remove_file_side(move_from, target_side);
        tree.file_mut(move_from).move_ref = None;
        stat.finish();
        Ok(())
    }

    fn file_overwrite(&self, file: FileId, target_side: Side, guard: &mut PairGuard) -> SyncResult<()> {
        let source_side = target_side.other();
        let (target_path, parent_dir, source_name, target_name, followed_target, source_attrs, target_attrs, source_path, rel_path) = {
            let tree = guard.pair();
            (
                tree.file_abs_path(file, target_side),
                tree.container_dir_path(tree.file_parent_container(file), target_side),
                tree.file_name(file, source_side).to_string(),
                tree.file_name(file, target_side).to_string(),
                tree.file_attrs(file, target_side)
                    .map(|a| a.is_followed_symlink)
                    .unwrap_or(false),
                tree.file_attrs(file, source_side).cloned().unwrap_or_default(),
                tree.file_attrs(file, target_side).cloned().unwrap_or_default(),
                tree.file_abs_path(file, source_side),
                tree.file_rel_path(file),
            )
        };
        // respect a difference in case of the source item name
        let target_path_logical = parent_dir.join(&source_name);

        let mut target_resolved_old = target_path.clone();
        let mut target_resolved_new = target_path_logical.clone();
        if followed_target {
            // update through the link rather than replacing it
            let resolved = parallel::get_symlink_resolved_path(&**self.fs, &target_path, guard)?;
            target_resolved_old = resolved.clone();
            target_resolved_new = resolved;
        }

        self.report_info(TXT_UPDATING_FILE, &display_path(&target_resolved_old))?;
        let stat = ItemStatReporter::new(1, source_attrs.size as i64, self.thread_idx, self.acb);

        if followed_target && !equal_item_name(&target_name, &source_name) {
            // sync case sensitivity of the link itself
            parallel::rename_item(&**self.fs, &target_path, &target_path_logical, guard)?;
        }

        let del = self.del_handler(target_side);
        let pair_lock = self.pair_lock;
        let mut delete_descr_attrs = target_attrs.clone();
        delete_descr_attrs.is_followed_symlink = false;
        let delete_path = target_resolved_old.clone();
        let delete_rel = rel_path.clone();
        let stat_ref = &stat;
        let mut on_delete_target = move || -> SyncResult<()> {
            // runs outside the pair lock: re-acquire for the deletion handler
            let mut inner = PairGuard::new(pair_lock);
            del.remove_file_with_callback(
                &FileDescriptor {
                    path: delete_path.clone(),
                    attrs: delete_descr_attrs.clone(),
                },
                &delete_rel,
                stat_ref,
                &mut inner,
            )?;
            // overwrite is one logical update, not delete + create
            stat_ref.report_delta(-1, 0)
        };

        let source_descr = FileDescriptor {
            path: source_path,
            attrs: source_attrs.clone(),
        };
        let result = self.copy_file_with_callback(
            &source_descr,
            &target_resolved_new,
            Some(&mut on_delete_target),
            &stat,
            guard,
        )?;
        if let Some(msg) = result.error_mod_time {
            self.ctx.errors_mod_time.lock().push(msg);
        }
        stat.report_delta(1, 0)?;

        guard.pair().set_synced_file(
            file,
            target_side,
            source_name,
            result.file_size,
            result.mod_time,
            result.mod_time,
            result.target_file_id,
            result.source_file_id,
            followed_target,
            source_attrs.is_followed_symlink,
        );
        stat.finish();
        Ok(())
    }

    fn file_copy_metadata(&self, file: FileId, target_side: Side, guard: &mut PairGuard) -> SyncResult<()> {
        let source_side = target_side.other();
        let (target_path, parent_dir, source_name, target_name, source_attrs, target_attrs) = {
            let tree = guard.pair();
            (
                tree.file_abs_path(file, target_side),
                tree.container_dir_path(tree.file_parent_container(file), target_side),
                tree.file_name(file, source_side).to_string(),
                tree.file_name(file, target_side).to_string(),
                tree.file_attrs(file, source_side).cloned().unwrap_or_default(),
                tree.file_attrs(file, target_side).cloned().unwrap_or_default(),
            )
        };
        self.report_info(TXT_UPDATING_ATTRIBUTES, &display_path(&target_path))?;
        let stat = ItemStatReporter::new(1, 0, self.thread_idx, self.acb);

        if !equal_item_name(&target_name, &source_name) {
            parallel::rename_item(&**self.fs, &target_path, &parent_dir.join(&source_name), guard)?;
        }
        stat.report_delta(1, 0)?;

        guard.pair().set_synced_file(
            file,
            target_side,
            source_name,
            source_attrs.size,
            target_attrs.mod_time,
            source_attrs.mod_time,
            target_attrs.file_id,
            source_attrs.file_id,
            target_attrs.is_followed_symlink,
            source_attrs.is_followed_symlink,
        );
        stat.finish();
        Ok(())
    }

    /// Transactional copy plus optional byte-for-byte verification. On
    /// verification failure the target is removed.
    fn copy_file_with_callback(
        &self,
        source: &FileDescriptor,
        target_path: &Path,
        on_delete_target: Option<&mut dyn FnMut() -> SyncResult<()>>,
        stat: &ItemStatReporter,
        guard: &mut PairGuard,
    ) -> SyncResult<FileCopyResult> {
        let result = parallel::copy_file_transactional(
            &**self.fs,
            &source.path,
            &source.attrs,
            target_path,
            self.ctx.copy_file_permissions,
            self.ctx.fail_safe_file_copy,
            on_delete_target,
            &mut |bytes| stat.report_delta(0, bytes),
            guard,
        )?;

        if self.ctx.verify_copied_files {
            let interrupt = self.acb.interrupt();
            let verified = (|| {
                self.report_info(TXT_VERIFYING_FILE, &display_path(target_path))?;
                parallel::verify_files(
                    &**self.fs,
                    &source.path,
                    target_path,
                    &mut |_| interrupt.check(),
                    guard,
                )
            })();
            if let Err(e) = verified {
                let _ = parallel::remove_file_plain(&**self.fs, target_path, guard);
                return Err(e);
            }
        }
        Ok(result)
    }

    //---- symlink dispatch ----------------------------------------------

    fn synchronize_link(&self, link: LinkId) -> SyncResult<()> {
        let mut guard = PairGuard::new(self.pair_lock);
        self.synchronize_link_with_guard(link, &mut guard)
    }

    fn synchronize_link_with_guard(&self, link: LinkId, guard: &mut PairGuard) -> SyncResult<()> {
        let op = guard.pair().link(link).op;
        let Some(target_side) = op.target_side() else {
            return Ok(());
        };
        let source_side = target_side.other();
        use SyncOperation::*;
        match op {
            CreateNewLeft | CreateNewRight => {
                let (skip, target_path, source_path, source_name, source_mod_time) = {
                    let tree = guard.pair();
                    let skip = match tree.link(link).parent {
                        Some(parent) => !tree.folder_exists(parent, target_side),
                        None => false,
                    };
                    (
                        skip,
                        tree.link_abs_path(link, target_side),
                        tree.link_abs_path(link, source_side),
                        tree.link_name(link, source_side).to_string(),
                        tree.link_attrs(link, source_side).map(|a| a.mod_time).unwrap_or(0),
                    )
                };
                if skip {
                    return Ok(());
                }
                self.report_info(TXT_CREATING_LINK, &display_path(&target_path))?;
                let stat = ItemStatReporter::new(1, 0, self.thread_idx, self.acb);

                match parallel::copy_symlink(
                    &**self.fs,
                    &source_path,
                    &target_path,
                    self.ctx.copy_file_permissions,
                    guard,
                ) {
                    Ok(()) => {
                        stat.report_delta(1, 0)?;
                        guard.pair().set_synced_link(
                            link,
                            target_side,
                            source_name,
                            source_mod_time,
                            source_mod_time,
                        );
                        stat.finish();
                    }
                    Err(SyncError::Interrupted) => return Err(SyncError::Interrupted),
                    Err(e) => {
                        let source_gone = matches!(
                            parallel::get_item_type_if_exists(&**self.fs, &source_path, guard),
                            Ok(None)
                        );
                        if source_gone {
                            stat.report_delta(1, 0)?;
                            self.report_info(TXT_SOURCE_NOT_FOUND, &display_path(&source_path))?;
                            guard.pair().remove_link_side(link, source_side);
                            stat.finish();
                        } else {
                            return Err(e);
                        }
                    }
                }
            }

            DeleteLeft | DeleteRight => {
                let (path, rel_path) = {
                    let tree = guard.pair();
                    (tree.link_abs_path(link, target_side), tree.link_rel_path(link))
                };
                let del = self.del_handler(target_side);
                self.report_info(del.txt_removing_symlink(), &display_path(&path))?;
                let stat = ItemStatReporter::new(1, 0, self.thread_idx, self.acb);
                del.remove_link_with_callback(&path, &rel_path, &stat, guard)?;
                guard.pair().remove_link_side(link, target_side);
                stat.finish();
            }

            OverwriteLeft | OverwriteRight => {
                let (target_path, parent_dir, source_path, source_name, rel_path, source_mod_time) = {
                    let tree = guard.pair();
                    (
                        tree.link_abs_path(link, target_side),
                        tree.container_dir_path(
                            match tree.link(link).parent {
                                None => ContainerRef::Root,
                                Some(p) => ContainerRef::Folder(p),
                            },
                            target_side,
                        ),
                        tree.link_abs_path(link, source_side),
                        tree.link_name(link, source_side).to_string(),
                        tree.link_rel_path(link),
                        tree.link_attrs(link, source_side).map(|a| a.mod_time).unwrap_or(0),
                    )
                };
                self.report_info(TXT_UPDATING_LINK, &display_path(&target_path))?;
                let stat = ItemStatReporter::new(1, 0, self.thread_idx, self.acb);

                let del = self.del_handler(target_side);
                del.remove_link_with_callback(&target_path, &rel_path, &stat, guard)?;
                // delete + copy is one logical update
                stat.report_delta(-1, 0)?;

                parallel::copy_symlink(
                    &**self.fs,
                    &source_path,
                    &parent_dir.join(&source_name),
                    self.ctx.copy_file_permissions,
                    guard,
                )?;
                stat.report_delta(1, 0)?;

                guard.pair().set_synced_link(
                    link,
                    target_side,
                    source_name,
                    source_mod_time,
                    source_mod_time,
                );
                stat.finish();
            }

            CopyMetadataToLeft | CopyMetadataToRight => {
                let (target_path, parent_dir, source_name, target_name, target_mod_time, source_mod_time) = {
                    let tree = guard.pair();
                    (
                        tree.link_abs_path(link, target_side),
                        tree.container_dir_path(
                            match tree.link(link).parent {
                                None => ContainerRef::Root,
                                Some(p) => ContainerRef::Folder(p),
                            },
                            target_side,
                        ),
                        tree.link_name(link, source_side).to_string(),
                        tree.link_name(link, target_side).to_string(),
                        tree.link_attrs(link, target_side).map(|a| a.mod_time).unwrap_or(0),
                        tree.link_attrs(link, source_side).map(|a| a.mod_time).unwrap_or(0),
                    )
                };
                self.report_info(TXT_UPDATING_ATTRIBUTES, &display_path(&target_path))?;
                let stat = ItemStatReporter::new(1, 0, self.thread_idx, self.acb);
                if !equal_item_name(&target_name, &source_name) {
                    parallel::rename_item(
                        &**self.fs,
                        &target_path,
                        &parent_dir.join(&source_name),
                        guard,
                    )?;
                }
                stat.report_delta(1, 0)?;
                guard.pair().set_synced_link(
                    link,
                    target_side,
                    source_name,
                    target_mod_time,
                    source_mod_time,
                );
                stat.finish();
            }

            MoveLeftFrom | MoveRightFrom | MoveLeftTo | MoveRightTo | DoNothing | Equal
            | UnresolvedConflict => {
                debug_assert!(false);
                return Ok(());
            }
        }
        self.acb.interrupt().check()
    }

    //---- folder dispatch -----------------------------------------------

    fn synchronize_folder(&self, folder: FolderId) -> SyncResult<()> {
        let mut guard = PairGuard::new(self.pair_lock);
        self.synchronize_folder_with_guard(folder, &mut guard)
    }

    fn synchronize_folder_with_guard(
        &self,
        folder: FolderId,
        guard: &mut PairGuard,
    ) -> SyncResult<()> {
        let op = guard.pair().folder(folder).op;
        let Some(target_side) = op.target_side() else {
            return Ok(());
        };
        let source_side = target_side.other();
        use SyncOperation::*;
        match op {
            CreateNewLeft | CreateNewRight => {
                let (skip, target_path, source_path, source_name, followed_source) = {
                    let tree = guard.pair();
                    let skip = match tree.folder(folder).parent {
                        Some(parent) => !tree.folder_exists(parent, target_side),
                        None => false,
                    };
                    (
                        skip,
                        tree.folder_abs_path(folder, target_side),
                        tree.folder_abs_path(folder, source_side),
                        tree.folder_name(folder, source_side).to_string(),
                        tree.folder_attrs(folder, source_side)
                            .map(|a| a.is_followed_symlink)
                            .unwrap_or(false),
                    )
                };
                if skip {
                    return Ok(());
                }
                self.report_info(TXT_CREATING_FOLDER, &display_path(&target_path))?;

                // a shallow folder copy would not necessarily fail on a
                // missing source, so probe it explicitly
                if parallel::get_item_type_if_exists(&**self.fs, &source_path, guard)?.is_some() {
                    let stat = ItemStatReporter::new(1, 0, self.thread_idx, self.acb);
                    match parallel::copy_new_folder(
                        &**self.fs,
                        &source_path,
                        &target_path,
                        self.ctx.copy_file_permissions,
                        guard,
                    ) {
                        Ok(()) => {}
                        Err(SyncError::Interrupted) => return Err(SyncError::Interrupted),
                        Err(e) => {
                            // race with concurrent creation is fine
                            let folder_already_exists = matches!(
                                parallel::get_item_type(&**self.fs, &target_path, guard),
                                Ok(ItemType::Folder)
                            );
                            if !folder_already_exists {
                                return Err(e);
                            }
                        }
                    }
                    stat.report_delta(1, 0)?;
                    guard.pair().set_synced_folder(
                        folder,
                        target_side,
                        source_name,
                        false,
                        followed_source,
                    );
                    stat.finish();
                } else {
                    // source deleted meanwhile: close the whole subtree
                    let sub_stats = SyncStatistics::from_folder_subtree(guard.pair(), folder);
                    let stat = ItemStatReporter::new(
                        1 + sub_stats.cud(),
                        sub_stats.bytes_to_process(),
                        self.thread_idx,
                        self.acb,
                    );
                    stat.report_delta(1, 0)?;
                    self.report_info(TXT_SOURCE_NOT_FOUND, &display_path(&source_path))?;
                    let tree = guard.pair();
                    tree.clear_folder_subtree(folder);
                    tree.remove_folder_side(folder, source_side);
                    stat.finish();
                }
            }

            DeleteLeft | DeleteRight => {
                let (path, rel_path) = {
                    let tree = guard.pair();
                    (tree.folder_abs_path(folder, target_side), tree.folder_rel_path(folder))
                };
                let del = self.del_handler(target_side);
                self.report_info(del.txt_removing_folder(), &display_path(&path))?;

                let sub_stats = SyncStatistics::from_folder_subtree(guard.pair(), folder);
                let stat = ItemStatReporter::new(
                    1 + sub_stats.cud(),
                    sub_stats.bytes_to_process(),
                    self.thread_idx,
                    self.acb,
                );
                del.remove_dir_with_callback(&path, &rel_path, &stat, guard)?;
                let tree = guard.pair();
                tree.clear_folder_subtree(folder);
                tree.remove_folder_side(folder, target_side);
                stat.finish();
            }

            OverwriteLeft | OverwriteRight | CopyMetadataToLeft | CopyMetadataToRight => {
                let (target_path, parent_dir, source_name, target_name, followed_target, followed_source) = {
                    let tree = guard.pair();
                    (
                        tree.folder_abs_path(folder, target_side),
                        tree.container_dir_path(tree.folder_parent_container(folder), target_side),
                        tree.folder_name(folder, source_side).to_string(),
                        tree.folder_name(folder, target_side).to_string(),
                        tree.folder_attrs(folder, target_side)
                            .map(|a| a.is_followed_symlink)
                            .unwrap_or(false),
                        tree.folder_attrs(folder, source_side)
                            .map(|a| a.is_followed_symlink)
                            .unwrap_or(false),
                    )
                };
                self.report_info(TXT_UPDATING_ATTRIBUTES, &display_path(&target_path))?;
                let stat = ItemStatReporter::new(1, 0, self.thread_idx, self.acb);
                if !equal_item_name(&target_name, &source_name) {
                    parallel::rename_item(
                        &**self.fs,
                        &target_path,
                        &parent_dir.join(&source_name),
                        guard,
                    )?;
                }
                stat.report_delta(1, 0)?;
                guard.pair().set_synced_folder(
                    folder,
                    target_side,
                    source_name,
                    followed_target,
                    followed_source,
                );
                stat.finish();
            }

            MoveLeftFrom | MoveRightFrom | MoveLeftTo | MoveRightTo | DoNothing | Equal
            | UnresolvedConflict => {
                debug_assert!(false);
                return Ok(());
            }
        }
        self.acb.interrupt().check()
    }
}
