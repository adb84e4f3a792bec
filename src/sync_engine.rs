//! Synchronization driver.
//!
//! Validates all folder pairs up front (conflicts, disk space, recycle-bin
//! availability, overlapping base folders, versioning-folder placement),
//! then executes each pair through the three-pass syncer, cleans up the
//! deletion handlers and persists the last-synchronous state.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DeletionPolicy, FolderPairSyncCfg, SyncOptions, Warnings};
use crate::db;
use crate::deletion::DeletionHandler;
use crate::errors::{SyncError, SyncResult};
use crate::file_ops::{
    display_path, equal_abstract_path, is_null_path, path_dependency, path_root, FileSystem,
    ItemType,
};
use crate::hierarchy::{BaseFolderPair, Side};
use crate::power::{BackgroundPriority, PreventStandby};
use crate::progress::{Phase, ProcessCallback, Response};
use crate::stats::{
    minimum_disk_space_needed, significant_difference_detected, ConflictInfo, SyncStatistics,
};
use crate::syncer::{run_sync, SyncCtx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FolderPairJobType {
    Process,
    AlreadyInSync,
    Skip,
}

/// Main-thread retry wrapper around a fallible step; returns the ignored
/// error message, if any.
fn try_reporting_error_cb<T>(
    cb: &mut dyn ProcessCallback,
    mut op: impl FnMut() -> SyncResult<T>,
) -> SyncResult<Option<String>> {
    let mut retry_number = 0;
    loop {
        match op() {
            Ok(_) => return Ok(None),
            Err(SyncError::Interrupted) => return Err(SyncError::Interrupted),
            Err(e) => match cb.report_error(&e.to_string(), retry_number)? {
                Response::IgnoreError => return Ok(Some(e.to_string())),
                Response::Retry => retry_number += 1,
            },
        }
    }
}

/// Probes whether `path` is an existing folder without blocking the UI: the
/// probe runs on a helper thread while the caller keeps refreshing.
fn folder_status_non_blocking(
    fs: &Arc<dyn FileSystem>,
    path: &Path,
    timeout: Duration,
    cb: &mut dyn ProcessCallback,
) -> SyncResult<bool> {
    let (tx, rx) = std::sync::mpsc::channel();
    let probe_fs = fs.clone();
    let probe_path = path.to_path_buf();
    std::thread::spawn(move || {
        let _ = tx.send(probe_fs.get_item_type_if_exists(&probe_path));
    });

    let deadline = std::time::Instant::now() + timeout;
    loop {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(result) => return Ok(matches!(result?, Some(ItemType::Folder))),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                cb.request_ui_refresh()?;
                if std::time::Instant::now() >= deadline {
                    return Err(SyncError::Timeout(display_path(path)));
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                return Err(SyncError::Other(format!(
                    "Folder status check failed for {}",
                    path.display()
                )))
            }
        }
    }
}

/// Detects a base folder that disappeared after comparison. Returns `true`
/// if the pair has to be skipped.
fn base_folder_drop(
    fs: &Arc<dyn FileSystem>,
    pair: &BaseFolderPair,
    side: Side,
    timeout: Duration,
    cb: &mut dyn ProcessCallback,
) -> SyncResult<bool> {
    let folder_path = pair.base_path(side).to_path_buf();
    if is_null_path(&folder_path) || !pair.is_available(side) {
        return Ok(false);
    }
    let mut retry_number = 0;
    loop {
        match folder_status_non_blocking(fs, &folder_path, timeout, cb) {
            Ok(true) => return Ok(false),
            Ok(false) => {
                let msg = format!("Cannot find folder {}.", display_path(&folder_path));
                match cb.report_error(&msg, retry_number)? {
                    Response::IgnoreError => return Ok(true),
                    Response::Retry => retry_number += 1,
                }
            }
            Err(SyncError::Interrupted) => return Err(SyncError::Interrupted),
            Err(e) => match cb.report_error(&e.to_string(), retry_number)? {
                Response::IgnoreError => return Ok(true),
                Response::Retry => retry_number += 1,
            },
        }
    }
}

/// Creates a missing base folder. Returns `false` on a fatal condition that
/// skips the pair.
fn create_base_folder(
    fs: &Arc<dyn FileSystem>,
    pair: &mut BaseFolderPair,
    side: Side,
    timeout: Duration,
    cb: &mut dyn ProcessCallback,
) -> SyncResult<bool> {
    let path = pair.base_path(side).to_path_buf();
    if is_null_path(&path) || pair.is_available(side) {
        return Ok(true);
    }
    let mut retry_number = 0;
    loop {
        match folder_status_non_blocking(fs, &path, timeout, cb) {
            Ok(false) => match fs.create_folder_if_missing_recursion(&path) {
                Ok(()) => {
                    pair.set_available(side, true);
                    return Ok(true);
                }
                Err(e) => match cb.report_error(&e.to_string(), retry_number)? {
                    Response::IgnoreError => return Ok(false),
                    Response::Retry => retry_number += 1,
                },
            },
            Ok(true) => {
                // base folder not found during comparison but existing now:
                // a temporary network drop made the sync directions stale
                cb.report_fatal_error(&format!(
                    "Target folder {} already existing.",
                    display_path(&path)
                ));
                return Ok(false);
            }
            Err(SyncError::Interrupted) => return Err(SyncError::Interrupted),
            Err(e) => match cb.report_error(&e.to_string(), retry_number)? {
                Response::IgnoreError => return Ok(false),
                Response::Retry => retry_number += 1,
            },
        }
    }
}

fn cleanup_gracefully(
    handler: &DeletionHandler,
    cb: &mut dyn ProcessCallback,
) -> SyncResult<()> {
    let mut retry_number = 0;
    loop {
        match handler.try_cleanup(cb, true) {
            Ok(()) => return Ok(()),
            Err(SyncError::Interrupted) => return Err(SyncError::Interrupted),
            Err(e) => match cb.report_error(&e.to_string(), retry_number)? {
                Response::IgnoreError => return Ok(()),
                Response::Retry => retry_number += 1,
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn execute_folder_pair(
    fs: &Arc<dyn FileSystem>,
    pair: &mut BaseFolderPair,
    cfg: &FolderPairSyncCfg,
    options: &SyncOptions,
    job: FolderPairJobType,
    recycler_supported: &HashMap<PathBuf, bool>,
    device_parallel_ops: &HashMap<PathBuf, usize>,
    timestamp: &str,
    errors_mod_time: &Mutex<Vec<String>>,
    callback: &mut dyn ProcessCallback,
) -> SyncResult<()> {
    if job == FolderPairJobType::Process {
        // copy permissions only if asked for and supported by both sides
        let mut copy_permissions = false;
        if options.copy_file_permissions
            && !is_null_path(&pair.left_path)
            && !is_null_path(&pair.right_path)
        {
            let mut retry_number = 0;
            loop {
                match fs.support_permission_copy(&pair.left_path, &pair.right_path) {
                    Ok(supported) => {
                        copy_permissions = supported;
                        break;
                    }
                    Err(SyncError::Interrupted) => return Err(SyncError::Interrupted),
                    Err(e) => match callback.report_error(&e.to_string(), retry_number)? {
                        Response::IgnoreError => break,
                        Response::Retry => retry_number += 1,
                    },
                }
            }
        }

        // downgrade to permanent deletion where the recycle bin is missing
        let effective_policy = |base: &Path| -> DeletionPolicy {
            if cfg.handle_deletion == DeletionPolicy::Recycler {
                if let Some(false) = recycler_supported.get(base) {
                    return DeletionPolicy::Permanent;
                }
            }
            cfg.handle_deletion
        };

        let del_handler_left = DeletionHandler::new(
            fs.clone(),
            pair.left_path.clone(),
            effective_policy(&pair.left_path),
            cfg.versioning_folder.clone(),
            cfg.versioning_style,
            timestamp.to_string(),
        );
        let del_handler_right = DeletionHandler::new(
            fs.clone(),
            pair.right_path.clone(),
            effective_policy(&pair.right_path),
            cfg.versioning_folder.clone(),
            cfg.versioning_style,
            timestamp.to_string(),
        );

        let parallel_ops = |path: &Path| -> usize {
            device_parallel_ops
                .get(&path_root(path))
                .copied()
                .unwrap_or(1)
                .max(1)
        };
        let thread_count = parallel_ops(&pair.left_path).max(parallel_ops(&pair.right_path));

        let ctx = SyncCtx {
            verify_copied_files: options.verify_copied_files,
            copy_file_permissions: copy_permissions,
            fail_safe_file_copy: options.fail_safe_file_copy,
            errors_mod_time,
            del_handling_left: &del_handler_left,
            del_handling_right: &del_handler_right,
            thread_count,
        };

        let mut pair_result = run_sync(&ctx, fs, pair, callback);
        // items that lost both sides are dropped in any case
        pair.remove_empty();

        if pair_result.is_ok() {
            pair_result = cleanup_gracefully(&del_handler_left, callback)
                .and_then(|_| cleanup_gracefully(&del_handler_right, callback));
        }
        if let Err(e) = pair_result {
            // best effort on the failure path: cleanup without user
            // interaction, then still try to capture the sync state
            let _ = del_handler_left.try_cleanup(callback, false);
            let _ = del_handler_right.try_cleanup(callback, false);
            if cfg.save_sync_db {
                let _ = db::save_last_synchronous_state(pair, &mut |_| Ok(()));
            }
            return Err(e);
        }
    }

    if cfg.save_sync_db {
        let save_result = (|| -> SyncResult<()> {
            callback.report_status("Generating database...")?;
            callback.force_ui_refresh();
            let mut retry_number = 0;
            loop {
                let result =
                    db::save_last_synchronous_state(pair, &mut |msg| callback.report_status(msg));
                match result {
                    Ok(()) => return Ok(()),
                    Err(SyncError::Interrupted) => return Err(SyncError::Interrupted),
                    Err(e) => match callback.report_error(&e.to_string(), retry_number)? {
                        Response::IgnoreError => return Ok(()),
                        Response::Retry => retry_number += 1,
                    },
                }
            }
        })();
        if let Err(e) = save_result {
            // user cancelled mid-save: still attempt to write the database
            let _ = db::save_last_synchronous_state(pair, &mut |_| Ok(()));
            return Err(e);
        }
    }
    Ok(())
}

/// Executes the synchronization described by `folder_cmp` and `sync_config`.
#[allow(clippy::too_many_arguments)]
pub fn synchronize(
    sync_start_time: DateTime<Local>,
    options: &SyncOptions,
    sync_config: &[FolderPairSyncCfg],
    folder_cmp: &mut [BaseFolderPair],
    device_parallel_ops: &HashMap<PathBuf, usize>,
    warnings: &mut Warnings,
    fs: Arc<dyn FileSystem>,
    callback: &mut dyn ProcessCallback,
) -> SyncResult<()> {
    if sync_config.len() != folder_cmp.len() {
        return Err(SyncError::ContractViolation(format!(
            "folder pair configuration mismatch: {} configs, {} pairs",
            sync_config.len(),
            folder_cmp.len()
        )));
    }

    // aggregate the workload and announce the phase before anything else
    let folder_pair_stats: Vec<SyncStatistics> = folder_cmp
        .iter()
        .map(SyncStatistics::from_base_folder)
        .collect();
    {
        let items_total: i64 = folder_pair_stats.iter().map(|s| s.cud()).sum();
        let bytes_total: i64 = folder_pair_stats.iter().map(|s| s.bytes_to_process()).sum();
        callback.init_new_phase(items_total, bytes_total, Phase::Synchronizing);
    }

    let _background_priority = if options.run_with_background_priority {
        match BackgroundPriority::new() {
            Ok(guard) => Some(guard),
            Err(e) => {
                callback.report_info(&e.to_string())?;
                None
            }
        }
    } else {
        None
    };
    let _no_standby = match PreventStandby::new() {
        Ok(guard) => Some(guard),
        Err(e) => {
            callback.report_info(&e.to_string())?;
            None
        }
    };

    //---- basic checks for all pairs before starting the sync -----------

    let mut job_types = vec![FolderPairJobType::Process; folder_cmp.len()];
    let mut unresolved_conflicts: Vec<ConflictInfo> = Vec::new();
    let mut read_write_check_base_folders: Vec<(PathBuf, bool)> = Vec::new();
    let mut significant_diff_pairs: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut disk_space_missing: Vec<(PathBuf, (i64, u64))> = Vec::new();
    let mut recycler_supported: HashMap<PathBuf, bool> = HashMap::new();
    let mut ver_check_versioning_paths: BTreeSet<PathBuf> = BTreeSet::new();
    let mut ver_check_base_paths: Vec<PathBuf> = Vec::new();

    for (index, pair) in folder_cmp.iter().enumerate() {
        let cfg = &sync_config[index];
        let stats = &folder_pair_stats[index];

        unresolved_conflicts.extend_from_slice(stats.conflicts());

        // exclude pathological cases, e.g. both sides empty
        if equal_abstract_path(&pair.left_path, &pair.right_path) {
            job_types[index] = FolderPairJobType::Skip;
            continue;
        }

        if stats.cud() == 0 {
            job_types[index] = FolderPairJobType::AlreadyInSync;
            continue;
        }

        let write_left = stats.create_count_side(Side::Left)
            + stats.update_count_side(Side::Left)
            + stats.delete_count_side(Side::Left)
            > 0;
        let write_right = stats.create_count_side(Side::Right)
            + stats.update_count_side(Side::Right)
            + stats.delete_count_side(Side::Right)
            > 0;

        // an empty folder field makes sense only as pure source
        if (is_null_path(&pair.left_path) && (write_left || cfg.save_sync_db))
            || (is_null_path(&pair.right_path) && (write_right || cfg.save_sync_db))
        {
            callback.report_fatal_error("Target folder input field must not be empty.");
            job_types[index] = FolderPairJobType::Skip;
            continue;
        }

        // check for network drops after comparison: early failure beats a
        // wall of copy errors
        if base_folder_drop(&fs, pair, Side::Left, options.folder_access_timeout, callback)?
            || base_folder_drop(&fs, pair, Side::Right, options.folder_access_timeout, callback)?
        {
            job_types[index] = FolderPairJobType::Skip;
            continue;
        }

        // deletions are only propagated from a null or existing source
        let mut source_missing = false;
        for side in [Side::Left, Side::Right] {
            let base = pair.base_path(side);
            if !is_null_path(base) && stats.delete_count() > 0 && !pair.is_available(side) {
                callback
                    .report_fatal_error(&format!("Source folder {} not found.", display_path(base)));
                source_missing = true;
                break;
            }
        }
        if source_missing {
            job_types[index] = FolderPairJobType::Skip;
            continue;
        }

        if cfg.handle_deletion == DeletionPolicy::Versioning {
            if is_null_path(&cfg.versioning_folder) {
                callback.report_fatal_error("Please enter a target folder for versioning.");
                job_types[index] = FolderPairJobType::Skip;
                continue;
            }
            ver_check_versioning_paths.insert(cfg.versioning_folder.clone());
            ver_check_base_paths.push(pair.left_path.clone());
            ver_check_base_paths.push(pair.right_path.clone());
        }

        read_write_check_base_folders.push((pair.left_path.clone(), write_left));
        read_write_check_base_folders.push((pair.right_path.clone(), write_right));

        if !is_null_path(&pair.left_path)
            && !is_null_path(&pair.right_path)
            && significant_difference_detected(stats)
        {
            significant_diff_pairs.push((pair.left_path.clone(), pair.right_path.clone()));
        }

        // free disk space; 0 means "not available" and is not a warning
        let (needed_left, needed_right) = minimum_disk_space_needed(pair);
        for (base, needed) in [(&pair.left_path, needed_left), (&pair.right_path, needed_right)] {
            if is_null_path(base) {
                continue;
            }
            if let Ok(free) = fs.get_free_disk_space(base) {
                if free > 0 && (free as i64) < needed {
                    disk_space_missing.push((base.clone(), (needed, free)));
                }
            }
        }

        // recycle bin existence, only for folders that will actually delete
        if cfg.handle_deletion == DeletionPolicy::Recycler {
            for side in [Side::Left, Side::Right] {
                let base = pair.base_path(side).to_path_buf();
                if is_null_path(&base)
                    || !stats.expect_physical_deletion(side)
                    || recycler_supported.contains_key(&base)
                {
                    continue;
                }
                callback.report_status(&format!(
                    "Checking recycle bin availability for folder {}...",
                    display_path(&base)
                ))?;
                callback.request_ui_refresh()?;
                let mut supported = false;
                try_reporting_error_cb(callback, || {
                    supported = fs.supports_recycle_bin(&base, &mut || Ok(()))?;
                    Ok(())
                })?;
                recycler_supported.insert(base, supported);
            }
        }
    }

    //---- batched warnings ----------------------------------------------

    if !unresolved_conflicts.is_empty() {
        let mut msg = String::from(
            "The following items have unresolved conflicts and will not be synchronized:",
        );
        for conflict in &unresolved_conflicts {
            msg += &format!("\n\n{}: {}", conflict.rel_path.display(), conflict.msg);
        }
        callback.report_warning(&msg, &mut warnings.warn_unresolved_conflicts)?;
    }

    if !significant_diff_pairs.is_empty() {
        let mut msg = String::from(
            "The following folders are significantly different. \
             Please check that the correct folders are selected for synchronization.",
        );
        for (left, right) in &significant_diff_pairs {
            msg += &format!("\n\n{} <-> \n{}", display_path(left), display_path(right));
        }
        callback.report_warning(&msg, &mut warnings.warn_significant_difference)?;
    }

    if !disk_space_missing.is_empty() {
        let mut msg = String::from("Not enough free disk space available in:");
        for (path, (needed, available)) in &disk_space_missing {
            msg += &format!(
                "\n\n{}\nRequired: {} bytes\nAvailable: {} bytes",
                display_path(path),
                needed,
                available
            );
        }
        callback.report_warning(&msg, &mut warnings.warn_not_enough_disk_space)?;
    }

    {
        let mut msg = String::new();
        let mut unsupported: Vec<&PathBuf> = recycler_supported
            .iter()
            .filter(|(_, supported)| !**supported)
            .map(|(path, _)| path)
            .collect();
        unsupported.sort();
        for path in unsupported {
            msg += &format!("\n{}", display_path(path));
        }
        if !msg.is_empty() {
            callback.report_warning(
                &format!(
                    "The recycle bin is not supported by the following folders. \
                     Deleted or overwritten files will not be able to be restored:\n{}",
                    msg
                ),
                &mut warnings.warn_recycler_missing,
            )?;
        }
    }

    // race condition: multiple accesses of which at least one is a write
    {
        let mut dependent_folders: BTreeSet<PathBuf> = BTreeSet::new();
        for (i, (path_i, write_i)) in read_write_check_base_folders.iter().enumerate() {
            if !*write_i || is_null_path(path_i) {
                continue;
            }
            for (j, (path_j, write_j)) in read_write_check_base_folders.iter().enumerate() {
                if i == j || is_null_path(path_j) {
                    continue;
                }
                if !*write_j || i < j {
                    if let Some(dependency) = path_dependency(path_i, path_j) {
                        dependent_folders.insert(dependency.base_path_parent);
                        dependent_folders.insert(dependency.base_path_child);
                    }
                }
            }
        }
        if !dependent_folders.is_empty() {
            let mut msg = String::from(
                "Some files will be synchronized as part of multiple base folders.\n\
                 To avoid conflicts, set up exclude filters so that each updated file is \
                 considered by only one base folder.\n",
            );
            for path in &dependent_folders {
                msg += &format!("\n{}", display_path(path));
            }
            callback.report_warning(&msg, &mut warnings.warn_dependent_base_folders)?;
        }
    }

    // versioning folder inside one of the base folders
    {
        let mut msg = String::new();
        for versioning_path in &ver_check_versioning_paths {
            let mut unique_lines: BTreeMap<PathBuf, String> = BTreeMap::new();
            for base in &ver_check_base_paths {
                if is_null_path(base) {
                    continue;
                }
                if let Some(dependency) = path_dependency(versioning_path, base) {
                    let mut line = format!(
                        "\n\nVersioning folder: {}\nBase folder: {}",
                        display_path(versioning_path),
                        display_path(base)
                    );
                    if equal_abstract_path(&dependency.base_path_parent, base)
                        && !dependency.rel_path.as_os_str().is_empty()
                    {
                        line += &format!("\nExclude: /{}/", dependency.rel_path.display());
                    }
                    unique_lines.insert(base.clone(), line);
                }
            }
            for line in unique_lines.values() {
                msg += line;
            }
        }
        if !msg.is_empty() {
            callback.report_warning(
                &format!(
                    "The versioning folder is contained in a base folder.\n\
                     The folder should be excluded from synchronization via filter.{}",
                    msg
                ),
                &mut warnings.warn_versioning_folder_part_of_sync,
            )?;
        }
    }

    //---- execute -------------------------------------------------------

    let errors_mod_time: Mutex<Vec<String>> = Mutex::new(Vec::new());
    let timestamp = sync_start_time.format("%Y-%m-%d %H%M%S").to_string();

    let run_result = (|| -> SyncResult<()> {
        for (index, pair) in folder_cmp.iter_mut().enumerate() {
            let cfg = &sync_config[index];
            let stats = &folder_pair_stats[index];

            if job_types[index] == FolderPairJobType::Skip {
                continue;
            }

            callback.report_info(&format!(
                "Synchronizing folder pair: {}\n    {}\n    {}",
                cfg.direction_variant.display_name(),
                display_path(&pair.left_path),
                display_path(&pair.right_path)
            ))?;

            // a long time may have passed since the pre-flight checks
            if base_folder_drop(&fs, pair, Side::Left, options.folder_access_timeout, callback)?
                || base_folder_drop(&fs, pair, Side::Right, options.folder_access_timeout, callback)?
            {
                continue;
            }

            // create missing base folders when something will be written
            if stats.create_count() > 0 || cfg.save_sync_db {
                if !create_base_folder(&fs, pair, Side::Left, options.folder_access_timeout, callback)?
                    || !create_base_folder(
                        &fs,
                        pair,
                        Side::Right,
                        options.folder_access_timeout,
                        callback,
                    )?
                {
                    continue;
                }
            }

            execute_folder_pair(
                &fs,
                pair,
                cfg,
                options,
                job_types[index],
                &recycler_supported,
                device_parallel_ops,
                &timestamp,
                &errors_mod_time,
                callback,
            )?;
        }

        // mod-time failures are a single aggregated warning, not errors
        let mod_time_errors = {
            let mut guard = errors_mod_time.lock();
            std::mem::take(&mut *guard)
        };
        if !mod_time_errors.is_empty() {
            callback.report_warning(
                &mod_time_errors.join("\n\n"),
                &mut warnings.warn_modification_time_error,
            )?;
        }
        Ok(())
    })();

    match run_result {
        Ok(()) => Ok(()),
        Err(SyncError::Interrupted) => Err(SyncError::Interrupted),
        Err(e) => {
            callback.report_fatal_error(&e.to_string());
            callback.abort_process_now();
            Err(SyncError::ContractViolation(e.to_string()))
        }
    }
}
