//! Configuration types consumed by the synchronization driver.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How removed items are disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicy {
    /// Delete permanently.
    Permanent,
    /// Collect in a per-base-folder session and flush to the recycle bin.
    Recycler,
    /// Move into a timestamped versioning folder.
    Versioning,
}

/// Naming scheme used by the versioning folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersioningStyle {
    /// Keep a single revision per relative path.
    Replace,
    /// Append the sync start timestamp to each revision.
    AddTimestamp,
}

/// Overall direction model the comparison was configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionVariant {
    TwoWay,
    Mirror,
    Update,
    Custom,
}

impl DirectionVariant {
    pub fn display_name(self) -> &'static str {
        match self {
            DirectionVariant::TwoWay => "Two way",
            DirectionVariant::Mirror => "Mirror",
            DirectionVariant::Update => "Update",
            DirectionVariant::Custom => "Custom",
        }
    }
}

/// Per-folder-pair synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderPairSyncCfg {
    pub detect_moved_files: bool,
    pub handle_deletion: DeletionPolicy,
    pub versioning_style: VersioningStyle,
    /// Target folder for `DeletionPolicy::Versioning`; empty means unset.
    pub versioning_folder: PathBuf,
    pub direction_variant: DirectionVariant,
    /// Persist the last-synchronous state database after the pair completes.
    pub save_sync_db: bool,
}

/// Global flags for one synchronization run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub verify_copied_files: bool,
    pub copy_locked_files: bool,
    pub copy_file_permissions: bool,
    pub fail_safe_file_copy: bool,
    pub run_with_background_priority: bool,
    /// Timeout for base-folder availability probes.
    pub folder_access_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            verify_copied_files: false,
            copy_locked_files: false,
            copy_file_permissions: false,
            fail_safe_file_copy: true,
            run_with_background_priority: false,
            folder_access_timeout: Duration::from_secs(20),
        }
    }
}

/// Warning toggles; a flag set to `false` suppresses the matching dialog.
#[derive(Debug, Clone)]
pub struct Warnings {
    pub warn_unresolved_conflicts: bool,
    pub warn_significant_difference: bool,
    pub warn_not_enough_disk_space: bool,
    pub warn_recycler_missing: bool,
    pub warn_dependent_base_folders: bool,
    pub warn_versioning_folder_part_of_sync: bool,
    pub warn_modification_time_error: bool,
}

impl Default for Warnings {
    fn default() -> Self {
        Self {
            warn_unresolved_conflicts: true,
            warn_significant_difference: true,
            warn_not_enough_disk_space: true,
            warn_recycler_missing: true,
            warn_dependent_base_folders: true,
            warn_versioning_folder_part_of_sync: true,
            warn_modification_time_error: true,
        }
    }
}
