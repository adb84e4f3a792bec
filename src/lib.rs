//! Synchronization engine of a bidirectional folder-pair synchronizer.
//!
//! Takes a pre-computed comparison tree annotated with per-item sync
//! operations and executes them against the filesystem: three-pass
//! scheduling (move preparation, deletions, everything else), a
//! work-stealing worker pool behind a single per-pair mutex, transactional
//! copy with optional verification, and permanent / recycle-bin /
//! versioning deletion handling.

pub mod actor;
pub mod config;
pub mod db;
pub mod deletion;
pub mod errors;
pub mod file_ops;
pub mod hierarchy;
pub mod parallel;
pub mod power;
pub mod progress;
pub mod recycle;
pub mod stats;
pub mod sync_engine;
pub mod syncer;
pub mod versioning;
pub mod workload;

pub use config::{
    DeletionPolicy, DirectionVariant, FolderPairSyncCfg, SyncOptions, VersioningStyle, Warnings,
};
pub use errors::{SyncError, SyncResult};
pub use file_ops::{FileSystem, NativeFileSystem, TEMP_FILE_ENDING};
pub use hierarchy::{
    BaseFolderPair, ContainerRef, FileAttributes, FileId, FileSide, FolderAttributes, FolderId,
    FolderSide, LinkAttributes, LinkId, LinkSide, Side, SyncOperation,
};
pub use progress::{Phase, ProcessCallback, Response};
pub use stats::{minimum_disk_space_needed, significant_difference_detected, SyncStatistics};
pub use sync_engine::synchronize;
