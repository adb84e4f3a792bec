//! Frontend progress contract.
//!
//! The engine talks to its frontend (GUI, CLI, tests) exclusively through
//! `ProcessCallback`. Methods returning `SyncResult` may cancel the run by
//! returning `SyncError::Interrupted` (or any other error).

use crate::errors::SyncResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    None,
    Scanning,
    Comparing,
    Synchronizing,
}

/// User decision after a reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    IgnoreError,
    Retry,
}

pub trait ProcessCallback {
    /// Announces the total workload of the phase that is about to start.
    fn init_new_phase(&mut self, items_total: i64, bytes_total: i64, phase: Phase);

    /// Progress deltas; must not fail.
    fn update_data_processed(&mut self, items_delta: i64, bytes_delta: i64);
    fn update_data_total(&mut self, items_delta: i64, bytes_delta: i64);

    fn report_status(&mut self, text: &str) -> SyncResult<()>;
    fn report_info(&mut self, text: &str) -> SyncResult<()>;
    fn log_info(&mut self, text: &str);

    /// `warning_active` is the suppress flag of this warning category; the
    /// frontend may clear it ("don't show this again").
    fn report_warning(&mut self, text: &str, warning_active: &mut bool) -> SyncResult<()>;

    /// Reports a retryable error; returns the user's decision.
    fn report_error(&mut self, text: &str, retry_number: usize) -> SyncResult<Response>;
    fn report_fatal_error(&mut self, text: &str);

    fn request_ui_refresh(&mut self) -> SyncResult<()>;
    fn force_ui_refresh(&mut self);
    fn abort_process_now(&mut self);
}
