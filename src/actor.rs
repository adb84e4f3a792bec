//! Coordination between worker threads and the main thread.
//!
//! Workers never touch the frontend callback directly: status text, log
//! lines and error dialogs are funneled through a single request slot that
//! the main thread drains in `wait_until_done`. Statistics deltas bypass the
//! slot entirely via lock-free atomics.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use crate::errors::{SyncError, SyncResult};
use crate::progress::{ProcessCallback, Response};

/// Granularity of interruptible condition waits.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Cooperative cancellation flag shared by all workers of one pass.
#[derive(Debug, Default)]
pub struct InterruptFlag(AtomicBool);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> SyncResult<()> {
        if self.is_set() {
            Err(SyncError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Waits on `cond` until `done` holds, polling the interruption flag.
pub(crate) fn interruptible_wait<T>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    interrupt: &InterruptFlag,
    mut done: impl FnMut(&T) -> bool,
) -> SyncResult<()> {
    loop {
        interrupt.check()?;
        if done(&**guard) {
            return Ok(());
        }
        cond.wait_for(guard, WAIT_SLICE);
    }
}

#[derive(Debug, Clone)]
struct ErrorInfo {
    msg: String,
    retry_number: usize,
}

#[derive(Debug, Default)]
struct Requests {
    error_request: Option<ErrorInfo>,
    error_response: Option<Response>,
    log_info_request: Option<String>,
    finish_now: bool,
}

#[derive(Debug, Default, Clone)]
struct ThreadStatus {
    active: bool,
    status_msg: String,
}

pub struct AsyncCallback {
    request: Mutex<Requests>,
    ready_for_new_request: Condvar,
    new_request: Condvar,
    have_response: Condvar,

    // separate lock: status updates must not stall on an open error dialog
    status: Mutex<Vec<ThreadStatus>>,
    total_thread_count: usize,

    items_delta_processed: AtomicI64,
    bytes_delta_processed: AtomicI64,
    items_delta_total: AtomicI64,
    bytes_delta_total: AtomicI64,

    interrupt: InterruptFlag,
}

impl AsyncCallback {
    pub fn new(thread_count: usize) -> Self {
        Self {
            request: Mutex::new(Requests::default()),
            ready_for_new_request: Condvar::new(),
            new_request: Condvar::new(),
            have_response: Condvar::new(),
            status: Mutex::new(vec![ThreadStatus::default(); thread_count]),
            total_thread_count: thread_count,
            items_delta_processed: AtomicI64::new(0),
            bytes_delta_processed: AtomicI64::new(0),
            items_delta_total: AtomicI64::new(0),
            bytes_delta_total: AtomicI64::new(0),
            interrupt: InterruptFlag::new(),
        }
    }

    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }

    /// Wakes every blocked waiter after the interruption flag was set.
    pub fn notify_interrupt(&self) {
        self.ready_for_new_request.notify_all();
        self.new_request.notify_all();
        self.have_response.notify_all();
    }

    //---- worker side ---------------------------------------------------

    /// Non-blocking statistics update.
    pub fn update_data_processed(&self, items_delta: i64, bytes_delta: i64) {
        self.items_delta_processed.fetch_add(items_delta, Ordering::Relaxed);
        self.bytes_delta_processed.fetch_add(bytes_delta, Ordering::Relaxed);
    }

    pub fn update_data_total(&self, items_delta: i64, bytes_delta: i64) {
        self.items_delta_total.fetch_add(items_delta, Ordering::Relaxed);
        self.bytes_delta_total.fetch_add(bytes_delta, Ordering::Relaxed);
    }

    pub fn report_status(&self, msg: &str, thread_idx: usize) -> SyncResult<()> {
        {
            let mut status = self.status.lock();
            status[thread_idx].status_msg = msg.to_string();
        }
        self.interrupt.check()
    }

    /// Blocking: publishes one log line for the main thread to forward.
    pub fn log_info(&self, msg: &str, thread_idx: usize) -> SyncResult<()> {
        let mut req = self.request.lock();
        interruptible_wait(&self.ready_for_new_request, &mut req, &self.interrupt, |r| {
            r.log_info_request.is_none()
        })?;
        req.log_info_request = Some(self.prefixed(msg, thread_idx));
        drop(req);
        self.new_request.notify_all();
        Ok(())
    }

    pub fn report_info(&self, msg: &str, thread_idx: usize) -> SyncResult<()> {
        self.report_status(msg, thread_idx)?;
        self.log_info(msg, thread_idx)
    }

    /// Blocking: publishes an error and waits for the user's decision. At
    /// most one error dialog is outstanding at any time.
    pub fn report_error(
        &self,
        msg: &str,
        retry_number: usize,
        thread_idx: usize,
    ) -> SyncResult<Response> {
        let mut req = self.request.lock();
        interruptible_wait(&self.ready_for_new_request, &mut req, &self.interrupt, |r| {
            r.error_request.is_none() && r.error_response.is_none()
        })?;
        req.error_request = Some(ErrorInfo {
            msg: self.prefixed(msg, thread_idx),
            retry_number,
        });
        self.new_request.notify_all();

        interruptible_wait(&self.have_response, &mut req, &self.interrupt, |r| {
            r.error_response.is_some()
        })?;
        let response = req.error_response.take();
        req.error_request = None;
        drop(req);
        self.ready_for_new_request.notify_all();
        response.ok_or(SyncError::Interrupted)
    }

    pub fn notify_work_begin(&self, thread_idx: usize) {
        let mut status = self.status.lock();
        status[thread_idx].active = true;
    }

    pub fn notify_work_end(&self, thread_idx: usize) {
        let mut status = self.status.lock();
        status[thread_idx].active = false;
        status[thread_idx].status_msg.clear();
    }

    /// Called by the scheduler when every worker has gone idle.
    pub fn notify_all_done(&self) {
        let mut req = self.request.lock();
        req.finish_now = true;
        drop(req);
        self.new_request.notify_all();
    }

    fn prefixed(&self, msg: &str, thread_idx: usize) -> String {
        if self.total_thread_count > 1 {
            format!("[{}] {}", thread_idx + 1, msg)
        } else {
            msg.to_string()
        }
    }

    //---- main-thread side ----------------------------------------------

    pub fn current_status(&self) -> String {
        let status = self.status.lock();
        let mut active_count = 0;
        let mut msg = String::new();
        for ts in status.iter() {
            if ts.active {
                active_count += 1;
                if msg.is_empty() {
                    msg = ts.status_msg.clone();
                }
            }
        }
        if active_count >= 2 {
            format!("[{} threads] {}", active_count, msg)
        } else {
            msg
        }
    }

    /// Flushes accumulated statistics deltas into the frontend callback.
    pub fn report_stats(&self, cb: &mut dyn ProcessCallback) {
        let items = self.items_delta_processed.load(Ordering::Relaxed);
        let bytes = self.bytes_delta_processed.load(Ordering::Relaxed);
        if items != 0 || bytes != 0 {
            // subtract what we saw; concurrent additions are preserved
            self.items_delta_processed.fetch_sub(items, Ordering::Relaxed);
            self.bytes_delta_processed.fetch_sub(bytes, Ordering::Relaxed);
            cb.update_data_processed(items, bytes);
        }
        let items = self.items_delta_total.load(Ordering::Relaxed);
        let bytes = self.bytes_delta_total.load(Ordering::Relaxed);
        if items != 0 || bytes != 0 {
            self.items_delta_total.fetch_sub(items, Ordering::Relaxed);
            self.bytes_delta_total.fetch_sub(bytes, Ordering::Relaxed);
            cb.update_data_total(items, bytes);
        }
    }

    /// Main-thread loop: drains error/log/finish requests, forwards status
    /// and statistics every `tick_interval` until all workers are done.
    pub fn wait_until_done(
        &self,
        tick_interval: Duration,
        cb: &mut dyn ProcessCallback,
    ) -> SyncResult<()> {
        loop {
            let deadline = Instant::now() + tick_interval;
            {
                let mut req = self.request.lock();
                // process all requests without delay until the tick expires
                loop {
                    let pending = (req.error_request.is_some() && req.error_response.is_none())
                        || req.log_info_request.is_some()
                        || req.finish_now;
                    if !pending {
                        if self.new_request.wait_until(&mut req, deadline).timed_out() {
                            break;
                        }
                        continue;
                    }

                    if let Some(error) = req.error_request.clone() {
                        if req.error_response.is_none() {
                            let response = cb.report_error(&error.msg, error.retry_number)?;
                            req.error_response = Some(response);
                            self.have_response.notify_all();
                        }
                    }
                    if let Some(msg) = req.log_info_request.take() {
                        cb.log_info(&msg);
                        self.ready_for_new_request.notify_all();
                    }
                    if req.finish_now {
                        drop(req);
                        self.report_stats(cb);
                        return Ok(());
                    }
                }
            }
            cb.report_status(&self.current_status())?;
            self.report_stats(cb);
        }
    }
}

/// Statistics reporting for a single item of work. Tracks the deltas
/// actually reported against the expected amount and reconciles the totals
/// when the scope closes: a completed item adjusts the total by the
/// difference, a failed one re-adds everything it reported.
pub struct ItemStatReporter<'a> {
    items_expected: i64,
    bytes_expected: i64,
    items_reported: Cell<i64>,
    bytes_reported: Cell<i64>,
    completed: Cell<bool>,
    thread_idx: usize,
    acb: &'a AsyncCallback,
}

impl<'a> ItemStatReporter<'a> {
    pub fn new(
        items_expected: i64,
        bytes_expected: i64,
        thread_idx: usize,
        acb: &'a AsyncCallback,
    ) -> Self {
        Self {
            items_expected,
            bytes_expected,
            items_reported: Cell::new(0),
            bytes_reported: Cell::new(0),
            completed: Cell::new(false),
            thread_idx,
            acb,
        }
    }

    pub fn report_status(&self, msg: &str) -> SyncResult<()> {
        self.acb.report_status(msg, self.thread_idx)
    }

    pub fn report_delta(&self, items_delta: i64, bytes_delta: i64) -> SyncResult<()> {
        self.acb.update_data_processed(items_delta, bytes_delta);
        self.items_reported.set(self.items_reported.get() + items_delta);
        self.bytes_reported.set(self.bytes_reported.get() + bytes_delta);

        // whatever exceeds the expected amount grows the total right away,
        // so the progress display never overshoots 100%
        if self.items_reported.get() > self.items_expected {
            self.acb
                .update_data_total(self.items_reported.get() - self.items_expected, 0);
            self.items_reported.set(self.items_expected);
        }
        if self.bytes_reported.get() > self.bytes_expected {
            self.acb
                .update_data_total(0, self.bytes_reported.get() - self.bytes_expected);
            self.bytes_reported.set(self.bytes_expected);
        }
        self.acb.interrupt().check()
    }

    /// Marks the item as successfully processed.
    pub fn finish(&self) {
        self.completed.set(true);
    }
}

impl Drop for ItemStatReporter<'_> {
    fn drop(&mut self) {
        if self.completed.get() {
            self.acb.update_data_total(
                self.items_reported.get() - self.items_expected,
                self.bytes_reported.get() - self.bytes_expected,
            );
        } else {
            // the expected work did not happen: re-add reported amounts
            self.acb
                .update_data_total(self.items_reported.get(), self.bytes_reported.get());
        }
    }
}

/// Universal per-item error boundary: runs `op`, routing failures through
/// the actor's error channel until the user retries or ignores. Returns the
/// ignored error message, if any.
pub fn try_reporting_error<T>(
    thread_idx: usize,
    acb: &AsyncCallback,
    mut op: impl FnMut() -> SyncResult<T>,
) -> SyncResult<Option<String>> {
    let mut retry_number = 0;
    loop {
        match op() {
            Ok(_) => return Ok(None),
            Err(SyncError::Interrupted) => return Err(SyncError::Interrupted),
            Err(e) => match acb.report_error(&e.to_string(), retry_number, thread_idx)? {
                Response::IgnoreError => return Ok(Some(e.to_string())),
                Response::Retry => retry_number += 1,
            },
        }
    }
}
