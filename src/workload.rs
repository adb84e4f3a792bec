//! Work distribution for one synchronization pass.
//!
//! Folder-level work items live in per-thread LIFO buckets; folders not yet
//! decomposed wait on a shared stack. An idle worker first expands pending
//! folders into its own bucket and otherwise steals every other item from
//! the largest bucket. The tree itself is only read under the pair lock
//! while expanding, so the item tree never needs to be thread-safe.

use parking_lot::{Condvar, Mutex};

use crate::actor::{interruptible_wait, AsyncCallback};
use crate::errors::SyncResult;
use crate::hierarchy::{BaseFolderPair, ContainerRef};
use crate::syncer::{folder_level_work_items, PassNo, WorkItem};

struct WorkState {
    buckets: Vec<Vec<WorkItem>>,
    folders_to_process: Vec<ContainerRef>,
    idle_threads: usize,
}

pub struct Workload {
    pass: PassNo,
    state: Mutex<WorkState>,
    new_work: Condvar,
}

impl Workload {
    pub fn new(pass: PassNo, thread_count: usize) -> Self {
        debug_assert!(thread_count > 0);
        Self {
            pass,
            state: Mutex::new(WorkState {
                buckets: vec![Vec::new(); thread_count],
                folders_to_process: vec![ContainerRef::Root],
                idle_threads: 0,
            }),
            new_work: Condvar::new(),
        }
    }

    pub fn add_folder_to_process(&self, folder: ContainerRef) {
        {
            let mut state = self.state.lock();
            state.folders_to_process.push(folder);
        }
        self.new_work.notify_all();
    }

    /// Wakes idle workers after the interruption flag was set.
    pub fn notify_interrupt(&self) {
        self.new_work.notify_all();
    }

    /// Blocking: returns the next work item for `thread_idx`. Ends with
    /// `Interrupted` once the pass is shut down.
    pub fn get_next(
        &self,
        thread_idx: usize,
        pair: &Mutex<BaseFolderPair>,
        acb: &AsyncCallback,
    ) -> SyncResult<WorkItem> {
        let mut state = self.state.lock();
        loop {
            loop {
                if let Some(item) = state.buckets[thread_idx].pop() {
                    return Ok(item);
                }
                if let Some(folder) = state.folders_to_process.pop() {
                    // expand outside the work lock; the tree is read under
                    // the pair lock (lock order: pair -> work, never both)
                    drop(state);
                    let (items, sub_folders) = {
                        let tree = pair.lock();
                        folder_level_work_items(self.pass, &tree, folder)
                    };
                    state = self.state.lock();
                    state.buckets[thread_idx].extend(items);
                    state.folders_to_process.extend(sub_folders);
                } else {
                    break;
                }
            }

            // steal every other item from the largest bucket
            let max_idx = (0..state.buckets.len())
                .max_by_key(|&i| state.buckets[i].len())
                .unwrap_or(thread_idx);
            if !state.buckets[max_idx].is_empty() && max_idx != thread_idx {
                let victim = std::mem::take(&mut state.buckets[max_idx]);
                let mut kept = Vec::with_capacity(victim.len() / 2);
                for (pos, item) in victim.into_iter().enumerate() {
                    if pos % 2 == 0 {
                        state.buckets[thread_idx].push(item);
                    } else {
                        kept.push(item);
                    }
                }
                state.buckets[max_idx] = kept;
                if let Some(item) = state.buckets[thread_idx].pop() {
                    return Ok(item);
                }
            }

            // idle: last one out signals the end of the pass
            state.idle_threads += 1;
            if state.idle_threads == state.buckets.len() {
                acb.notify_all_done();
            }
            acb.notify_work_end(thread_idx);
            let waited = interruptible_wait(&self.new_work, &mut state, acb.interrupt(), |s| {
                !s.folders_to_process.is_empty() || s.buckets.iter().any(|b| !b.is_empty())
            });
            state.idle_threads -= 1;
            acb.notify_work_begin(thread_idx);
            waited?;
        }
    }

    #[cfg(test)]
    pub(crate) fn bucket_len(&self, thread_idx: usize) -> usize {
        self.state.lock().buckets[thread_idx].len()
    }
}
