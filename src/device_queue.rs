// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! [`DeviceQueue`] (§4.3): one [`Queue`] behind a `Mutex`+`Condvar`, plus the
//! `threads_per_queue` worker threads bound to it.
//!
//! §5 specifies OS-level preemptive threads that block on a per-queue
//! condition variable when idle — `std::sync::{Mutex, Condvar}` is exactly
//! that, and is used directly rather than through the teacher's lock-free
//! `QLock`/combiner machinery, which solves a different problem (a no_std
//! NUMA replication log with no blocking primitive available at all).

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::dag::DagRunInfo;
use crate::error::SchedulerError;
use crate::queue::Queue;
use crate::worker::{self, WorkerContext};

pub(crate) struct QueueState {
    pub(crate) queue: Queue<Arc<DagRunInfo>>,
    pub(crate) shutdown: bool,
}

/// A per-device FIFO with its own worker pool. Created on first reference to
/// a device string by [`crate::registry::DeviceRegistry::ensure`] and lives
/// until process shutdown.
pub struct DeviceQueue {
    pub(crate) device: String,
    pub(crate) state: Mutex<QueueState>,
    pub(crate) cond: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceQueue {
    /// Creates a `DeviceQueue` and spawns `threads_per_queue` workers bound
    /// to it. On spawn failure, the partially constructed queue (and any
    /// threads already spawned) is torn down and the error propagated, per
    /// §4.2.
    pub(crate) fn new(
        device: String,
        threads_per_queue: usize,
        ctx: Arc<WorkerContext>,
    ) -> Result<Arc<DeviceQueue>, SchedulerError> {
        let dq = Arc::new(DeviceQueue {
            device: device.clone(),
            state: Mutex::new(QueueState {
                queue: Queue::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
            workers: Mutex::new(Vec::with_capacity(threads_per_queue)),
        });

        let mut handles = Vec::with_capacity(threads_per_queue);
        for worker_idx in 0..threads_per_queue {
            let dq_clone = dq.clone();
            let ctx_clone = ctx.clone();
            let spawn_result = thread::Builder::new()
                .name(format!("dagsched-{}-{}", device, worker_idx))
                .spawn(move || worker::run_worker(dq_clone, ctx_clone));

            match spawn_result {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    // Tear down: tell any already-spawned workers to exit
                    // and join them before surfacing the failure.
                    dq.shutdown();
                    for h in handles {
                        let _ = h.join();
                    }
                    return Err(SchedulerError::WorkerSpawn { device, source });
                }
            }
        }

        *dq.workers.lock().unwrap() = handles;
        log::debug!("device queue {} started with {} workers", dq.device, threads_per_queue);
        Ok(dq)
    }

    /// External submitters' enqueue protocol (§4.3): lock, push back, signal,
    /// unlock.
    pub(crate) fn submit(&self, rinfo: Arc<DagRunInfo>) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(rinfo);
        self.cond.notify_one();
    }

    /// Sets the shutdown flag and wakes every worker so it can observe it
    /// and exit. Idempotent.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        drop(state);
        self.cond.notify_all();
    }

    /// Signals shutdown and joins every worker thread. Called once, from
    /// `DeviceRegistry::shutdown`.
    pub(crate) fn join(&self) {
        self.shutdown();
        let mut workers = self.workers.lock().unwrap();
        for h in workers.drain(..) {
            let _ = h.join();
        }
    }
}

impl std::fmt::Debug for DeviceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceQueue").field("device", &self.device).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::inspector::DefaultInspector;
    use crate::worker::WorkerContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopExecutor;
    impl crate::executor::Executor for NoopExecutor {
        fn run_single(&self, _rinfo: &Arc<DagRunInfo>, _device: &str) {}
        fn run_batched(&self, _batch: &[Arc<DagRunInfo>], _device: &str) {}
    }

    #[test]
    fn new_spawns_requested_worker_count() {
        let unblocked = Arc::new(AtomicUsize::new(0));
        let unblocked_clone = unblocked.clone();
        let ctx = Arc::new(WorkerContext {
            inspector: Arc::new(DefaultInspector),
            executor: Arc::new(NoopExecutor),
            unblock: Arc::new(move |_client, _rinfo| {
                unblocked_clone.fetch_add(1, Ordering::SeqCst);
            }),
            retry_sleep: std::time::Duration::from_millis(1),
        });

        let dq = DeviceQueue::new("CPU".to_string(), 3, ctx).expect("spawn should succeed");
        assert_eq!(dq.workers.lock().unwrap().len(), 3);
        dq.join();
    }
}
