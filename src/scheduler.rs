// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! [`Scheduler`] (§6): the public facade. Wires a [`DagInspector`] and
//! [`Executor`] supplied by the host into a [`DeviceRegistry`], and exposes
//! `submit`/`shutdown`.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use crate::dag::DagRunInfo;
use crate::error::SchedulerError;
use crate::executor::Executor;
use crate::inspector::DagInspector;
use crate::registry::DeviceRegistry;
use crate::worker::{UnblockFn, WorkerContext};

/// Tunables the host supplies at construction (§1A). Both fields have
/// sensible defaults for the common case of one worker per device and the
/// 1ms retry backoff §4.7 specifies.
#[derive(Clone)]
pub struct SchedulerConfig {
    pub threads_per_queue: NonZeroUsize,
    pub retry_sleep: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> SchedulerConfig {
        SchedulerConfig {
            threads_per_queue: NonZeroUsize::new(1).unwrap(),
            retry_sleep: Duration::from_millis(1),
        }
    }
}

/// The top-level scheduler: one per process (or per independent runtime
/// instance under test). Cheap to clone — everything it holds is behind an
/// `Arc` internally via `DeviceRegistry`/`WorkerContext`.
pub struct Scheduler {
    registry: DeviceRegistry,
    ctx: Arc<WorkerContext>,
    threads_per_queue: usize,
}

impl Scheduler {
    /// Builds a scheduler around host-supplied `inspector`/`executor`/
    /// `unblock` collaborators (§6).
    pub fn new(
        config: SchedulerConfig,
        inspector: Arc<dyn DagInspector>,
        executor: Arc<dyn Executor>,
        unblock: Arc<UnblockFn>,
    ) -> Scheduler {
        let ctx = Arc::new(WorkerContext {
            inspector,
            executor,
            unblock,
            retry_sleep: config.retry_sleep,
        });
        Scheduler {
            registry: DeviceRegistry::new(),
            ctx,
            threads_per_queue: config.threads_per_queue.get(),
        }
    }

    /// Submits a DAG for execution (§6): ensures a queue exists for every
    /// device the DAG touches, then enqueues `rinfo` onto each. A DAG
    /// touching N devices is submitted to N queues; each queue independently
    /// drives it to completion via the shared `dag_ref_count`.
    ///
    /// `rinfo`'s `dag_ref_count` already covers every device at construction
    /// time, so every `ensure` must succeed before any queue sees `rinfo` —
    /// otherwise a failure partway through would leave an earlier device
    /// holding a live submission while a later device's slot in
    /// `dag_ref_count` can never be decremented, and the DAG never unblocks.
    pub fn submit(&self, rinfo: Arc<DagRunInfo>) -> Result<(), SchedulerError> {
        let devices = rinfo.dag.devices();
        let mut queues = Vec::with_capacity(devices.len());
        for device in &devices {
            queues.push(self.registry.ensure(device, self.threads_per_queue, self.ctx.clone())?);
        }
        for queue in queues {
            queue.submit(rinfo.clone());
        }
        Ok(())
    }

    /// Shuts down every device queue's workers and joins them. Blocks until
    /// every worker thread has exited.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}
