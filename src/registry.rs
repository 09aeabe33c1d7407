// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! [`DeviceRegistry`] (§4.2): the map from device string to its
//! [`DeviceQueue`], created lazily on first reference.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::device_queue::DeviceQueue;
use crate::error::SchedulerError;
use crate::worker::WorkerContext;

/// Owns every device queue the scheduler has ever created. Device strings
/// are normalized to uppercase before lookup/insertion, so `"gpu:0"` and
/// `"GPU:0"` share a queue.
#[derive(Default)]
pub(crate) struct DeviceRegistry {
    queues: Mutex<HashMap<String, Arc<DeviceQueue>>>,
}

impl DeviceRegistry {
    pub(crate) fn new() -> DeviceRegistry {
        DeviceRegistry {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the `DeviceQueue` for `device`, creating it (and spawning its
    /// worker threads) on first reference. Locks the registry mutex only
    /// long enough to look up or insert; it is released before any worker
    /// thread runs.
    pub(crate) fn ensure(
        &self,
        device: &str,
        threads_per_queue: usize,
        ctx: Arc<WorkerContext>,
    ) -> Result<Arc<DeviceQueue>, SchedulerError> {
        if device.is_empty() {
            return Err(SchedulerError::EmptyDevice);
        }
        let normalized = device.to_uppercase();

        let mut queues = self.queues.lock().unwrap();
        if let Some(existing) = queues.get(&normalized) {
            return Ok(existing.clone());
        }

        let dq = DeviceQueue::new(normalized.clone(), threads_per_queue, ctx)?;
        queues.insert(normalized, dq.clone());
        Ok(dq)
    }

    /// Joins every device queue's workers. Called once, from
    /// `Scheduler::shutdown`.
    pub(crate) fn shutdown(&self) {
        let queues = self.queues.lock().unwrap();
        for dq in queues.values() {
            dq.join();
        }
    }
}
