// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Rust-level failures the scheduler itself can raise (§7 "registry
//! failure"). Execution failures on a DAG are *not* modeled here — those are
//! recorded on the `DagRunInfo` and surfaced once at unblock, per §7's
//! propagation policy, never as a `Result` out of the worker loop.

use std::io;

/// Failures that can occur while standing up or tearing down scheduler
/// infrastructure.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// `DeviceRegistry::ensure` failed to spawn a worker thread for a new
    /// device queue. The submission that triggered the `ensure` call must be
    /// rejected by the caller; the partially constructed queue is torn down
    /// before this error is returned.
    #[error("failed to spawn worker thread for device {device:?}: {source}")]
    WorkerSpawn { device: String, source: io::Error },

    /// The device string supplied to `submit`/`ensure` was empty.
    #[error("device string must be non-empty")]
    EmptyDevice,
}
