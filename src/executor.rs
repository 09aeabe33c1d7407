// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The [`Executor`] trait (§4.5): runs a single op, or a batched group of
//! compatible ops, against a device. Model/script backends and tensor
//! storage are out of scope (§1) — this is the seam they plug in through.

use std::sync::Arc;

use crate::dag::DagRunInfo;

/// Runs ops against a device. Implementations write results/errors into the
/// `DagRunInfo` under its own mutex (via [`DagRunInfo::write_output`] /
/// [`DagRunInfo::mark_error`](crate::dag::DagRunInfo::mark_error)); the
/// compute itself should run with no queue or DAG lock held.
pub trait Executor: Send + Sync {
    /// Executes the current op for `device` against a single DAG.
    fn run_single(&self, rinfo: &Arc<DagRunInfo>, device: &str);

    /// Executes a group of compatible model ops as a single batched call,
    /// splitting results back out to each member's own `DagRunInfo`. Called
    /// only with `batch.len() > 1`; members are guaranteed (by the worker
    /// loop, via `DagInspector::batching_match`) to invoke the same model
    /// with matching non-batch dimensions.
    fn run_batched(&self, batch: &[Arc<DagRunInfo>], device: &str);
}
