// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A per-device background execution scheduler for DAGs of tensor
//! operations.
//!
//! A client submits a [`dag::Dag`] — an ordered sequence of ops, each pinned
//! to a device — wrapped in a [`dag::DagRunInfo`]. The [`scheduler::Scheduler`]
//! enqueues it onto one [`device_queue::DeviceQueue`] per distinct device the
//! DAG touches; each queue's worker pool independently walks its FIFO,
//! opportunistically batching compatible ops bound for the same device, and
//! calls back into the host-supplied [`executor::Executor`] to actually run
//! them. The host's [`inspector::DagInspector`] implementation is the sole
//! authority on what "ready", "batchable", and "done" mean for a given DAG;
//! the worker loop never inspects a DAG's ops directly.

pub mod dag;
pub mod device_queue;
pub mod error;
pub mod executor;
pub mod inspector;
pub mod queue;
mod registry;
pub mod scheduler;
mod worker;

pub use dag::{ClientHandle, ContextEntry, Dag, DagRunInfo, Op, OpKind, Tensor};
pub use error::SchedulerError;
pub use executor::Executor;
pub use inspector::{BatchMatch, CurrentOpInfo, DagInspector, DefaultInspector, OpBatchInfo};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use worker::UnblockFn;
