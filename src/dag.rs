// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The DAG data model: ops, the context of computed tensors, and
//! [`DagRunInfo`] — the shared, mutex-guarded per-request state a
//! [`DagRunInfo`] threads through every device queue it touches.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Opaque tensor payload. The scheduler never looks inside this; only the
/// shape carried alongside it in [`ContextEntry`] is scheduler-visible, and
/// only so that batching math (§4.4's `op_batch_info`/`batching_match`) has
/// somewhere to read dimension sizes from.
pub type Tensor = std::sync::Arc<dyn Any + Send + Sync>;

/// An opaque handle to whatever blocked-client primitive the host store
/// uses. `None` means the client already detached before the DAG finished.
pub type ClientHandle = Box<dyn Any + Send + Sync>;

/// The kind of computation an [`Op`] performs. Only `Model` ops carry batch
/// parameters; `Script` and `TensorOp` ops always run unbatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Model,
    Script,
    TensorOp,
}

/// A single node of a client's submitted DAG, pinned to one device.
#[derive(Debug, Clone)]
pub struct Op {
    pub device: String,
    pub kind: OpKind,
    /// Symbolic context keys this op reads.
    pub inputs: Vec<String>,
    /// Symbolic context key this op writes on success.
    pub output: String,
    /// Model identifier, used by `batching_match` to group ops invoking the
    /// same model. Irrelevant for non-`Model` ops.
    pub model: Option<String>,
    /// 0 means "not batchable".
    pub batchsize: usize,
    /// 0 means "no minimum".
    pub minbatchsize: usize,
}

impl Op {
    /// Convenience constructor for a non-batchable op (script or tensor op).
    /// `device` is normalized to uppercase (§4.2), the same normalization
    /// `DeviceRegistry::ensure` applies, so an op's device always matches
    /// the `DeviceQueue` it ends up queued on.
    pub fn unbatched(device: impl Into<String>, kind: OpKind, inputs: Vec<String>, output: impl Into<String>) -> Op {
        Op {
            device: device.into().to_uppercase(),
            kind,
            inputs,
            output: output.into(),
            model: None,
            batchsize: 0,
            minbatchsize: 0,
        }
    }

    /// Convenience constructor for a batchable model invocation.
    pub fn model(
        device: impl Into<String>,
        model: impl Into<String>,
        inputs: Vec<String>,
        output: impl Into<String>,
        batchsize: usize,
        minbatchsize: usize,
    ) -> Op {
        Op {
            device: device.into().to_uppercase(),
            kind: OpKind::Model,
            inputs,
            output: output.into(),
            model: Some(model.into()),
            batchsize,
            minbatchsize,
        }
    }

    pub fn is_batchable(&self) -> bool {
        self.kind == OpKind::Model && self.batchsize > 0
    }
}

/// An ordered sequence of ops forming a client's submitted DAG.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    pub ops: Vec<Op>,
}

impl Dag {
    pub fn new(ops: Vec<Op>) -> Dag {
        Dag { ops }
    }

    /// The distinct, normalized device strings touched by this DAG, in the
    /// order they first appear.
    pub fn devices(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for op in &self.ops {
            if seen.insert(op.device.clone()) {
                out.push(op.device.clone());
            }
        }
        out
    }
}

/// A computed value in the DAG's context, together with enough shape
/// metadata to support batching. `shape[0]` is the batch dimension.
#[derive(Clone)]
pub struct ContextEntry {
    pub value: Tensor,
    pub shape: Vec<usize>,
}

impl ContextEntry {
    pub fn new(value: Tensor, shape: Vec<usize>) -> ContextEntry {
        ContextEntry { value, shape }
    }

    pub fn dim0(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }
}

/// Everything protected by `DagRunInfo::dag_mutex`.
pub(crate) struct Inner {
    pub(crate) context: HashMap<String, ContextEntry>,
    pub(crate) dag_error: bool,
    pub(crate) error_message: Option<String>,
    /// Devices that still have at least one unfinished op for this DAG.
    /// Its length *is* `dag_ref_count`; removal is the only mutation, which
    /// makes double-decrementing the same device impossible by construction.
    pub(crate) remaining_devices: HashSet<String>,
    pub(crate) client: Option<ClientHandle>,
}

/// The shared per-request state described in §3: the DAG, the computed
/// context, the DAG-wide error flag and reference count, and the client
/// handle — all behind a single mutex.
///
/// Lives as an `Arc<DagRunInfo>`: it is inserted into one device queue per
/// distinct device the DAG touches, and is dropped once every queue and the
/// unblock callback have released their clone. There is no separate "free"
/// step to get wrong; the obligation that matters is the *protocol* one —
/// exactly-once unblock — not memory management.
pub struct DagRunInfo {
    pub dag: Dag,
    pub(crate) inner: Mutex<Inner>,
}

impl DagRunInfo {
    /// Builds a `DagRunInfo` for a freshly submitted DAG.
    ///
    /// `literal_inputs` seeds the context with the request's literal
    /// arguments (e.g. a `tensorset` that's part of the same DAG but already
    /// has its value available at submission time).
    pub fn new(dag: Dag, literal_inputs: HashMap<String, ContextEntry>, client: Option<ClientHandle>) -> DagRunInfo {
        let remaining_devices: HashSet<String> = dag.devices().into_iter().collect();
        DagRunInfo {
            inner: Mutex::new(Inner {
                context: literal_inputs,
                dag_error: false,
                error_message: None,
                remaining_devices,
                client,
            }),
            dag,
        }
    }

    /// Writes an op's output into the context. Called by an `Executor` under
    /// `dag_mutex` after a successful run.
    pub fn write_output(&self, key: &str, entry: ContextEntry) {
        let mut inner = self.inner.lock().unwrap();
        log::debug!("dag context write: {}", key);
        inner.context.insert(key.to_string(), entry);
    }

    /// Marks the whole DAG as failed. Called by an `Executor` under
    /// `dag_mutex` after a failed run. Idempotent: the first failure across
    /// a batched group is the only one whose message sticks (§7).
    pub fn mark_error(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.dag_error {
            inner.dag_error = true;
            inner.error_message = Some(message.into());
        }
    }

    /// Reads a single context entry by key, if it has been produced yet.
    /// The primary way a host `Executor` implementation fetches an op's
    /// inputs before computing its output.
    pub fn context_entry(&self, key: &str) -> Option<ContextEntry> {
        self.inner.lock().unwrap().context.get(key).cloned()
    }

    /// Reads `(dag_error, dag_ref_count)` as of right now.
    pub(crate) fn error_and_ref_count(&self) -> (bool, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.dag_error, inner.remaining_devices.len())
    }

    /// This DAG's own `(dag_error, dag_complete)`, independent of whatever a
    /// sibling in the same executed batch did. The worker loop's per-member
    /// unblock decision must read this instead of the batch-wide outcome: a
    /// batch can mix a failing member with a successful one, and each must
    /// be judged on its own state.
    pub(crate) fn terminal_status(&self) -> (bool, bool) {
        let inner = self.inner.lock().unwrap();
        let complete = self.is_dag_complete(&inner);
        (inner.dag_error, complete)
    }

    /// Whether every op in the DAG has a result in the context. Independent
    /// of `dag_error`: on the error path this stays `false` even once
    /// `dag_ref_count` reaches zero, which is exactly how the worker loop
    /// distinguishes the success-unblock path from the error-unblock path.
    pub(crate) fn is_dag_complete(&self, inner: &Inner) -> bool {
        self.dag.ops.iter().all(|op| inner.context.contains_key(&op.output))
    }

    /// Takes the client handle, if any, leaving `None` behind. The worker
    /// loop calls this exactly once, at the point it has decided to unblock.
    pub(crate) fn take_client(&self) -> Option<ClientHandle> {
        self.inner.lock().unwrap().client.take()
    }

    pub fn dag_error(&self) -> bool {
        self.inner.lock().unwrap().dag_error
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.lock().unwrap().error_message.clone()
    }
}

impl std::fmt::Debug for DagRunInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagRunInfo")
            .field("ops", &self.dag.ops.len())
            .finish()
    }
}
