// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The [`DagInspector`] trait (§4.4): pure queries a [`crate::worker`]
//! scheduling round uses to decide what's runnable, what's batchable, and
//! when a device (or the whole DAG) is done.
//!
//! Implemented as a trait, invoked uniformly by the worker loop, the same
//! seam shape as the teacher's `Dispatch` trait being invoked uniformly by
//! `Replica` — one place defines "what does it mean to run this", the
//! combiner/worker never needs to know the concrete data structure.

use crate::dag::DagRunInfo;

/// Result of `current_op_and_info`: everything the selection walk needs to
/// know about a DAG's progress on one device.
#[derive(Debug, Clone, Copy)]
pub struct CurrentOpInfo {
    /// Index into `dag.ops` of the earliest pending op for this device, if
    /// any remains.
    pub op_index: Option<usize>,
    pub ready: bool,
    pub batchable: bool,
    pub device_complete: bool,
    pub dag_complete: bool,
}

/// Result of `op_batch_info`.
#[derive(Debug, Clone, Copy)]
pub struct OpBatchInfo {
    pub batchsize: usize,
    pub minbatchsize: usize,
    pub inbatchsize: usize,
}

/// Result of `batching_match`.
#[derive(Debug, Clone, Copy)]
pub struct BatchMatch {
    pub compatible: bool,
    pub added_batchsize: usize,
}

/// Queries over a [`DagRunInfo`] relative to one device. See §4.4.
pub trait DagInspector: Send + Sync {
    fn current_op_and_info(&self, rinfo: &DagRunInfo, device: &str) -> CurrentOpInfo;

    fn op_batch_info(&self, rinfo: &DagRunInfo, op_index: usize) -> OpBatchInfo;

    fn batching_match(
        &self,
        rinfo_a: &DagRunInfo,
        op_a: usize,
        rinfo_b: &DagRunInfo,
        op_b: usize,
    ) -> BatchMatch;

    /// Removes `device` from the set of devices still holding work for
    /// `rinfo`, returning the new `dag_ref_count`. The *only* place
    /// `dag_ref_count` is mutated; called exactly once per device, from the
    /// worker loop's "device-complete bookkeeping" step.
    fn complete_device(&self, rinfo: &DagRunInfo, device: &str) -> usize;
}

/// The default, spec-faithful [`DagInspector`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultInspector;

impl DagInspector for DefaultInspector {
    fn current_op_and_info(&self, rinfo: &DagRunInfo, device: &str) -> CurrentOpInfo {
        let inner = rinfo.inner.lock().unwrap();

        if inner.dag_error {
            return CurrentOpInfo {
                op_index: None,
                ready: false,
                batchable: false,
                device_complete: true,
                dag_complete: rinfo.is_dag_complete(&inner),
            };
        }

        let op_index = rinfo
            .dag
            .ops
            .iter()
            .position(|op| op.device == device && !inner.context.contains_key(&op.output));

        let dag_complete = rinfo.is_dag_complete(&inner);

        match op_index {
            None => CurrentOpInfo {
                op_index: None,
                ready: false,
                batchable: false,
                device_complete: true,
                dag_complete,
            },
            Some(idx) => {
                let op = &rinfo.dag.ops[idx];
                let ready = op.inputs.iter().all(|k| inner.context.contains_key(k));
                CurrentOpInfo {
                    op_index: Some(idx),
                    ready,
                    batchable: op.is_batchable(),
                    device_complete: false,
                    dag_complete,
                }
            }
        }
    }

    fn op_batch_info(&self, rinfo: &DagRunInfo, op_index: usize) -> OpBatchInfo {
        let op = &rinfo.dag.ops[op_index];
        let inner = rinfo.inner.lock().unwrap();
        let inbatchsize = op
            .inputs
            .first()
            .and_then(|k| inner.context.get(k))
            .map(|e| e.dim0())
            .unwrap_or(0);
        OpBatchInfo {
            batchsize: op.batchsize,
            minbatchsize: op.minbatchsize,
            inbatchsize,
        }
    }

    fn batching_match(
        &self,
        rinfo_a: &DagRunInfo,
        op_a: usize,
        rinfo_b: &DagRunInfo,
        op_b: usize,
    ) -> BatchMatch {
        let op_a_def = rinfo_a.dag.ops[op_a].clone();
        let op_b_def = rinfo_b.dag.ops[op_b].clone();

        let (shape_a, dim0_a) = {
            let inner = rinfo_a.inner.lock().unwrap();
            match op_a_def.inputs.first().and_then(|k| inner.context.get(k)) {
                Some(e) => (e.shape.clone(), e.dim0()),
                None => (Vec::new(), 0),
            }
        };
        let (shape_b, dim0_b) = {
            let inner = rinfo_b.inner.lock().unwrap();
            match op_b_def.inputs.first().and_then(|k| inner.context.get(k)) {
                Some(e) => (e.shape.clone(), e.dim0()),
                None => (Vec::new(), 0),
            }
        };

        let same_model = op_a_def.model.is_some() && op_a_def.model == op_b_def.model;
        let non_batch_dims_match = shape_a.len() == shape_b.len() && shape_a[1..] == shape_b[1..];

        BatchMatch {
            compatible: same_model && non_batch_dims_match,
            added_batchsize: dim0_b,
        }
    }

    fn complete_device(&self, rinfo: &DagRunInfo, device: &str) -> usize {
        let mut inner = rinfo.inner.lock().unwrap();
        inner.remaining_devices.remove(device);
        let remaining = inner.remaining_devices.len();
        log::debug!("device {} done for dag, {} device(s) remaining", device, remaining);
        remaining
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dag::{ContextEntry, Dag, DagRunInfo, Op, OpKind};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn entry(dim0: usize, rest: &[usize]) -> ContextEntry {
        let mut shape = vec![dim0];
        shape.extend_from_slice(rest);
        ContextEntry::new(Arc::new(0u8), shape)
    }

    #[test]
    fn current_op_reports_earliest_pending_for_device() {
        let dag = Dag::new(vec![
            Op::unbatched("CPU", OpKind::TensorOp, vec![], "t"),
            Op::model("GPU:0", "m", vec!["t".into()], "y", 8, 0),
        ]);
        let rinfo = DagRunInfo::new(dag, HashMap::new(), None);
        let inspector = DefaultInspector;

        let info = inspector.current_op_and_info(&rinfo, "CPU");
        assert_eq!(info.op_index, Some(0));
        assert!(info.ready);
        assert!(!info.device_complete);

        let info = inspector.current_op_and_info(&rinfo, "GPU:0");
        assert_eq!(info.op_index, Some(1));
        assert!(!info.ready); // t not produced yet
    }

    #[test]
    fn device_complete_once_no_pending_op_remains() {
        let dag = Dag::new(vec![Op::unbatched("CPU", OpKind::TensorOp, vec![], "t")]);
        let mut ctx = HashMap::new();
        ctx.insert("t".to_string(), entry(1, &[]));
        let rinfo = DagRunInfo::new(dag, ctx, None);
        let inspector = DefaultInspector;

        let info = inspector.current_op_and_info(&rinfo, "CPU");
        assert!(info.device_complete);
        assert!(info.dag_complete);
    }

    #[test]
    fn dag_error_forces_device_complete() {
        let dag = Dag::new(vec![Op::unbatched("CPU", OpKind::TensorOp, vec![], "t")]);
        let rinfo = DagRunInfo::new(dag, HashMap::new(), None);
        rinfo.mark_error("boom");
        let inspector = DefaultInspector;

        let info = inspector.current_op_and_info(&rinfo, "CPU");
        assert!(info.device_complete);
        assert!(!info.dag_complete);
    }

    #[test]
    fn batching_match_requires_same_model_and_shape() {
        let dag_a = Dag::new(vec![Op::model("GPU:0", "m", vec!["x".into()], "y", 8, 0)]);
        let dag_b = Dag::new(vec![Op::model("GPU:0", "m", vec!["x".into()], "y", 8, 0)]);
        let dag_c = Dag::new(vec![Op::model("GPU:0", "other", vec!["x".into()], "y", 8, 0)]);

        let mut ctx_a = HashMap::new();
        ctx_a.insert("x".to_string(), entry(2, &[4]));
        let mut ctx_b = HashMap::new();
        ctx_b.insert("x".to_string(), entry(3, &[4]));
        let mut ctx_c = HashMap::new();
        ctx_c.insert("x".to_string(), entry(3, &[4]));

        let a = DagRunInfo::new(dag_a, ctx_a, None);
        let b = DagRunInfo::new(dag_b, ctx_b, None);
        let c = DagRunInfo::new(dag_c, ctx_c, None);

        let inspector = DefaultInspector;
        let m = inspector.batching_match(&a, 0, &b, 0);
        assert!(m.compatible);
        assert_eq!(m.added_batchsize, 3);

        let m = inspector.batching_match(&a, 0, &c, 0);
        assert!(!m.compatible);
    }

    #[test]
    fn complete_device_decrements_ref_count_exactly_once() {
        let dag = Dag::new(vec![
            Op::unbatched("CPU", OpKind::TensorOp, vec![], "t"),
            Op::model("GPU:0", "m", vec!["t".into()], "y", 8, 0),
        ]);
        let rinfo = DagRunInfo::new(dag, HashMap::new(), None);
        let inspector = DefaultInspector;

        assert_eq!(inspector.complete_device(&rinfo, "CPU"), 1);
        // Removing an already-absent device is a no-op, not a second decrement.
        assert_eq!(inspector.complete_device(&rinfo, "CPU"), 1);
        assert_eq!(inspector.complete_device(&rinfo, "GPU:0"), 0);
    }
}
