// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The worker loop (§4.7) — the core scheduling algorithm. Each worker
//! thread spawned by a [`crate::device_queue::DeviceQueue`] runs
//! [`run_worker`] until shutdown.
//!
//! The shape — peek ahead at pending work, collect a compatible batch,
//! release the lock, run once, fan results back out — is the same shape as
//! the teacher's `Replica::combine` flat-combining round (`replica.rs`).
//! Where the teacher combines *everything* pending from *every* registered
//! thread unconditionally, this worker only ever combines the subset that
//! passes `batching_match`/`minbatchsize`/`batchsize`, per §4.7's
//! opportunistic, compatibility-gated batching — the generalization the
//! spec requires in place of the teacher's unconditional combine.

use std::sync::{Arc, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::dag::{ClientHandle, DagRunInfo};
use crate::device_queue::{DeviceQueue, QueueState};
use crate::executor::Executor;
use crate::inspector::DagInspector;
use crate::queue::{NodeHandle, Queue};

/// Host callback invoked exactly once per `DagRunInfo` with a non-null
/// client (§4.6). Receives ownership of the client handle and the
/// `DagRunInfo`; disposes of both.
pub type UnblockFn = dyn Fn(ClientHandle, Arc<DagRunInfo>) + Send + Sync;

/// Everything a worker thread needs besides its own `DeviceQueue`: the
/// collaborators supplied by the host (§6).
pub struct WorkerContext {
    pub inspector: Arc<dyn DagInspector>,
    pub executor: Arc<dyn Executor>,
    pub unblock: Arc<UnblockFn>,
    /// How long to sleep on a retry against an otherwise-empty queue (§4.7).
    /// The distilled spec pins this at 1ms; exposed here so tests aren't
    /// forced to actually wait on it.
    pub retry_sleep: Duration,
}

/// What the selection walk decided to do with the node(s) it picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectedOutcome {
    /// `dag_complete` was true for the head: no op remains anywhere in the
    /// DAG. Candidate for client unblock once `dag_ref_count` hits zero.
    Unblock,
    /// `device_complete` was true for the head: no pending op remains on
    /// this device (possibly because `dag_error` forced it).
    DeviceComplete,
    /// The head's current op exists but isn't ready yet.
    Retry,
    /// One or more ready, mutually compatible ops to actually execute.
    Run,
}

/// Outcome of a single scheduling round, for the outer loop in
/// [`run_worker`].
enum RoundOutcome {
    /// Some node was evicted and handled.
    Progressed,
    /// The walk exhausted the queue (via the minbatchsize "advance head"
    /// fallback) without finding anything to do. The worker should go back
    /// to waiting on the condition variable even though the queue may still
    /// be non-empty (§4.7: "release mutex and return from the round to
    /// step 1").
    NoCandidate,
}

/// The main per-worker loop (§4.7, outer structure). Blocks on `dq.cond`
/// when idle; exits cleanly once `dq`'s shutdown flag is observed.
pub(crate) fn run_worker(dq: Arc<DeviceQueue>, ctx: Arc<WorkerContext>) {
    let mut state = dq.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }
        if state.queue.is_empty() {
            state = dq.cond.wait(state).unwrap();
            continue;
        }

        let (new_state, outcome) = run_one_round(&dq, state, &ctx);
        state = new_state;

        if matches!(outcome, RoundOutcome::NoCandidate) {
            if state.shutdown {
                return;
            }
            state = dq.cond.wait(state).unwrap();
        }
    }
}

/// Runs exactly one scheduling round, per §4.7. Takes and returns ownership
/// of the queue-state lock because execution happens with the lock released.
fn run_one_round<'a>(
    dq: &'a DeviceQueue,
    mut state: MutexGuard<'a, QueueState>,
    ctx: &WorkerContext,
) -> (MutexGuard<'a, QueueState>, RoundOutcome) {
    let device = dq.device.clone();

    let selection = select(&state.queue, ctx.inspector.as_ref(), &device);
    let (handles, outcome) = match selection {
        None => return (state, RoundOutcome::NoCandidate),
        Some(found) => found,
    };

    // Evict every node in the batch, still under the queue mutex. The
    // worker now exclusively owns these nodes.
    let batch: Vec<Arc<DagRunInfo>> = handles.iter().map(|h| state.queue.evict(*h)).collect();

    // Execute with the queue mutex released; compute is unlocked.
    drop(state);
    if let SelectedOutcome::Run = outcome {
        if batch.len() > 1 {
            log::debug!("running batch of {} ops on {}", batch.len(), device);
            ctx.executor.run_batched(&batch, &device);
        } else {
            ctx.executor.run_single(&batch[0], &device);
        }
    }
    // OR across the whole batch, not just the last member (§9's resolved
    // open question), so one failing member's error is never masked by a
    // later member's success.
    let run_error = matches!(outcome, SelectedOutcome::Run) && batch.iter().any(|r| r.dag_error());

    let mut state = dq.state.lock().unwrap();

    match outcome {
        SelectedOutcome::Retry => {
            debug_assert_eq!(batch.len(), 1);
            let head = batch.into_iter().next().unwrap();
            if let Some(next_handle) = state.queue.front() {
                let next_item = state.queue.evict(next_handle);
                state.queue.push_front(head);
                state.queue.push_front(next_item);
                log::debug!("retry-swap on {}: head yields to next item", device);
            } else {
                state.queue.push_front(head);
                drop(state);
                thread::sleep(ctx.retry_sleep);
                state = dq.state.lock().unwrap();
            }
        }
        SelectedOutcome::Run if !run_error => {
            // Push every member back to the front in reverse order, so the
            // original head remains the head.
            for rinfo in batch.into_iter().rev() {
                state.queue.push_front(rinfo);
            }
        }
        // DeviceComplete, Unblock, and Run-with-error all need this
        // device's bookkeeping decrement. A node handled here is never
        // re-queued: it is terminally done for this device.
        //
        // `outcome` is a batch-wide classification (one `run_batched` call
        // can mix a failing member with a successful sibling), so it must
        // not decide any individual member's unblock. Each rinfo is judged
        // on its own terminal state instead.
        _ => {
            for rinfo in batch {
                let remaining = ctx.inspector.complete_device(&rinfo, &device);
                let (has_error, is_complete) = rinfo.terminal_status();
                let should_unblock = remaining == 0 && (has_error || is_complete);
                if should_unblock {
                    if let Some(client) = rinfo.take_client() {
                        log::debug!("unblocking client, error={}", has_error);
                        (ctx.unblock)(client, rinfo);
                    }
                }
            }
        }
    }

    (state, RoundOutcome::Progressed)
}

/// The selection walk (§4.7): finds the next batch of work to run, or
/// decides the head isn't runnable yet, or gives up entirely if no head
/// (including advanced ones) can make progress.
fn select(
    queue: &Queue<Arc<DagRunInfo>>,
    inspector: &dyn DagInspector,
    device: &str,
) -> Option<(Vec<NodeHandle>, SelectedOutcome)> {
    let mut candidate = queue.front();

    while let Some(item) = candidate {
        let rinfo = queue.get(item);
        let info = inspector.current_op_and_info(rinfo, device);

        if info.dag_complete {
            return Some((vec![item], SelectedOutcome::Unblock));
        }
        if info.device_complete {
            return Some((vec![item], SelectedOutcome::DeviceComplete));
        }
        if !info.ready {
            return Some((vec![item], SelectedOutcome::Retry));
        }
        if !info.batchable {
            return Some((vec![item], SelectedOutcome::Run));
        }

        let op_index = info.op_index.expect("ready+batchable implies a current op");
        let batch_info = inspector.op_batch_info(rinfo, op_index);
        if batch_info.inbatchsize == 0 || batch_info.inbatchsize >= batch_info.batchsize {
            return Some((vec![item], SelectedOutcome::Run));
        }

        let mut batch = vec![item];
        let mut running_total = batch_info.inbatchsize;
        let mut cursor = queue.next(item);

        while let Some(candidate_node) = cursor {
            let candidate_rinfo = queue.get(candidate_node);
            let candidate_info = inspector.current_op_and_info(candidate_rinfo, device);

            if candidate_info.ready && candidate_info.batchable {
                if let Some(candidate_op_index) = candidate_info.op_index {
                    let m = inspector.batching_match(rinfo, op_index, candidate_rinfo, candidate_op_index);
                    if m.compatible {
                        if running_total + m.added_batchsize <= batch_info.batchsize {
                            batch.push(candidate_node);
                            running_total += m.added_batchsize;
                            cursor = queue.next(candidate_node);
                            continue;
                        } else {
                            // First node that would overflow batchsize: stop scanning.
                            break;
                        }
                    }
                }
            }
            cursor = queue.next(candidate_node);
        }

        if batch_info.minbatchsize == 0 || running_total >= batch_info.minbatchsize {
            return Some((batch, SelectedOutcome::Run));
        }

        // Couldn't meet minbatchsize starting at this head; try the next
        // item as a new head, discarding this batch attempt entirely.
        candidate = queue.next(item);
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dag::{ContextEntry, Dag, Op, OpKind};
    use crate::inspector::DefaultInspector;
    use std::collections::HashMap;

    fn entry(dim0: usize) -> ContextEntry {
        ContextEntry::new(Arc::new(0u8), vec![dim0, 4])
    }

    fn single_op_dag(device: &str) -> DagRunInfo {
        let dag = Dag::new(vec![Op::unbatched(device, OpKind::TensorOp, vec![], "out")]);
        DagRunInfo::new(dag, HashMap::new(), None)
    }

    #[test]
    fn select_finds_ready_unbatchable_op_as_run() {
        let mut q: Queue<Arc<DagRunInfo>> = Queue::new();
        q.push_back(Arc::new(single_op_dag("CPU")));
        let inspector = DefaultInspector;

        let (batch, outcome) = select(&q, &inspector, "CPU").unwrap();
        assert_eq!(batch.len(), 1);
        assert!(matches!(outcome, SelectedOutcome::Run));
    }

    #[test]
    fn select_retries_when_not_ready() {
        let dag = Dag::new(vec![Op::unbatched("CPU", OpKind::TensorOp, vec!["missing".into()], "out")]);
        let rinfo = Arc::new(DagRunInfo::new(dag, HashMap::new(), None));
        let mut q: Queue<Arc<DagRunInfo>> = Queue::new();
        q.push_back(rinfo);
        let inspector = DefaultInspector;

        let (batch, outcome) = select(&q, &inspector, "CPU").unwrap();
        assert_eq!(batch.len(), 1);
        assert!(matches!(outcome, SelectedOutcome::Retry));
    }

    #[test]
    fn select_batches_compatible_model_ops() {
        let dag_a = Dag::new(vec![Op::model("GPU:0", "m", vec!["x".into()], "y", 8, 0)]);
        let dag_b = Dag::new(vec![Op::model("GPU:0", "m", vec!["x".into()], "y", 8, 0)]);

        let mut ctx_a = HashMap::new();
        ctx_a.insert("x".to_string(), entry(2));
        let mut ctx_b = HashMap::new();
        ctx_b.insert("x".to_string(), entry(3));

        let a = Arc::new(DagRunInfo::new(dag_a, ctx_a, None));
        let b = Arc::new(DagRunInfo::new(dag_b, ctx_b, None));

        let mut q: Queue<Arc<DagRunInfo>> = Queue::new();
        q.push_back(a);
        q.push_back(b);

        let inspector = DefaultInspector;
        let (batch, outcome) = select(&q, &inspector, "GPU:0").unwrap();
        assert_eq!(batch.len(), 2);
        assert!(matches!(outcome, SelectedOutcome::Run));
    }

    #[test]
    fn select_stops_batch_scan_on_overflow() {
        let dag_a = Dag::new(vec![Op::model("GPU:0", "m", vec!["x".into()], "y", 8, 0)]);
        let dag_b = Dag::new(vec![Op::model("GPU:0", "m", vec!["x".into()], "y", 8, 0)]);
        let dag_c = Dag::new(vec![Op::model("GPU:0", "m", vec!["x".into()], "y", 8, 0)]);

        let mut ctx_a = HashMap::new();
        ctx_a.insert("x".to_string(), entry(2));
        let mut ctx_b = HashMap::new();
        ctx_b.insert("x".to_string(), entry(3));
        let mut ctx_c = HashMap::new();
        ctx_c.insert("x".to_string(), entry(4));

        let a = Arc::new(DagRunInfo::new(dag_a, ctx_a, None));
        let b = Arc::new(DagRunInfo::new(dag_b, ctx_b, None));
        let c = Arc::new(DagRunInfo::new(dag_c, ctx_c, None));

        let mut q: Queue<Arc<DagRunInfo>> = Queue::new();
        q.push_back(a);
        q.push_back(b);
        q.push_back(c);

        // 2 + 3 = 5 fits in batchsize 8; 5 + 4 = 9 overflows, so c is left
        // out of this batch (scenario S3).
        let inspector = DefaultInspector;
        let (batch, outcome) = select(&q, &inspector, "GPU:0").unwrap();
        assert_eq!(batch.len(), 2);
        assert!(matches!(outcome, SelectedOutcome::Run));
    }

    #[test]
    fn select_advances_head_when_minbatchsize_unmet() {
        let dag_a = Dag::new(vec![Op::model("GPU:0", "m", vec!["x".into()], "y", 8, 4)]);
        let mut ctx_a = HashMap::new();
        ctx_a.insert("x".to_string(), entry(2));
        let a = Arc::new(DagRunInfo::new(dag_a, ctx_a, None));

        let mut q: Queue<Arc<DagRunInfo>> = Queue::new();
        q.push_back(a);

        // Only one item, minbatchsize 4 > inbatchsize 2: no candidate.
        let inspector = DefaultInspector;
        assert!(select(&q, &inspector, "GPU:0").is_none());
    }
}
