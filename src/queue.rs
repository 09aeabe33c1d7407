// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! An unsynchronized, doubly linked FIFO with O(1) mid-list eviction.
//!
//! [`Queue`] deliberately does none of its own locking: the caller (a
//! [`crate::device_queue::DeviceQueue`]) holds a single `Mutex` around every
//! operation, so there is no benefit to the atomics/CAS machinery a lock-free
//! structure would need. What *is* required, and what this module provides,
//! is that a [`NodeHandle`] handed out by `push_back`/`push_front` stays valid
//! — and keeps pointing at the same logical node — for as long as that node
//! sits in the queue, so that [`WorkerLoop`](crate::worker)'s selection walk
//! can hold on to a handle across a `next()` traversal and later `evict()` it
//! in O(1).

use std::fmt;

/// An opaque handle to a node inside a [`Queue`]. Stable until the node it
/// names is evicted or popped.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(usize);

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHandle({})", self.0)
    }
}

struct Slot<T> {
    value: Option<T>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// An unbounded FIFO queue supporting O(1) push front/back, pop front, and
/// eviction of an arbitrary node given its handle.
///
/// Backed by a slab of slots rather than raw pointers: a freed slot is
/// recycled by future pushes, but a handle to a slot that hasn't been freed
/// always names the same logical element.
pub struct Queue<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    /// Creates an empty queue.
    pub fn new() -> Queue<T> {
        Queue {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Number of elements currently in the queue.
    pub fn length(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn alloc_slot(&mut self, value: T) -> usize {
        let slot = Slot {
            value: Some(value),
            prev: None,
            next: None,
        };
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = slot;
            idx
        } else {
            self.slots.push(slot);
            self.slots.len() - 1
        }
    }

    /// Appends `v` to the tail of the queue.
    pub fn push_back(&mut self, v: T) -> NodeHandle {
        let idx = self.alloc_slot(v);
        self.slots[idx].prev = self.tail;
        self.slots[idx].next = None;
        match self.tail {
            Some(t) => self.slots[t].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
        NodeHandle(idx)
    }

    /// Prepends `v` to the head of the queue.
    pub fn push_front(&mut self, v: T) -> NodeHandle {
        let idx = self.alloc_slot(v);
        self.slots[idx].next = self.head;
        self.slots[idx].prev = None;
        match self.head {
            Some(h) => self.slots[h].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
        NodeHandle(idx)
    }

    /// Removes and returns the value at the head of the queue, if any.
    pub fn pop_front(&mut self) -> Option<T> {
        let idx = self.head?;
        Some(self.unlink(idx))
    }

    /// Returns a handle to the head of the queue without removing it.
    pub fn front(&self) -> Option<NodeHandle> {
        self.head.map(NodeHandle)
    }

    /// Returns a handle to the node following `node`, if any. Read-only:
    /// does not itself require the caller to hold anything beyond the lock
    /// they already hold around every other `Queue` call.
    pub fn next(&self, node: NodeHandle) -> Option<NodeHandle> {
        self.slots[node.0].next.map(NodeHandle)
    }

    /// Borrows the value named by `node`.
    ///
    /// # Panics
    /// Panics if `node` does not currently name a live slot (i.e. it was
    /// already evicted or popped). Callers only ever hold handles they
    /// obtained from `front`/`next`/`push_*` within the same locked section,
    /// so this should never happen in practice.
    pub fn get(&self, node: NodeHandle) -> &T {
        self.slots[node.0]
            .value
            .as_ref()
            .expect("NodeHandle refers to an evicted slot")
    }

    /// Unlinks `node` from wherever it sits in the list and returns its
    /// value. O(1).
    pub fn evict(&mut self, node: NodeHandle) -> T {
        self.unlink(node.0)
    }

    fn unlink(&mut self, idx: usize) -> T {
        let prev = self.slots[idx].prev;
        let next = self.slots[idx].next;

        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }

        self.len -= 1;
        self.free.push(idx);
        self.slots[idx]
            .value
            .take()
            .expect("unlinking a slot with no value")
    }
}
