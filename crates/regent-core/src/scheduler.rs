// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Admission windows and per-processor ready queues.
//!
//! Dispatch itself lives with the runtime; this module owns the two
//! structures it schedules through. [`TaskWindow`] throttles how many
//! operations a context may have admitted but not yet dispatched.
//! [`ReadyQueues`] holds, per processor, the operations whose mapping
//! preconditions have all triggered.
//!
//! # Invariants
//!
//! - A window admission blocks while the outstanding count equals the
//!   limit; each release wakes one blocked submitter.
//! - Ready queues order by unique id; pops and steals drain the lowest
//!   remaining ids first.
//! - A steal never leaves the victim with fewer queued ops than its keep
//!   floor, and never moves an op the approval filter did not name.
//! - No queue lock is held while caller-supplied code (the approval
//!   filter) runs.

use std::collections::BTreeMap;

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use regent_lowlevel::Processor;

use crate::ident::UniqueOpId;
use crate::op::OpRef;

// ============================================================================
// Admission window
// ============================================================================

/// Bounded count of operations a context has submitted but not yet
/// dispatched.
///
/// Submission calls [`acquire`](Self::acquire) and blocks once the window
/// is full; the dispatcher calls [`release`](Self::release) when an op
/// leaves its ready queue and begins mapping. A limit of zero is raised
/// to one so submission can always make progress.
pub struct TaskWindow {
    limit: usize,
    outstanding: Mutex<usize>,
    freed: Condvar,
}

impl std::fmt::Debug for TaskWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWindow")
            .field("limit", &self.limit)
            .field("outstanding", &*self.outstanding.lock())
            .finish()
    }
}

impl TaskWindow {
    /// A window admitting up to `limit` undispatched operations.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            outstanding: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    /// The admission limit.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Operations admitted and not yet dispatched.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        *self.outstanding.lock()
    }

    /// Claims one admission slot, blocking while the window is full.
    pub fn acquire(&self) {
        let mut outstanding = self.outstanding.lock();
        while *outstanding >= self.limit {
            trace!(limit = self.limit, "submission window full");
            self.freed.wait(&mut outstanding);
        }
        *outstanding += 1;
    }

    /// Returns one admission slot, waking a blocked submitter.
    pub fn release(&self) {
        let mut outstanding = self.outstanding.lock();
        if *outstanding == 0 {
            error!("window release without a matching acquire");
            debug_assert!(false, "BUG: window release without a matching acquire");
            return;
        }
        *outstanding -= 1;
        drop(outstanding);
        self.freed.notify_one();
    }
}

// ============================================================================
// Ready queues
// ============================================================================

/// Per-processor queues of operations whose preconditions have triggered.
///
/// Each queue is its own mutex; nothing here takes two locks at once.
pub struct ReadyQueues {
    queues: Vec<Mutex<BTreeMap<UniqueOpId, OpRef>>>,
}

impl std::fmt::Debug for ReadyQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyQueues")
            .field("processors", &self.queues.len())
            .finish_non_exhaustive()
    }
}

impl ReadyQueues {
    /// Empty queues for `processor_count` processors.
    #[must_use]
    pub fn new(processor_count: usize) -> Self {
        Self {
            queues: (0..processor_count).map(|_| Mutex::new(BTreeMap::new())).collect(),
        }
    }

    fn queue(&self, proc: Processor) -> Option<&Mutex<BTreeMap<UniqueOpId, OpRef>>> {
        let slot = self.queues.get(proc.raw() as usize);
        if slot.is_none() {
            error!(processor = proc.raw(), "ready queue for unknown processor");
            debug_assert!(false, "BUG: ready queue for unknown processor {}", proc.raw());
        }
        slot
    }

    /// Queues `op` for dispatch on `proc`.
    pub fn enqueue(&self, proc: Processor, id: UniqueOpId, op: OpRef) {
        if let Some(queue) = self.queue(proc) {
            queue.lock().insert(id, op);
            trace!(op = %id, processor = proc.raw(), "ready");
        }
    }

    /// Ops currently queued on `proc`.
    #[must_use]
    pub fn depth(&self, proc: Processor) -> usize {
        self.queue(proc).map_or(0, |q| q.lock().len())
    }

    /// Dequeues up to `limit` ops from `proc`, lowest unique ids first.
    #[must_use]
    pub fn pop_batch(&self, proc: Processor, limit: usize) -> Vec<(UniqueOpId, OpRef)> {
        let Some(queue) = self.queue(proc) else {
            return Vec::new();
        };
        let mut queue = queue.lock();
        let mut batch = Vec::with_capacity(limit.min(queue.len()));
        while batch.len() < limit {
            match queue.pop_first() {
                Some(entry) => batch.push(entry),
                None => break,
            }
        }
        batch
    }

    /// Ids `victim` could afford to lose: everything beyond its oldest
    /// `keep_floor` queued ops.
    #[must_use]
    pub fn steal_candidates(&self, victim: Processor, keep_floor: usize) -> Vec<UniqueOpId> {
        self.queue(victim).map_or_else(Vec::new, |q| {
            q.lock().keys().skip(keep_floor).copied().collect()
        })
    }

    /// Moves approved ops from `victim` to `thief`, returning the ids that
    /// actually moved.
    ///
    /// `approve` runs with no queue lock held and sees the candidate ids in
    /// ascending order. Ops the victim dispatched in the meantime are
    /// skipped, and the victim is re-checked against `keep_floor` under its
    /// lock, so a racing dispatch can shrink a steal but never break the
    /// floor.
    pub fn steal_into(
        &self,
        victim: Processor,
        thief: Processor,
        keep_floor: usize,
        approve: impl FnOnce(&[UniqueOpId]) -> Vec<UniqueOpId>,
    ) -> Vec<UniqueOpId> {
        if victim == thief {
            return Vec::new();
        }
        let candidates = self.steal_candidates(victim, keep_floor);
        if candidates.is_empty() {
            return Vec::new();
        }
        let mut approved = approve(&candidates);
        approved.retain(|id| candidates.contains(id));
        if approved.is_empty() {
            return Vec::new();
        }

        let moved: Vec<(UniqueOpId, OpRef)> = match self.queue(victim) {
            Some(queue) => {
                let mut queue = queue.lock();
                let mut moved = Vec::with_capacity(approved.len());
                for id in &approved {
                    if queue.len() <= keep_floor {
                        break;
                    }
                    if let Some(op) = queue.remove(id) {
                        moved.push((*id, op));
                    }
                }
                moved
            }
            None => Vec::new(),
        };
        if moved.is_empty() {
            return Vec::new();
        }

        if let Some(queue) = self.queue(thief) {
            let mut queue = queue.lock();
            for (id, op) in &moved {
                queue.insert(*id, *op);
            }
        }
        trace!(
            victim = victim.raw(),
            thief = thief.raw(),
            count = moved.len(),
            "stole ready ops"
        );
        moved.into_iter().map(|(id, _)| id).collect()
    }
}
