// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Operations and the operation pool.
//!
//! Every task, copy, close, deletion, and fence lives in one
//! [`OperationPool`] slab. Slots recycle; each recycle advances the slot's
//! generation, so an [`OpRef`] held by analysis state goes stale instead
//! of dangling. [`UniqueOpId`]s are minted monotonically and never reused.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

use regent_lowlevel::{Event, Fabric, Processor, Reservation, UserEvent};

use crate::field_mask::FieldMask;
use crate::ident::{ContextId, FieldId, FieldSpaceId, GenerationId, TaskId, UniqueOpId};
use crate::logical::TreeNodeRef;
use crate::profiling::OperationTimeline;
use crate::usage::{DependenceType, RegionRequirement};

// ============================================================================
// References and lifecycle
// ============================================================================

/// Generational reference into the pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct OpRef {
    /// Slab slot index.
    pub slot: u32,
    /// Generation the slot held when this reference was taken.
    pub generation: GenerationId,
}

/// Lifecycle of an operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpStatus {
    /// Issued; dependence analysis not finished.
    Registered,
    /// Waiting on dependences or an unresolved predicate.
    Waiting,
    /// All preconditions satisfied; queued for a processor.
    Ready,
    /// A mapper invocation is in progress.
    Mapping,
    /// The body is executing.
    Running,
    /// Finished normally.
    Completed,
    /// Predicate resolved false before dispatch.
    Cancelled,
    /// Mapping retries were exhausted.
    Failed,
}

impl OpStatus {
    /// Terminal states never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for OpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Registered => "registered",
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Mapping => "mapping",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        })
    }
}

// ============================================================================
// Predicates and futures
// ============================================================================

/// Predicate resolution failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PredicateError {
    /// The predicate was already resolved.
    #[error("predicate already resolved")]
    AlreadySet,
}

struct PredicateState {
    value: Option<bool>,
    waiters: Vec<Box<dyn FnOnce(bool) + Send>>,
}

/// A boolean resolved at most once, observable by the scheduler.
#[derive(Clone)]
pub struct PredicateHandle {
    inner: Arc<Mutex<PredicateState>>,
}

impl PredicateHandle {
    /// An unresolved predicate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PredicateState {
                value: None,
                waiters: Vec::new(),
            })),
        }
    }

    /// The resolved value, if any.
    #[must_use]
    pub fn value(&self) -> Option<bool> {
        self.inner.lock().value
    }

    /// Resolves the predicate, running registered callbacks inline.
    pub fn set(&self, value: bool) -> Result<(), PredicateError> {
        let waiters = {
            let mut state = self.inner.lock();
            if state.value.is_some() {
                return Err(PredicateError::AlreadySet);
            }
            state.value = Some(value);
            std::mem::take(&mut state.waiters)
        };
        for w in waiters {
            w(value);
        }
        Ok(())
    }

    /// Runs `f` with the value once resolved; immediately if already is.
    pub fn on_resolve(&self, f: impl FnOnce(bool) + Send + 'static) {
        let resolved = {
            let mut state = self.inner.lock();
            match state.value {
                Some(v) => v,
                None => {
                    state.waiters.push(Box::new(f));
                    return;
                }
            }
        };
        f(resolved);
    }
}

impl Default for PredicateHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PredicateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateHandle")
            .field("value", &self.value())
            .finish_non_exhaustive()
    }
}

/// Gate evaluated before an operation maps.
#[derive(Clone, Debug)]
pub enum Predicate {
    /// Known at issue time.
    Const(bool),
    /// Resolved later through the handle.
    Deferred(PredicateHandle),
}

impl Predicate {
    /// Always-true predicate.
    pub const TRUE: Self = Self::Const(true);

    /// The value, when resolved.
    #[must_use]
    pub fn value(&self) -> Option<bool> {
        match self {
            Self::Const(v) => Some(*v),
            Self::Deferred(h) => h.value(),
        }
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Self::TRUE
    }
}

/// Handle to a task's eventual byte result.
///
/// Completion triggers even when the task is cancelled or fails; `get`
/// then yields `None`.
#[derive(Clone, Debug)]
pub struct Future {
    completion: Event,
    result: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Future {
    pub(crate) fn new(completion: Event) -> Self {
        Self {
            completion,
            result: Arc::new(Mutex::new(None)),
        }
    }

    /// The event marking the producing operation's completion.
    #[must_use]
    pub const fn completion(&self) -> Event {
        self.completion
    }

    /// Blocks until the producer finishes, then returns its result bytes.
    #[must_use]
    pub fn get(&self, fabric: &Fabric) -> Option<Vec<u8>> {
        fabric.wait(self.completion);
        self.result.lock().clone()
    }

    /// Non-blocking probe.
    #[must_use]
    pub fn try_get(&self, fabric: &Fabric) -> Option<Vec<u8>> {
        if fabric.has_triggered(self.completion) {
            self.result.lock().clone()
        } else {
            None
        }
    }

    pub(crate) fn set_result(&self, bytes: Vec<u8>) {
        *self.result.lock() = Some(bytes);
    }
}

// ============================================================================
// Operation kinds
// ============================================================================

/// What a deletion retires.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeletionTarget {
    /// A whole region tree.
    RegionTree(crate::ident::RegionTreeId),
    /// One field of a field space.
    Field {
        /// The owning field space.
        field_space: FieldSpaceId,
        /// The field retired.
        field: FieldId,
    },
}

/// Tagged operation payload.
#[derive(Clone, Debug)]
pub enum OperationKind {
    /// A task launch: registered body plus argument bytes.
    Task {
        /// Which registered task body to run.
        task_id: TaskId,
        /// Opaque argument bytes handed to the body.
        args: Vec<u8>,
    },
    /// An explicit region-to-region copy. The first `num_sources`
    /// requirements are sources; the rest are destinations, pairwise.
    Copy {
        /// How many leading requirements are sources.
        num_sources: usize,
    },
    /// A synthesized close consolidating child data at a node.
    Close {
        /// The node being consolidated.
        node: TreeNodeRef,
        /// Fields being consolidated.
        mask: FieldMask,
    },
    /// Deferred destruction of forest structure.
    Deletion(DeletionTarget),
    /// Execution fence within a context.
    Fence,
}

impl OperationKind {
    /// Short tag for logs.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Task { .. } => "task",
            Self::Copy { .. } => "copy",
            Self::Close { .. } => "close",
            Self::Deletion(_) => "deletion",
            Self::Fence => "fence",
        }
    }
}

/// A dependence this operation waits on, kept for querying.
#[derive(Clone, Copy, Debug)]
pub struct RecordedDependence {
    /// The operation waited on.
    pub predecessor: UniqueOpId,
    /// Classified obligation.
    pub kind: DependenceType,
    /// Fields over which the two conflict.
    pub mask: FieldMask,
}

/// Everything the runtime tracks about one in-flight operation.
#[derive(Debug)]
pub struct OperationRecord {
    /// Process-wide id.
    pub unique_id: UniqueOpId,
    /// Issuing context.
    pub context: ContextId,
    /// Payload.
    pub kind: OperationKind,
    /// Lifecycle state.
    pub status: OpStatus,
    /// Declared region accesses.
    pub requirements: Vec<RegionRequirement>,
    /// Field masks resolved per requirement.
    pub masks: Vec<FieldMask>,
    /// Dependences recorded during analysis.
    pub dependences: Vec<RecordedDependence>,
    /// Events that must trigger before mapping.
    pub preconditions: Vec<Event>,
    /// Reservations acquired for atomic coherence, in handle order.
    pub reservations: Vec<Reservation>,
    /// Dispatch gate.
    pub predicate: Predicate,
    /// Triggered when the operation reaches a terminal state.
    pub completion: UserEvent,
    /// Chosen by the mapper at dispatch.
    pub target_processor: Option<Processor>,
    /// Milestone instants.
    pub timeline: OperationTimeline,
    /// Result slot for tasks that return bytes.
    pub future: Option<Future>,
    /// Mapping attempts so far.
    pub mapping_attempts: u32,
}

// ============================================================================
// Pool
// ============================================================================

struct OpSlot {
    generation: GenerationId,
    record: Option<OperationRecord>,
}

/// Slab of operation slots with generational references.
#[derive(Default)]
pub struct OperationPool {
    slots: Vec<OpSlot>,
    free: Vec<u32>,
    next_unique: u64,
    by_unique: FxHashMap<UniqueOpId, OpRef>,
}

impl OperationPool {
    /// An empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a slot for a new operation.
    pub fn allocate(
        &mut self,
        context: ContextId,
        kind: OperationKind,
        predicate: Predicate,
        completion: UserEvent,
    ) -> (OpRef, UniqueOpId) {
        let unique_id = UniqueOpId(self.next_unique);
        self.next_unique += 1;
        let mut timeline = OperationTimeline::default();
        timeline.mark_issued();
        let record = OperationRecord {
            unique_id,
            context,
            kind,
            status: OpStatus::Registered,
            requirements: Vec::new(),
            masks: Vec::new(),
            dependences: Vec::new(),
            preconditions: Vec::new(),
            reservations: Vec::new(),
            predicate,
            completion,
            target_processor: None,
            timeline,
            future: None,
            mapping_attempts: 0,
        };
        let slot = if let Some(slot) = self.free.pop() {
            self.slots[slot as usize].record = Some(record);
            slot
        } else {
            let slot = self.slots.len() as u32;
            self.slots.push(OpSlot {
                generation: GenerationId(1),
                record: Some(record),
            });
            slot
        };
        let op = OpRef {
            slot,
            generation: self.slots[slot as usize].generation,
        };
        self.by_unique.insert(unique_id, op);
        (op, unique_id)
    }

    /// The record behind `op`, unless the slot was recycled.
    #[must_use]
    pub fn get(&self, op: OpRef) -> Option<&OperationRecord> {
        let slot = self.slots.get(op.slot as usize)?;
        if slot.generation != op.generation {
            return None;
        }
        slot.record.as_ref()
    }

    /// Mutable access to the record behind `op`.
    pub fn get_mut(&mut self, op: OpRef) -> Option<&mut OperationRecord> {
        let slot = self.slots.get_mut(op.slot as usize)?;
        if slot.generation != op.generation {
            return None;
        }
        slot.record.as_mut()
    }

    /// Resolves a unique id to its live reference.
    #[must_use]
    pub fn lookup(&self, unique_id: UniqueOpId) -> Option<OpRef> {
        self.by_unique.get(&unique_id).copied()
    }

    /// Whether `op` still names a live operation.
    #[must_use]
    pub fn is_live(&self, op: OpRef) -> bool {
        self.get(op).is_some()
    }

    /// Retires `op`, recycling its slot under a new generation.
    pub fn retire(&mut self, op: OpRef) -> Option<OperationRecord> {
        let slot = self.slots.get_mut(op.slot as usize)?;
        if slot.generation != op.generation {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = GenerationId(slot.generation.0 + 1);
        self.free.push(op.slot);
        self.by_unique.remove(&record.unique_id);
        Some(record)
    }

    /// Number of live operations.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.record.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regent_lowlevel::MachineDesc;

    fn pool_and_fabric() -> (OperationPool, Fabric) {
        let fabric = match Fabric::start(MachineDesc::default()) {
            Ok(f) => f,
            Err(e) => unreachable!("BUG: fabric start failed: {e}"),
        };
        (OperationPool::new(), fabric)
    }

    #[test]
    fn refs_go_stale_after_retire() {
        let (mut pool, fabric) = pool_and_fabric();
        let ev = fabric.create_user_event();
        let (op, id) = pool.allocate(
            ContextId(0),
            OperationKind::Fence,
            Predicate::TRUE,
            ev,
        );
        assert!(pool.is_live(op));
        assert_eq!(pool.lookup(id), Some(op));

        let record = pool.retire(op);
        assert!(record.is_some());
        assert!(!pool.is_live(op), "retired refs are stale");
        assert!(pool.get(op).is_none());
        assert_eq!(pool.lookup(id), None);
        assert!(pool.retire(op).is_none(), "double retire is a no-op");
        fabric.shutdown();
    }

    #[test]
    fn recycled_slots_change_generation() {
        let (mut pool, fabric) = pool_and_fabric();
        let (a, _) = pool.allocate(
            ContextId(0),
            OperationKind::Fence,
            Predicate::TRUE,
            fabric.create_user_event(),
        );
        pool.retire(a);
        let (b, id_b) = pool.allocate(
            ContextId(0),
            OperationKind::Fence,
            Predicate::TRUE,
            fabric.create_user_event(),
        );
        assert_eq!(a.slot, b.slot, "slot is recycled");
        assert_ne!(a.generation, b.generation);
        assert!(!pool.is_live(a));
        assert!(pool.is_live(b));
        let unique = pool.get(b).map(|r| r.unique_id);
        assert_eq!(unique, Some(id_b));
        fabric.shutdown();
    }

    #[test]
    fn unique_ids_are_monotonic() {
        let (mut pool, fabric) = pool_and_fabric();
        let mut last = None;
        for _ in 0..5 {
            let (op, id) = pool.allocate(
                ContextId(0),
                OperationKind::Fence,
                Predicate::TRUE,
                fabric.create_user_event(),
            );
            if let Some(prev) = last {
                assert!(id > prev, "ids never regress");
            }
            last = Some(id);
            pool.retire(op);
        }
        fabric.shutdown();
    }

    #[test]
    fn predicates_resolve_once() {
        let h = PredicateHandle::new();
        assert_eq!(h.value(), None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        h.on_resolve(move |v| sink.lock().push(v));
        assert_eq!(h.set(false), Ok(()));
        assert_eq!(h.set(true), Err(PredicateError::AlreadySet));
        assert_eq!(h.value(), Some(false));
        assert_eq!(&*seen.lock(), &[false]);

        // Late registration runs inline.
        let late = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&late);
        h.on_resolve(move |v| sink.lock().push(v));
        assert_eq!(&*late.lock(), &[false]);
    }

    #[test]
    fn futures_deliver_after_completion() {
        let (_, fabric) = pool_and_fabric();
        let ev = fabric.create_user_event();
        let fut = Future::new(ev.event());
        fut.set_result(vec![7, 8, 9]);
        assert_eq!(fut.try_get(&fabric), None, "result gated on the event");
        match fabric.trigger(ev) {
            Ok(()) => {}
            Err(e) => unreachable!("BUG: trigger failed: {e}"),
        }
        assert_eq!(fut.get(&fabric), Some(vec![7, 8, 9]));
        fabric.shutdown();
    }
}
