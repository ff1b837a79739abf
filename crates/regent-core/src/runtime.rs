// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! The runtime: explicit state, submission, dispatch, and completion.
//!
//! One [`Runtime`] serves one address space. It owns the fabric, the region
//! forest, the operation pool, every context, the ready queues, and the
//! distributed registry; nothing here lives in a global.
//!
//! An operation's life: submission acquires a context window slot, runs the
//! logical dependence analysis, and parks the op until its predecessors'
//! completion events trigger. Readiness queues it on its target processor,
//! whose idle handler maps it (mapper decisions, instance creation, copy
//! issue) and launches the body. Completion releases reservations, triggers
//! the completion event, retires the record, and notifies the context.
//!
//! # Invariants
//!
//! - Lock nesting order: context physical state, then the operation pool,
//!   then any of context logical state, the mapper, the live map, or leaf
//!   tables. The forest and the fabric synchronize internally and may be
//!   used under any of these.
//! - Every admitted operation releases its window slot exactly once, at
//!   dispatch or at predicate cancellation. Closes ride on their issuing
//!   op's slot and never touch the window.
//! - Completion triggers before the record retires; the live map shrinks
//!   last, so fences and [`Runtime::drain`] never miss an operation.
//! - The pool lock is never held across a completion trigger; readiness
//!   callbacks of dependents run inline on the triggering thread.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use regent_lowlevel::{
    Event, Fabric, FabricError, MachineDesc, ProcKind, Processor, Reservation,
};

use crate::config::RuntimeConfig;
use crate::distributed::{local_channels, DistributedError, DistributedRegistry};
use crate::domain::Domain;
use crate::field_mask::FieldMask;
use crate::forest::{RegionTreeForest, TreeError};
use crate::ident::{
    AddressSpaceId, ContextId, DistributedId, FieldId, FieldSpaceId, IndexSpace, LogicalRegion,
    ReductionOpId, TaskId, UniqueOpId,
};
use crate::logical::{
    register_logical_user, AnalysisPool, CloseHandle, ContextLogicalState, MappingDependence,
    PrivilegeError, SynthesizedClose, TreeNodeRef,
};
use crate::manager::{ManagerError, PhysicalManager};
use crate::mapper::{DefaultMapper, MapFailure, Mapper, MappingDecision, ReductionFlavor};
use crate::op::{
    DeletionTarget, Future, OpRef, OpStatus, OperationKind, OperationPool, Predicate,
    RecordedDependence,
};
use crate::physical::{
    AccessRequest, AccessTarget, ContextPhysicalState, MapTarget, MappedAccess, PhysicalError,
    PhysicalRegion, ViewRef,
};
use crate::profiling::{NullProfilingSink, ProfilingSink};
use crate::reduction::{ReductionError, ReductionOp, ReductionTable};
use crate::scheduler::{ReadyQueues, TaskWindow};
use crate::usage::{
    CoherenceProperty, DependenceType, PrivilegeMode, RegionRequirement, RegionUsage,
};

// ============================================================================
// Errors
// ============================================================================

/// Failures surfaced by the runtime's public API.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The named context was never created here.
    #[error("no such context: {0:?}")]
    UnknownContext(ContextId),
    /// A launch named a task id with no registered body.
    #[error("no task body registered for {0:?}")]
    UnknownTask(TaskId),
    /// The task id is already taken.
    #[error("task {0:?} is already registered")]
    DuplicateTask(TaskId),
    /// A copy launch must pair each source with one destination.
    #[error("copy launch pairs {sources} sources with {destinations} destinations")]
    CopyShape {
        /// Source requirements given.
        sources: usize,
        /// Destination requirements given.
        destinations: usize,
    },
    /// A copy requirement held the wrong privilege for its role.
    #[error("copy requirement {index} must be {need}")]
    CopyPrivilege {
        /// Requirement position, sources first.
        index: usize,
        /// What the role demands.
        need: &'static str,
    },
    /// Copies move bytes slot by slot, so both sides must share a field
    /// space.
    #[error("copy pair {index} crosses field spaces")]
    CopyFieldSpace {
        /// The offending pair.
        index: usize,
    },
    /// A requirement failed the privilege check.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
    /// A forest lookup or mutation failed.
    #[error(transparent)]
    Tree(#[from] TreeError),
    /// Reduction operator registration failed.
    #[error(transparent)]
    Reduction(#[from] ReductionError),
    /// The distributed registry or its router failed.
    #[error(transparent)]
    Distributed(#[from] DistributedError),
    /// The lowlevel fabric could not be brought up.
    #[error(transparent)]
    Fabric(#[from] FabricError),
}

/// Mapping-path failures; these fail the op, not the runtime.
#[derive(Debug, Error)]
enum MapAbort {
    #[error("mapping attempts exhausted after {0}")]
    Exhausted(u32),
    #[error("operation record retired mid-mapping")]
    Vanished,
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Physical(#[from] PhysicalError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Reduction(#[from] ReductionError),
}

// ============================================================================
// Launchers and task bodies
// ============================================================================

/// What a task body sees while it runs.
pub struct TaskContext<'a> {
    /// The processor executing the body.
    pub processor: Processor,
    /// Argument bytes from the launcher.
    pub args: &'a [u8],
    /// Mapped requirements, positionally; `None` where the requirement
    /// declared no access.
    pub regions: &'a [Option<PhysicalRegion>],
}

impl TaskContext<'_> {
    /// The mapped region of requirement `index`, if any.
    #[must_use]
    pub fn region(&self, index: usize) -> Option<&PhysicalRegion> {
        self.regions.get(index).and_then(Option::as_ref)
    }
}

/// A registered task body: requirement handles in, result bytes out.
pub type TaskBody = dyn Fn(&TaskContext<'_>) -> Vec<u8> + Send + Sync;

struct TaskEntry {
    name: String,
    body: Arc<TaskBody>,
}

/// Describes one task launch.
#[derive(Clone)]
pub struct TaskLauncher {
    /// The registered body to run.
    pub task_id: TaskId,
    /// Opaque argument bytes.
    pub args: Vec<u8>,
    /// Declared region accesses.
    pub requirements: Vec<RegionRequirement>,
    /// Dispatch gate; defaults to always-true.
    pub predicate: Predicate,
}

impl TaskLauncher {
    /// A launch of `task_id` with no arguments or requirements.
    #[must_use]
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            args: Vec::new(),
            requirements: Vec::new(),
            predicate: Predicate::TRUE,
        }
    }

    /// Sets the argument bytes.
    #[must_use]
    pub fn with_args(mut self, args: Vec<u8>) -> Self {
        self.args = args;
        self
    }

    /// Appends a region requirement.
    #[must_use]
    pub fn add_requirement(mut self, req: RegionRequirement) -> Self {
        self.requirements.push(req);
        self
    }

    /// Gates the launch on `predicate`.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }
}

/// Describes one explicit region-to-region copy.
#[derive(Clone, Default)]
pub struct CopyLauncher {
    /// Read-only source requirements.
    pub sources: Vec<RegionRequirement>,
    /// Writable destination requirements, pairwise with the sources.
    pub destinations: Vec<RegionRequirement>,
    /// Dispatch gate; defaults to always-true.
    pub predicate: Predicate,
}

impl CopyLauncher {
    /// An empty copy launch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one source/destination pair.
    #[must_use]
    pub fn add_pair(mut self, source: RegionRequirement, destination: RegionRequirement) -> Self {
        self.sources.push(source);
        self.destinations.push(destination);
        self
    }

    /// Gates the launch on `predicate`.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }
}

// ============================================================================
// Context state
// ============================================================================

struct ContextState {
    id: ContextId,
    logical: Mutex<ContextLogicalState>,
    physical: Mutex<ContextPhysicalState>,
    window: TaskWindow,
    /// Live operations and their completion events, for fences and drain.
    live: Mutex<FxHashMap<UniqueOpId, Event>>,
    quiet: Condvar,
    last_fence: Mutex<Option<(UniqueOpId, Event)>>,
}

impl ContextState {
    fn new(id: ContextId, window_limit: usize) -> Self {
        Self {
            id,
            logical: Mutex::new(ContextLogicalState::new()),
            physical: Mutex::new(ContextPhysicalState::new()),
            window: TaskWindow::new(window_limit),
            live: Mutex::new(FxHashMap::default()),
            quiet: Condvar::new(),
            last_fence: Mutex::new(None),
        }
    }

    fn wait_quiescent(&self) {
        let mut live = self.live.lock();
        while !live.is_empty() {
            self.quiet.wait(&mut live);
        }
        trace!(context = self.id.0, "context quiescent");
    }
}

/// Adapts the pool (and the fabric, for completion events) to the analysis.
struct PoolAdapter<'a> {
    pool: &'a mut OperationPool,
    fabric: &'a Fabric,
    context: ContextId,
}

impl AnalysisPool for PoolAdapter<'_> {
    fn is_live(&self, op: OpRef) -> bool {
        self.pool.is_live(op)
    }

    fn synthesize_close(&mut self, node: TreeNodeRef, mask: &FieldMask) -> CloseHandle {
        let completion = self.fabric.create_user_event();
        let (op, unique_id) = self.pool.allocate(
            self.context,
            OperationKind::Close { node, mask: *mask },
            Predicate::TRUE,
            completion,
        );
        CloseHandle { op, unique_id }
    }
}

// ============================================================================
// Runtime
// ============================================================================

struct Submitted {
    completion: Event,
    future: Option<Future>,
}

struct DispatchPlan {
    context: ContextId,
    kind: OperationKind,
    requirements: Vec<RegionRequirement>,
    masks: Vec<FieldMask>,
    reservations: Vec<Reservation>,
    completion: Event,
    future: Option<Future>,
}

struct MappedSet {
    regions: Vec<Option<PhysicalRegion>>,
    handles: Vec<Option<Arc<PhysicalManager>>>,
    waits: Vec<Event>,
    pinned: Vec<ViewRef>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    fabric: Fabric,
    forest: RegionTreeForest,
    pool: Mutex<OperationPool>,
    contexts: Mutex<FxHashMap<ContextId, Arc<ContextState>>>,
    next_context: AtomicU32,
    next_manager: AtomicU64,
    queues: ReadyQueues,
    dispatch_procs: Vec<Processor>,
    copy_proc: Processor,
    mapper: Mutex<Box<dyn Mapper>>,
    tasks: Mutex<FxHashMap<TaskId, TaskEntry>>,
    reductions: Mutex<ReductionTable>,
    registry: Arc<DistributedRegistry>,
    router: Mutex<Option<JoinHandle<()>>>,
    profiler: Arc<dyn ProfilingSink>,
    atomic_locks: Mutex<FxHashMap<LogicalRegion, Reservation>>,
    outcomes: Mutex<FxHashMap<UniqueOpId, OpStatus>>,
}

/// One address space's worth of runtime state.
///
/// Share it by reference, or wrap it in an `Arc` for threaded drivers.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("space", &self.inner.config.address_space)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Brings up a standalone runtime with the default mapper and a silent
    /// profiling sink.
    pub fn new(config: RuntimeConfig, machine: MachineDesc) -> Result<Self, RuntimeError> {
        let space_idx = config.address_space.0 as usize;
        let (mut sender_sets, mut inboxes) = local_channels(space_idx + 1);
        let senders = sender_sets.swap_remove(space_idx);
        let inbox = inboxes.swap_remove(space_idx);
        Self::with_parts(
            config,
            machine,
            Box::new(DefaultMapper::new()),
            Arc::new(NullProfilingSink),
            senders,
            inbox,
        )
    }

    /// Brings up a runtime from explicit parts: mapper, profiling sink, and
    /// the message channels wiring it to its peer spaces.
    pub fn with_parts(
        config: RuntimeConfig,
        machine: MachineDesc,
        mapper: Box<dyn Mapper>,
        profiler: Arc<dyn ProfilingSink>,
        senders: Vec<Sender<Bytes>>,
        inbox: Receiver<Bytes>,
    ) -> Result<Self, RuntimeError> {
        let fabric = Fabric::start(machine)?;
        let processors = fabric.processors();
        let cpus = fabric.processors_of_kind(ProcKind::Cpu);
        let dispatch_procs = if cpus.is_empty() { processors.clone() } else { cpus };
        let copy_proc = fabric
            .processors_of_kind(ProcKind::Utility)
            .first()
            .copied()
            .or_else(|| processors.first().copied());
        let Some(copy_proc) = copy_proc else {
            fabric.shutdown();
            return Err(RuntimeError::Fabric(FabricError::NoProcessors));
        };

        let registry = Arc::new(DistributedRegistry::new(
            config.address_space,
            fabric.clone(),
            copy_proc,
            senders,
        ));
        let router = match registry.start_router(inbox) {
            Ok(handle) => handle,
            Err(e) => {
                fabric.shutdown();
                return Err(e.into());
            }
        };

        let inner = Arc::new(RuntimeInner {
            config,
            queues: ReadyQueues::new(processors.len()),
            fabric,
            forest: RegionTreeForest::new(),
            pool: Mutex::new(OperationPool::new()),
            contexts: Mutex::new(FxHashMap::default()),
            next_context: AtomicU32::new(0),
            next_manager: AtomicU64::new(1),
            dispatch_procs,
            copy_proc,
            mapper: Mutex::new(mapper),
            tasks: Mutex::new(FxHashMap::default()),
            reductions: Mutex::new(ReductionTable::default()),
            registry,
            router: Mutex::new(Some(router)),
            profiler,
            atomic_locks: Mutex::new(FxHashMap::default()),
            outcomes: Mutex::new(FxHashMap::default()),
        });

        // Idle handlers hold the runtime weakly so shutdown can tear the
        // cycle between fabric and runtime down.
        for &proc in &inner.dispatch_procs {
            let weak: Weak<RuntimeInner> = Arc::downgrade(&inner);
            inner
                .fabric
                .set_idle_handler(proc, move || weak.upgrade().is_some_and(|rt| rt.pump(proc)));
        }

        debug!(
            space = %inner.config.address_space,
            processors = inner.dispatch_procs.len(),
            "runtime up"
        );
        Ok(Self { inner })
    }

    /// The configuration this runtime was built with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The lowlevel fabric, for event waits and machine introspection.
    #[must_use]
    pub fn fabric(&self) -> &Fabric {
        &self.inner.fabric
    }

    /// The region forest, for structural queries beyond the passthroughs.
    #[must_use]
    pub fn forest(&self) -> &RegionTreeForest {
        &self.inner.forest
    }

    /// The distributed registry serving this address space.
    #[must_use]
    pub fn registry(&self) -> &Arc<DistributedRegistry> {
        &self.inner.registry
    }

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    /// Creates an index space over `domain`.
    #[must_use]
    pub fn create_index_space(&self, domain: Domain) -> IndexSpace {
        self.inner.forest.create_index_space(domain)
    }

    /// Creates an empty field space.
    #[must_use]
    pub fn create_field_space(&self) -> FieldSpaceId {
        self.inner.forest.create_field_space()
    }

    /// Allocates `field` with `size`-byte elements, returning its slot.
    pub fn allocate_field(
        &self,
        fs: FieldSpaceId,
        field: FieldId,
        size: usize,
    ) -> Result<u32, RuntimeError> {
        Ok(self.inner.forest.allocate_field(fs, field, size)?)
    }

    /// Creates a top-level region, rooting a fresh tree.
    pub fn create_logical_region(
        &self,
        index_space: IndexSpace,
        field_space: FieldSpaceId,
    ) -> Result<LogicalRegion, RuntimeError> {
        Ok(self.inner.forest.create_logical_region(index_space, field_space)?)
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Registers a task body under `task_id`.
    pub fn register_task(
        &self,
        task_id: TaskId,
        name: impl Into<String>,
        body: impl Fn(&TaskContext<'_>) -> Vec<u8> + Send + Sync + 'static,
    ) -> Result<(), RuntimeError> {
        let mut tasks = self.inner.tasks.lock();
        if tasks.contains_key(&task_id) {
            return Err(RuntimeError::DuplicateTask(task_id));
        }
        let name = name.into();
        debug!(task = task_id.0, name = %name, "registered task");
        tasks.insert(
            task_id,
            TaskEntry {
                name,
                body: Arc::new(body),
            },
        );
        Ok(())
    }

    /// Registers a reduction operator. Id zero and duplicates are rejected.
    pub fn register_reduction_op(
        &self,
        id: ReductionOpId,
        op: ReductionOp,
    ) -> Result<(), RuntimeError> {
        self.inner.reductions.lock().register(id, op)?;
        debug!(redop = id.0, "registered reduction operator");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Contexts
    // ------------------------------------------------------------------

    /// Creates an empty context with its own admission window.
    pub fn create_context(&self) -> ContextId {
        let id = ContextId(self.inner.next_context.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(ContextState::new(id, self.inner.config.max_task_window));
        self.inner.contexts.lock().insert(id, state);
        debug!(context = id.0, "created context");
        id
    }

    /// Grants the context `privilege` over `fields` of `region`, as a root
    /// it may claim as a requirement parent.
    pub fn grant_privilege(
        &self,
        ctx: ContextId,
        region: LogicalRegion,
        fields: &[FieldId],
        privilege: PrivilegeMode,
    ) -> Result<(), RuntimeError> {
        let state = self.inner.context(ctx)?;
        let mask = self.inner.forest.requirement_mask(region.field_space, fields)?;
        state.logical.lock().add_grant(region, mask, privilege);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Submits a task launch, returning the future of its result.
    ///
    /// Blocks while the context window is full.
    pub fn submit_task(&self, ctx: ContextId, launcher: TaskLauncher) -> Result<Future, RuntimeError> {
        let TaskLauncher {
            task_id,
            args,
            requirements,
            predicate,
        } = launcher;
        if !self.inner.tasks.lock().contains_key(&task_id) {
            return Err(RuntimeError::UnknownTask(task_id));
        }
        let submitted = self.inner.submit_operation(
            ctx,
            OperationKind::Task { task_id, args },
            requirements,
            predicate,
            true,
        )?;
        Ok(submitted
            .future
            .unwrap_or_else(|| Future::new(submitted.completion)))
    }

    /// Submits an explicit copy, returning its completion event.
    pub fn submit_copy(&self, ctx: ContextId, launcher: CopyLauncher) -> Result<Event, RuntimeError> {
        let CopyLauncher {
            sources,
            destinations,
            predicate,
        } = launcher;
        if sources.is_empty() || sources.len() != destinations.len() {
            return Err(RuntimeError::CopyShape {
                sources: sources.len(),
                destinations: destinations.len(),
            });
        }
        for (index, src) in sources.iter().enumerate() {
            if !src.privilege.is_read_only() {
                return Err(RuntimeError::CopyPrivilege {
                    index,
                    need: "a read-only source",
                });
            }
        }
        let num_sources = sources.len();
        for (i, dst) in destinations.iter().enumerate() {
            if !dst.privilege.has_write() || dst.privilege.is_reduce() {
                return Err(RuntimeError::CopyPrivilege {
                    index: num_sources + i,
                    need: "a writable destination",
                });
            }
            if dst.region.field_space != sources[i].region.field_space {
                return Err(RuntimeError::CopyFieldSpace { index: i });
            }
        }
        let mut requirements = sources;
        requirements.extend(destinations);
        let submitted = self.inner.submit_operation(
            ctx,
            OperationKind::Copy { num_sources },
            requirements,
            predicate,
            false,
        )?;
        Ok(submitted.completion)
    }

    /// Submits an execution fence: it waits for every live operation in the
    /// context, and every later submission waits for it.
    pub fn submit_fence(&self, ctx: ContextId) -> Result<Event, RuntimeError> {
        let submitted = self.inner.submit_operation(
            ctx,
            OperationKind::Fence,
            Vec::new(),
            Predicate::TRUE,
            false,
        )?;
        Ok(submitted.completion)
    }

    /// Submits a deferred deletion of forest structure.
    ///
    /// Ordering is conservative: the deletion waits for every operation
    /// live in the context at submission.
    pub fn submit_deletion(
        &self,
        ctx: ContextId,
        target: DeletionTarget,
    ) -> Result<Event, RuntimeError> {
        let submitted = self.inner.submit_operation(
            ctx,
            OperationKind::Deletion(target),
            Vec::new(),
            Predicate::TRUE,
            false,
        )?;
        Ok(submitted.completion)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The dependences recorded for a live operation.
    #[must_use]
    pub fn dependences_of(&self, id: UniqueOpId) -> Option<Vec<RecordedDependence>> {
        let pool = self.inner.pool.lock();
        let op = pool.lookup(id)?;
        pool.get(op).map(|rec| rec.dependences.clone())
    }

    /// An operation's status: live state while in flight, terminal state
    /// after it finishes.
    #[must_use]
    pub fn status_of(&self, id: UniqueOpId) -> Option<OpStatus> {
        {
            let pool = self.inner.pool.lock();
            if let Some(op) = pool.lookup(id) {
                if let Some(rec) = pool.get(op) {
                    return Some(rec.status);
                }
            }
        }
        self.inner.outcomes.lock().get(&id).copied()
    }

    /// Operations currently held by the pool.
    #[must_use]
    pub fn live_operations(&self) -> usize {
        self.inner.pool.lock().live_count()
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Blocks until every operation the context issued has finished.
    pub fn drain(&self, ctx: ContextId) -> Result<(), RuntimeError> {
        let state = self.inner.context(ctx)?;
        state.wait_quiescent();
        Ok(())
    }

    /// Drains every context, stops the message router, and joins the
    /// fabric's workers.
    pub fn shutdown(&self) {
        let contexts: Vec<Arc<ContextState>> =
            self.inner.contexts.lock().values().cloned().collect();
        for ctx in contexts {
            ctx.wait_quiescent();
        }
        if let Err(e) = self.inner.registry.stop_router() {
            debug!(error = %e, "router already stopped");
        }
        if let Some(handle) = self.inner.router.lock().take() {
            if handle.join().is_err() {
                error!("router thread panicked");
            }
        }
        self.inner.fabric.shutdown();
        debug!(space = %self.inner.config.address_space, "runtime down");
    }
}

// ============================================================================
// Submission internals
// ============================================================================

impl RuntimeInner {
    fn context(&self, ctx: ContextId) -> Result<Arc<ContextState>, RuntimeError> {
        self.contexts
            .lock()
            .get(&ctx)
            .cloned()
            .ok_or(RuntimeError::UnknownContext(ctx))
    }

    fn fresh_did(&self) -> DistributedId {
        let seq = self.next_manager.fetch_add(1, Ordering::Relaxed);
        DistributedId::pack(self.config.address_space, seq)
    }

    fn atomic_reservation(&self, region: LogicalRegion) -> Reservation {
        *self
            .atomic_locks
            .lock()
            .entry(region)
            .or_insert_with(|| self.fabric.create_reservation())
    }

    fn submit_operation(
        self: &Arc<Self>,
        ctx_id: ContextId,
        kind: OperationKind,
        requirements: Vec<RegionRequirement>,
        predicate: Predicate,
        wants_future: bool,
    ) -> Result<Submitted, RuntimeError> {
        let ctx = self.context(ctx_id)?;
        let gates_on_live = matches!(
            kind,
            OperationKind::Fence | OperationKind::Deletion(_)
        );
        let sets_fence = matches!(kind, OperationKind::Fence);
        let gate = predicate.clone();

        ctx.window.acquire();
        let completion = self.fabric.create_user_event();

        let mut pool = self.pool.lock();
        let (opref, unique_id) = pool.allocate(ctx_id, kind, predicate, completion);
        let future = wants_future.then(|| Future::new(completion.event()));

        let mut preconditions: Vec<Event> = Vec::new();
        let mut extra_deps: Vec<RecordedDependence> = Vec::new();

        // Everything a context submits orders behind its last fence.
        if let Some((fence_id, fence_ev)) = *ctx.last_fence.lock() {
            preconditions.push(fence_ev);
            extra_deps.push(RecordedDependence {
                predecessor: fence_id,
                kind: DependenceType::True,
                mask: FieldMask::new(),
            });
        }
        if gates_on_live {
            let live = ctx.live.lock();
            for (&pred_id, &ev) in live.iter() {
                preconditions.push(ev);
                extra_deps.push(RecordedDependence {
                    predecessor: pred_id,
                    kind: DependenceType::True,
                    mask: FieldMask::new(),
                });
            }
        }

        // Logical dependence analysis, one requirement at a time.
        let mut masks: Vec<FieldMask> = Vec::with_capacity(requirements.len());
        let mut edges: Vec<MappingDependence> = Vec::new();
        let mut closes: Vec<SynthesizedClose> = Vec::new();
        let failure = {
            let mut logical = ctx.logical.lock();
            let mut adapter = PoolAdapter {
                pool: &mut *pool,
                fabric: &self.fabric,
                context: ctx_id,
            };
            let mut failure = None;
            for (index, req) in requirements.iter().enumerate() {
                match register_logical_user(
                    &mut logical,
                    &self.forest,
                    &mut adapter,
                    opref,
                    unique_id,
                    req,
                ) {
                    Ok(outcome) => {
                        masks.push(outcome.mask);
                        edges.extend(outcome.dependences);
                        closes.extend(outcome.closes);
                    }
                    Err(e) => {
                        failure = Some((index, e));
                        break;
                    }
                }
            }
            failure
        };
        if let Some((index, err)) = failure {
            warn!(op = %unique_id, index, error = %err, "requirement rejected");
            let mut doomed = Vec::with_capacity(closes.len() + 1);
            for close in &closes {
                if let Some(rec) = pool.get(close.handle.op) {
                    doomed.push(rec.completion);
                }
                let _ = pool.retire(close.handle.op);
            }
            if let Some(rec) = pool.get(opref) {
                doomed.push(rec.completion);
            }
            let _ = pool.retire(opref);
            drop(pool);
            for ev in doomed {
                if let Err(e) = self.fabric.trigger(ev) {
                    debug_assert!(false, "BUG: aborted submission already triggered: {e}");
                    error!(op = %unique_id, error = %e, "aborted submission already triggered");
                }
            }
            ctx.window.release();
            return Err(err.into());
        }

        // Record the edges and collect precondition events per successor;
        // a successor is either this op or one of its closes. Simultaneous
        // and atomic predecessors are recorded but never event-ordered:
        // concurrent users coexist on one view, and atomic exclusion rides
        // on the region reservation instead.
        let mut pre_map: FxHashMap<UniqueOpId, Vec<Event>> = FxHashMap::default();
        for edge in &edges {
            let Some(pred) = pool.get(edge.predecessor_ref) else {
                continue;
            };
            let ev = pred.completion.event();
            if let Some(succ) = pool.get_mut(edge.successor_ref) {
                succ.dependences.push(RecordedDependence {
                    predecessor: edge.predecessor,
                    kind: edge.kind,
                    mask: edge.mask,
                });
            }
            if matches!(edge.kind, DependenceType::True | DependenceType::Anti) {
                pre_map.entry(edge.successor).or_default().push(ev);
            }
        }

        // Atomic coherence takes one reservation per region, acquired in
        // handle order at launch so chained grants cannot deadlock.
        let mut reservations: Vec<Reservation> = requirements
            .iter()
            .filter(|r| r.coherence == CoherenceProperty::Atomic)
            .map(|r| self.atomic_reservation(r.region))
            .collect();
        reservations.sort_unstable_by_key(|r| r.raw());
        reservations.dedup();

        if let Some(events) = pre_map.remove(&unique_id) {
            preconditions.extend(events);
        }
        preconditions.sort_unstable_by_key(|e| e.raw());
        preconditions.dedup();

        let fallback_proc = self.dispatch_procs[0];
        let target = match pool.get_mut(opref) {
            Some(rec) => {
                rec.requirements = requirements;
                rec.masks = masks;
                rec.dependences.extend(extra_deps);
                rec.preconditions = preconditions.clone();
                rec.reservations = reservations;
                rec.future = future.clone();
                rec.status = OpStatus::Waiting;
                let target = self.mapper.lock().select_target_processor(&self.fabric, rec);
                rec.target_processor = Some(target);
                target
            }
            None => {
                error!(op = %unique_id, "record vanished during submission");
                debug_assert!(false, "BUG: record vanished during submission");
                fallback_proc
            }
        };

        let mut hooks: Vec<(OpRef, UniqueOpId, Vec<Event>, Processor)> = Vec::new();
        for close in &closes {
            let events = pre_map.remove(&close.handle.unique_id).unwrap_or_default();
            let ctarget = match pool.get_mut(close.handle.op) {
                Some(crec) => {
                    crec.masks = vec![close.mask];
                    crec.preconditions = events.clone();
                    crec.status = OpStatus::Waiting;
                    let t = self.mapper.lock().select_target_processor(&self.fabric, crec);
                    crec.target_processor = Some(t);
                    t
                }
                None => {
                    debug_assert!(false, "BUG: close record vanished during submission");
                    fallback_proc
                }
            };
            hooks.push((close.handle.op, close.handle.unique_id, events, ctarget));
        }
        debug_assert!(pre_map.is_empty(), "BUG: dependence edges with unknown successors");

        {
            let mut live = ctx.live.lock();
            live.insert(unique_id, completion.event());
            for close in &closes {
                let ev = pool
                    .get(close.handle.op)
                    .map_or(Event::NO_EVENT, |r| r.completion.event());
                live.insert(close.handle.unique_id, ev);
            }
        }
        if sets_fence {
            *ctx.last_fence.lock() = Some((unique_id, completion.event()));
        }
        drop(pool);

        self.profiler.on_issued(unique_id);
        for close in &closes {
            self.profiler.on_issued(close.handle.unique_id);
        }
        trace!(
            op = %unique_id,
            context = ctx_id.0,
            closes = closes.len(),
            waits = preconditions.len(),
            "submitted"
        );

        // Hooks install with no lock held: already-triggered preconditions
        // run the readiness callback inline right here.
        for (copref, cid, events, ctarget) in hooks {
            self.hook_readiness(copref, cid, events, Predicate::TRUE, ctarget);
        }
        self.hook_readiness(opref, unique_id, preconditions, gate, target);

        Ok(Submitted {
            completion: completion.event(),
            future,
        })
    }

    fn hook_readiness(
        self: &Arc<Self>,
        opref: OpRef,
        id: UniqueOpId,
        preconditions: Vec<Event>,
        gate: Predicate,
        target: Processor,
    ) {
        let merged = self.fabric.merge_events(&preconditions);
        match gate {
            Predicate::Const(true) => self.arm(opref, id, merged, target),
            Predicate::Const(false) => self.cancel_unmapped(opref, id),
            Predicate::Deferred(handle) => {
                let inner = Arc::clone(self);
                handle.on_resolve(move |pass| {
                    if pass {
                        inner.arm(opref, id, merged, target);
                    } else {
                        inner.cancel_unmapped(opref, id);
                    }
                });
            }
        }
    }

    fn arm(self: &Arc<Self>, opref: OpRef, id: UniqueOpId, merged: Event, target: Processor) {
        let inner = Arc::clone(self);
        self.fabric.add_waiter(merged, move || inner.on_ready(opref, id, target));
    }

    fn on_ready(&self, opref: OpRef, id: UniqueOpId, target: Processor) {
        {
            let mut pool = self.pool.lock();
            let Some(rec) = pool.get_mut(opref) else {
                return;
            };
            rec.status = OpStatus::Ready;
            rec.timeline.mark_ready();
        }
        self.profiler.on_ready(id);
        self.queues.enqueue(target, id, opref);
        self.fabric.wake(target);
    }

    fn cancel_unmapped(&self, opref: OpRef, id: UniqueOpId) {
        debug!(op = %id, "predicate false; cancelling before dispatch");
        let ctx_id = {
            let pool = self.pool.lock();
            pool.get(opref).map(|rec| rec.context)
        };
        let Some(ctx_id) = ctx_id else {
            return;
        };
        let Ok(ctx) = self.context(ctx_id) else {
            return;
        };
        ctx.window.release();
        self.finish_op(&ctx, opref, id, Vec::new(), &[], OpStatus::Cancelled);
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn pump(self: &Arc<Self>, me: Processor) -> bool {
        let width = self.config.superscalar_width.max(1);
        let batch = self.queues.pop_batch(me, width);
        if batch.is_empty() {
            return self.try_steal(me);
        }
        for (id, opref) in batch {
            self.dispatch(me, id, opref);
        }
        true
    }

    fn try_steal(self: &Arc<Self>, me: Processor) -> bool {
        if self.dispatch_procs.len() < 2 {
            return false;
        }
        let Some(my_pos) = self.dispatch_procs.iter().position(|p| *p == me) else {
            return false;
        };
        let floor = self.config.min_tasks_to_keep;
        for step in 1..self.dispatch_procs.len() {
            let victim = self.dispatch_procs[(my_pos + step) % self.dispatch_procs.len()];
            let moved = self.queues.steal_into(victim, me, floor, |candidates| {
                self.mapper.lock().permit_steal(victim, candidates)
            });
            if moved.is_empty() {
                continue;
            }
            for id in &moved {
                self.profiler.on_stolen(*id, victim, me);
            }
            debug!(
                victim = victim.raw(),
                thief = me.raw(),
                count = moved.len(),
                "stole ready work"
            );
            return true;
        }
        false
    }

    fn dispatch(self: &Arc<Self>, me: Processor, id: UniqueOpId, opref: OpRef) {
        let plan = {
            let mut pool = self.pool.lock();
            let Some(rec) = pool.get_mut(opref) else {
                return;
            };
            rec.status = OpStatus::Mapping;
            DispatchPlan {
                context: rec.context,
                kind: rec.kind.clone(),
                requirements: rec.requirements.clone(),
                masks: rec.masks.clone(),
                reservations: rec.reservations.clone(),
                completion: rec.completion.event(),
                future: rec.future.clone(),
            }
        };
        let Ok(ctx) = self.context(plan.context) else {
            error!(op = %id, "dispatch for unknown context");
            debug_assert!(false, "BUG: dispatch for unknown context");
            return;
        };
        if !matches!(plan.kind, OperationKind::Close { .. }) {
            ctx.window.release();
        }
        self.profiler.on_dispatched(id, me);
        trace!(op = %id, processor = me.raw(), kind = plan.kind.tag(), "dispatching");

        match &plan.kind {
            OperationKind::Fence => self.launch_structural(me, &ctx, opref, id, None),
            OperationKind::Deletion(target) => {
                self.launch_structural(me, &ctx, opref, id, Some(*target));
            }
            OperationKind::Close { node, mask } => {
                self.dispatch_close(me, &ctx, opref, id, *node, *mask, plan.completion);
            }
            OperationKind::Task { task_id, args } => {
                self.dispatch_task(me, &ctx, opref, id, *task_id, args.clone(), &plan);
            }
            OperationKind::Copy { num_sources } => {
                self.dispatch_copy(me, &ctx, opref, id, *num_sources, &plan);
            }
        }
    }

    fn launch_structural(
        self: &Arc<Self>,
        me: Processor,
        ctx: &Arc<ContextState>,
        opref: OpRef,
        id: UniqueOpId,
        deletion: Option<DeletionTarget>,
    ) {
        let inner = Arc::clone(self);
        let ctx2 = Arc::clone(ctx);
        self.fabric.spawn(me, Event::NO_EVENT, move || {
            inner.mark_running(opref);
            if let Some(target) = deletion {
                inner.execute_deletion(target);
            }
            inner.finish_op(&ctx2, opref, id, Vec::new(), &[], OpStatus::Completed);
        });
    }

    fn execute_deletion(&self, target: DeletionTarget) {
        let result = match target {
            DeletionTarget::RegionTree(tree) => self.forest.destroy_region_tree(tree),
            DeletionTarget::Field { field_space, field } => {
                self.forest.free_field(field_space, field)
            }
        };
        match result {
            Ok(()) => debug!(?target, "deletion executed"),
            Err(e) => warn!(?target, error = %e, "deletion target already gone"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_task(
        self: &Arc<Self>,
        me: Processor,
        ctx: &Arc<ContextState>,
        opref: OpRef,
        id: UniqueOpId,
        task_id: TaskId,
        args: Vec<u8>,
        plan: &DispatchPlan,
    ) {
        let entry = {
            let tasks = self.tasks.lock();
            tasks
                .get(&task_id)
                .map(|e| (e.name.clone(), Arc::clone(&e.body)))
        };
        let Some((name, body)) = entry else {
            error!(op = %id, task = task_id.0, "no task body registered");
            self.fail_op(ctx, opref, id);
            return;
        };
        let mapped = match self.map_requirements(
            ctx,
            opref,
            id,
            &plan.requirements,
            &plan.masks,
            plan.completion,
        ) {
            Ok(m) => m,
            Err(abort) => {
                error!(op = %id, error = %abort, "mapping failed");
                self.fail_op(ctx, opref, id);
                return;
            }
        };

        let precondition =
            self.chain_reservations(&plan.reservations, self.fabric.merge_events(&mapped.waits));
        let inner = Arc::clone(self);
        let ctx2 = Arc::clone(ctx);
        let reservations = plan.reservations.clone();
        let future = plan.future.clone();
        let MappedSet {
            regions, pinned, ..
        } = mapped;
        self.fabric.spawn(me, precondition, move || {
            inner.mark_running(opref);
            trace!(op = %id, task = %name, "running task body");
            let tctx = TaskContext {
                processor: me,
                args: &args,
                regions: &regions,
            };
            let bytes = body(&tctx);
            if let Some(f) = &future {
                f.set_result(bytes);
            }
            inner.finish_op(&ctx2, opref, id, pinned, &reservations, OpStatus::Completed);
        });
    }

    fn dispatch_copy(
        self: &Arc<Self>,
        me: Processor,
        ctx: &Arc<ContextState>,
        opref: OpRef,
        id: UniqueOpId,
        num_sources: usize,
        plan: &DispatchPlan,
    ) {
        let mapped = match self.map_requirements(
            ctx,
            opref,
            id,
            &plan.requirements,
            &plan.masks,
            plan.completion,
        ) {
            Ok(m) => m,
            Err(abort) => {
                error!(op = %id, error = %abort, "mapping failed");
                self.fail_op(ctx, opref, id);
                return;
            }
        };

        let precondition =
            self.chain_reservations(&plan.reservations, self.fabric.merge_events(&mapped.waits));
        let inner = Arc::clone(self);
        let ctx2 = Arc::clone(ctx);
        let reservations = plan.reservations.clone();
        let dst_masks: Vec<FieldMask> = plan.masks[num_sources..].to_vec();
        let MappedSet {
            handles, pinned, ..
        } = mapped;
        self.fabric.spawn(me, precondition, move || {
            inner.mark_running(opref);
            for (pair, dst_mask) in dst_masks.iter().enumerate() {
                let (Some(src), Some(dst)) = (&handles[pair], &handles[num_sources + pair]) else {
                    continue;
                };
                match src.copy_into(dst, dst_mask) {
                    Ok(elements) => trace!(op = %id, pair, elements, "copied"),
                    Err(e) => error!(op = %id, pair, error = %e, "copy failed"),
                }
            }
            inner.finish_op(&ctx2, opref, id, pinned, &reservations, OpStatus::Completed);
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_close(
        self: &Arc<Self>,
        me: Processor,
        ctx: &Arc<ContextState>,
        opref: OpRef,
        id: UniqueOpId,
        node: TreeNodeRef,
        mask: FieldMask,
        completion: Event,
    ) {
        let result = self.map_close(ctx, opref, id, node, mask, completion);
        match result {
            Ok(mapped) => {
                let inner = Arc::clone(self);
                let ctx2 = Arc::clone(ctx);
                self.fabric.spawn(me, mapped.precondition, move || {
                    inner.mark_running(opref);
                    inner.finish_op(&ctx2, opref, id, Vec::new(), &[], OpStatus::Completed);
                });
            }
            Err(abort) => {
                error!(op = %id, error = %abort, "close mapping failed");
                self.fail_op(ctx, opref, id);
            }
        }
    }

    fn map_close(
        &self,
        ctx: &ContextState,
        opref: OpRef,
        id: UniqueOpId,
        node: TreeNodeRef,
        mask: FieldMask,
        completion: Event,
    ) -> Result<MappedAccess, MapAbort> {
        let region = self.close_region(node)?;
        let domain = self.forest.index_space_domain(region.index_space)?;
        let slot_sizes = self.forest.slot_sizes(region.field_space, &mask)?;
        let areq = AccessRequest {
            region,
            usage: RegionUsage::new(PrivilegeMode::ReadWrite, CoherenceProperty::Exclusive),
            mask,
            completion,
        };
        let mut physical = ctx.physical.lock();
        self.map_with_mapper(&mut physical, opref, id, 0, &areq, &domain, &slot_sizes, true)
    }

    fn close_region(&self, node: TreeNodeRef) -> Result<LogicalRegion, TreeError> {
        match node {
            TreeNodeRef::Region(region) => Ok(region),
            TreeNodeRef::Partition(part) => {
                let parent = self.forest.partition_parent(part.index_partition)?;
                Ok(LogicalRegion {
                    index_space: parent,
                    field_space: part.field_space,
                    tree_id: part.tree_id,
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Mapping
    // ------------------------------------------------------------------

    fn map_requirements(
        &self,
        ctx: &ContextState,
        opref: OpRef,
        id: UniqueOpId,
        requirements: &[RegionRequirement],
        masks: &[FieldMask],
        completion: Event,
    ) -> Result<MappedSet, MapAbort> {
        let mut out = MappedSet {
            regions: Vec::with_capacity(requirements.len()),
            handles: Vec::with_capacity(requirements.len()),
            waits: Vec::new(),
            pinned: Vec::new(),
        };
        for (index, req) in requirements.iter().enumerate() {
            let usage = req.usage();
            let Some(mask) = masks.get(index) else {
                continue;
            };
            if usage.privilege == PrivilegeMode::NoAccess {
                out.regions.push(None);
                out.handles.push(None);
                continue;
            }
            match self.map_one(ctx, opref, id, index, req, usage, mask, completion, &mut out) {
                Ok(()) => {}
                Err(abort) => {
                    if !out.pinned.is_empty() {
                        let mut physical = ctx.physical.lock();
                        for view in out.pinned.drain(..) {
                            physical.unpin(view);
                        }
                    }
                    return Err(abort);
                }
            }
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn map_one(
        &self,
        ctx: &ContextState,
        opref: OpRef,
        id: UniqueOpId,
        index: usize,
        req: &RegionRequirement,
        usage: RegionUsage,
        mask: &FieldMask,
        completion: Event,
        out: &mut MappedSet,
    ) -> Result<(), MapAbort> {
        let domain = self.forest.index_space_domain(req.region.index_space)?;
        let slot_sizes = self.forest.slot_sizes(req.region.field_space, mask)?;
        let areq = AccessRequest {
            region: req.region,
            usage,
            mask: *mask,
            completion,
        };

        let mut physical = ctx.physical.lock();
        // Concurrent coherence binds to the one shared view when valid data
        // already exists; the mapper only chooses when there is none.
        let mapped = if usage.coherence.is_concurrent() {
            match physical.find_simultaneous(req.region, mask) {
                Some(view) => physical.map_access(
                    &self.fabric,
                    self.copy_proc,
                    &self.forest,
                    &areq,
                    MapTarget::Reuse(view),
                )?,
                None => self.map_with_mapper(
                    &mut physical,
                    opref,
                    id,
                    index,
                    &areq,
                    &domain,
                    &slot_sizes,
                    false,
                )?,
            }
        } else {
            self.map_with_mapper(
                &mut physical,
                opref,
                id,
                index,
                &areq,
                &domain,
                &slot_sizes,
                false,
            )?
        };
        if usage.coherence.is_concurrent() {
            if let AccessTarget::Instance(view) = mapped.target {
                physical.pin(view);
                out.pinned.push(view);
            }
        }
        let manager = match mapped.target {
            AccessTarget::Instance(view) => {
                physical.view(view).map(|iv| Arc::clone(iv.manager()))
            }
            AccessTarget::Reduction(view) => physical
                .reduction_view(view)
                .map(|rv| Arc::clone(rv.manager())),
        };
        drop(physical);
        let Some(manager) = manager else {
            debug_assert!(false, "BUG: mapped access lost its view");
            return Err(MapAbort::Physical(PhysicalError::UnknownView));
        };

        out.waits.push(mapped.precondition);
        let fields = req
            .fields
            .iter()
            .map(|&field| {
                self.forest
                    .field_slot(req.region.field_space, field)
                    .map(|slot| (field, slot))
            })
            .collect::<Result<Vec<_>, _>>()?;
        out.regions.push(Some(PhysicalRegion::new(
            req.region,
            usage,
            Arc::clone(&manager),
            fields,
        )));
        out.handles.push(Some(manager));
        Ok(())
    }

    /// Runs the mapper until a decision materializes, feeding allocation
    /// failures back in, bounded by the configured retry budget.
    #[allow(clippy::too_many_arguments)]
    fn map_with_mapper(
        &self,
        physical: &mut ContextPhysicalState,
        opref: OpRef,
        id: UniqueOpId,
        index: usize,
        areq: &AccessRequest,
        domain: &Domain,
        slot_sizes: &[(u32, usize)],
        close: bool,
    ) -> Result<MappedAccess, MapAbort> {
        let valid = physical.valid_views(areq.region, &areq.mask);
        let max_attempts = self.config.max_mapping_retries.max(1);
        let mut feedback: Vec<MapFailure> = Vec::new();
        let mut attempts = 0u32;
        loop {
            if attempts >= max_attempts {
                return Err(MapAbort::Exhausted(attempts));
            }
            attempts += 1;
            let decision = {
                let mut pool = self.pool.lock();
                let Some(rec) = pool.get_mut(opref) else {
                    return Err(MapAbort::Vanished);
                };
                rec.mapping_attempts += 1;
                self.mapper
                    .lock()
                    .map_region(&self.fabric, rec, index, &valid, &feedback)
            };
            let target = match decision {
                MappingDecision::Reuse(view) => MapTarget::Reuse(view),
                MappingDecision::Create { memories } => {
                    match self.create_instance(&memories, areq.region, domain, slot_sizes, &mut feedback)? {
                        Some(manager) => MapTarget::Fresh(manager),
                        None => {
                            self.profiler.on_mapping_retry(id, attempts);
                            continue;
                        }
                    }
                }
                MappingDecision::CreateReduction { memories, flavor } => {
                    if close || !areq.usage.privilege.is_reduce() {
                        return Err(MapAbort::Physical(PhysicalError::TargetKind {
                            want: "instance",
                            found: "reduction",
                        }));
                    }
                    let op = self.reductions.lock().get(areq.usage.redop).cloned()?;
                    match self.create_reduction(
                        &memories,
                        flavor,
                        areq.region,
                        domain,
                        slot_sizes,
                        areq.usage.redop,
                        &op,
                        &mut feedback,
                    )? {
                        Some(manager) => MapTarget::Fresh(manager),
                        None => {
                            self.profiler.on_mapping_retry(id, attempts);
                            continue;
                        }
                    }
                }
            };

            let fresh = matches!(target, MapTarget::Fresh(_));
            let mapped = if close {
                physical.close_access(
                    &self.fabric,
                    self.copy_proc,
                    &self.forest,
                    areq.region,
                    &areq.mask,
                    areq.completion,
                    target,
                )?
            } else {
                physical.map_access(&self.fabric, self.copy_proc, &self.forest, areq, target)?
            };
            if fresh {
                match mapped.target {
                    AccessTarget::Instance(view) => {
                        if let Some(iv) = physical.view(view) {
                            self.register_manager(iv.manager());
                        }
                    }
                    AccessTarget::Reduction(view) => {
                        if let Some(rv) = physical.reduction_view(view) {
                            self.register_manager(rv.manager());
                        }
                    }
                }
            }
            return Ok(mapped);
        }
    }

    fn create_instance(
        &self,
        memories: &[regent_lowlevel::Memory],
        region: LogicalRegion,
        domain: &Domain,
        slot_sizes: &[(u32, usize)],
        feedback: &mut Vec<MapFailure>,
    ) -> Result<Option<PhysicalManager>, MapAbort> {
        for &memory in memories {
            let did = self.fresh_did();
            match PhysicalManager::instance(
                &self.fabric,
                memory,
                did,
                region,
                domain.clone(),
                slot_sizes,
            ) {
                Ok(manager) => return Ok(Some(manager)),
                Err(ManagerError::Memory(error)) => {
                    debug!(memory = memory.raw(), error = %error, "instance allocation failed");
                    feedback.push(MapFailure { memory, error });
                }
                Err(other) => return Err(other.into()),
            }
        }
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_reduction(
        &self,
        memories: &[regent_lowlevel::Memory],
        flavor: ReductionFlavor,
        region: LogicalRegion,
        domain: &Domain,
        slot_sizes: &[(u32, usize)],
        redop: ReductionOpId,
        op: &ReductionOp,
        feedback: &mut Vec<MapFailure>,
    ) -> Result<Option<PhysicalManager>, MapAbort> {
        for &memory in memories {
            let did = self.fresh_did();
            let built = match flavor {
                ReductionFlavor::List => PhysicalManager::list_reduction(
                    memory,
                    did,
                    region,
                    domain.clone(),
                    slot_sizes,
                    redop,
                    op,
                ),
                ReductionFlavor::Fold => PhysicalManager::fold_reduction(
                    &self.fabric,
                    memory,
                    did,
                    region,
                    domain.clone(),
                    slot_sizes,
                    redop,
                    op,
                ),
            };
            match built {
                Ok(manager) => return Ok(Some(manager)),
                Err(ManagerError::Memory(error)) => {
                    debug!(memory = memory.raw(), error = %error, "reduction allocation failed");
                    feedback.push(MapFailure { memory, error });
                }
                Err(other) => return Err(other.into()),
            }
        }
        Ok(None)
    }

    fn register_manager(&self, manager: &Arc<PhysicalManager>) {
        if let Err(e) = self.registry.register(Arc::clone(manager)) {
            error!(did = %manager.did(), error = %e, "manager registration failed");
            debug_assert!(false, "BUG: fresh manager failed to register: {e}");
        }
    }

    fn chain_reservations(&self, reservations: &[Reservation], base: Event) -> Event {
        let mut gate = base;
        for &resv in reservations {
            gate = self.fabric.acquire(resv, gate);
        }
        gate
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    fn mark_running(&self, opref: OpRef) {
        let mut pool = self.pool.lock();
        if let Some(rec) = pool.get_mut(opref) {
            rec.status = OpStatus::Running;
            rec.timeline.mark_start();
        }
    }

    fn fail_op(&self, ctx: &Arc<ContextState>, opref: OpRef, id: UniqueOpId) {
        self.finish_op(ctx, opref, id, Vec::new(), &[], OpStatus::Failed);
    }

    fn finish_op(
        &self,
        ctx: &Arc<ContextState>,
        opref: OpRef,
        id: UniqueOpId,
        pinned: Vec<ViewRef>,
        reservations: &[Reservation],
        status: OpStatus,
    ) {
        for &resv in reservations {
            self.fabric.release(resv);
        }
        if !pinned.is_empty() {
            let mut physical = ctx.physical.lock();
            for view in pinned {
                physical.unpin(view);
            }
        }
        let completion = {
            let mut pool = self.pool.lock();
            match pool.get_mut(opref) {
                Some(rec) => {
                    rec.status = status;
                    rec.timeline.mark_complete();
                    self.profiler.on_completed(id, &rec.timeline);
                    self.outcomes.lock().insert(id, status);
                    Some(rec.completion)
                }
                None => {
                    error!(op = %id, "finished operation has no record");
                    debug_assert!(false, "BUG: finished operation {id} has no record");
                    None
                }
            }
        };
        // Dependents' readiness callbacks run inline on this trigger; the
        // pool lock must already be gone.
        if let Some(completion) = completion {
            if let Err(e) = self.fabric.trigger(completion) {
                error!(op = %id, error = %e, "completion already triggered");
                debug_assert!(false, "BUG: double completion on {id}");
            }
        }
        {
            let mut pool = self.pool.lock();
            let _ = pool.retire(opref);
        }
        {
            let mut live = ctx.live.lock();
            live.remove(&id);
            drop(live);
            ctx.quiet.notify_all();
        }
        trace!(op = %id, status = %status, "operation finished");
    }
}

// ============================================================================
// Multi-space harness
// ============================================================================

/// Several runtimes in one process, wired over local channels.
///
/// Space `i` gets address space id `i`; distributed ids minted by one
/// runtime resolve across all of them.
pub struct RuntimeGroup {
    runtimes: Vec<Runtime>,
}

impl std::fmt::Debug for RuntimeGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeGroup")
            .field("spaces", &self.runtimes.len())
            .finish()
    }
}

impl RuntimeGroup {
    /// Brings up `spaces` runtimes on default machines, sharing `config`
    /// apart from the address space id.
    pub fn new_local(spaces: usize, config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let (sender_sets, inboxes) = local_channels(spaces);
        let mut runtimes = Vec::with_capacity(spaces);
        for (i, (senders, inbox)) in sender_sets.into_iter().zip(inboxes).enumerate() {
            let cfg = RuntimeConfig {
                address_space: AddressSpaceId(i as u32),
                ..config.clone()
            };
            match Runtime::with_parts(
                cfg,
                MachineDesc::default(),
                Box::new(DefaultMapper::new()),
                Arc::new(NullProfilingSink),
                senders,
                inbox,
            ) {
                Ok(rt) => runtimes.push(rt),
                Err(e) => {
                    for rt in &runtimes {
                        rt.shutdown();
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { runtimes })
    }

    /// All member runtimes, in space order.
    #[must_use]
    pub fn runtimes(&self) -> &[Runtime] {
        &self.runtimes
    }

    /// The runtime serving `space`, if it exists.
    #[must_use]
    pub fn runtime(&self, space: AddressSpaceId) -> Option<&Runtime> {
        self.runtimes.get(space.0 as usize)
    }

    /// Shuts every member down.
    pub fn shutdown(&self) {
        for rt in &self.runtimes {
            rt.shutdown();
        }
    }
}
