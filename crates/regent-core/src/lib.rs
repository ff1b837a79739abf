// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Regent core: dependence analysis and deferred execution over logical
//! regions.
//!
//! Programs name data as logical regions (an index space crossed with a
//! field space) and submit operations against them with declared privileges
//! and coherence. The runtime discovers the partial order those declarations
//! imply, maps each operation onto concrete instances, and runs it once its
//! predecessors finish. Nothing executes eagerly; submission returns
//! [`Future`]s and events, and the program blocks only where it chooses to.
//!
//! The layers, bottom up:
//!
//! - [`FieldMask`] and the region forest ([`RegionTreeForest`]) give the
//!   analysis its vocabulary: field sets and the index/partition tree.
//! - The logical layer ([`register_logical_user`]) walks per-field tree
//!   state, classifies dependences, and synthesizes close operations where
//!   a requirement crosses an open subtree.
//! - The physical layer ([`ContextPhysicalState`]) tracks which instances
//!   hold valid data per field, issues copies and reduction flushes, and
//!   advances version epochs.
//! - [`PhysicalManager`]s own instance memory; the [`DistributedRegistry`]
//!   keeps managers alive across address spaces until every reference
//!   retires.
//! - The [`Runtime`] ties it together: admission windows, ready queues with
//!   stealing, mapper callbacks, and completion plumbing, all running on the
//!   `regent-lowlevel` fabric.
//!
//! No globals anywhere; every component is owned, explicitly constructed,
//! and reachable from a [`Runtime`] value.

#![forbid(unsafe_code)]

mod config;
mod distributed;
mod domain;
mod field_mask;
mod forest;
mod ident;
mod logical;
mod manager;
mod mapper;
mod op;
mod physical;
mod profiling;
mod reduction;
mod runtime;
mod scheduler;
mod usage;

/// Runtime construction knobs.
pub use config::RuntimeConfig;
/// Distributed manager registry, reference-count messages, and wiring.
pub use distributed::{
    local_channels, DistributedError, DistributedRegistry, LivenessQuery, MessageError, RefKind,
    RefMessage,
};
/// Structured index domains and partition colorings.
pub use domain::{Coloring, Domain, Interval, Point};
/// Dense and run-length field sets.
pub use field_mask::{CompressedFieldMask, FieldMask, FieldMaskIter, FieldRun, MAX_FIELDS};
/// The shared region tree forest.
pub use forest::{PathStep, RegionTreeForest, TreeError};
/// Identifier newtypes used across every layer.
pub use ident::{
    AddressSpaceId, Color, ContextId, DistributedId, FieldId, FieldSpaceId, GenerationId,
    IndexPartition, IndexSpace, LogicalPartition, LogicalRegion, MapperId, ReductionOpId,
    RegionTreeId, TaskId, UniqueOpId, VersionId,
};
/// Logical dependence analysis and its per-context state.
pub use logical::{
    register_logical_user, AnalysisPool, CloseHandle, ContextLogicalState, LogicalUser,
    MappingDependence, PrivilegeError, PrivilegeGrant, RegistrationOutcome, SynthesizedClose,
    TreeNodeRef,
};
/// Physical instance managers and their layouts.
pub use manager::{
    FieldBlock, FoldReductionManager, InstanceLayout, InstanceManager, ListReductionManager,
    ManagerError, PhysicalManager,
};
/// Mapping decisions and the default mapper.
pub use mapper::{DefaultMapper, MapFailure, Mapper, MappingDecision, ReductionFlavor};
/// Operation records, predicates, futures, and the slab pool.
pub use op::{
    DeletionTarget, Future, OpRef, OpStatus, OperationKind, OperationPool, OperationRecord,
    Predicate, PredicateError, PredicateHandle, RecordedDependence,
};
/// Physical state: views, access mapping, and mapped regions.
pub use physical::{
    AccessRequest, AccessTarget, ContextPhysicalState, InstanceView, MapTarget, MappedAccess,
    PhysicalError, PhysicalRegion, PhysicalUser, ReductionView, ReductionViewRef, ViewRef,
};
/// Lifecycle observation hooks and per-operation timelines.
pub use profiling::{NullProfilingSink, OperationTimeline, ProfilingSink};
/// Reduction operators and their registry.
pub use reduction::{max_u64, sum_u64, CombineFn, ReductionError, ReductionOp, ReductionTable};
/// The runtime, launchers, and the multi-space harness.
pub use runtime::{
    CopyLauncher, Runtime, RuntimeError, RuntimeGroup, TaskBody, TaskContext, TaskLauncher,
};
/// Admission windows and per-processor ready queues.
pub use scheduler::{ReadyQueues, TaskWindow};
/// Privileges, coherence, requirements, and dependence classification.
pub use usage::{
    classify_dependence, CoherenceProperty, DependenceType, PrivilegeMode, RegionRequirement,
    RegionUsage, RequirementError,
};
