// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Mapping policy: where operations run and where their data lands.
//!
//! A [`Mapper`] answers the questions the scheduler cannot answer itself:
//! which processor an operation should run on, how each region requirement
//! turns into a physical instance, and which ready operations an idle
//! processor may take from a peer. Implementations run under a
//! per-processor exclusion lock, so they may keep internal state without
//! synchronizing.
//!
//! # Invariants
//!
//! - Mapper decisions affect placement, never outcomes; a poor decision
//!   costs copies or retries, not answers.
//! - `map_region` re-invocations see every prior failure for that
//!   requirement, so a mapper that skips failed memories terminates.

use tracing::trace;

use regent_lowlevel::{Fabric, Memory, MemoryError, ProcKind, Processor};

use crate::field_mask::FieldMask;
use crate::ident::UniqueOpId;
use crate::op::OperationRecord;
use crate::physical::ViewRef;

/// One failed attempt to place a requirement, fed back on retry.
#[derive(PartialEq, Eq, Debug)]
pub struct MapFailure {
    /// The memory that was tried.
    pub memory: Memory,
    /// Why the attempt failed.
    pub error: MemoryError,
}

/// How a reduction requirement buffers its contributions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReductionFlavor {
    /// Ordered contribution log, replayed at flush time.
    List,
    /// Identity-initialized buffer folded in place.
    Fold,
}

/// The mapper's answer for one region requirement.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum MappingDecision {
    /// Use a view that already holds valid data in this context.
    Reuse(ViewRef),
    /// Create an instance in the first listed memory that fits.
    Create {
        /// Memories to try, best first.
        memories: Vec<Memory>,
    },
    /// Create a reduction view in the first listed memory that fits.
    CreateReduction {
        /// Memories to try, best first.
        memories: Vec<Memory>,
        /// Buffering strategy.
        flavor: ReductionFlavor,
    },
}

/// Placement policy consulted at dispatch.
///
/// One mapper instance serves one processor; the scheduler serializes the
/// calls to it.
pub trait Mapper: Send {
    /// Picks the processor `op` should run on.
    fn select_target_processor(&mut self, fabric: &Fabric, op: &OperationRecord) -> Processor;

    /// Decides how requirement `index` of `op` is satisfied.
    ///
    /// `valid` lists views of the requirement's region that already hold
    /// data in the issuing context, with the fields each covers.
    /// `feedback` carries this requirement's earlier failed attempts.
    fn map_region(
        &mut self,
        fabric: &Fabric,
        op: &OperationRecord,
        index: usize,
        valid: &[(ViewRef, FieldMask)],
        feedback: &[MapFailure],
    ) -> MappingDecision;

    /// Filters which of a victim's ready operations a thief may take.
    ///
    /// The default approves everything offered.
    fn permit_steal(&mut self, victim: Processor, candidates: &[UniqueOpId]) -> Vec<UniqueOpId> {
        let _ = victim;
        candidates.to_vec()
    }
}

/// The stock policy: CPUs round-robin, memories ranked affinity first and
/// free space second, steals approved wholesale.
#[derive(Default, Debug)]
pub struct DefaultMapper {
    next_cpu: usize,
}

impl DefaultMapper {
    /// A mapper with its round-robin cursor at the first CPU.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ranked_memories(
        fabric: &Fabric,
        target: Option<Processor>,
        feedback: &[MapFailure],
    ) -> Vec<Memory> {
        let affine = target.map_or_else(Vec::new, |p| fabric.affine_memories(p));
        let mut rest: Vec<Memory> = fabric
            .memories()
            .into_iter()
            .filter(|m| !affine.contains(m))
            .collect();
        rest.sort_by_key(|m| std::cmp::Reverse(fabric.memory_available(*m).unwrap_or(0)));
        let mut ranked = affine;
        ranked.extend(rest);
        ranked.retain(|m| !feedback.iter().any(|f| f.memory == *m));
        ranked
    }
}

impl Mapper for DefaultMapper {
    fn select_target_processor(&mut self, fabric: &Fabric, op: &OperationRecord) -> Processor {
        let cpus = fabric.processors_of_kind(ProcKind::Cpu);
        let pool = if cpus.is_empty() {
            fabric.processors()
        } else {
            cpus
        };
        // A started fabric always has at least one processor.
        let pick = pool[self.next_cpu % pool.len()];
        self.next_cpu = self.next_cpu.wrapping_add(1);
        trace!(op = %op.unique_id, processor = pick.raw(), "selected target processor");
        pick
    }

    fn map_region(
        &mut self,
        fabric: &Fabric,
        op: &OperationRecord,
        index: usize,
        valid: &[(ViewRef, FieldMask)],
        feedback: &[MapFailure],
    ) -> MappingDecision {
        let memories = Self::ranked_memories(fabric, op.target_processor, feedback);
        let Some(req) = op.requirements.get(index) else {
            debug_assert!(false, "BUG: mapping requirement {index} out of range");
            return MappingDecision::Create { memories };
        };
        if req.privilege.is_reduce() {
            return MappingDecision::CreateReduction {
                memories,
                flavor: ReductionFlavor::Fold,
            };
        }
        if let Some(mask) = op.masks.get(index) {
            for (view, coverage) in valid {
                if (coverage & mask) == *mask {
                    trace!(op = %op.unique_id, requirement = index, view = view.0, "reusing valid view");
                    return MappingDecision::Reuse(*view);
                }
            }
        }
        MappingDecision::Create { memories }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ident::{
        ContextId, FieldId, FieldSpaceId, IndexSpace, LogicalRegion, ReductionOpId, RegionTreeId,
        TaskId,
    };
    use crate::op::{OpRef, OperationKind, OperationPool, Predicate};
    use crate::usage::{CoherenceProperty, PrivilegeMode, RegionRequirement};
    use regent_lowlevel::{Affinity, MachineDesc, MemKind, MemoryDesc, ProcDesc};

    fn fenced_op(pool: &mut OperationPool, fabric: &Fabric) -> OpRef {
        let (op, _) = pool.allocate(
            ContextId(0),
            OperationKind::Fence,
            Predicate::TRUE,
            fabric.create_user_event(),
        );
        op
    }

    fn op_with_requirement(
        pool: &mut OperationPool,
        fabric: &Fabric,
        privilege: PrivilegeMode,
        redop: ReductionOpId,
        mask: FieldMask,
        target: Option<Processor>,
    ) -> OpRef {
        let (op, _) = pool.allocate(
            ContextId(0),
            OperationKind::Task {
                task_id: TaskId(1),
                args: Vec::new(),
            },
            Predicate::TRUE,
            fabric.create_user_event(),
        );
        let region = LogicalRegion {
            index_space: IndexSpace(0),
            field_space: FieldSpaceId(0),
            tree_id: RegionTreeId(0),
        };
        match pool.get_mut(op) {
            Some(r) => {
                r.requirements.push(RegionRequirement {
                    region,
                    parent: region,
                    fields: vec![FieldId(0)],
                    privilege,
                    coherence: CoherenceProperty::Exclusive,
                    redop,
                });
                r.masks.push(mask);
                r.target_processor = target;
            }
            None => unreachable!("BUG: fresh op is live"),
        }
        op
    }

    #[test]
    fn round_robin_covers_cpus_and_skips_utilities() {
        let fabric = match Fabric::start(MachineDesc::symmetric(3, 1, 1 << 20)) {
            Ok(f) => f,
            Err(e) => unreachable!("BUG: fabric start failed in test: {e}"),
        };
        let mut pool = OperationPool::new();
        let op = fenced_op(&mut pool, &fabric);
        let record = match pool.get(op) {
            Some(r) => r,
            None => unreachable!("BUG: fresh op is live"),
        };

        let cpus = fabric.processors_of_kind(ProcKind::Cpu);
        let utilities = fabric.processors_of_kind(ProcKind::Utility);
        let mut mapper = DefaultMapper::new();
        let picks: Vec<Processor> = (0..6)
            .map(|_| mapper.select_target_processor(&fabric, record))
            .collect();
        assert_eq!(picks[..3], cpus[..]);
        assert_eq!(picks[3..], cpus[..], "cursor wraps");
        assert!(!picks.contains(&utilities[0]));
        fabric.shutdown();
    }

    #[test]
    fn memories_rank_affinity_then_capacity_and_skip_failures() {
        let desc = MachineDesc {
            processors: vec![ProcDesc { kind: ProcKind::Cpu }],
            memories: vec![
                MemoryDesc {
                    kind: MemKind::System,
                    capacity: 1 << 10,
                },
                MemoryDesc {
                    kind: MemKind::System,
                    capacity: 1 << 20,
                },
                MemoryDesc {
                    kind: MemKind::System,
                    capacity: 1 << 16,
                },
            ],
            affinities: vec![Affinity {
                processor: 0,
                memory: 0,
                bandwidth: 100,
            }],
        };
        let fabric = match Fabric::start(desc) {
            Ok(f) => f,
            Err(e) => unreachable!("BUG: fabric start failed in test: {e}"),
        };
        let mems = fabric.memories();
        let cpu = fabric.processors()[0];
        let mut pool = OperationPool::new();
        let op = op_with_requirement(
            &mut pool,
            &fabric,
            PrivilegeMode::ReadWrite,
            ReductionOpId::NONE,
            FieldMask::single(0),
            Some(cpu),
        );
        let record = match pool.get(op) {
            Some(r) => r,
            None => unreachable!("BUG: fresh op is live"),
        };

        let mut mapper = DefaultMapper::new();
        // The small affine memory leads; the rest rank by free space.
        assert_eq!(
            mapper.map_region(&fabric, record, 0, &[], &[]),
            MappingDecision::Create {
                memories: vec![mems[0], mems[1], mems[2]],
            }
        );

        let feedback = [MapFailure {
            memory: mems[0],
            error: MemoryError::OutOfMemory {
                requested: 64,
                available: 0,
            },
        }];
        assert_eq!(
            mapper.map_region(&fabric, record, 0, &[], &feedback),
            MappingDecision::Create {
                memories: vec![mems[1], mems[2]],
            }
        );
        fabric.shutdown();
    }

    #[test]
    fn reductions_map_to_fold_views() {
        let fabric = match Fabric::start(MachineDesc::symmetric(1, 0, 1 << 20)) {
            Ok(f) => f,
            Err(e) => unreachable!("BUG: fabric start failed in test: {e}"),
        };
        let mut pool = OperationPool::new();
        let op = op_with_requirement(
            &mut pool,
            &fabric,
            PrivilegeMode::Reduce,
            ReductionOpId(7),
            FieldMask::single(0),
            None,
        );
        let record = match pool.get(op) {
            Some(r) => r,
            None => unreachable!("BUG: fresh op is live"),
        };

        let mut mapper = DefaultMapper::new();
        let decision = mapper.map_region(&fabric, record, 0, &[], &[]);
        assert!(matches!(
            decision,
            MappingDecision::CreateReduction {
                flavor: ReductionFlavor::Fold,
                ..
            }
        ));
        fabric.shutdown();
    }

    #[test]
    fn full_coverage_views_are_reused() {
        let fabric = match Fabric::start(MachineDesc::symmetric(1, 0, 1 << 20)) {
            Ok(f) => f,
            Err(e) => unreachable!("BUG: fabric start failed in test: {e}"),
        };
        let mut pool = OperationPool::new();
        let mask: FieldMask = [0usize, 1].into_iter().collect();
        let op = op_with_requirement(
            &mut pool,
            &fabric,
            PrivilegeMode::ReadOnly,
            ReductionOpId::NONE,
            mask,
            None,
        );
        let record = match pool.get(op) {
            Some(r) => r,
            None => unreachable!("BUG: fresh op is live"),
        };

        let full: FieldMask = [0usize, 1, 2].into_iter().collect();
        let partial = FieldMask::single(0);
        let mut mapper = DefaultMapper::new();
        assert_eq!(
            mapper.map_region(
                &fabric,
                record,
                0,
                &[(ViewRef(2), partial), (ViewRef(5), full)],
                &[],
            ),
            MappingDecision::Reuse(ViewRef(5)),
            "only a view covering every requested field is reused"
        );
        assert!(matches!(
            mapper.map_region(&fabric, record, 0, &[(ViewRef(2), partial)], &[]),
            MappingDecision::Create { .. }
        ));
        fabric.shutdown();
    }

    #[test]
    fn default_steal_filter_approves_everything() {
        let fabric = match Fabric::start(MachineDesc::symmetric(2, 0, 1 << 20)) {
            Ok(f) => f,
            Err(e) => unreachable!("BUG: fabric start failed in test: {e}"),
        };
        let victim = fabric.processors()[0];
        let offered = [UniqueOpId(3), UniqueOpId(9)];
        let mut mapper = DefaultMapper::new();
        assert_eq!(mapper.permit_steal(victim, &offered), offered.to_vec());
        fabric.shutdown();
    }
}
