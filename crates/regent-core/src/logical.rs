// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Logical dependence analysis over region trees.
//!
//! Each issuing context owns a [`ContextLogicalState`]: per tree node, the
//! fields currently open into children (and in what mode) plus the recent
//! users of that node. Registering an operation's requirement walks the
//! index-tree path from its privilege root to its target region and, at
//! each node, classifies against overlapping users, forces closes where
//! the open-mode transition table demands them, and finally records the
//! operation as a user at the target.
//!
//! # Invariants
//!
//! - A (child, field) pair is open in at most one mode at any node.
//! - A registration synthesizes at most one close operation per node; the
//!   close covers the union of everything closed there.
//! - A close is recorded as a user at its node before the registering
//!   operation classifies, so the new operation orders behind it.
//! - Users whose operations have retired are pruned when traversal meets
//!   them; nothing here requires a global sweep.
//! - Failed privilege checks leave all analysis state untouched.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;

use crate::field_mask::FieldMask;
use crate::forest::{RegionTreeForest, TreeError};
use crate::ident::{Color, LogicalPartition, LogicalRegion, ReductionOpId, UniqueOpId};
use crate::op::OpRef;
use crate::usage::{
    classify_dependence, CoherenceProperty, DependenceType, PrivilegeMode, RegionRequirement,
    RegionUsage, RequirementError,
};

/// Usage under which synthesized closes read child data home.
const CLOSE_USAGE: RegionUsage =
    RegionUsage::new(PrivilegeMode::ReadWrite, CoherenceProperty::Exclusive);

// ============================================================================
// Node references and per-node state
// ============================================================================

/// A region-tree node named by value: either a region or a partition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TreeNodeRef {
    /// A logical region node.
    Region(LogicalRegion),
    /// A logical partition node.
    Partition(LogicalPartition),
}

impl TreeNodeRef {
    /// The region, when this names one.
    #[must_use]
    pub const fn as_region(self) -> Option<LogicalRegion> {
        match self {
            Self::Region(r) => Some(r),
            Self::Partition(_) => None,
        }
    }
}

/// Open mode of a (child, field) set at one node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum OpenState {
    ReadOnly,
    ReadWrite,
    SingleReduce,
    MultiReduce,
}

/// One recorded user of a node.
#[derive(Clone, Debug)]
pub struct LogicalUser {
    /// Pool reference; goes stale when the slot's generation advances.
    pub op: OpRef,
    /// Process-wide id, stable for the life of the operation.
    pub unique_id: UniqueOpId,
    /// How the user accessed the node.
    pub usage: RegionUsage,
    /// Fields the user touched, trimmed as closes consume it.
    pub mask: FieldMask,
}

#[derive(Debug)]
struct FieldState {
    open: OpenState,
    redop: ReductionOpId,
    open_children: BTreeMap<Color, FieldMask>,
    valid_fields: FieldMask,
}

impl FieldState {
    fn recompute(&mut self) {
        let mut valid = FieldMask::EMPTY;
        for m in self.open_children.values() {
            valid |= m;
        }
        self.valid_fields = valid;
    }
}

#[derive(Debug, Default)]
struct NodeState {
    states: Vec<FieldState>,
    users: Vec<LogicalUser>,
}

impl NodeState {
    /// Opens `mask` of `color` in `(open, redop)` mode, coalescing with an
    /// existing state of the same mode.
    fn open_child(&mut self, open: OpenState, redop: ReductionOpId, color: Color, mask: &FieldMask) {
        if let Some(st) = self
            .states
            .iter_mut()
            .find(|s| s.open == open && s.redop == redop)
        {
            *st.open_children.entry(color).or_insert(FieldMask::EMPTY) |= mask;
            st.valid_fields |= mask;
            return;
        }
        let mut open_children = BTreeMap::new();
        open_children.insert(color, *mask);
        self.states.push(FieldState {
            open,
            redop,
            open_children,
            valid_fields: *mask,
        });
    }

    /// Removes `mask` bits of `color` from whatever mode holds them.
    fn remove_child_bits(&mut self, color: Color, mask: &FieldMask) {
        for st in &mut self.states {
            let emptied = match st.open_children.get_mut(&color) {
                Some(cm) => {
                    *cm -= mask;
                    cm.is_empty()
                }
                None => continue,
            };
            if emptied {
                st.open_children.remove(&color);
            }
            st.recompute();
        }
        self.states.retain(|s| !s.valid_fields.is_empty());
    }

    /// Removes `mask` bits from every open child.
    fn remove_all_child_bits(&mut self, mask: &FieldMask) {
        for st in &mut self.states {
            st.open_children.retain(|_, cm| {
                *cm -= mask;
                !cm.is_empty()
            });
            st.recompute();
        }
        self.states.retain(|s| !s.valid_fields.is_empty());
    }
}

// ============================================================================
// Pool hooks
// ============================================================================

/// Identity of a synthesized close operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CloseHandle {
    /// Pool reference for the close.
    pub op: OpRef,
    /// Its process-wide id.
    pub unique_id: UniqueOpId,
}

/// What the analysis needs from the operation pool while it runs.
pub trait AnalysisPool {
    /// Whether the slot still holds the generation `op` names.
    fn is_live(&self, op: OpRef) -> bool;

    /// Mints a close operation consolidating `mask` at `node`.
    fn synthesize_close(&mut self, node: TreeNodeRef, mask: &FieldMask) -> CloseHandle;
}

// ============================================================================
// Outcome
// ============================================================================

/// One edge of the dependence graph, found during registration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MappingDependence {
    /// The operation that must wait.
    pub successor: UniqueOpId,
    /// Pool reference of the successor.
    pub successor_ref: OpRef,
    /// The operation waited on.
    pub predecessor: UniqueOpId,
    /// Pool reference of the predecessor.
    pub predecessor_ref: OpRef,
    /// Classified obligation.
    pub kind: DependenceType,
    /// Fields over which the two conflict.
    pub mask: FieldMask,
}

/// A close minted during a registration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SynthesizedClose {
    /// The close operation.
    pub handle: CloseHandle,
    /// The node it consolidates.
    pub node: TreeNodeRef,
    /// Fields it consolidates.
    pub mask: FieldMask,
}

/// Everything one registration produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RegistrationOutcome {
    /// Field mask of the requirement, resolved through the field space.
    pub mask: FieldMask,
    /// Dependence edges, for the registered op and its closes alike.
    pub dependences: Vec<MappingDependence>,
    /// Closes minted along the path, in path order.
    pub closes: Vec<SynthesizedClose>,
}

// ============================================================================
// Privileges
// ============================================================================

/// Fields and privilege a context holds on one region.
#[derive(Clone, Debug)]
pub struct PrivilegeGrant {
    /// The region granted.
    pub region: LogicalRegion,
    /// Fields covered.
    pub mask: FieldMask,
    /// Strongest privilege permitted.
    pub privilege: PrivilegeMode,
}

/// Requirement rejections; checked before any analysis state changes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrivilegeError {
    /// The claimed parent is not a region this context holds.
    #[error("no privilege grant for the requirement's parent region")]
    UnknownParent(LogicalRegion),
    /// The target region is not below the claimed parent.
    #[error("region is not a subregion of the requirement's parent")]
    NotSubregion,
    /// The requirement names fields outside the grant.
    #[error("requirement names fields outside the granted set")]
    FieldsNotGranted,
    /// The requirement asks for more than the grant allows.
    #[error("requested privilege {requested} exceeds granted {granted}")]
    PrivilegeEscalation {
        /// What the grant allows.
        granted: PrivilegeMode,
        /// What the requirement asked for.
        requested: PrivilegeMode,
    },
    /// The requirement is internally inconsistent.
    #[error(transparent)]
    Requirement(#[from] RequirementError),
    /// A forest lookup failed.
    #[error(transparent)]
    Tree(TreeError),
}

impl From<TreeError> for PrivilegeError {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::NotSubregion => Self::NotSubregion,
            other => Self::Tree(other),
        }
    }
}

const fn privilege_covers(granted: PrivilegeMode, requested: PrivilegeMode) -> bool {
    match granted {
        PrivilegeMode::ReadWrite => true,
        PrivilegeMode::ReadOnly => matches!(
            requested,
            PrivilegeMode::NoAccess | PrivilegeMode::ReadOnly
        ),
        PrivilegeMode::WriteDiscard => matches!(
            requested,
            PrivilegeMode::NoAccess | PrivilegeMode::WriteDiscard
        ),
        PrivilegeMode::Reduce => matches!(
            requested,
            PrivilegeMode::NoAccess | PrivilegeMode::Reduce
        ),
        PrivilegeMode::NoAccess => matches!(requested, PrivilegeMode::NoAccess),
    }
}

// ============================================================================
// Context state
// ============================================================================

/// All logical analysis state one context holds.
#[derive(Debug, Default)]
pub struct ContextLogicalState {
    grants: Vec<PrivilegeGrant>,
    nodes: FxHashMap<TreeNodeRef, NodeState>,
}

impl ContextLogicalState {
    /// Fresh state with no grants.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `privilege` over `mask` of `region`, merging with an existing
    /// grant of the same region and privilege.
    pub fn add_grant(&mut self, region: LogicalRegion, mask: FieldMask, privilege: PrivilegeMode) {
        if let Some(g) = self
            .grants
            .iter_mut()
            .find(|g| g.region == region && g.privilege == privilege)
        {
            g.mask |= mask;
            return;
        }
        self.grants.push(PrivilegeGrant {
            region,
            mask,
            privilege,
        });
    }

    /// The grants currently held.
    #[must_use]
    pub fn grants(&self) -> &[PrivilegeGrant] {
        &self.grants
    }

    fn check_privilege(
        &self,
        req: &RegionRequirement,
        mask: &FieldMask,
    ) -> Result<(), PrivilegeError> {
        let grant = self
            .grants
            .iter()
            .find(|g| g.region == req.parent)
            .ok_or(PrivilegeError::UnknownParent(req.parent))?;
        if req.region.tree_id != req.parent.tree_id
            || req.region.field_space != req.parent.field_space
        {
            return Err(PrivilegeError::NotSubregion);
        }
        if !grant.mask.subsumes(mask) {
            return Err(PrivilegeError::FieldsNotGranted);
        }
        if !privilege_covers(grant.privilege, req.privilege) {
            return Err(PrivilegeError::PrivilegeEscalation {
                granted: grant.privilege,
                requested: req.privilege,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Registration
// ============================================================================

fn child_node_ref(
    forest: &RegionTreeForest,
    parent: TreeNodeRef,
    color: Color,
) -> Result<TreeNodeRef, TreeError> {
    match parent {
        TreeNodeRef::Region(r) => {
            let part = forest.index_partition_by_color(r.index_space, color)?;
            Ok(TreeNodeRef::Partition(LogicalPartition {
                index_partition: part,
                field_space: r.field_space,
                tree_id: r.tree_id,
            }))
        }
        TreeNodeRef::Partition(lp) => Ok(TreeNodeRef::Region(
            forest.get_logical_subregion(lp, color)?,
        )),
    }
}

fn siblings_disjoint(
    forest: &RegionTreeForest,
    node: TreeNodeRef,
    a: Color,
    b: Color,
) -> Result<bool, TreeError> {
    match node {
        TreeNodeRef::Region(r) => {
            let pa = forest.index_partition_by_color(r.index_space, a)?;
            let pb = forest.index_partition_by_color(r.index_space, b)?;
            forest.are_partitions_disjoint(pa, pb)
        }
        TreeNodeRef::Partition(lp) => forest.are_children_disjoint(lp.index_partition, a, b),
    }
}

/// Which open children must close before the access proceeds.
///
/// `next` is the child the fields continue into, or `None` at the target.
fn decide_closes(
    forest: &RegionTreeForest,
    node: TreeNodeRef,
    ns: &NodeState,
    next: Option<Color>,
    usage: &RegionUsage,
    mask: &FieldMask,
) -> Result<BTreeMap<Color, FieldMask>, TreeError> {
    let mut to_close: BTreeMap<Color, FieldMask> = BTreeMap::new();
    for st in &ns.states {
        if !st.valid_fields.overlaps(mask) {
            continue;
        }
        let same_redop = usage.privilege.is_reduce() && usage.redop == st.redop;
        let reducing = matches!(st.open, OpenState::SingleReduce | OpenState::MultiReduce);
        for (&oc, cm) in &st.open_children {
            let overlap = cm & mask;
            if overlap.is_empty() {
                continue;
            }
            let keep = match next {
                // Descending into this very child: only a reduction-mode
                // mismatch forces a flush before reopening.
                Some(c) if oc == c => !reducing || same_redop,
                // A sibling of the descent child.
                Some(c) => {
                    (st.open == OpenState::ReadOnly && usage.privilege.is_read_only())
                        || (reducing && same_redop)
                        || siblings_disjoint(forest, node, oc, c)?
                }
                // Access lands at this node: dirty children come home;
                // read-only children tolerate a read above them.
                None => st.open == OpenState::ReadOnly && usage.privilege.is_read_only(),
            };
            if !keep {
                *to_close.entry(oc).or_insert(FieldMask::EMPTY) |= &overlap;
            }
        }
    }
    Ok(to_close)
}

/// Walks a closed subtree collecting the users and resetting open bits.
#[derive(Default)]
struct LogicalCloser {
    closed_mask: FieldMask,
    closed_users: Vec<(LogicalUser, FieldMask)>,
}

impl LogicalCloser {
    fn close_child(
        &mut self,
        nodes: &mut FxHashMap<TreeNodeRef, NodeState>,
        forest: &RegionTreeForest,
        pool: &dyn AnalysisPool,
        parent: TreeNodeRef,
        color: Color,
        mask: &FieldMask,
    ) -> Result<(), TreeError> {
        self.closed_mask |= mask;
        let child = child_node_ref(forest, parent, color)?;
        self.close_node(nodes, forest, pool, child, mask)
    }

    fn close_node(
        &mut self,
        nodes: &mut FxHashMap<TreeNodeRef, NodeState>,
        forest: &RegionTreeForest,
        pool: &dyn AnalysisPool,
        node: TreeNodeRef,
        mask: &FieldMask,
    ) -> Result<(), TreeError> {
        let open: Vec<(Color, FieldMask)> = match nodes.get_mut(&node) {
            Some(ns) => {
                ns.users.retain_mut(|u| {
                    if !pool.is_live(u.op) {
                        return false;
                    }
                    let overlap = &u.mask & mask;
                    if overlap.is_empty() {
                        return true;
                    }
                    self.closed_users.push((u.clone(), overlap));
                    u.mask -= mask;
                    !u.mask.is_empty()
                });
                let open = ns
                    .states
                    .iter()
                    .flat_map(|st| {
                        st.open_children.iter().filter_map(|(&c, cm)| {
                            let overlap = cm & mask;
                            (!overlap.is_empty()).then_some((c, overlap))
                        })
                    })
                    .collect();
                ns.remove_all_child_bits(mask);
                open
            }
            None => return Ok(()),
        };
        for (c, overlap) in open {
            let child = child_node_ref(forest, node, c)?;
            self.close_node(nodes, forest, pool, child, &overlap)?;
        }
        Ok(())
    }
}

/// Registers one requirement of `op`, recording dependences and minting
/// closes.
///
/// The privilege check runs first and failure leaves the state untouched.
/// `NoAccess` requirements validate and return an empty outcome.
pub fn register_logical_user(
    state: &mut ContextLogicalState,
    forest: &RegionTreeForest,
    pool: &mut dyn AnalysisPool,
    op: OpRef,
    unique_id: UniqueOpId,
    req: &RegionRequirement,
) -> Result<RegistrationOutcome, PrivilegeError> {
    req.validate()?;
    let mask = forest.requirement_mask(req.region.field_space, &req.fields)?;
    state.check_privilege(req, &mask)?;
    let path = forest.region_path(req.parent.index_space, req.region.index_space)?;

    let mut outcome = RegistrationOutcome {
        mask,
        ..RegistrationOutcome::default()
    };
    let usage = req.usage();
    if usage.privilege == PrivilegeMode::NoAccess {
        return Ok(outcome);
    }

    // The node chain from privilege root to target, with the color the
    // fields continue into at each interior node.
    let mut chain: Vec<(TreeNodeRef, Option<Color>)> = Vec::with_capacity(path.len() * 2 + 1);
    let mut cursor = req.parent;
    for step in &path {
        chain.push((TreeNodeRef::Region(cursor), Some(step.partition_color)));
        let lp = LogicalPartition {
            index_partition: step.partition,
            field_space: cursor.field_space,
            tree_id: cursor.tree_id,
        };
        chain.push((TreeNodeRef::Partition(lp), Some(step.subspace_color)));
        cursor = LogicalRegion {
            index_space: step.subspace,
            field_space: cursor.field_space,
            tree_id: cursor.tree_id,
        };
    }
    chain.push((TreeNodeRef::Region(cursor), None));

    for (node, next) in chain {
        state.nodes.entry(node).or_default();

        let to_close = {
            let ns = match state.nodes.get(&node) {
                Some(ns) => ns,
                None => continue,
            };
            decide_closes(forest, node, ns, next, &usage, &mask)?
        };

        if !to_close.is_empty() {
            let mut closer = LogicalCloser::default();
            for (color, overlap) in &to_close {
                closer.close_child(&mut state.nodes, forest, &*pool, node, *color, overlap)?;
                if let Some(ns) = state.nodes.get_mut(&node) {
                    ns.remove_child_bits(*color, overlap);
                }
            }
            let closed = closer.closed_mask;
            let handle = pool.synthesize_close(node, &closed);
            debug!(
                close = %handle.unique_id,
                node = ?node,
                mask = ?closed,
                "synthesized close"
            );
            for (user, overlap) in closer.closed_users {
                let kind = classify_dependence(&user.usage, &CLOSE_USAGE);
                if kind != DependenceType::None {
                    outcome.dependences.push(MappingDependence {
                        successor: handle.unique_id,
                        successor_ref: handle.op,
                        predecessor: user.unique_id,
                        predecessor_ref: user.op,
                        kind,
                        mask: overlap,
                    });
                }
            }
            if let Some(ns) = state.nodes.get_mut(&node) {
                ns.users.push(LogicalUser {
                    op: handle.op,
                    unique_id: handle.unique_id,
                    usage: CLOSE_USAGE,
                    mask: closed,
                });
            }
            outcome.closes.push(SynthesizedClose {
                handle,
                node,
                mask: closed,
            });
        }

        let ns = match state.nodes.get_mut(&node) {
            Some(ns) => ns,
            None => continue,
        };

        ns.users.retain_mut(|u| {
            if !pool.is_live(u.op) {
                return false;
            }
            let overlap = &u.mask & &mask;
            if !overlap.is_empty() {
                let kind = classify_dependence(&u.usage, &usage);
                if kind != DependenceType::None {
                    outcome.dependences.push(MappingDependence {
                        successor: unique_id,
                        successor_ref: op,
                        predecessor: u.unique_id,
                        predecessor_ref: u.op,
                        kind,
                        mask: overlap,
                    });
                }
            }
            true
        });

        match next {
            Some(color) => {
                ns.remove_child_bits(color, &mask);
                if usage.privilege.is_reduce() {
                    // Joining an existing reduction epoch promotes the
                    // whole epoch to multi-reduce.
                    let promoted: Vec<(Color, FieldMask)> = ns
                        .states
                        .iter()
                        .filter(|st| {
                            st.redop == usage.redop
                                && matches!(
                                    st.open,
                                    OpenState::SingleReduce | OpenState::MultiReduce
                                )
                        })
                        .flat_map(|st| {
                            st.open_children.iter().filter_map(|(&oc, cm)| {
                                if oc == color {
                                    return None;
                                }
                                let overlap = cm & &mask;
                                (!overlap.is_empty()).then_some((oc, overlap))
                            })
                        })
                        .collect();
                    if promoted.is_empty() {
                        ns.open_child(OpenState::SingleReduce, usage.redop, color, &mask);
                    } else {
                        for (oc, overlap) in promoted {
                            ns.remove_child_bits(oc, &overlap);
                            ns.open_child(OpenState::MultiReduce, usage.redop, oc, &overlap);
                        }
                        ns.open_child(OpenState::MultiReduce, usage.redop, color, &mask);
                    }
                } else if usage.privilege.is_read_only() {
                    ns.open_child(OpenState::ReadOnly, ReductionOpId::NONE, color, &mask);
                } else {
                    ns.open_child(OpenState::ReadWrite, ReductionOpId::NONE, color, &mask);
                }
            }
            None => {
                ns.users.push(LogicalUser {
                    op,
                    unique_id,
                    usage,
                    mask,
                });
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Coloring, Domain};
    use crate::ident::{FieldId, GenerationId, IndexSpace};
    use crate::usage::PrivilegeMode::{ReadOnly, ReadWrite, Reduce};

    struct StubPool {
        next_slot: u32,
        next_id: u64,
        dead: Vec<OpRef>,
    }

    impl StubPool {
        fn new() -> Self {
            Self {
                next_slot: 1000,
                next_id: 1000,
                dead: Vec::new(),
            }
        }

        fn fresh(&mut self) -> (OpRef, UniqueOpId) {
            let op = OpRef {
                slot: self.next_slot,
                generation: GenerationId(1),
            };
            self.next_slot += 1;
            let id = UniqueOpId(self.next_id);
            self.next_id += 1;
            (op, id)
        }
    }

    impl AnalysisPool for StubPool {
        fn is_live(&self, op: OpRef) -> bool {
            !self.dead.contains(&op)
        }

        fn synthesize_close(&mut self, _node: TreeNodeRef, _mask: &FieldMask) -> CloseHandle {
            let (op, unique_id) = self.fresh();
            CloseHandle { op, unique_id }
        }
    }

    struct Fixture {
        forest: RegionTreeForest,
        state: ContextLogicalState,
        pool: StubPool,
        root: LogicalRegion,
        children: Vec<LogicalRegion>,
    }

    /// Root region over [0, 16) with three fields and one two-way
    /// partition; `aliased` picks overlapping child domains.
    fn fixture(aliased: bool) -> Fixture {
        let forest = RegionTreeForest::new();
        let top = forest.create_index_space(Domain::interval(0, 16));
        let fs = forest.create_field_space();
        let fields = vec![FieldId(1), FieldId(2), FieldId(3)];
        for &f in &fields {
            match forest.allocate_field(fs, f, 8) {
                Ok(_) => {}
                Err(e) => unreachable!("BUG: allocate failed: {e}"),
            }
        }
        let root = match forest.create_logical_region(top, fs) {
            Ok(r) => r,
            Err(e) => unreachable!("BUG: region failed: {e}"),
        };
        let mut coloring = Coloring::new();
        if aliased {
            coloring.insert(Color(0), Domain::interval(0, 10));
            coloring.insert(Color(1), Domain::interval(6, 16));
        } else {
            coloring.insert(Color(0), Domain::interval(0, 8));
            coloring.insert(Color(1), Domain::interval(8, 16));
        }
        let part = match forest.create_index_partition(top, &coloring, None) {
            Ok(p) => p,
            Err(e) => unreachable!("BUG: partition failed: {e}"),
        };
        let lp = match forest.get_logical_partition(root, part) {
            Ok(p) => p,
            Err(e) => unreachable!("BUG: logical partition failed: {e}"),
        };
        let children: Vec<LogicalRegion> = (0..2)
            .map(|c| match forest.get_logical_subregion(lp, Color(c)) {
                Ok(r) => r,
                Err(e) => unreachable!("BUG: subregion failed: {e}"),
            })
            .collect();
        let mut state = ContextLogicalState::new();
        state.add_grant(root, FieldMask::FULL, ReadWrite);
        Fixture {
            forest,
            state,
            pool: StubPool::new(),
            root,
            children,
        }
    }

    fn register(
        fx: &mut Fixture,
        region: LogicalRegion,
        fields: &[FieldId],
        privilege: PrivilegeMode,
    ) -> (UniqueOpId, RegistrationOutcome) {
        let (op, id) = fx.pool.fresh();
        let req = RegionRequirement::new(
            region,
            fx.root,
            fields.to_vec(),
            privilege,
            CoherenceProperty::Exclusive,
        );
        let outcome =
            match register_logical_user(&mut fx.state, &fx.forest, &mut fx.pool, op, id, &req) {
                Ok(o) => o,
                Err(e) => unreachable!("BUG: registration failed: {e}"),
            };
        (id, outcome)
    }

    #[test]
    fn sibling_write_closes_shared_fields_only() {
        let mut fx = fixture(true);
        let (child0, child1) = (fx.children[0], fx.children[1]);
        let (reader, out1) = register(&mut fx, child0, &[FieldId(1), FieldId(2)], ReadOnly);
        assert!(out1.dependences.is_empty());
        assert!(out1.closes.is_empty());

        let (writer, out2) = register(&mut fx, child1, &[FieldId(2), FieldId(3)], ReadWrite);
        assert_eq!(out2.closes.len(), 1, "exactly one close for the overlap");
        let close = out2.closes[0];
        let f2 = match fx.forest.requirement_mask(fx.root.field_space, &[FieldId(2)]) {
            Ok(m) => m,
            Err(e) => unreachable!("BUG: mask failed: {e}"),
        };
        assert_eq!(close.mask, f2, "close covers the shared field only");

        let close_dep = out2
            .dependences
            .iter()
            .find(|d| d.successor == close.handle.unique_id)
            .map(|d| (d.predecessor, d.kind));
        assert_eq!(
            close_dep,
            Some((reader, DependenceType::Anti)),
            "close anti-depends on the reader it evicts"
        );
        let op_dep = out2
            .dependences
            .iter()
            .find(|d| d.successor == writer)
            .map(|d| (d.predecessor, d.kind));
        assert_eq!(
            op_dep,
            Some((close.handle.unique_id, DependenceType::True)),
            "the writer orders behind the close"
        );
        assert!(
            !out2.dependences.iter().any(|d| d.successor == writer && d.predecessor == reader),
            "no direct edge to the reader; ordering flows through the close"
        );

        // The reader's untouched field stays open read-only.
        let lp = TreeNodeRef::Partition(LogicalPartition {
            index_partition: match fx.forest.index_partition_by_color(
                fx.root.index_space,
                Color(0),
            ) {
                Ok(p) => p,
                Err(e) => unreachable!("BUG: partition lookup failed: {e}"),
            },
            field_space: fx.root.field_space,
            tree_id: fx.root.tree_id,
        });
        let ns = match fx.state.nodes.get(&lp) {
            Some(ns) => ns,
            None => unreachable!("BUG: partition node missing"),
        };
        let f1 = match fx.forest.requirement_mask(fx.root.field_space, &[FieldId(1)]) {
            Ok(m) => m,
            Err(e) => unreachable!("BUG: mask failed: {e}"),
        };
        let ro = ns
            .states
            .iter()
            .find(|s| s.open == OpenState::ReadOnly)
            .and_then(|s| s.open_children.get(&Color(0)).copied());
        assert_eq!(ro, Some(f1), "field 1 stays open read-only under child 0");
    }

    #[test]
    fn disjoint_siblings_need_no_close() {
        let mut fx = fixture(false);
        let (child0, child1) = (fx.children[0], fx.children[1]);
        let (_, out1) = register(&mut fx, child0, &[FieldId(1), FieldId(2)], ReadOnly);
        assert!(out1.closes.is_empty());
        let (_, out2) = register(&mut fx, child1, &[FieldId(2), FieldId(3)], ReadWrite);
        assert!(out2.closes.is_empty(), "disjoint siblings stay open");
        assert!(out2.dependences.is_empty());
    }

    #[test]
    fn access_at_parent_closes_dirty_children() {
        let mut fx = fixture(false);
        let (child0, root) = (fx.children[0], fx.root);
        let (writer, _) = register(&mut fx, child0, &[FieldId(1)], ReadWrite);
        let (reader, out) = register(&mut fx, root, &[FieldId(1)], ReadOnly);
        // One close at the root; its sweep covers the partition and the
        // dirty leaf below it.
        assert_eq!(out.closes.len(), 1);
        assert!(
            out.dependences
                .iter()
                .any(|d| d.predecessor == writer && d.kind == DependenceType::True),
            "a close reads the dirty child home"
        );
        assert!(
            out.dependences
                .iter()
                .any(|d| d.successor == reader && d.kind == DependenceType::True),
            "the reader orders behind a close"
        );
    }

    #[test]
    fn read_only_children_tolerate_parent_reads() {
        let mut fx = fixture(false);
        let (child0, root) = (fx.children[0], fx.root);
        register(&mut fx, child0, &[FieldId(1)], ReadOnly);
        let (_, out) = register(&mut fx, root, &[FieldId(1)], ReadOnly);
        assert!(out.closes.is_empty(), "read above read-only child is clean");
    }

    #[test]
    fn same_redop_reductions_share_an_epoch() {
        let mut fx = fixture(true);
        let mk = |fx: &mut Fixture, child: usize, redop: u32| {
            let (op, id) = fx.pool.fresh();
            let req = RegionRequirement::reduction(
                fx.children[child],
                fx.root,
                vec![FieldId(1)],
                ReductionOpId(redop),
                CoherenceProperty::Exclusive,
            );
            match register_logical_user(&mut fx.state, &fx.forest, &mut fx.pool, op, id, &req) {
                Ok(o) => (id, o),
                Err(e) => unreachable!("BUG: registration failed: {e}"),
            }
        };
        let (_, out1) = mk(&mut fx, 0, 7);
        assert!(out1.closes.is_empty());
        let (_, out2) = mk(&mut fx, 1, 7);
        assert!(out2.closes.is_empty(), "same redop joins the epoch");
        assert!(out2.dependences.is_empty(), "reductions commute");

        let lp = TreeNodeRef::Partition(LogicalPartition {
            index_partition: match fx.forest.index_partition_by_color(
                fx.root.index_space,
                Color(0),
            ) {
                Ok(p) => p,
                Err(e) => unreachable!("BUG: partition lookup failed: {e}"),
            },
            field_space: fx.root.field_space,
            tree_id: fx.root.tree_id,
        });
        let ns = match fx.state.nodes.get(&lp) {
            Some(ns) => ns,
            None => unreachable!("BUG: partition node missing"),
        };
        assert!(
            ns.states
                .iter()
                .any(|s| s.open == OpenState::MultiReduce && s.open_children.len() == 2),
            "both children open in one multi-reduce epoch"
        );

        let (_, out3) = mk(&mut fx, 0, 9);
        assert_eq!(out3.closes.len(), 1, "a different redop flushes first");
    }

    #[test]
    fn privilege_checks_precede_mutation() {
        let mut fx = fixture(false);
        let (op, id) = fx.pool.fresh();

        let mut ro_state = ContextLogicalState::new();
        ro_state.add_grant(fx.root, FieldMask::FULL, ReadOnly);
        let req = RegionRequirement::new(
            fx.children[0],
            fx.root,
            vec![FieldId(1)],
            ReadWrite,
            CoherenceProperty::Exclusive,
        );
        assert_eq!(
            register_logical_user(&mut ro_state, &fx.forest, &mut fx.pool, op, id, &req),
            Err(PrivilegeError::PrivilegeEscalation {
                granted: ReadOnly,
                requested: ReadWrite,
            })
        );
        assert!(ro_state.nodes.is_empty(), "failed check mutates nothing");

        let foreign = LogicalRegion {
            index_space: IndexSpace(999),
            field_space: fx.root.field_space,
            tree_id: fx.root.tree_id,
        };
        let req = RegionRequirement::new(
            fx.children[0],
            foreign,
            vec![FieldId(1)],
            ReadOnly,
            CoherenceProperty::Exclusive,
        );
        assert_eq!(
            register_logical_user(&mut fx.state, &fx.forest, &mut fx.pool, op, id, &req),
            Err(PrivilegeError::UnknownParent(foreign))
        );

        let mut narrow = ContextLogicalState::new();
        narrow.add_grant(
            fx.root,
            FieldMask::single(0),
            ReadWrite,
        );
        let req = RegionRequirement::new(
            fx.children[0],
            fx.root,
            vec![FieldId(2)],
            ReadOnly,
            CoherenceProperty::Exclusive,
        );
        assert_eq!(
            register_logical_user(&mut narrow, &fx.forest, &mut fx.pool, op, id, &req),
            Err(PrivilegeError::FieldsNotGranted)
        );
    }

    #[test]
    fn retired_users_prune_during_traversal() {
        let mut fx = fixture(false);
        let child0 = fx.children[0];
        let (_, _) = register(&mut fx, child0, &[FieldId(1)], ReadWrite);
        // Retire the writer before anyone conflicts with it.
        let target = TreeNodeRef::Region(child0);
        let stale = match fx.state.nodes.get(&target) {
            Some(ns) => ns.users[0].op,
            None => unreachable!("BUG: target node missing"),
        };
        fx.pool.dead.push(stale);

        let (_, out) = register(&mut fx, child0, &[FieldId(1)], ReadWrite);
        assert!(
            out.dependences.is_empty(),
            "retired predecessors produce no edges"
        );
        let ns = match fx.state.nodes.get(&target) {
            Some(ns) => ns,
            None => unreachable!("BUG: target node missing"),
        };
        assert_eq!(ns.users.len(), 1, "the stale user was pruned");
    }

    #[test]
    fn no_access_registers_nothing() {
        let mut fx = fixture(false);
        let (op, id) = fx.pool.fresh();
        let req = RegionRequirement::new(
            fx.children[0],
            fx.root,
            vec![FieldId(1)],
            PrivilegeMode::NoAccess,
            CoherenceProperty::Exclusive,
        );
        let out =
            match register_logical_user(&mut fx.state, &fx.forest, &mut fx.pool, op, id, &req) {
                Ok(o) => o,
                Err(e) => unreachable!("BUG: registration failed: {e}"),
            };
        assert!(out.dependences.is_empty() && out.closes.is_empty());
        assert!(fx.state.nodes.is_empty());
    }

    #[test]
    fn writers_in_sequence_form_a_chain() {
        let mut fx = fixture(false);
        let child0 = fx.children[0];
        let (a, _) = register(&mut fx, child0, &[FieldId(1)], ReadWrite);
        let (b, out_b) = register(&mut fx, child0, &[FieldId(1)], ReadWrite);
        assert_eq!(out_b.dependences.len(), 1);
        assert_eq!(out_b.dependences[0].predecessor, a);
        assert_eq!(out_b.dependences[0].kind, DependenceType::True);
        let (_, out_c) = register(&mut fx, child0, &[FieldId(1)], ReadOnly);
        assert_eq!(out_c.dependences.len(), 2, "reader sees both writers");
        assert!(out_c.dependences.iter().any(|d| d.predecessor == b));
    }

    #[test]
    fn reduce_grant_covers_only_reductions() {
        assert!(privilege_covers(ReadWrite, Reduce));
        assert!(privilege_covers(Reduce, Reduce));
        assert!(!privilege_covers(Reduce, ReadOnly));
        assert!(!privilege_covers(ReadOnly, ReadWrite));
        assert!(privilege_covers(ReadOnly, PrivilegeMode::NoAccess));
    }
}
