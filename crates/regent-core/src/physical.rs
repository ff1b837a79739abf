// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Physical state: which instances hold which fields, per context.
//!
//! The logical layer decides *order*; this layer decides *data movement*.
//! Every tree node a context has touched carries a record of the instance
//! views currently holding valid data per field, the per-slot version
//! epoch, a mask of fields whose authoritative bytes live in an open
//! child, and the pending reduction views in issue order. Mapping an
//! access consults that record to decide which copies and reduction
//! flushes to issue, wires their preconditions from the recorded users of
//! the views involved, and updates the record eagerly so the next mapping
//! in dependence order sees the world as it will be.
//!
//! # Invariants
//!
//! - For any `(region, field)`, authoritative data is in the region's own
//!   valid views unless the field is in `dirty_below`, in which case it is
//!   in a descendant's state (recursively).
//! - A write-only mapping never issues copy-in; it advances the field's
//!   version epoch and invalidates every other view's claim to the field.
//! - A non-reduction access over fields with pending reductions flushes
//!   them: each pending view lands on the target instance in issue order,
//!   drained, before the access's own precondition can trigger.
//! - Concurrent-coherence mappings over overlapping fields bind to the
//!   same view, which stays pinned while such users are live.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{error, trace};

use regent_lowlevel::{Event, Fabric, Processor};

use crate::domain::Point;
use crate::field_mask::FieldMask;
use crate::forest::{RegionTreeForest, TreeError};
use crate::ident::{FieldId, LogicalRegion, ReductionOpId, VersionId};
use crate::manager::{ManagerError, PhysicalManager};
use crate::usage::{classify_dependence, CoherenceProperty, PrivilegeMode, RegionUsage};

// ============================================================================
// Errors
// ============================================================================

/// Errors from physical mapping and task-side region access.
#[derive(Debug, Error)]
pub enum PhysicalError {
    /// The instance view reference does not name a view of this context.
    #[error("unknown instance view")]
    UnknownView,
    /// The reduction view reference does not name a view of this context.
    #[error("unknown reduction view")]
    UnknownReductionView,
    /// The mapping target's manager variant does not fit the access.
    #[error("mapping needs a {want} manager, found {found}")]
    TargetKind {
        /// Variant the access requires.
        want: &'static str,
        /// Variant supplied.
        found: &'static str,
    },
    /// A reduction mapped onto a view folding a different operator.
    #[error("reduction operator mismatch: view folds {}, requirement uses {}", have.0, want.0)]
    RedopMismatch {
        /// Operator the view's manager folds.
        have: ReductionOpId,
        /// Operator the requirement declared.
        want: ReductionOpId,
    },
    /// A task touched a region in a way its privilege does not allow.
    #[error("{action} needs a {needed} privilege, requirement holds {held}")]
    PrivilegeViolation {
        /// What the task attempted.
        action: &'static str,
        /// Privilege class required.
        needed: &'static str,
        /// Privilege actually held.
        held: PrivilegeMode,
    },
    /// A task named a field its requirement did not carry.
    #[error("field {} is not part of this mapping", .0.0)]
    UnmappedField(FieldId),
    /// Element access or manager construction failed.
    #[error(transparent)]
    Manager(#[from] ManagerError),
    /// A forest lookup failed.
    #[error(transparent)]
    Tree(#[from] TreeError),
}

// ============================================================================
// Users and views
// ============================================================================

/// One recorded use of a view: what it did, which fields, and the event
/// that triggers when it has finished.
#[derive(Clone, Debug)]
pub struct PhysicalUser {
    /// Completion of the using operation (or copy, or flush).
    pub event: Event,
    /// How the fields were accessed.
    pub usage: RegionUsage,
    /// Fields touched.
    pub mask: FieldMask,
}

#[derive(Default)]
struct UserList {
    users: Mutex<Vec<PhysicalUser>>,
}

impl UserList {
    fn add(&self, user: PhysicalUser) {
        self.users.lock().push(user);
    }

    /// Events a new access must wait on. Users whose events have already
    /// triggered are pruned on the way through; a triggered precondition
    /// constrains nothing.
    fn preconditions(&self, fabric: &Fabric, usage: &RegionUsage, mask: &FieldMask) -> Vec<Event> {
        let mut users = self.users.lock();
        users.retain(|u| !fabric.has_triggered(u.event));
        users
            .iter()
            .filter(|u| u.mask.overlaps(mask))
            .filter(|u| classify_dependence(&u.usage, usage).orders_execution())
            .map(|u| u.event)
            .collect()
    }

    fn len(&self) -> usize {
        self.users.lock().len()
    }
}

/// A context's interface onto one normal instance.
pub struct InstanceView {
    manager: Arc<PhysicalManager>,
    users: UserList,
}

impl InstanceView {
    fn new(manager: Arc<PhysicalManager>) -> Self {
        Self {
            manager,
            users: UserList::default(),
        }
    }

    /// The manager behind the view.
    #[must_use]
    pub fn manager(&self) -> &Arc<PhysicalManager> {
        &self.manager
    }

    /// Records a use of the view.
    pub fn add_user(&self, user: PhysicalUser) {
        self.users.add(user);
    }

    /// Events a new access with `usage` over `mask` must wait on.
    pub fn preconditions(&self, fabric: &Fabric, usage: &RegionUsage, mask: &FieldMask) -> Vec<Event> {
        self.users.preconditions(fabric, usage, mask)
    }

    /// Number of recorded users, including already-finished ones not yet
    /// pruned.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

/// A context's interface onto one reduction manager.
pub struct ReductionView {
    manager: Arc<PhysicalManager>,
    users: UserList,
}

impl ReductionView {
    fn new(manager: Arc<PhysicalManager>) -> Self {
        Self {
            manager,
            users: UserList::default(),
        }
    }

    /// The manager behind the view.
    #[must_use]
    pub fn manager(&self) -> &Arc<PhysicalManager> {
        &self.manager
    }

    /// Records a use of the view.
    pub fn add_user(&self, user: PhysicalUser) {
        self.users.add(user);
    }

    /// Events a new access with `usage` over `mask` must wait on.
    pub fn preconditions(&self, fabric: &Fabric, usage: &RegionUsage, mask: &FieldMask) -> Vec<Event> {
        self.users.preconditions(fabric, usage, mask)
    }
}

/// Index of an instance view within its context.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ViewRef(pub u32);

/// Index of a reduction view within its context. Creation order doubles as
/// reduction issue order.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ReductionViewRef(pub u32);

// ============================================================================
// Per-node state
// ============================================================================

#[derive(Default)]
struct RegionState {
    versions: FxHashMap<u32, VersionId>,
    valid: Vec<(ViewRef, FieldMask)>,
    dirty_below: FieldMask,
    reductions: Vec<(ReductionViewRef, FieldMask)>,
}

impl RegionState {
    fn add_valid(&mut self, view: ViewRef, mask: &FieldMask) {
        for (v, m) in &mut self.valid {
            if *v == view {
                *m |= mask;
                return;
            }
        }
        self.valid.push((view, *mask));
    }

    /// Removes `mask` bits from every view's claim except `keep`'s.
    fn strip_valid_except(&mut self, keep: Option<ViewRef>, mask: &FieldMask) {
        for (v, m) in &mut self.valid {
            if Some(*v) != keep {
                *m -= mask;
            }
        }
        self.valid.retain(|(_, m)| !m.is_empty());
    }

    fn add_reduction(&mut self, view: ReductionViewRef, mask: &FieldMask) {
        for (v, m) in &mut self.reductions {
            if *v == view {
                *m |= mask;
                return;
            }
        }
        self.reductions.push((view, *mask));
    }

    fn strip_reductions(&mut self, mask: &FieldMask) {
        for (_, m) in &mut self.reductions {
            *m -= mask;
        }
        self.reductions.retain(|(_, m)| !m.is_empty());
    }

    fn bump_versions(&mut self, mask: &FieldMask) {
        for slot in mask.iter() {
            let v = self.versions.entry(slot as u32).or_insert(VersionId(0));
            *v = VersionId(v.0 + 1);
        }
    }
}

// ============================================================================
// Mapping requests and results
// ============================================================================

/// One requirement's worth of physical mapping input.
#[derive(Clone, Debug)]
pub struct AccessRequest {
    /// Region whose node the access binds to.
    pub region: LogicalRegion,
    /// Privilege, coherence, and reduction operator.
    pub usage: RegionUsage,
    /// Fields accessed, as slots.
    pub mask: FieldMask,
    /// Event that triggers when the accessing operation has finished;
    /// recorded as the new user's event so later mappings order behind it.
    pub completion: Event,
}

/// Where a mapping should land, as decided by the mapper (or by the
/// same-view rule for concurrent coherence).
#[derive(Debug)]
pub enum MapTarget {
    /// Bind to an existing instance view.
    Reuse(ViewRef),
    /// Bind to an existing reduction view.
    ReuseReduction(ReductionViewRef),
    /// Adopt a freshly created manager.
    Fresh(PhysicalManager),
}

/// The view an access was bound to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessTarget {
    /// Normal data access through an instance view.
    Instance(ViewRef),
    /// Reduction contributions through a reduction view.
    Reduction(ReductionViewRef),
}

/// Result of mapping one access.
#[derive(Debug)]
pub struct MappedAccess {
    /// The bound view.
    pub target: AccessTarget,
    /// Everything the operation's body must wait for: conflicting prior
    /// users, copy-ins, and forced flushes.
    pub precondition: Event,
    /// Copy-ins issued to fill the target.
    pub copy_events: Vec<Event>,
    /// Reduction flushes forced by this access.
    pub flush_events: Vec<Event>,
}

// ============================================================================
// Context physical state
// ============================================================================

/// All physical state one context has accumulated.
///
/// `BTreeMap` keyed by region so descendant sweeps visit nodes in a
/// deterministic order.
#[derive(Default)]
pub struct ContextPhysicalState {
    views: Vec<InstanceView>,
    red_views: Vec<ReductionView>,
    regions: BTreeMap<LogicalRegion, RegionState>,
    pins: FxHashMap<ViewRef, u32>,
}

impl ContextPhysicalState {
    /// An empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The instance view behind `view`, if it exists.
    #[must_use]
    pub fn view(&self, view: ViewRef) -> Option<&InstanceView> {
        self.views.get(view.0 as usize)
    }

    /// The reduction view behind `view`, if it exists.
    #[must_use]
    pub fn reduction_view(&self, view: ReductionViewRef) -> Option<&ReductionView> {
        self.red_views.get(view.0 as usize)
    }

    /// Views holding valid data for any of `mask` at `region`, with their
    /// claims narrowed to the overlap. Mapper input.
    #[must_use]
    pub fn valid_views(&self, region: LogicalRegion, mask: &FieldMask) -> Vec<(ViewRef, FieldMask)> {
        let Some(st) = self.regions.get(&region) else {
            return Vec::new();
        };
        st.valid
            .iter()
            .filter_map(|(v, m)| {
                let overlap = m & mask;
                (!overlap.is_empty()).then_some((*v, overlap))
            })
            .collect()
    }

    /// Pending reduction views overlapping `mask` at `region`, in issue
    /// order.
    #[must_use]
    pub fn pending_reductions(
        &self,
        region: LogicalRegion,
        mask: &FieldMask,
    ) -> Vec<(ReductionViewRef, FieldMask)> {
        let Some(st) = self.regions.get(&region) else {
            return Vec::new();
        };
        st.reductions
            .iter()
            .filter_map(|(v, m)| {
                let overlap = m & mask;
                (!overlap.is_empty()).then_some((*v, overlap))
            })
            .collect()
    }

    /// The version epoch of `slot` at `region`. Fields start at epoch zero
    /// and advance once per write mapping.
    #[must_use]
    pub fn version(&self, region: LogicalRegion, slot: u32) -> VersionId {
        self.regions
            .get(&region)
            .and_then(|st| st.versions.get(&slot))
            .copied()
            .unwrap_or(VersionId(0))
    }

    /// The view a concurrent-coherence mapping over `mask` must bind to,
    /// if one already holds valid data there. Pinned views win ties.
    #[must_use]
    pub fn find_simultaneous(&self, region: LogicalRegion, mask: &FieldMask) -> Option<ViewRef> {
        let st = self.regions.get(&region)?;
        let mut fallback = None;
        for (v, m) in &st.valid {
            if !m.overlaps(mask) {
                continue;
            }
            if self.pins.get(v).copied().unwrap_or(0) > 0 {
                return Some(*v);
            }
            if fallback.is_none() {
                fallback = Some(*v);
            }
        }
        fallback
    }

    /// Pins `view` for one live concurrent user.
    pub fn pin(&mut self, view: ViewRef) {
        *self.pins.entry(view).or_insert(0) += 1;
    }

    /// Releases one pin on `view`.
    pub fn unpin(&mut self, view: ViewRef) {
        match self.pins.get_mut(&view) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                self.pins.remove(&view);
            }
            None => debug_assert!(false, "BUG: unpin of unpinned view {view:?}"),
        }
    }

    /// Returns whether `view` currently has live concurrent users.
    #[must_use]
    pub fn is_pinned(&self, view: ViewRef) -> bool {
        self.pins.get(&view).copied().unwrap_or(0) > 0
    }

    fn push_instance(&mut self, manager: PhysicalManager) -> Result<ViewRef, PhysicalError> {
        if manager.is_reduction() {
            return Err(PhysicalError::TargetKind {
                want: "instance",
                found: manager.kind_name(),
            });
        }
        let view = ViewRef(self.views.len() as u32);
        self.views.push(InstanceView::new(Arc::new(manager)));
        Ok(view)
    }

    fn push_reduction(&mut self, manager: PhysicalManager) -> Result<ReductionViewRef, PhysicalError> {
        if !manager.is_reduction() {
            return Err(PhysicalError::TargetKind {
                want: "reduction",
                found: manager.kind_name(),
            });
        }
        let view = ReductionViewRef(self.red_views.len() as u32);
        self.red_views.push(ReductionView::new(Arc::new(manager)));
        Ok(view)
    }

    /// Registers an externally created instance manager as a view without
    /// mapping anything onto it.
    pub fn register_instance(&mut self, manager: PhysicalManager) -> Result<ViewRef, PhysicalError> {
        self.push_instance(manager)
    }

    /// Maps one access: binds it to a view, issues whatever copies and
    /// flushes the access needs, records the access as a user, and updates
    /// validity, versions, and dirty tracking.
    ///
    /// Callers invoke mappings in dependence order; the state update here
    /// is what the next mapping observes.
    pub fn map_access(
        &mut self,
        fabric: &Fabric,
        copy_proc: Processor,
        forest: &RegionTreeForest,
        req: &AccessRequest,
        target: MapTarget,
    ) -> Result<MappedAccess, PhysicalError> {
        if req.usage.privilege.is_reduce() {
            self.map_reduction(fabric, forest, req, target)
        } else {
            self.map_instance_access(fabric, copy_proc, forest, req, target)
        }
    }

    /// Maps a close: a read-write consolidation at `region` that pulls
    /// descendant data home, then invalidates the subtree below for the
    /// closed fields.
    pub fn close_access(
        &mut self,
        fabric: &Fabric,
        copy_proc: Processor,
        forest: &RegionTreeForest,
        region: LogicalRegion,
        mask: &FieldMask,
        completion: Event,
        target: MapTarget,
    ) -> Result<MappedAccess, PhysicalError> {
        let req = AccessRequest {
            region,
            usage: RegionUsage::new(PrivilegeMode::ReadWrite, CoherenceProperty::Exclusive),
            mask: *mask,
            completion,
        };
        let mapped = self.map_instance_access(fabric, copy_proc, forest, &req, target)?;
        self.invalidate_below(forest, region, mask);
        Ok(mapped)
    }

    fn map_reduction(
        &mut self,
        fabric: &Fabric,
        forest: &RegionTreeForest,
        req: &AccessRequest,
        target: MapTarget,
    ) -> Result<MappedAccess, PhysicalError> {
        let ancestors = self.ancestor_chain(forest, req.region)?;
        let view = match target {
            MapTarget::ReuseReduction(view) => {
                let have = self
                    .red_views
                    .get(view.0 as usize)
                    .ok_or(PhysicalError::UnknownReductionView)?
                    .manager
                    .redop();
                if have != req.usage.redop {
                    return Err(PhysicalError::RedopMismatch {
                        have,
                        want: req.usage.redop,
                    });
                }
                view
            }
            MapTarget::Fresh(manager) => {
                if manager.redop() != req.usage.redop {
                    return Err(PhysicalError::RedopMismatch {
                        have: manager.redop(),
                        want: req.usage.redop,
                    });
                }
                self.push_reduction(manager)?
            }
            MapTarget::Reuse(_) => {
                return Err(PhysicalError::TargetKind {
                    want: "reduction",
                    found: "instance",
                })
            }
        };
        let red_view = self
            .red_views
            .get(view.0 as usize)
            .ok_or(PhysicalError::UnknownReductionView)?;
        let waits = red_view.preconditions(fabric, &req.usage, &req.mask);
        red_view.add_user(PhysicalUser {
            event: req.completion,
            usage: req.usage,
            mask: req.mask,
        });
        let st = self.regions.entry(req.region).or_default();
        st.add_reduction(view, &req.mask);
        // Ancestors learn there are contributions pending below; their own
        // valid data stays, it is the base the contributions fold onto.
        for region in &ancestors {
            let st = self.regions.entry(*region).or_default();
            st.dirty_below |= &req.mask;
        }
        trace!(region = ?req.region, view = view.0, redop = req.usage.redop.0, "mapped reduction");
        Ok(MappedAccess {
            target: AccessTarget::Reduction(view),
            precondition: fabric.merge_events(&waits),
            copy_events: Vec::new(),
            flush_events: Vec::new(),
        })
    }

    fn map_instance_access(
        &mut self,
        fabric: &Fabric,
        copy_proc: Processor,
        forest: &RegionTreeForest,
        req: &AccessRequest,
        target: MapTarget,
    ) -> Result<MappedAccess, PhysicalError> {
        let dst = match target {
            MapTarget::Reuse(view) => {
                if self.views.get(view.0 as usize).is_none() {
                    return Err(PhysicalError::UnknownView);
                }
                view
            }
            MapTarget::Fresh(manager) => self.push_instance(manager)?,
            MapTarget::ReuseReduction(_) => {
                return Err(PhysicalError::TargetKind {
                    want: "instance",
                    found: "reduction",
                })
            }
        };

        let ancestors = self.ancestor_chain(forest, req.region)?;

        // What the target still needs brought in. Write-only access never
        // reads, so nothing is missing by definition.
        let mut missing = if req.usage.privilege.is_write_only() {
            FieldMask::new()
        } else {
            let mut m = req.mask;
            if let Some(st) = self.regions.get(&req.region) {
                for (v, vm) in &st.valid {
                    if *v == dst {
                        m -= vm;
                    }
                }
            }
            m
        };

        // Copy sources, nearest data first: sibling views at the node,
        // then descendants for fields the node has delegated downward,
        // then ancestors for everything else.
        let mut sources: Vec<(ViewRef, FieldMask)> = Vec::new();
        if !missing.is_empty() {
            if let Some(st) = self.regions.get(&req.region) {
                for (v, vm) in &st.valid {
                    if *v == dst {
                        continue;
                    }
                    let overlap = vm & &missing;
                    if !overlap.is_empty() {
                        missing -= &overlap;
                        sources.push((*v, overlap));
                    }
                }
            }
        }

        let dirty_needed = self
            .regions
            .get(&req.region)
            .map(|st| st.dirty_below & req.mask)
            .unwrap_or_default();
        let mut child_reductions: Vec<(ReductionViewRef, FieldMask)> = Vec::new();
        if !dirty_needed.is_empty() {
            for child in self.descendants_of(forest, req.region) {
                let Some(cst) = self.regions.get(&child) else {
                    continue;
                };
                for (v, vm) in &cst.valid {
                    let overlap = vm & &dirty_needed;
                    if !overlap.is_empty() {
                        sources.push((*v, overlap));
                    }
                }
                for (rv, rm) in &cst.reductions {
                    let overlap = rm & &req.mask;
                    if !overlap.is_empty() {
                        child_reductions.push((*rv, overlap));
                    }
                }
            }
            missing -= &dirty_needed;
        }

        if !missing.is_empty() {
            for region in ancestors.iter().rev() {
                if missing.is_empty() {
                    break;
                }
                let Some(st) = self.regions.get(region) else {
                    continue;
                };
                for (v, vm) in &st.valid {
                    let overlap = vm & &missing;
                    if !overlap.is_empty() {
                        missing -= &overlap;
                        sources.push((*v, overlap));
                    }
                }
            }
            if !missing.is_empty() {
                // First touch of these fields; the instance starts zeroed.
                trace!(region = ?req.region, fields = ?missing, "no source holds these fields yet");
            }
        }

        let mut copy_events = Vec::new();
        for (src, overlap) in &sources {
            let done = self.issue_copy(fabric, copy_proc, *src, dst, overlap)?;
            copy_events.push(done);
        }

        // Pending reductions under this access flush now, after copy-in,
        // in issue order.
        let mut flushes = self.pending_reductions(req.region, &req.mask);
        flushes.extend(child_reductions);
        flushes.sort_by_key(|(rv, _)| rv.0);
        let mut flush_events = Vec::new();
        let mut chain: Vec<Event> = copy_events.clone();
        for (rv, fm) in &flushes {
            let done = self.issue_flush(fabric, copy_proc, *rv, dst, fm, &chain)?;
            chain = vec![done];
            flush_events.push(done);
        }

        let dst_view = self.views.get(dst.0 as usize).ok_or(PhysicalError::UnknownView)?;
        let mut waits = dst_view.preconditions(fabric, &req.usage, &req.mask);
        waits.extend(copy_events.iter().copied());
        waits.extend(flush_events.iter().copied());
        let precondition = fabric.merge_events(&waits);
        dst_view.add_user(PhysicalUser {
            event: req.completion,
            usage: req.usage,
            mask: req.mask,
        });

        let has_write = req.usage.privilege.has_write();
        {
            let st = self.regions.entry(req.region).or_default();
            if has_write {
                st.strip_valid_except(Some(dst), &req.mask);
                st.bump_versions(&req.mask);
            }
            st.add_valid(dst, &req.mask);
            st.strip_reductions(&req.mask);
        }
        if has_write {
            for region in &ancestors {
                let st = self.regions.entry(*region).or_default();
                st.dirty_below |= &req.mask;
                st.strip_valid_except(None, &req.mask);
            }
        }
        if req.usage.coherence.is_concurrent() {
            self.pin(dst);
        }

        trace!(
            region = ?req.region,
            view = dst.0,
            copies = copy_events.len(),
            flushes = flush_events.len(),
            "mapped access"
        );
        Ok(MappedAccess {
            target: AccessTarget::Instance(dst),
            precondition,
            copy_events,
            flush_events,
        })
    }

    fn issue_copy(
        &self,
        fabric: &Fabric,
        copy_proc: Processor,
        src: ViewRef,
        dst: ViewRef,
        mask: &FieldMask,
    ) -> Result<Event, PhysicalError> {
        let src_view = self.views.get(src.0 as usize).ok_or(PhysicalError::UnknownView)?;
        let dst_view = self.views.get(dst.0 as usize).ok_or(PhysicalError::UnknownView)?;
        let read = RegionUsage::new(PrivilegeMode::ReadOnly, CoherenceProperty::Exclusive);
        let write = RegionUsage::new(PrivilegeMode::ReadWrite, CoherenceProperty::Exclusive);
        let mut waits = src_view.preconditions(fabric, &read, mask);
        waits.extend(dst_view.preconditions(fabric, &write, mask));
        let precondition = fabric.merge_events(&waits);
        let src_mgr = Arc::clone(&src_view.manager);
        let dst_mgr = Arc::clone(&dst_view.manager);
        let copy_mask = *mask;
        let done = fabric.spawn(copy_proc, precondition, move || {
            if let Err(e) = src_mgr.copy_into(&dst_mgr, &copy_mask) {
                debug_assert!(false, "BUG: deferred copy failed: {e}");
                error!(error = %e, "deferred copy failed");
            }
        });
        src_view.add_user(PhysicalUser {
            event: done,
            usage: read,
            mask: *mask,
        });
        dst_view.add_user(PhysicalUser {
            event: done,
            usage: write,
            mask: *mask,
        });
        trace!(src = src.0, dst = dst.0, fields = ?mask, "issued copy");
        Ok(done)
    }

    fn issue_flush(
        &self,
        fabric: &Fabric,
        copy_proc: Processor,
        src: ReductionViewRef,
        dst: ViewRef,
        mask: &FieldMask,
        after: &[Event],
    ) -> Result<Event, PhysicalError> {
        let red_view = self
            .red_views
            .get(src.0 as usize)
            .ok_or(PhysicalError::UnknownReductionView)?;
        let dst_view = self.views.get(dst.0 as usize).ok_or(PhysicalError::UnknownView)?;
        // The apply drains the reduction view and mutates the target, so
        // it behaves as a read-write user of both.
        let apply = RegionUsage::new(PrivilegeMode::ReadWrite, CoherenceProperty::Exclusive);
        let mut waits = red_view.preconditions(fabric, &apply, mask);
        waits.extend(dst_view.preconditions(fabric, &apply, mask));
        waits.extend(after.iter().copied());
        let precondition = fabric.merge_events(&waits);
        let red_mgr = Arc::clone(&red_view.manager);
        let dst_mgr = Arc::clone(&dst_view.manager);
        let flush_mask = *mask;
        let done = fabric.spawn(copy_proc, precondition, move || {
            if let Err(e) = red_mgr.apply_into(&dst_mgr, &flush_mask) {
                debug_assert!(false, "BUG: reduction flush failed: {e}");
                error!(error = %e, "reduction flush failed");
            }
        });
        red_view.add_user(PhysicalUser {
            event: done,
            usage: apply,
            mask: *mask,
        });
        dst_view.add_user(PhysicalUser {
            event: done,
            usage: apply,
            mask: *mask,
        });
        trace!(reduction = src.0, dst = dst.0, fields = ?mask, "issued reduction flush");
        Ok(done)
    }

    /// Ancestors of `region` from the tree root down, excluding `region`.
    fn ancestor_chain(
        &self,
        forest: &RegionTreeForest,
        region: LogicalRegion,
    ) -> Result<Vec<LogicalRegion>, PhysicalError> {
        let root = forest.region_tree_root(region.tree_id)?;
        let steps = forest.region_path(root.index_space, region.index_space)?;
        let mut chain = Vec::with_capacity(steps.len());
        let mut cursor = root;
        for step in &steps {
            chain.push(cursor);
            cursor = LogicalRegion {
                index_space: step.subspace,
                field_space: region.field_space,
                tree_id: region.tree_id,
            };
        }
        Ok(chain)
    }

    /// Strict descendants of `region` that carry physical state, in key
    /// order.
    fn descendants_of(&self, forest: &RegionTreeForest, region: LogicalRegion) -> Vec<LogicalRegion> {
        self.regions
            .keys()
            .filter(|r| r.tree_id == region.tree_id && **r != region)
            .filter(|r| forest.region_path(region.index_space, r.index_space).is_ok())
            .copied()
            .collect()
    }

    fn invalidate_below(&mut self, forest: &RegionTreeForest, region: LogicalRegion, mask: &FieldMask) {
        for child in self.descendants_of(forest, region) {
            if let Some(st) = self.regions.get_mut(&child) {
                st.strip_valid_except(None, mask);
                st.strip_reductions(mask);
                st.dirty_below -= mask;
            }
        }
        if let Some(st) = self.regions.get_mut(&region) {
            st.dirty_below -= mask;
        }
    }
}

// ============================================================================
// Task-side access
// ============================================================================

/// A task body's handle onto one mapped requirement.
///
/// Every access is checked against the privilege the requirement declared;
/// holding a region does not let a body exceed what it asked for.
pub struct PhysicalRegion {
    region: LogicalRegion,
    usage: RegionUsage,
    manager: Arc<PhysicalManager>,
    fields: Vec<(FieldId, u32)>,
}

impl std::fmt::Debug for PhysicalRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalRegion")
            .field("region", &self.region)
            .field("usage", &self.usage)
            .field("fields", &self.fields.len())
            .finish_non_exhaustive()
    }
}

impl PhysicalRegion {
    pub(crate) fn new(
        region: LogicalRegion,
        usage: RegionUsage,
        manager: Arc<PhysicalManager>,
        fields: Vec<(FieldId, u32)>,
    ) -> Self {
        Self {
            region,
            usage,
            manager,
            fields,
        }
    }

    /// The region this handle maps.
    #[must_use]
    pub const fn region(&self) -> LogicalRegion {
        self.region
    }

    /// The privilege and coherence the handle was mapped with.
    #[must_use]
    pub const fn usage(&self) -> RegionUsage {
        self.usage
    }

    /// The fields the handle carries.
    pub fn fields(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.fields.iter().map(|&(f, _)| f)
    }

    fn slot_of(&self, field: FieldId) -> Result<u32, PhysicalError> {
        self.fields
            .iter()
            .find(|&&(f, _)| f == field)
            .map(|&(_, slot)| slot)
            .ok_or(PhysicalError::UnmappedField(field))
    }

    /// Reads one element.
    pub fn read(&self, field: FieldId, point: Point) -> Result<Vec<u8>, PhysicalError> {
        if !self.usage.privilege.has_read() {
            return Err(PhysicalError::PrivilegeViolation {
                action: "read",
                needed: "readable",
                held: self.usage.privilege,
            });
        }
        Ok(self.manager.read_element(self.slot_of(field)?, point)?)
    }

    /// Overwrites one element.
    pub fn write(&self, field: FieldId, point: Point, bytes: &[u8]) -> Result<(), PhysicalError> {
        if !self.usage.privilege.has_write() || self.usage.privilege.is_reduce() {
            return Err(PhysicalError::PrivilegeViolation {
                action: "write",
                needed: "writable",
                held: self.usage.privilege,
            });
        }
        Ok(self.manager.write_element(self.slot_of(field)?, point, bytes)?)
    }

    /// Contributes one reduction value.
    pub fn reduce(&self, field: FieldId, point: Point, value: &[u8]) -> Result<(), PhysicalError> {
        if !self.usage.privilege.is_reduce() {
            return Err(PhysicalError::PrivilegeViolation {
                action: "reduce",
                needed: "reduce",
                held: self.usage.privilege,
            });
        }
        Ok(self.manager.fold_element(self.slot_of(field)?, point, value)?)
    }
}
