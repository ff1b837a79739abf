// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Physical managers: byte-level storage behind region data.
//!
//! A manager owns one lowlevel allocation plus a layout describing how
//! `(field slot, point)` pairs map onto its bytes. Normal instances store
//! data structure-of-arrays: one contiguous block per field slot, blocks
//! ascending by slot, points ordered by domain rank within each block.
//! Reduction managers buffer deferred contributions instead of
//! authoritative data and land them on a normal instance at flush time.
//!
//! # Invariants
//!
//! - Element access is slot-, point-, and size-checked; a caller can never
//!   touch bytes outside its own element.
//! - A list manager preserves contribution order; `apply_into` lands
//!   entries in exactly the order they were recorded.
//! - A fold buffer starts at the operator's identity and returns to it
//!   after every flush.
//! - Flushes drain: each contribution is applied exactly once.

use std::ops::Range;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use regent_lowlevel::{Fabric, InstanceHandle, Memory, MemoryError};

use crate::domain::{Domain, Point};
use crate::field_mask::FieldMask;
use crate::ident::{DistributedId, LogicalRegion, ReductionOpId};
use crate::reduction::ReductionOp;

// ============================================================================
// Layout
// ============================================================================

/// One field's block within an instance layout.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FieldBlock {
    /// Field slot the block stores.
    pub slot: u32,
    /// Bytes per element.
    pub element_size: usize,
    /// Byte offset of the block within the allocation.
    pub offset: usize,
}

/// Structure-of-arrays layout over `domain × field slots`.
#[derive(Clone, Debug)]
pub struct InstanceLayout {
    domain: Domain,
    blocks: Vec<FieldBlock>,
    total_size: usize,
}

impl InstanceLayout {
    /// Lays out one block per `(slot, element_size)` pair over `domain`,
    /// blocks ascending by slot regardless of input order.
    #[must_use]
    pub fn new(domain: Domain, slot_sizes: &[(u32, usize)]) -> Self {
        let volume = domain.volume() as usize;
        let mut pairs: Vec<(u32, usize)> = slot_sizes.to_vec();
        pairs.sort_unstable_by_key(|&(slot, _)| slot);
        pairs.dedup_by_key(|&mut (slot, _)| slot);
        let mut blocks = Vec::with_capacity(pairs.len());
        let mut offset = 0usize;
        for (slot, element_size) in pairs {
            blocks.push(FieldBlock {
                slot,
                element_size,
                offset,
            });
            offset += volume * element_size;
        }
        Self {
            domain,
            blocks,
            total_size: offset,
        }
    }

    /// The point set the layout covers.
    #[must_use]
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Total bytes of the allocation.
    #[must_use]
    pub const fn total_size(&self) -> usize {
        self.total_size
    }

    /// Mask of the slots the layout stores.
    #[must_use]
    pub fn slot_mask(&self) -> FieldMask {
        self.blocks.iter().map(|b| b.slot as usize).collect()
    }

    /// The block storing `slot`, if present.
    #[must_use]
    pub fn block(&self, slot: u32) -> Option<&FieldBlock> {
        self.blocks
            .binary_search_by_key(&slot, |b| b.slot)
            .ok()
            .and_then(|i| self.blocks.get(i))
    }

    /// Byte range of the element at `(slot, point)`.
    #[must_use]
    pub fn byte_range(&self, slot: u32, point: Point) -> Option<Range<usize>> {
        let block = self.block(slot)?;
        let rank = self.domain.rank_of(point)? as usize;
        let start = block.offset + rank * block.element_size;
        Some(start..start + block.element_size)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from manager construction and element access.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The slot is not part of the manager's layout.
    #[error("field slot {0} is not in the instance layout")]
    MissingSlot(u32),
    /// The point lies outside the manager's domain.
    #[error("point {0} is outside the instance domain")]
    PointOutsideDomain(Point),
    /// The caller passed bytes of the wrong length for the slot.
    #[error("element size mismatch on slot {slot}: holds {have} bytes, got {got}")]
    ElementSize {
        /// Slot accessed.
        slot: u32,
        /// Bytes the slot's elements hold.
        have: usize,
        /// Bytes the caller passed.
        got: usize,
    },
    /// A reduction manager was requested over a field whose size differs
    /// from the operator's element size.
    #[error("reduction operator {} folds {element}-byte elements but slot {slot} holds {field} bytes", redop.0)]
    ReductionSizeMismatch {
        /// The operator.
        redop: ReductionOpId,
        /// Offending slot.
        slot: u32,
        /// The operator's element size.
        element: usize,
        /// The field's size.
        field: usize,
    },
    /// The operation needs a different manager variant.
    #[error("{op} needs a {want} manager, found {found}")]
    WrongManagerKind {
        /// Operation attempted.
        op: &'static str,
        /// Variant required.
        want: &'static str,
        /// Variant present.
        found: &'static str,
    },
    /// The backing allocation failed.
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

// ============================================================================
// Instance managers
// ============================================================================

/// A normal instance holding authoritative field data.
pub struct InstanceManager {
    did: DistributedId,
    region: LogicalRegion,
    memory: Memory,
    layout: InstanceLayout,
    data: InstanceHandle,
}

impl std::fmt::Debug for InstanceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceManager")
            .field("did", &self.did)
            .field("region", &self.region)
            .field("memory", &self.memory)
            .field("bytes", &self.layout.total_size())
            .finish_non_exhaustive()
    }
}

impl InstanceManager {
    fn create(
        fabric: &Fabric,
        memory: Memory,
        did: DistributedId,
        region: LogicalRegion,
        layout: InstanceLayout,
    ) -> Result<Self, ManagerError> {
        let data = fabric.allocate_instance(memory, layout.total_size())?;
        debug!(
            did = %did,
            memory = memory.raw(),
            bytes = layout.total_size(),
            "created instance"
        );
        Ok(Self {
            did,
            region,
            memory,
            layout,
            data,
        })
    }

    fn element(&self, slot: u32, point: Point, len: Option<usize>) -> Result<Range<usize>, ManagerError> {
        let block = self
            .layout
            .block(slot)
            .ok_or(ManagerError::MissingSlot(slot))?;
        if let Some(got) = len {
            if got != block.element_size {
                return Err(ManagerError::ElementSize {
                    slot,
                    have: block.element_size,
                    got,
                });
            }
        }
        self.layout
            .byte_range(slot, point)
            .ok_or(ManagerError::PointOutsideDomain(point))
    }

    /// The layout of the allocation.
    #[must_use]
    pub fn layout(&self) -> &InstanceLayout {
        &self.layout
    }

    /// Reads one element.
    pub fn read_element(&self, slot: u32, point: Point) -> Result<Vec<u8>, ManagerError> {
        let range = self.element(slot, point, None)?;
        Ok(self.data.with_bytes(|b| b[range].to_vec()))
    }

    /// Overwrites one element.
    pub fn write_element(&self, slot: u32, point: Point, bytes: &[u8]) -> Result<(), ManagerError> {
        let range = self.element(slot, point, Some(bytes.len()))?;
        self.data.with_bytes_mut(|b| b[range].copy_from_slice(bytes));
        Ok(())
    }

    /// Combines `rhs` into one element with `f`.
    pub fn combine_element(
        &self,
        slot: u32,
        point: Point,
        f: fn(&mut [u8], &[u8]),
        rhs: &[u8],
    ) -> Result<(), ManagerError> {
        let range = self.element(slot, point, Some(rhs.len()))?;
        self.data.with_bytes_mut(|b| f(&mut b[range], rhs));
        Ok(())
    }
}

// ============================================================================
// Reduction managers
// ============================================================================

struct ListEntry {
    slot: u32,
    point: Point,
    value: Vec<u8>,
}

/// Deferred reduction contributions, kept as an ordered list.
///
/// Entry storage grows with the contribution count rather than the domain
/// volume; the layout is carried for slot and point validation only.
pub struct ListReductionManager {
    did: DistributedId,
    region: LogicalRegion,
    memory: Memory,
    redop: ReductionOpId,
    op: ReductionOp,
    layout: InstanceLayout,
    entries: Mutex<Vec<ListEntry>>,
}

impl std::fmt::Debug for ListReductionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListReductionManager")
            .field("did", &self.did)
            .field("redop", &self.redop)
            .field("pending", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl ListReductionManager {
    fn record(&self, slot: u32, point: Point, value: &[u8]) -> Result<(), ManagerError> {
        if self.layout.block(slot).is_none() {
            return Err(ManagerError::MissingSlot(slot));
        }
        if !self.layout.domain().contains(point) {
            return Err(ManagerError::PointOutsideDomain(point));
        }
        if value.len() != self.op.element_size {
            return Err(ManagerError::ElementSize {
                slot,
                have: self.op.element_size,
                got: value.len(),
            });
        }
        self.entries.lock().push(ListEntry {
            slot,
            point,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn apply_entries(&self, dst: &InstanceManager, mask: &FieldMask) -> Result<u64, ManagerError> {
        let drained: Vec<ListEntry> = {
            let mut entries = self.entries.lock();
            let mut kept = Vec::with_capacity(entries.len());
            let mut take = Vec::new();
            for entry in entries.drain(..) {
                if mask.test(entry.slot as usize) {
                    take.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            *entries = kept;
            take
        };
        let mut applied = 0u64;
        for entry in &drained {
            dst.combine_element(entry.slot, entry.point, self.op.apply, &entry.value)?;
            applied += 1;
        }
        trace!(did = %self.did, applied, "applied list reductions");
        Ok(applied)
    }
}

/// Deferred reduction contributions, folded into a dense per-point buffer.
pub struct FoldReductionManager {
    did: DistributedId,
    region: LogicalRegion,
    memory: Memory,
    redop: ReductionOpId,
    op: ReductionOp,
    layout: InstanceLayout,
    data: InstanceHandle,
}

impl std::fmt::Debug for FoldReductionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FoldReductionManager")
            .field("did", &self.did)
            .field("redop", &self.redop)
            .field("bytes", &self.layout.total_size())
            .finish_non_exhaustive()
    }
}

impl FoldReductionManager {
    fn fill_identity(&self) {
        self.data.with_bytes_mut(|bytes| {
            for chunk in bytes.chunks_exact_mut(self.op.element_size) {
                chunk.copy_from_slice(&self.op.identity);
            }
        });
    }

    fn fold(&self, slot: u32, point: Point, value: &[u8]) -> Result<(), ManagerError> {
        if value.len() != self.op.element_size {
            return Err(ManagerError::ElementSize {
                slot,
                have: self.op.element_size,
                got: value.len(),
            });
        }
        let range = self
            .layout
            .block(slot)
            .ok_or(ManagerError::MissingSlot(slot))
            .and_then(|_| {
                self.layout
                    .byte_range(slot, point)
                    .ok_or(ManagerError::PointOutsideDomain(point))
            })?;
        self.data
            .with_bytes_mut(|b| (self.op.fold)(&mut b[range], value));
        Ok(())
    }

    fn apply_buffer(&self, dst: &InstanceManager, mask: &FieldMask) -> Result<u64, ManagerError> {
        let mut applied = 0u64;
        for slot in mask.iter() {
            let slot = slot as u32;
            if self.layout.block(slot).is_none() {
                continue;
            }
            for point in self.layout.domain().points() {
                let Some(range) = self.layout.byte_range(slot, point) else {
                    debug_assert!(false, "BUG: enumerated point escaped its own layout");
                    continue;
                };
                let acc = self.data.with_bytes(|b| b[range.clone()].to_vec());
                dst.combine_element(slot, point, self.op.apply, &acc)?;
                self.data
                    .with_bytes_mut(|b| b[range].copy_from_slice(&self.op.identity));
                applied += 1;
            }
        }
        trace!(did = %self.did, applied, "applied fold reductions");
        Ok(applied)
    }
}

// ============================================================================
// The tagged union
// ============================================================================

/// One physical manager: the storage behind a mapped region.
///
/// The three variants share ownership semantics (a distributed id, a home
/// memory, a layout) and differ in what the bytes mean. Code that needs a
/// particular variant goes through the checked accessors; passing the wrong
/// variant is reported, never assumed away.
#[derive(Debug)]
pub enum PhysicalManager {
    /// Authoritative field data.
    Instance(InstanceManager),
    /// Ordered list of deferred reduction contributions.
    ListReduction(ListReductionManager),
    /// Identity-initialized fold buffer for one reduction operator.
    FoldReduction(FoldReductionManager),
}

impl PhysicalManager {
    /// Allocates a normal instance in `memory`.
    pub fn instance(
        fabric: &Fabric,
        memory: Memory,
        did: DistributedId,
        region: LogicalRegion,
        domain: Domain,
        slot_sizes: &[(u32, usize)],
    ) -> Result<Self, ManagerError> {
        let layout = InstanceLayout::new(domain, slot_sizes);
        InstanceManager::create(fabric, memory, did, region, layout).map(Self::Instance)
    }

    /// Builds a list reduction manager for `redop` over the given fields.
    ///
    /// Every slot's field size must equal the operator's element size.
    pub fn list_reduction(
        memory: Memory,
        did: DistributedId,
        region: LogicalRegion,
        domain: Domain,
        slot_sizes: &[(u32, usize)],
        redop: ReductionOpId,
        op: &ReductionOp,
    ) -> Result<Self, ManagerError> {
        check_reduction_sizes(slot_sizes, redop, op)?;
        let layout = InstanceLayout::new(domain, slot_sizes);
        debug!(did = %did, redop = redop.0, "created list reduction manager");
        Ok(Self::ListReduction(ListReductionManager {
            did,
            region,
            memory,
            redop,
            op: op.clone(),
            layout,
            entries: Mutex::new(Vec::new()),
        }))
    }

    /// Allocates a fold reduction buffer for `redop` over the given fields,
    /// initialized to the operator's identity.
    pub fn fold_reduction(
        fabric: &Fabric,
        memory: Memory,
        did: DistributedId,
        region: LogicalRegion,
        domain: Domain,
        slot_sizes: &[(u32, usize)],
        redop: ReductionOpId,
        op: &ReductionOp,
    ) -> Result<Self, ManagerError> {
        check_reduction_sizes(slot_sizes, redop, op)?;
        let layout = InstanceLayout::new(domain, slot_sizes);
        let data = fabric.allocate_instance(memory, layout.total_size())?;
        let manager = FoldReductionManager {
            did,
            region,
            memory,
            redop,
            op: op.clone(),
            layout,
            data,
        };
        manager.fill_identity();
        debug!(did = %did, redop = redop.0, bytes = manager.layout.total_size(), "created fold reduction manager");
        Ok(Self::FoldReduction(manager))
    }

    /// The manager's distributed id.
    #[must_use]
    pub const fn did(&self) -> DistributedId {
        match self {
            Self::Instance(m) => m.did,
            Self::ListReduction(m) => m.did,
            Self::FoldReduction(m) => m.did,
        }
    }

    /// The region the manager was created for.
    #[must_use]
    pub const fn region(&self) -> LogicalRegion {
        match self {
            Self::Instance(m) => m.region,
            Self::ListReduction(m) => m.region,
            Self::FoldReduction(m) => m.region,
        }
    }

    /// The memory the manager lives in.
    #[must_use]
    pub const fn memory(&self) -> Memory {
        match self {
            Self::Instance(m) => m.memory,
            Self::ListReduction(m) => m.memory,
            Self::FoldReduction(m) => m.memory,
        }
    }

    /// The reduction operator, [`ReductionOpId::NONE`] for instances.
    #[must_use]
    pub const fn redop(&self) -> ReductionOpId {
        match self {
            Self::Instance(_) => ReductionOpId::NONE,
            Self::ListReduction(m) => m.redop,
            Self::FoldReduction(m) => m.redop,
        }
    }

    /// Variant name for logs and errors.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Instance(_) => "instance",
            Self::ListReduction(_) => "list-reduction",
            Self::FoldReduction(_) => "fold-reduction",
        }
    }

    /// Returns whether the manager buffers reductions.
    #[must_use]
    pub const fn is_reduction(&self) -> bool {
        !matches!(self, Self::Instance(_))
    }

    /// The manager's layout.
    #[must_use]
    pub const fn layout(&self) -> &InstanceLayout {
        match self {
            Self::Instance(m) => &m.layout,
            Self::ListReduction(m) => &m.layout,
            Self::FoldReduction(m) => &m.layout,
        }
    }

    /// The instance variant, if that is what this is.
    #[must_use]
    pub const fn as_instance(&self) -> Option<&InstanceManager> {
        match self {
            Self::Instance(m) => Some(m),
            _ => None,
        }
    }

    fn require_instance(&self, op: &'static str) -> Result<&InstanceManager, ManagerError> {
        self.as_instance().ok_or(ManagerError::WrongManagerKind {
            op,
            want: "instance",
            found: self.kind_name(),
        })
    }

    /// Reads one element of a normal instance.
    pub fn read_element(&self, slot: u32, point: Point) -> Result<Vec<u8>, ManagerError> {
        self.require_instance("read_element")?.read_element(slot, point)
    }

    /// Overwrites one element of a normal instance.
    pub fn write_element(&self, slot: u32, point: Point, bytes: &[u8]) -> Result<(), ManagerError> {
        self.require_instance("write_element")?
            .write_element(slot, point, bytes)
    }

    /// Records one reduction contribution.
    pub fn fold_element(&self, slot: u32, point: Point, value: &[u8]) -> Result<(), ManagerError> {
        match self {
            Self::Instance(_) => Err(ManagerError::WrongManagerKind {
                op: "fold_element",
                want: "reduction",
                found: self.kind_name(),
            }),
            Self::ListReduction(m) => m.record(slot, point, value),
            Self::FoldReduction(m) => m.fold(slot, point, value),
        }
    }

    /// Lands this manager's pending contributions for `mask` on `dst`,
    /// draining them. Returns the number of applications performed.
    pub fn apply_into(&self, dst: &Self, mask: &FieldMask) -> Result<u64, ManagerError> {
        let target = dst.require_instance("apply_into")?;
        match self {
            Self::Instance(_) => Err(ManagerError::WrongManagerKind {
                op: "apply_into",
                want: "reduction",
                found: self.kind_name(),
            }),
            Self::ListReduction(m) => m.apply_entries(target, mask),
            Self::FoldReduction(m) => m.apply_buffer(target, mask),
        }
    }

    /// Copies `mask` fields from this instance into `dst` over the
    /// intersection of their domains. Returns elements moved.
    pub fn copy_into(&self, dst: &Self, mask: &FieldMask) -> Result<u64, ManagerError> {
        let src = self.require_instance("copy_into")?;
        let target = dst.require_instance("copy_into")?;
        if src.did == target.did {
            return Ok(0);
        }
        let span = src.layout.domain().intersection(target.layout.domain());
        let mut moved = 0u64;
        for slot in mask.iter() {
            let slot = slot as u32;
            let from = src
                .layout
                .block(slot)
                .ok_or(ManagerError::MissingSlot(slot))?;
            let to = target
                .layout
                .block(slot)
                .ok_or(ManagerError::MissingSlot(slot))?;
            if from.element_size != to.element_size {
                return Err(ManagerError::ElementSize {
                    slot,
                    have: to.element_size,
                    got: from.element_size,
                });
            }
            for point in span.points() {
                let (Some(sr), Some(tr)) = (
                    src.layout.byte_range(slot, point),
                    target.layout.byte_range(slot, point),
                ) else {
                    debug_assert!(false, "BUG: intersection point escaped a layout");
                    continue;
                };
                src.data
                    .with_bytes(|s| target.data.with_bytes_mut(|d| d[tr].copy_from_slice(&s[sr])));
                moved += 1;
            }
        }
        trace!(src = %src.did, dst = %target.did, moved, "copied fields");
        Ok(moved)
    }

    /// Returns the manager's allocation to its memory. List managers hold
    /// no allocation; for them this is a no-op.
    pub fn release(&self, fabric: &Fabric) {
        match self {
            Self::Instance(m) => fabric.free_instance(&m.data),
            Self::ListReduction(_) => {}
            Self::FoldReduction(m) => fabric.free_instance(&m.data),
        }
    }
}

fn check_reduction_sizes(
    slot_sizes: &[(u32, usize)],
    redop: ReductionOpId,
    op: &ReductionOp,
) -> Result<(), ManagerError> {
    for &(slot, field) in slot_sizes {
        if field != op.element_size {
            return Err(ManagerError::ReductionSizeMismatch {
                redop,
                slot,
                element: op.element_size,
                field,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::{AddressSpaceId, FieldSpaceId, IndexSpace, RegionTreeId};
    use crate::reduction::{max_u64, sum_u64};
    use regent_lowlevel::MachineDesc;

    fn fabric() -> Fabric {
        match Fabric::start(MachineDesc::symmetric(1, 0, 1 << 20)) {
            Ok(f) => f,
            Err(e) => unreachable!("BUG: fabric start failed in test: {e}"),
        }
    }

    fn region() -> LogicalRegion {
        LogicalRegion {
            index_space: IndexSpace(0),
            field_space: FieldSpaceId(0),
            tree_id: RegionTreeId(0),
        }
    }

    fn did(seq: u64) -> DistributedId {
        DistributedId::pack(AddressSpaceId(0), seq)
    }

    fn u64_bytes(v: u64) -> Vec<u8> {
        v.to_le_bytes().to_vec()
    }

    #[test]
    fn layout_blocks_ascend_by_slot() {
        let layout = InstanceLayout::new(Domain::interval(0, 4), &[(2, 4), (0, 8)]);
        assert_eq!(layout.total_size(), 4 * 8 + 4 * 4);
        let b0 = layout.block(0);
        let b2 = layout.block(2);
        assert_eq!(b0.map(|b| b.offset), Some(0));
        assert_eq!(b2.map(|b| b.offset), Some(32));
        assert_eq!(layout.byte_range(2, 1), Some(36..40));
        assert_eq!(layout.byte_range(1, 0), None);
        assert_eq!(layout.byte_range(0, 4), None);
    }

    #[test]
    fn instance_elements_round_trip() {
        let f = fabric();
        let mem = f.memories()[0];
        let m = match PhysicalManager::instance(
            &f,
            mem,
            did(1),
            region(),
            Domain::interval(0, 8),
            &[(0, 8)],
        ) {
            Ok(m) => m,
            Err(e) => unreachable!("BUG: instance creation failed: {e}"),
        };
        if let Err(e) = m.write_element(0, 3, &u64_bytes(99)) {
            unreachable!("BUG: write failed: {e}");
        }
        match m.read_element(0, 3) {
            Ok(bytes) => assert_eq!(bytes, u64_bytes(99)),
            Err(e) => unreachable!("BUG: read failed: {e}"),
        }
        match m.read_element(0, 0) {
            Ok(bytes) => assert_eq!(bytes, u64_bytes(0), "untouched elements stay zeroed"),
            Err(e) => unreachable!("BUG: read failed: {e}"),
        }
        m.release(&f);
        f.shutdown();
    }

    #[test]
    fn element_access_is_checked() {
        let f = fabric();
        let mem = f.memories()[0];
        let m = match PhysicalManager::instance(
            &f,
            mem,
            did(1),
            region(),
            Domain::interval(0, 4),
            &[(0, 8)],
        ) {
            Ok(m) => m,
            Err(e) => unreachable!("BUG: instance creation failed: {e}"),
        };
        assert!(matches!(
            m.write_element(1, 0, &u64_bytes(1)),
            Err(ManagerError::MissingSlot(1))
        ));
        assert!(matches!(
            m.write_element(0, 9, &u64_bytes(1)),
            Err(ManagerError::PointOutsideDomain(9))
        ));
        assert!(matches!(
            m.write_element(0, 0, &[1, 2, 3]),
            Err(ManagerError::ElementSize { slot: 0, have: 8, got: 3 })
        ));
        assert!(matches!(
            m.fold_element(0, 0, &u64_bytes(1)),
            Err(ManagerError::WrongManagerKind { .. })
        ));
        m.release(&f);
        f.shutdown();
    }

    #[test]
    fn fold_buffer_accumulates_and_flushes_once() {
        let f = fabric();
        let mem = f.memories()[0];
        let dom = Domain::interval(0, 4);
        let dst = match PhysicalManager::instance(&f, mem, did(1), region(), dom.clone(), &[(0, 8)])
        {
            Ok(m) => m,
            Err(e) => unreachable!("BUG: instance creation failed: {e}"),
        };
        let red = match PhysicalManager::fold_reduction(
            &f,
            mem,
            did(2),
            region(),
            dom,
            &[(0, 8)],
            ReductionOpId(1),
            &sum_u64(),
        ) {
            Ok(m) => m,
            Err(e) => unreachable!("BUG: fold creation failed: {e}"),
        };
        for v in [5u64, 7, 30] {
            if let Err(e) = red.fold_element(0, 2, &u64_bytes(v)) {
                unreachable!("BUG: fold failed: {e}");
            }
        }
        let mask: FieldMask = [0usize].into_iter().collect();
        match red.apply_into(&dst, &mask) {
            Ok(n) => assert_eq!(n, 4, "every point of the buffer is applied"),
            Err(e) => unreachable!("BUG: apply failed: {e}"),
        }
        match dst.read_element(0, 2) {
            Ok(bytes) => assert_eq!(bytes, u64_bytes(42)),
            Err(e) => unreachable!("BUG: read failed: {e}"),
        }
        // Second flush finds only identity, leaving the target untouched.
        match red.apply_into(&dst, &mask) {
            Ok(_) => {}
            Err(e) => unreachable!("BUG: apply failed: {e}"),
        }
        match dst.read_element(0, 2) {
            Ok(bytes) => assert_eq!(bytes, u64_bytes(42)),
            Err(e) => unreachable!("BUG: read failed: {e}"),
        }
        red.release(&f);
        dst.release(&f);
        f.shutdown();
    }

    #[test]
    fn list_entries_apply_in_recorded_order() {
        // An overwriting "operator" makes application order observable.
        fn clobber(lhs: &mut [u8], rhs: &[u8]) {
            lhs.copy_from_slice(rhs);
        }
        let op = ReductionOp {
            name: "clobber",
            element_size: 8,
            identity: vec![0; 8],
            fold: clobber,
            apply: clobber,
        };
        let f = fabric();
        let mem = f.memories()[0];
        let dom = Domain::interval(0, 2);
        let dst = match PhysicalManager::instance(&f, mem, did(1), region(), dom.clone(), &[(0, 8)])
        {
            Ok(m) => m,
            Err(e) => unreachable!("BUG: instance creation failed: {e}"),
        };
        let red = match PhysicalManager::list_reduction(
            mem,
            did(2),
            region(),
            dom,
            &[(0, 8)],
            ReductionOpId(1),
            &op,
        ) {
            Ok(m) => m,
            Err(e) => unreachable!("BUG: list creation failed: {e}"),
        };
        for v in [11u64, 22, 33] {
            if let Err(e) = red.fold_element(0, 1, &u64_bytes(v)) {
                unreachable!("BUG: record failed: {e}");
            }
        }
        let mask: FieldMask = [0usize].into_iter().collect();
        match red.apply_into(&dst, &mask) {
            Ok(n) => assert_eq!(n, 3),
            Err(e) => unreachable!("BUG: apply failed: {e}"),
        }
        match dst.read_element(0, 1) {
            Ok(bytes) => assert_eq!(bytes, u64_bytes(33), "last entry lands last"),
            Err(e) => unreachable!("BUG: read failed: {e}"),
        }
        match red.apply_into(&dst, &mask) {
            Ok(n) => assert_eq!(n, 0, "entries drain on flush"),
            Err(e) => unreachable!("BUG: apply failed: {e}"),
        }
        dst.release(&f);
        f.shutdown();
    }

    #[test]
    fn list_and_fold_agree_for_commutative_ops() {
        let f = fabric();
        let mem = f.memories()[0];
        let dom = Domain::interval(0, 2);
        let contributions = [3u64, 900, 41, 7];
        let mut finals = Vec::new();
        for flavor in 0..2u64 {
            let dst =
                match PhysicalManager::instance(&f, mem, did(10 + flavor), region(), dom.clone(), &[(0, 8)]) {
                    Ok(m) => m,
                    Err(e) => unreachable!("BUG: instance creation failed: {e}"),
                };
            let red = if flavor == 0 {
                PhysicalManager::list_reduction(
                    mem,
                    did(20),
                    region(),
                    dom.clone(),
                    &[(0, 8)],
                    ReductionOpId(1),
                    &max_u64(),
                )
            } else {
                PhysicalManager::fold_reduction(
                    &f,
                    mem,
                    did(21),
                    region(),
                    dom.clone(),
                    &[(0, 8)],
                    ReductionOpId(1),
                    &max_u64(),
                )
            };
            let red = match red {
                Ok(m) => m,
                Err(e) => unreachable!("BUG: reduction creation failed: {e}"),
            };
            for v in contributions {
                if let Err(e) = red.fold_element(0, 0, &u64_bytes(v)) {
                    unreachable!("BUG: contribution failed: {e}");
                }
            }
            let mask: FieldMask = [0usize].into_iter().collect();
            if let Err(e) = red.apply_into(&dst, &mask) {
                unreachable!("BUG: apply failed: {e}");
            }
            match dst.read_element(0, 0) {
                Ok(bytes) => finals.push(bytes),
                Err(e) => unreachable!("BUG: read failed: {e}"),
            }
            red.release(&f);
            dst.release(&f);
        }
        assert_eq!(finals[0], finals[1]);
        assert_eq!(finals[0], u64_bytes(900));
        f.shutdown();
    }

    #[test]
    fn reduction_creation_checks_field_sizes() {
        let f = fabric();
        let mem = f.memories()[0];
        let err = PhysicalManager::fold_reduction(
            &f,
            mem,
            did(1),
            region(),
            Domain::interval(0, 2),
            &[(0, 4)],
            ReductionOpId(1),
            &sum_u64(),
        );
        assert!(matches!(
            err,
            Err(ManagerError::ReductionSizeMismatch { slot: 0, element: 8, field: 4, .. })
        ));
        f.shutdown();
    }

    #[test]
    fn copy_moves_intersection_only() {
        let f = fabric();
        let mem = f.memories()[0];
        let a = match PhysicalManager::instance(
            &f,
            mem,
            did(1),
            region(),
            Domain::interval(0, 8),
            &[(0, 8), (1, 8)],
        ) {
            Ok(m) => m,
            Err(e) => unreachable!("BUG: instance creation failed: {e}"),
        };
        let b = match PhysicalManager::instance(
            &f,
            mem,
            did(2),
            region(),
            Domain::interval(4, 12),
            &[(0, 8), (1, 8)],
        ) {
            Ok(m) => m,
            Err(e) => unreachable!("BUG: instance creation failed: {e}"),
        };
        for p in 0..8 {
            if let Err(e) = a.write_element(0, p, &u64_bytes(100 + p as u64)) {
                unreachable!("BUG: write failed: {e}");
            }
        }
        let mask: FieldMask = [0usize].into_iter().collect();
        match a.copy_into(&b, &mask) {
            Ok(moved) => assert_eq!(moved, 4, "points 4..8 in one field"),
            Err(e) => unreachable!("BUG: copy failed: {e}"),
        }
        match b.read_element(0, 5) {
            Ok(bytes) => assert_eq!(bytes, u64_bytes(105)),
            Err(e) => unreachable!("BUG: read failed: {e}"),
        }
        match b.read_element(1, 5) {
            Ok(bytes) => assert_eq!(bytes, u64_bytes(0), "unmasked fields stay put"),
            Err(e) => unreachable!("BUG: read failed: {e}"),
        }
        a.release(&f);
        b.release(&f);
        f.shutdown();
    }
}
