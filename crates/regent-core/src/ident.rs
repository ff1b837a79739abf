// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Handle types for the region tree and the runtime.
//!
//! Every name in the system is a plain copyable id into an arena owned by
//! the forest, the operation pool, or the distributed registry. Nothing here
//! carries a pointer; a handle is only meaningful together with the runtime
//! that minted it.

/// Color of a child within its parent (partition within an index space,
/// subspace within a partition).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Color(pub u32);

/// Application-chosen name of a field within a field space.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldId(pub u32);

/// Handle for an index space node.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndexSpace(pub u32);

/// Handle for an index partition node.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndexPartition(pub u32);

/// Handle for a field space.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldSpaceId(pub u32);

/// Identifier of one region tree (one root logical region).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegionTreeId(pub u32);

/// A logical region: the pairing of an index space with a field space inside
/// one region tree.
///
/// Two regions with the same index space but different tree ids are distinct
/// data; analysis never crosses tree boundaries.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogicalRegion {
    /// Points of the region.
    pub index_space: IndexSpace,
    /// Fields of the region.
    pub field_space: FieldSpaceId,
    /// Tree the region belongs to.
    pub tree_id: RegionTreeId,
}

/// A logical partition: the pairing of an index partition with a field space
/// inside one region tree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogicalPartition {
    /// Points, as a partition of the parent's index space.
    pub index_partition: IndexPartition,
    /// Fields of the partition (same as the parent region's).
    pub field_space: FieldSpaceId,
    /// Tree the partition belongs to.
    pub tree_id: RegionTreeId,
}

/// Identifier of one analysis context (one parent-task scope).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextId(pub u32);

/// Process-wide monotonically increasing operation id.
///
/// Unique ids are never recycled, unlike operation pool slots; a stale pool
/// reference can always be told apart from a live one by generation, and a
/// unique id names an operation forever in logs and dependence records.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UniqueOpId(pub u64);

impl std::fmt::Display for UniqueOpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Reuse generation of an operation pool slot.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GenerationId(pub u64);

/// Version epoch of a field's data at one tree node.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VersionId(pub u64);

/// One node/process-equivalent unit in the distributed protocol.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AddressSpaceId(pub u32);

impl std::fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "space{}", self.0)
    }
}

/// Bits reserved at the top of a [`DistributedId`] for the owner space.
const OWNER_SHIFT: u32 = 40;

/// Identifier of a distributed object (a physical manager).
///
/// # Invariants
/// - The owner address space is embedded in the top bits, so any space can
///   route a message about the object without a directory lookup.
/// - The low bits are a per-owner monotonic sequence; ids are never reused.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DistributedId(pub u64);

impl DistributedId {
    /// Packs an owner space and per-owner sequence number.
    #[must_use]
    pub const fn pack(owner: AddressSpaceId, seq: u64) -> Self {
        Self(((owner.0 as u64) << OWNER_SHIFT) | (seq & ((1 << OWNER_SHIFT) - 1)))
    }

    /// The address space that owns this object.
    #[must_use]
    pub const fn owner(self) -> AddressSpaceId {
        AddressSpaceId((self.0 >> OWNER_SHIFT) as u32)
    }

    /// The per-owner sequence number.
    #[must_use]
    pub const fn sequence(self) -> u64 {
        self.0 & ((1 << OWNER_SHIFT) - 1)
    }
}

impl std::fmt::Display for DistributedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "did({}:{})", self.owner().0, self.sequence())
    }
}

/// Identifier of a registered reduction operator. Zero is reserved for
/// "no reduction".
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReductionOpId(pub u32);

impl std::fmt::Display for ReductionOpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ReductionOpId {
    /// The "no reduction" sentinel.
    pub const NONE: Self = Self(0);

    /// Returns `true` for the sentinel.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Identifier of a registered task body.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskId(pub u32);

/// Identifier of a registered mapper.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MapperId(pub u32);

impl MapperId {
    /// The runtime-provided default mapper.
    pub const DEFAULT: Self = Self(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distributed_id_round_trips_owner_and_sequence() {
        let did = DistributedId::pack(AddressSpaceId(3), 12345);
        assert_eq!(did.owner(), AddressSpaceId(3));
        assert_eq!(did.sequence(), 12345);
    }

    #[test]
    fn distributed_id_sequence_is_masked() {
        let did = DistributedId::pack(AddressSpaceId(1), u64::MAX);
        assert_eq!(did.owner(), AddressSpaceId(1));
        assert_eq!(did.sequence(), (1 << 40) - 1);
    }

    #[test]
    fn reduction_op_none_sentinel() {
        assert!(ReductionOpId::NONE.is_none());
        assert!(!ReductionOpId(7).is_none());
    }
}
