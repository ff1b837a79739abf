// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Privileges, coherence, and dependence classification.
//!
//! A [`RegionUsage`] is the analysis-relevant summary of one region
//! requirement: what the operation may do to the data (privilege), what
//! concurrency it tolerates from others (coherence), and which reduction
//! operator it contributes with, if any. [`classify_dependence`] is the
//! single table that turns a pair of usages over overlapping fields into an
//! ordering obligation; every edge in the dependence graph comes from it.

use thiserror::Error;

use crate::ident::{FieldId, LogicalRegion, ReductionOpId};

/// What an operation may do to the fields it names.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PrivilegeMode {
    /// May observe metadata only; never generates dependences.
    NoAccess,
    /// May read current values.
    ReadOnly,
    /// May read and overwrite values.
    ReadWrite,
    /// May overwrite values without observing priors; never needs copy-in.
    WriteDiscard,
    /// May only apply a reduction operator's contributions.
    Reduce,
}

impl PrivilegeMode {
    /// Reads and nothing else.
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnly)
    }

    /// Mutates the data in any way, reductions included.
    #[must_use]
    pub const fn has_write(self) -> bool {
        matches!(self, Self::ReadWrite | Self::WriteDiscard | Self::Reduce)
    }

    /// Writes without reading: prior contents are dead.
    #[must_use]
    pub const fn is_write_only(self) -> bool {
        matches!(self, Self::WriteDiscard)
    }

    /// Contributes through a reduction operator.
    #[must_use]
    pub const fn is_reduce(self) -> bool {
        matches!(self, Self::Reduce)
    }

    /// Observes current values (plain writes included).
    #[must_use]
    pub const fn has_read(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }
}

impl std::fmt::Display for PrivilegeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NoAccess => "na",
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
            Self::WriteDiscard => "wd",
            Self::Reduce => "red",
        })
    }
}

/// What interleaving an operation tolerates from other users of the same
/// fields.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CoherenceProperty {
    /// Full isolation; conflicting users are ordered.
    Exclusive,
    /// Conflicting atomic users need mutual exclusion, not ordering.
    Atomic,
    /// Concurrent access through one shared copy of the data.
    Simultaneous,
    /// Like simultaneous, with no consistency expectation at all.
    Relaxed,
}

impl CoherenceProperty {
    /// Coherences that waive ordering entirely.
    #[must_use]
    pub const fn is_concurrent(self) -> bool {
        matches!(self, Self::Simultaneous | Self::Relaxed)
    }
}

/// The ordering obligation between two users of overlapping fields.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DependenceType {
    /// No constraint.
    None,
    /// Flow dependence: the later user consumes the earlier one's data.
    True,
    /// Anti dependence: ordering protects the earlier read (or a dead
    /// overwrite); no data flows.
    Anti,
    /// Both sides are atomic: mutual exclusion suffices, order is free.
    Atomic,
    /// At least one side is concurrent: both run against one shared copy.
    Simultaneous,
}

impl DependenceType {
    /// Returns whether this edge imposes a happens-before execution order.
    #[must_use]
    pub const fn orders_execution(self) -> bool {
        matches!(self, Self::True | Self::Anti)
    }
}

impl std::fmt::Display for DependenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::True => "true",
            Self::Anti => "anti",
            Self::Atomic => "atomic",
            Self::Simultaneous => "simultaneous",
        })
    }
}

/// The analysis-relevant summary of one requirement.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegionUsage {
    /// Granted privilege.
    pub privilege: PrivilegeMode,
    /// Granted coherence.
    pub coherence: CoherenceProperty,
    /// Reduction operator; [`ReductionOpId::NONE`] unless `privilege` is
    /// [`PrivilegeMode::Reduce`].
    pub redop: ReductionOpId,
}

impl RegionUsage {
    /// A non-reduction usage.
    #[must_use]
    pub const fn new(privilege: PrivilegeMode, coherence: CoherenceProperty) -> Self {
        Self {
            privilege,
            coherence,
            redop: ReductionOpId::NONE,
        }
    }

    /// A reduction usage contributing through `redop`.
    #[must_use]
    pub const fn reduction(redop: ReductionOpId, coherence: CoherenceProperty) -> Self {
        Self {
            privilege: PrivilegeMode::Reduce,
            coherence,
            redop,
        }
    }
}

/// Classifies the obligation `next` owes `prev`, given that their field
/// masks overlap.
///
/// Field disjointness is the caller's business: this function assumes the
/// two usages touch at least one common field slot.
///
/// The decision ladder:
/// 1. no-access on either side, two readers, or two reducers with the same
///    operator: no dependence;
/// 2. either side concurrent (simultaneous or relaxed): a
///    [`DependenceType::Simultaneous`] record, which orders nothing but
///    pins both users to one shared copy;
/// 3. both sides atomic: [`DependenceType::Atomic`]; mutual exclusion
///    replaces ordering even where an anti dependence would otherwise hold;
/// 4. otherwise anti when the earlier user only read, or when the later
///    user overwrites without reading; true for every remaining conflict.
#[must_use]
pub fn classify_dependence(prev: &RegionUsage, next: &RegionUsage) -> DependenceType {
    if prev.privilege == PrivilegeMode::NoAccess || next.privilege == PrivilegeMode::NoAccess {
        return DependenceType::None;
    }
    if prev.privilege.is_read_only() && next.privilege.is_read_only() {
        return DependenceType::None;
    }
    if prev.privilege.is_reduce() && next.privilege.is_reduce() && prev.redop == next.redop {
        return DependenceType::None;
    }
    if prev.coherence.is_concurrent() || next.coherence.is_concurrent() {
        return DependenceType::Simultaneous;
    }
    if prev.coherence == CoherenceProperty::Atomic && next.coherence == CoherenceProperty::Atomic {
        return DependenceType::Atomic;
    }
    if prev.privilege.is_read_only() && next.privilege.has_write() {
        return DependenceType::Anti;
    }
    if next.privilege.is_write_only() {
        return DependenceType::Anti;
    }
    DependenceType::True
}

/// One declared region access of an operation.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegionRequirement {
    /// The region accessed.
    pub region: LogicalRegion,
    /// The ancestor region the issuing context holds privileges on.
    pub parent: LogicalRegion,
    /// Fields accessed; translated to a mask via the field space.
    pub fields: Vec<FieldId>,
    /// Requested privilege.
    pub privilege: PrivilegeMode,
    /// Requested coherence.
    pub coherence: CoherenceProperty,
    /// Reduction operator for [`PrivilegeMode::Reduce`] requirements.
    pub redop: ReductionOpId,
}

/// Structural problems with a requirement, caught before any analysis.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequirementError {
    /// A reduce requirement must name its operator.
    #[error("reduce requirement without a reduction operator")]
    ReduceWithoutRedop,
    /// Only reduce requirements may name an operator.
    #[error("reduction operator on a non-reduce requirement")]
    RedopWithoutReduce,
}

impl RegionRequirement {
    /// A non-reduction requirement.
    #[must_use]
    pub fn new(
        region: LogicalRegion,
        parent: LogicalRegion,
        fields: Vec<FieldId>,
        privilege: PrivilegeMode,
        coherence: CoherenceProperty,
    ) -> Self {
        Self {
            region,
            parent,
            fields,
            privilege,
            coherence,
            redop: ReductionOpId::NONE,
        }
    }

    /// A reduction requirement contributing through `redop`.
    #[must_use]
    pub fn reduction(
        region: LogicalRegion,
        parent: LogicalRegion,
        fields: Vec<FieldId>,
        redop: ReductionOpId,
        coherence: CoherenceProperty,
    ) -> Self {
        Self {
            region,
            parent,
            fields,
            privilege: PrivilegeMode::Reduce,
            coherence,
            redop,
        }
    }

    /// The usage summary of this requirement.
    #[must_use]
    pub const fn usage(&self) -> RegionUsage {
        RegionUsage {
            privilege: self.privilege,
            coherence: self.coherence,
            redop: self.redop,
        }
    }

    /// Checks privilege/operator consistency.
    pub fn validate(&self) -> Result<(), RequirementError> {
        match (self.privilege.is_reduce(), self.redop.is_none()) {
            (true, true) => Err(RequirementError::ReduceWithoutRedop),
            (false, false) => Err(RequirementError::RedopWithoutReduce),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CoherenceProperty::{Atomic, Exclusive, Relaxed, Simultaneous};
    use PrivilegeMode::{NoAccess, ReadOnly, ReadWrite, Reduce, WriteDiscard};

    fn usage(p: PrivilegeMode, c: CoherenceProperty) -> RegionUsage {
        let redop = if p.is_reduce() {
            ReductionOpId(1)
        } else {
            ReductionOpId::NONE
        };
        RegionUsage {
            privilege: p,
            coherence: c,
            redop,
        }
    }

    #[test]
    fn readers_never_conflict() {
        let a = usage(ReadOnly, Exclusive);
        let b = usage(ReadOnly, Atomic);
        assert_eq!(classify_dependence(&a, &b), DependenceType::None);
    }

    #[test]
    fn same_operator_reductions_commute() {
        let a = RegionUsage::reduction(ReductionOpId(4), Exclusive);
        let b = RegionUsage::reduction(ReductionOpId(4), Exclusive);
        assert_eq!(classify_dependence(&a, &b), DependenceType::None);
        let c = RegionUsage::reduction(ReductionOpId(5), Exclusive);
        assert_eq!(
            classify_dependence(&a, &c),
            DependenceType::True,
            "different operators must be ordered"
        );
    }

    #[test]
    fn write_after_read_is_anti() {
        let r = usage(ReadOnly, Exclusive);
        let w = usage(ReadWrite, Exclusive);
        assert_eq!(classify_dependence(&r, &w), DependenceType::Anti);
        assert_eq!(classify_dependence(&w, &r), DependenceType::True);
    }

    #[test]
    fn overwrite_without_read_is_anti() {
        let w1 = usage(ReadWrite, Exclusive);
        let w2 = usage(WriteDiscard, Exclusive);
        assert_eq!(classify_dependence(&w1, &w2), DependenceType::Anti);
        assert_eq!(classify_dependence(&w2, &w1), DependenceType::True);
    }

    #[test]
    fn atomic_pair_beats_anti() {
        let r = usage(ReadOnly, Atomic);
        let w = usage(ReadWrite, Atomic);
        assert_eq!(
            classify_dependence(&r, &w),
            DependenceType::Atomic,
            "mutual exclusion replaces the anti ordering"
        );
        assert_eq!(classify_dependence(&w, &r), DependenceType::Atomic);
    }

    #[test]
    fn lone_atomic_still_orders() {
        let a = usage(ReadWrite, Atomic);
        let b = usage(ReadWrite, Exclusive);
        assert_eq!(classify_dependence(&a, &b), DependenceType::True);
    }

    #[test]
    fn concurrent_side_wins_over_everything() {
        let s = usage(ReadWrite, Simultaneous);
        let e = usage(ReadWrite, Exclusive);
        let x = usage(ReadWrite, Relaxed);
        let a = usage(ReadWrite, Atomic);
        assert_eq!(classify_dependence(&s, &e), DependenceType::Simultaneous);
        assert_eq!(classify_dependence(&e, &s), DependenceType::Simultaneous);
        assert_eq!(classify_dependence(&x, &a), DependenceType::Simultaneous);
        assert_eq!(classify_dependence(&s, &s), DependenceType::Simultaneous);
    }

    #[test]
    fn no_access_is_invisible() {
        let n = usage(NoAccess, Exclusive);
        let w = usage(ReadWrite, Exclusive);
        assert_eq!(classify_dependence(&n, &w), DependenceType::None);
        assert_eq!(classify_dependence(&w, &n), DependenceType::None);
    }

    #[test]
    fn requirement_validation_ties_redop_to_reduce() {
        let region = LogicalRegion {
            index_space: crate::ident::IndexSpace(0),
            field_space: crate::ident::FieldSpaceId(0),
            tree_id: crate::ident::RegionTreeId(0),
        };
        let bad = RegionRequirement::reduction(
            region,
            region,
            vec![FieldId(0)],
            ReductionOpId::NONE,
            Exclusive,
        );
        assert_eq!(bad.validate(), Err(RequirementError::ReduceWithoutRedop));

        let mut wrong = RegionRequirement::new(region, region, vec![FieldId(0)], ReadWrite, Exclusive);
        wrong.redop = ReductionOpId(3);
        assert_eq!(wrong.validate(), Err(RequirementError::RedopWithoutReduce));

        let ok = RegionRequirement::reduction(
            region,
            region,
            vec![FieldId(0)],
            ReductionOpId(3),
            Exclusive,
        );
        assert_eq!(ok.validate(), Ok(()));
    }
}
