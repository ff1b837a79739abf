// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Reduction operators.
//!
//! A [`ReductionOp`] describes one commutative, associative combining
//! function over fixed-size elements. Operators are registered once with
//! the runtime and referenced by [`ReductionOpId`] from requirements,
//! reduction views, and copy flushes.
//!
//! Two combining entry points exist because reduction state and target
//! data are not the same thing:
//! - `fold` combines two pending contributions (right folded into left);
//! - `apply` lands a contribution on actual field data.
//!
//! For arithmetic operators the two are usually the same function; the
//! split matters for operators whose accumulator representation differs
//! from the stored element.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::ident::ReductionOpId;

/// Combines `rhs` into `lhs`; both are exactly `element_size` bytes.
pub type CombineFn = fn(lhs: &mut [u8], rhs: &[u8]);

/// One registered reduction operator.
#[derive(Clone, PartialEq, Eq)]
pub struct ReductionOp {
    /// Short human-readable name for logs.
    pub name: &'static str,
    /// Size in bytes of one element.
    pub element_size: usize,
    /// The identity element; folding it into anything is a no-op.
    pub identity: Vec<u8>,
    /// Combines a pending contribution into an accumulator.
    pub fold: CombineFn,
    /// Lands a contribution (or folded accumulator) on field data.
    pub apply: CombineFn,
}

impl std::fmt::Debug for ReductionOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReductionOp")
            .field("name", &self.name)
            .field("element_size", &self.element_size)
            .finish_non_exhaustive()
    }
}

/// Registration and lookup failures for reduction operators.
///
/// An unknown operator at use time is a programming error in the caller;
/// the analysis has no way to combine contributions it cannot interpret.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReductionError {
    /// The id is already taken.
    #[error("reduction operator {0} registered twice")]
    DuplicateOp(ReductionOpId),
    /// Id zero is the "no operator" sentinel and cannot be registered.
    #[error("reduction operator id 0 is reserved")]
    ReservedOp,
    /// The identity buffer must be exactly one element.
    #[error("identity is {got} bytes, operator elements are {want}")]
    IdentitySize {
        /// Declared element size.
        want: usize,
        /// Provided identity length.
        got: usize,
    },
    /// No operator registered under this id.
    #[error("unknown reduction operator {0}")]
    UnknownOp(ReductionOpId),
}

/// The runtime's operator registry.
#[derive(Debug, Default)]
pub struct ReductionTable {
    ops: FxHashMap<ReductionOpId, ReductionOp>,
}

impl ReductionTable {
    /// Registers `op` under `id`.
    pub fn register(&mut self, id: ReductionOpId, op: ReductionOp) -> Result<(), ReductionError> {
        if id.is_none() {
            return Err(ReductionError::ReservedOp);
        }
        if op.identity.len() != op.element_size {
            return Err(ReductionError::IdentitySize {
                want: op.element_size,
                got: op.identity.len(),
            });
        }
        if self.ops.contains_key(&id) {
            return Err(ReductionError::DuplicateOp(id));
        }
        self.ops.insert(id, op);
        Ok(())
    }

    /// Looks up a registered operator.
    pub fn get(&self, id: ReductionOpId) -> Result<&ReductionOp, ReductionError> {
        self.ops.get(&id).ok_or(ReductionError::UnknownOp(id))
    }
}

// ============================================================================
// Sample Operators
// ============================================================================

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    let n = bytes.len().min(8);
    raw[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(raw)
}

fn write_u64(bytes: &mut [u8], value: u64) {
    let raw = value.to_le_bytes();
    let n = bytes.len().min(8);
    bytes[..n].copy_from_slice(&raw[..n]);
}

fn fold_sum_u64(lhs: &mut [u8], rhs: &[u8]) {
    write_u64(lhs, read_u64(lhs).wrapping_add(read_u64(rhs)));
}

fn fold_max_u64(lhs: &mut [u8], rhs: &[u8]) {
    write_u64(lhs, read_u64(lhs).max(read_u64(rhs)));
}

/// Wrapping sum over little-endian `u64` elements.
#[must_use]
pub fn sum_u64() -> ReductionOp {
    ReductionOp {
        name: "sum_u64",
        element_size: 8,
        identity: vec![0u8; 8],
        fold: fold_sum_u64,
        apply: fold_sum_u64,
    }
}

/// Maximum over little-endian `u64` elements.
#[must_use]
pub fn max_u64() -> ReductionOp {
    ReductionOp {
        name: "max_u64",
        element_size: 8,
        identity: vec![0u8; 8],
        fold: fold_max_u64,
        apply: fold_max_u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut table = ReductionTable::default();
        match table.register(ReductionOpId(1), sum_u64()) {
            Ok(()) => {}
            Err(e) => unreachable!("BUG: registration failed: {e}"),
        }
        match table.get(ReductionOpId(1)) {
            Ok(op) => assert_eq!(op.name, "sum_u64"),
            Err(e) => unreachable!("BUG: lookup failed: {e}"),
        }
        assert_eq!(
            table.get(ReductionOpId(2)),
            Err(ReductionError::UnknownOp(ReductionOpId(2)))
        );
    }

    #[test]
    fn reserved_and_duplicate_ids_rejected() {
        let mut table = ReductionTable::default();
        assert_eq!(
            table.register(ReductionOpId::NONE, sum_u64()),
            Err(ReductionError::ReservedOp)
        );
        assert_eq!(table.register(ReductionOpId(7), sum_u64()), Ok(()));
        assert_eq!(
            table.register(ReductionOpId(7), max_u64()),
            Err(ReductionError::DuplicateOp(ReductionOpId(7)))
        );
    }

    #[test]
    fn identity_size_checked() {
        let mut table = ReductionTable::default();
        let mut op = sum_u64();
        op.identity = vec![0u8; 4];
        assert_eq!(
            table.register(ReductionOpId(1), op),
            Err(ReductionError::IdentitySize { want: 8, got: 4 })
        );
    }

    #[test]
    fn sample_operators_combine() {
        let sum = sum_u64();
        let mut acc = sum.identity.clone();
        let mut contribution = vec![0u8; 8];
        write_u64(&mut contribution, 5);
        (sum.fold)(&mut acc, &contribution);
        write_u64(&mut contribution, 7);
        (sum.fold)(&mut acc, &contribution);
        assert_eq!(read_u64(&acc), 12);

        let max = max_u64();
        let mut acc = max.identity.clone();
        write_u64(&mut contribution, 9);
        (max.apply)(&mut acc, &contribution);
        write_u64(&mut contribution, 3);
        (max.apply)(&mut acc, &contribution);
        assert_eq!(read_u64(&acc), 9);
    }
}
