// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Field masks: fixed-width bitsets over field slots.
//!
//! Every analysis structure in the runtime is keyed by which field slots it
//! concerns, and all of those sets are [`FieldMask`]s: 2048 bits in 32
//! machine words, cheap to AND/OR/NOT, cheap to compare. For wide sparse
//! sets (metadata messages, long-lived summaries) [`CompressedFieldMask`]
//! stores the same information as sorted maximal runs of set bits; the two
//! representations convert losslessly and agree on every operation.
//!
//! Slot allocation (which field name owns which slot) belongs to field
//! spaces in the forest; masks only know bit positions.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, BitXorAssign, Not, Sub, SubAssign};

/// Upper bound on simultaneously allocated fields in one field space.
pub const MAX_FIELDS: usize = 2048;

const WORD_BITS: usize = 64;
const WORDS: usize = MAX_FIELDS / WORD_BITS;

/// Fixed-width bitset over field slots `0..MAX_FIELDS`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FieldMask {
    words: [u64; WORDS],
}

impl FieldMask {
    /// The empty mask.
    pub const EMPTY: Self = Self { words: [0; WORDS] };

    /// The mask with every slot set.
    pub const FULL: Self = Self {
        words: [u64::MAX; WORDS],
    };

    /// Creates an empty mask.
    #[must_use]
    pub const fn new() -> Self {
        Self::EMPTY
    }

    /// Creates a mask with exactly `slot` set.
    #[must_use]
    pub fn single(slot: usize) -> Self {
        let mut m = Self::EMPTY;
        m.set(slot);
        m
    }

    /// Sets `slot`. Out-of-range slots are a caller bug and are ignored.
    pub fn set(&mut self, slot: usize) {
        if slot >= MAX_FIELDS {
            debug_assert!(false, "BUG: field slot {slot} out of range");
            return;
        }
        self.words[slot / WORD_BITS] |= 1u64 << (slot % WORD_BITS);
    }

    /// Clears `slot`.
    pub fn clear(&mut self, slot: usize) {
        if slot >= MAX_FIELDS {
            debug_assert!(false, "BUG: field slot {slot} out of range");
            return;
        }
        self.words[slot / WORD_BITS] &= !(1u64 << (slot % WORD_BITS));
    }

    /// Returns whether `slot` is set.
    #[must_use]
    pub fn test(&self, slot: usize) -> bool {
        if slot >= MAX_FIELDS {
            debug_assert!(false, "BUG: field slot {slot} out of range");
            return false;
        }
        self.words[slot / WORD_BITS] & (1u64 << (slot % WORD_BITS)) != 0
    }

    /// Sets the half-open slot range `[start, start + len)`.
    pub fn set_range(&mut self, start: usize, len: usize) {
        let end = start.saturating_add(len).min(MAX_FIELDS);
        debug_assert!(
            start.saturating_add(len) <= MAX_FIELDS,
            "BUG: field range {start}+{len} out of range"
        );
        for slot in start..end {
            self.words[slot / WORD_BITS] |= 1u64 << (slot % WORD_BITS);
        }
    }

    /// Returns whether no slot is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Number of set slots.
    #[must_use]
    pub fn pop_count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns whether the two masks share any set slot.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Returns whether every slot of `other` is also set in `self`.
    #[must_use]
    pub fn subsumes(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| b & !a == 0)
    }

    /// Lowest set slot, if any.
    #[must_use]
    pub fn first_set(&self) -> Option<usize> {
        for (i, &w) in self.words.iter().enumerate() {
            if w != 0 {
                return Some(i * WORD_BITS + w.trailing_zeros() as usize);
            }
        }
        None
    }

    /// Iterates set slots in ascending order.
    pub fn iter(&self) -> FieldMaskIter {
        FieldMaskIter {
            words: self.words,
            word_idx: 0,
            current: self.words[0],
        }
    }

    /// The maximal runs of set slots, ascending.
    #[must_use]
    pub fn runs(&self) -> Vec<FieldRun> {
        let mut runs: Vec<FieldRun> = Vec::new();
        for slot in self.iter() {
            let slot = slot as u32;
            match runs.last_mut() {
                Some(r) if r.start + r.len == slot => r.len += 1,
                _ => runs.push(FieldRun { start: slot, len: 1 }),
            }
        }
        runs
    }
}

impl fmt::Debug for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fields[")?;
        for (i, r) in self.runs().iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if r.len == 1 {
                write!(f, "{}", r.start)?;
            } else {
                write!(f, "{}-{}", r.start, r.start + r.len - 1)?;
            }
        }
        write!(f, "]")
    }
}

impl fmt::Display for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl FromIterator<usize> for FieldMask {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut m = Self::EMPTY;
        for slot in iter {
            m.set(slot);
        }
        m
    }
}

/// Iterator over set slots of a [`FieldMask`].
pub struct FieldMaskIter {
    words: [u64; WORDS],
    word_idx: usize,
    current: u64,
}

impl Iterator for FieldMaskIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                return Some(self.word_idx * WORD_BITS + bit);
            }
            self.word_idx += 1;
            if self.word_idx >= WORDS {
                return None;
            }
            self.current = self.words[self.word_idx];
        }
    }
}

impl IntoIterator for &FieldMask {
    type Item = usize;
    type IntoIter = FieldMaskIter;

    fn into_iter(self) -> FieldMaskIter {
        self.iter()
    }
}

macro_rules! mask_binop {
    ($trait:ident, $method:ident, $assign_trait:ident, $assign_method:ident, $op:tt) => {
        impl $trait for FieldMask {
            type Output = FieldMask;
            fn $method(self, rhs: FieldMask) -> FieldMask {
                let mut out = self;
                for (a, b) in out.words.iter_mut().zip(rhs.words.iter()) {
                    *a = *a $op *b;
                }
                out
            }
        }

        impl $trait for &FieldMask {
            type Output = FieldMask;
            fn $method(self, rhs: &FieldMask) -> FieldMask {
                let mut out = *self;
                for (a, b) in out.words.iter_mut().zip(rhs.words.iter()) {
                    *a = *a $op *b;
                }
                out
            }
        }

        impl $assign_trait<&FieldMask> for FieldMask {
            fn $assign_method(&mut self, rhs: &FieldMask) {
                for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
                    *a = *a $op *b;
                }
            }
        }

        impl $assign_trait for FieldMask {
            fn $assign_method(&mut self, rhs: FieldMask) {
                self.$assign_method(&rhs);
            }
        }
    };
}

mask_binop!(BitAnd, bitand, BitAndAssign, bitand_assign, &);
mask_binop!(BitOr, bitor, BitOrAssign, bitor_assign, |);
mask_binop!(BitXor, bitxor, BitXorAssign, bitxor_assign, ^);

impl Sub for FieldMask {
    type Output = FieldMask;
    fn sub(self, rhs: FieldMask) -> FieldMask {
        &self - &rhs
    }
}

impl Sub for &FieldMask {
    type Output = FieldMask;
    fn sub(self, rhs: &FieldMask) -> FieldMask {
        let mut out = *self;
        for (a, b) in out.words.iter_mut().zip(rhs.words.iter()) {
            *a &= !*b;
        }
        out
    }
}

impl SubAssign<&FieldMask> for FieldMask {
    fn sub_assign(&mut self, rhs: &FieldMask) {
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a &= !*b;
        }
    }
}

impl SubAssign for FieldMask {
    fn sub_assign(&mut self, rhs: FieldMask) {
        *self -= &rhs;
    }
}

impl Not for FieldMask {
    type Output = FieldMask;
    fn not(self) -> FieldMask {
        !&self
    }
}

impl Not for &FieldMask {
    type Output = FieldMask;
    fn not(self) -> FieldMask {
        // MAX_FIELDS is word-aligned, so plain word complement is exact.
        let mut out = *self;
        for w in out.words.iter_mut() {
            *w = !*w;
        }
        out
    }
}

// ============================================================================
// Run-length compressed representation
// ============================================================================

/// One maximal run of set slots: the half-open range
/// `[start, start + len)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldRun {
    /// First slot of the run.
    pub start: u32,
    /// Number of slots; always nonzero.
    pub len: u32,
}

impl FieldRun {
    const fn end(self) -> u32 {
        self.start + self.len
    }
}

/// Run-length encoded field set.
///
/// # Invariants
/// - Runs are sorted by `start`, non-empty, and separated by at least one
///   clear slot (maximal runs).
/// - All slots lie below [`MAX_FIELDS`].
///
/// Operations perform ordered run merges, so cost scales with the number of
/// runs rather than the width of the universe.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CompressedFieldMask {
    runs: Vec<FieldRun>,
}

impl CompressedFieldMask {
    /// The empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self { runs: Vec::new() }
    }

    /// The runs, sorted ascending.
    #[must_use]
    pub fn runs(&self) -> &[FieldRun] {
        &self.runs
    }

    /// Returns whether no slot is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Number of set slots.
    #[must_use]
    pub fn pop_count(&self) -> usize {
        self.runs.iter().map(|r| r.len as usize).sum()
    }

    /// Returns whether `slot` is set.
    #[must_use]
    pub fn test(&self, slot: usize) -> bool {
        let slot = slot as u32;
        let idx = self.runs.partition_point(|r| r.start <= slot);
        idx > 0 && self.runs[idx - 1].end() > slot
    }

    /// Union of the two sets.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut out: Vec<FieldRun> = Vec::with_capacity(self.runs.len() + other.runs.len());
        let (mut i, mut j) = (0, 0);
        while i < self.runs.len() || j < other.runs.len() {
            let take_left = j >= other.runs.len()
                || (i < self.runs.len() && self.runs[i].start <= other.runs[j].start);
            let next = if take_left {
                let r = self.runs[i];
                i += 1;
                r
            } else {
                let r = other.runs[j];
                j += 1;
                r
            };
            match out.last_mut() {
                Some(last) if next.start <= last.end() => {
                    let end = last.end().max(next.end());
                    last.len = end - last.start;
                }
                _ => out.push(next),
            }
        }
        Self { runs: out }
    }

    /// Intersection of the two sets.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.runs.len() && j < other.runs.len() {
            let a = self.runs[i];
            let b = other.runs[j];
            let start = a.start.max(b.start);
            let end = a.end().min(b.end());
            if start < end {
                out.push(FieldRun {
                    start,
                    len: end - start,
                });
            }
            if a.end() <= b.end() {
                i += 1;
            } else {
                j += 1;
            }
        }
        Self { runs: out }
    }

    /// Slots set in `self` but not in `other`.
    #[must_use]
    pub fn subtract(&self, other: &Self) -> Self {
        let mut out = Vec::new();
        let mut j = 0;
        for r in &self.runs {
            let mut cursor = r.start;
            let end = r.end();
            while j < other.runs.len() && other.runs[j].end() <= cursor {
                j += 1;
            }
            let mut k = j;
            while k < other.runs.len() && other.runs[k].start < end {
                let o = other.runs[k];
                if o.start > cursor {
                    out.push(FieldRun {
                        start: cursor,
                        len: o.start - cursor,
                    });
                }
                cursor = cursor.max(o.end());
                if o.end() >= end {
                    break;
                }
                k += 1;
            }
            if cursor < end {
                out.push(FieldRun {
                    start: cursor,
                    len: end - cursor,
                });
            }
        }
        Self { runs: out }
    }

    /// Complement within the `0..MAX_FIELDS` universe.
    #[must_use]
    pub fn complement(&self) -> Self {
        Self::full().subtract(self)
    }

    /// Returns whether the two sets share any slot.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.runs.len() && j < other.runs.len() {
            let a = self.runs[i];
            let b = other.runs[j];
            if a.end() <= b.start {
                i += 1;
            } else if b.end() <= a.start {
                j += 1;
            } else {
                return true;
            }
        }
        false
    }

    /// Returns whether every slot of `other` is also set in `self`.
    #[must_use]
    pub fn subsumes(&self, other: &Self) -> bool {
        other.subtract(self).is_empty()
    }

    fn full() -> Self {
        Self {
            runs: vec![FieldRun {
                start: 0,
                len: MAX_FIELDS as u32,
            }],
        }
    }
}

impl fmt::Debug for CompressedFieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cfields[")?;
        for (i, r) in self.runs.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if r.len == 1 {
                write!(f, "{}", r.start)?;
            } else {
                write!(f, "{}-{}", r.start, r.end() - 1)?;
            }
        }
        write!(f, "]")
    }
}

impl From<&FieldMask> for CompressedFieldMask {
    fn from(mask: &FieldMask) -> Self {
        Self { runs: mask.runs() }
    }
}

impl From<FieldMask> for CompressedFieldMask {
    fn from(mask: FieldMask) -> Self {
        Self::from(&mask)
    }
}

impl From<&CompressedFieldMask> for FieldMask {
    fn from(c: &CompressedFieldMask) -> Self {
        let mut m = FieldMask::EMPTY;
        for r in &c.runs {
            m.set_range(r.start as usize, r.len as usize);
        }
        m
    }
}

impl From<CompressedFieldMask> for FieldMask {
    fn from(c: CompressedFieldMask) -> Self {
        Self::from(&c)
    }
}

impl BitAnd for &CompressedFieldMask {
    type Output = CompressedFieldMask;
    fn bitand(self, rhs: &CompressedFieldMask) -> CompressedFieldMask {
        self.intersect(rhs)
    }
}

impl BitOr for &CompressedFieldMask {
    type Output = CompressedFieldMask;
    fn bitor(self, rhs: &CompressedFieldMask) -> CompressedFieldMask {
        self.union(rhs)
    }
}

impl Sub for &CompressedFieldMask {
    type Output = CompressedFieldMask;
    fn sub(self, rhs: &CompressedFieldMask) -> CompressedFieldMask {
        self.subtract(rhs)
    }
}

impl Not for &CompressedFieldMask {
    type Output = CompressedFieldMask;
    fn not(self) -> CompressedFieldMask {
        self.complement()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_test_clear_across_word_boundaries() {
        let mut m = FieldMask::new();
        for &slot in &[0, 63, 64, 65, 127, 2047] {
            assert!(!m.test(slot));
            m.set(slot);
            assert!(m.test(slot), "slot {slot} must read back");
        }
        assert_eq!(m.pop_count(), 6);
        m.clear(64);
        assert!(!m.test(64));
        assert!(m.test(63) && m.test(65), "neighbors untouched");
    }

    #[test]
    fn overlap_and_subsume_basics() {
        let a: FieldMask = [1usize, 2, 3].into_iter().collect();
        let b: FieldMask = [3usize, 4].into_iter().collect();
        let c: FieldMask = [4usize, 5].into_iter().collect();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(a.subsumes(&FieldMask::single(2)));
        assert!(!a.subsumes(&b));
        assert!(FieldMask::FULL.subsumes(&a));
        assert!(a.subsumes(&FieldMask::EMPTY));
    }

    #[test]
    fn operators_match_set_algebra() {
        let a: FieldMask = (0..8usize).collect();
        let b: FieldMask = (4..12usize).collect();
        assert_eq!((&a & &b), (4..8usize).collect());
        assert_eq!((&a | &b), (0..12usize).collect());
        assert_eq!((&a - &b), (0..4usize).collect());
        assert_eq!((&a ^ &b), {
            let mut m: FieldMask = (0..4usize).collect();
            m.set_range(8, 4);
            m
        });
        let n = !&a;
        assert!(!n.test(0) && n.test(8) && n.test(2047));
        assert_eq!(n.pop_count(), MAX_FIELDS - 8);
    }

    #[test]
    fn iter_yields_ascending_slots() {
        let m: FieldMask = [5usize, 0, 64, 2047, 63].into_iter().collect();
        let got: Vec<usize> = m.iter().collect();
        assert_eq!(got, vec![0, 5, 63, 64, 2047]);
        assert_eq!(m.first_set(), Some(0));
        assert_eq!(FieldMask::EMPTY.first_set(), None);
    }

    #[test]
    fn debug_prints_runs() {
        let mut m = FieldMask::new();
        m.set_range(0, 3);
        m.set(7);
        assert_eq!(format!("{m:?}"), "fields[0-2,7]");
        assert_eq!(format!("{:?}", FieldMask::EMPTY), "fields[]");
    }

    #[test]
    fn compression_round_trips() {
        let mut m = FieldMask::new();
        m.set_range(0, 5);
        m.set(63);
        m.set_range(64, 2);
        m.set(2047);
        let c = CompressedFieldMask::from(&m);
        // 63 and 64 are adjacent across the word boundary; one run.
        assert_eq!(
            c.runs(),
            &[
                FieldRun { start: 0, len: 5 },
                FieldRun { start: 63, len: 3 },
                FieldRun {
                    start: 2047,
                    len: 1
                }
            ]
        );
        assert_eq!(FieldMask::from(&c), m);
        assert_eq!(c.pop_count(), m.pop_count());
    }

    #[test]
    fn compressed_algebra_matches_plain() {
        let mut a = FieldMask::new();
        a.set_range(10, 20);
        a.set_range(100, 4);
        let mut b = FieldMask::new();
        b.set_range(25, 10);
        b.set(102);

        let ca = CompressedFieldMask::from(&a);
        let cb = CompressedFieldMask::from(&b);

        assert_eq!(FieldMask::from(&ca.union(&cb)), &a | &b);
        assert_eq!(FieldMask::from(&ca.intersect(&cb)), &a & &b);
        assert_eq!(FieldMask::from(&ca.subtract(&cb)), &a - &b);
        assert_eq!(FieldMask::from(&ca.complement()), !&a);
        assert_eq!(ca.overlaps(&cb), a.overlaps(&b));
        assert_eq!(ca.subsumes(&cb), a.subsumes(&b));
    }

    #[test]
    fn compressed_test_uses_binary_search() {
        let mut m = FieldMask::new();
        m.set_range(8, 8);
        m.set_range(32, 1);
        let c = CompressedFieldMask::from(&m);
        assert!(!c.test(7));
        assert!(c.test(8) && c.test(15));
        assert!(!c.test(16));
        assert!(c.test(32));
        assert!(!c.test(33));
    }

    #[test]
    fn subtract_handles_covering_run() {
        let mut a = FieldMask::new();
        a.set_range(0, 4);
        a.set_range(8, 4);
        let mut cover = FieldMask::new();
        cover.set_range(0, 16);
        let ca = CompressedFieldMask::from(&a);
        let cc = CompressedFieldMask::from(&cover);
        assert!(ca.subtract(&cc).is_empty());
        assert_eq!(FieldMask::from(&cc.subtract(&ca)), &cover - &a);
    }
}
