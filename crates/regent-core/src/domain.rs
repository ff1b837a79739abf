// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Index domains: the point sets under index spaces.
//!
//! A [`Domain`] is a normalized set of half-open intervals over `i64`
//! points: sorted, pairwise disjoint, never adjacent. Partition disjointness
//! and completeness, copy extents, and instance layout ranks all reduce to
//! interval algebra here.

use std::collections::BTreeMap;

use crate::ident::Color;

/// A point of an index space.
pub type Point = i64;

/// Half-open interval `[lo, hi)`; empty unless `lo < hi`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Interval {
    /// Inclusive lower bound.
    pub lo: Point,
    /// Exclusive upper bound.
    pub hi: Point,
}

impl Interval {
    fn width(self) -> u64 {
        debug_assert!(self.lo < self.hi, "BUG: empty interval stored");
        self.hi.abs_diff(self.lo)
    }
}

/// A normalized interval set.
///
/// # Invariants
/// - Intervals are sorted by `lo`, non-empty, and separated by at least one
///   absent point (maximal intervals).
#[derive(Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Domain {
    intervals: Vec<Interval>,
}

impl Domain {
    /// The empty domain.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            intervals: Vec::new(),
        }
    }

    /// The single interval `[lo, hi)`; empty when `lo >= hi`.
    #[must_use]
    pub fn interval(lo: Point, hi: Point) -> Self {
        if lo < hi {
            Self {
                intervals: vec![Interval { lo, hi }],
            }
        } else {
            Self::empty()
        }
    }

    /// Builds a domain from arbitrary intervals, normalizing as needed.
    #[must_use]
    pub fn from_intervals(intervals: impl IntoIterator<Item = (Point, Point)>) -> Self {
        let mut raw: Vec<Interval> = intervals
            .into_iter()
            .filter(|&(lo, hi)| lo < hi)
            .map(|(lo, hi)| Interval { lo, hi })
            .collect();
        raw.sort_by_key(|iv| iv.lo);
        let mut out: Vec<Interval> = Vec::with_capacity(raw.len());
        for iv in raw {
            match out.last_mut() {
                Some(last) if iv.lo <= last.hi => last.hi = last.hi.max(iv.hi),
                _ => out.push(iv),
            }
        }
        Self { intervals: out }
    }

    /// The normalized intervals, ascending.
    #[must_use]
    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// Returns whether the domain has no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Number of points.
    #[must_use]
    pub fn volume(&self) -> u64 {
        self.intervals.iter().map(|iv| iv.width()).sum()
    }

    /// Returns whether `p` is a point of the domain.
    #[must_use]
    pub fn contains(&self, p: Point) -> bool {
        let idx = self.intervals.partition_point(|iv| iv.lo <= p);
        idx > 0 && self.intervals[idx - 1].hi > p
    }

    /// Returns whether the two domains share any point.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.intervals.len() && j < other.intervals.len() {
            let a = self.intervals[i];
            let b = other.intervals[j];
            if a.hi <= b.lo {
                i += 1;
            } else if b.hi <= a.lo {
                j += 1;
            } else {
                return true;
            }
        }
        false
    }

    /// Points in both domains.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.intervals.len() && j < other.intervals.len() {
            let a = self.intervals[i];
            let b = other.intervals[j];
            let lo = a.lo.max(b.lo);
            let hi = a.hi.min(b.hi);
            if lo < hi {
                out.push(Interval { lo, hi });
            }
            if a.hi <= b.hi {
                i += 1;
            } else {
                j += 1;
            }
        }
        Self { intervals: out }
    }

    /// Points in either domain.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self::from_intervals(
            self.intervals
                .iter()
                .chain(other.intervals.iter())
                .map(|iv| (iv.lo, iv.hi)),
        )
    }

    /// Points of `self` not in `other`.
    #[must_use]
    pub fn subtract(&self, other: &Self) -> Self {
        let mut out = Vec::new();
        let mut j = 0;
        for iv in &self.intervals {
            let mut cursor = iv.lo;
            let end = iv.hi;
            while j < other.intervals.len() && other.intervals[j].hi <= cursor {
                j += 1;
            }
            let mut k = j;
            while k < other.intervals.len() && other.intervals[k].lo < end {
                let o = other.intervals[k];
                if o.lo > cursor {
                    out.push(Interval {
                        lo: cursor,
                        hi: o.lo,
                    });
                }
                cursor = cursor.max(o.hi);
                if o.hi >= end {
                    break;
                }
                k += 1;
            }
            if cursor < end {
                out.push(Interval {
                    lo: cursor,
                    hi: end,
                });
            }
        }
        Self { intervals: out }
    }

    /// Returns whether every point of `other` lies in `self`.
    #[must_use]
    pub fn subsumes(&self, other: &Self) -> bool {
        other.subtract(self).is_empty()
    }

    /// Position of `p` in this domain's ascending point enumeration.
    ///
    /// Instance layout is dense over the enumeration, so the rank is the
    /// per-field element index of the point inside any instance allocated
    /// for this domain.
    #[must_use]
    pub fn rank_of(&self, p: Point) -> Option<u64> {
        let mut before = 0u64;
        for iv in &self.intervals {
            if p < iv.lo {
                return None;
            }
            if p < iv.hi {
                return Some(before + p.abs_diff(iv.lo));
            }
            before += iv.width();
        }
        None
    }

    /// Iterates the points in ascending order.
    pub fn points(&self) -> impl Iterator<Item = Point> + '_ {
        self.intervals.iter().flat_map(|iv| iv.lo..iv.hi)
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "domain[")?;
        for (i, iv) in self.intervals.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}..{}", iv.lo, iv.hi)?;
        }
        write!(f, "]")
    }
}

/// Assignment of colors to child domains, used to create partitions.
///
/// `BTreeMap` so child creation order (and thus child handle order) is
/// deterministic for a given coloring.
pub type Coloring = BTreeMap<Color, Domain>;
