// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! The region tree forest.
//!
//! The forest is shared naming infrastructure: index spaces and their
//! partitions describe where data lives, field spaces describe what is
//! stored there, and logical regions are (index space, field space) pairs
//! rooting a region tree. Nodes here carry structure only. Analysis state
//! (who last touched which fields, what is open where) lives with the
//! issuing context, never in the forest, so two contexts can analyze
//! against the same trees without contending on anything but this
//! module's read lock.
//!
//! # Invariants
//!
//! - A partition's child subspaces are subsets of the parent's domain.
//! - `disjoint` and `complete` are fixed at partition creation.
//! - Field slots within one field space are unique while allocated and
//!   recycled only after [`RegionTreeForest::free_field`].
//! - Destroyed nodes keep their entries (marked) so stale handles fail
//!   with [`TreeError::Destroyed`] instead of aliasing a reused id.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;

use crate::domain::{Coloring, Domain};
use crate::field_mask::{FieldMask, MAX_FIELDS};
use crate::ident::{
    Color, FieldId, FieldSpaceId, IndexPartition, IndexSpace, LogicalPartition, LogicalRegion,
    RegionTreeId,
};

// ============================================================================
// Errors
// ============================================================================

/// Failures from forest lookups and mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    /// No index space under this handle.
    #[error("unknown index space {0:?}")]
    UnknownIndexSpace(IndexSpace),
    /// No index partition under this handle.
    #[error("unknown index partition {0:?}")]
    UnknownIndexPartition(IndexPartition),
    /// No field space under this handle.
    #[error("unknown field space {0:?}")]
    UnknownFieldSpace(FieldSpaceId),
    /// No region tree under this id.
    #[error("unknown region tree {0:?}")]
    UnknownRegionTree(RegionTreeId),
    /// The partition has no child of this color.
    #[error("no child of color {0:?}")]
    UnknownColor(Color),
    /// The field space has no such field.
    #[error("unknown field {0:?}")]
    UnknownField(FieldId),
    /// The field id is already allocated in this field space.
    #[error("field {0:?} already allocated")]
    DuplicateField(FieldId),
    /// All field slots in the space are in use.
    #[error("field space is full ({MAX_FIELDS} slots)")]
    FieldSlotsExhausted,
    /// A coloring entry escapes the parent index space.
    #[error("coloring for {0:?} is not a subset of the parent domain")]
    ColoringNotSubset(Color),
    /// The named region is not below the claimed ancestor.
    #[error("region is not a subregion of the claimed parent")]
    NotSubregion,
    /// The handle refers to a destroyed node.
    #[error("handle refers to a destroyed node")]
    Destroyed,
    /// Partitions need at least one child.
    #[error("coloring has no entries")]
    EmptyColoring,
    /// The partition does not partition the region's index space.
    #[error("partition {partition:?} does not divide index space {space:?}")]
    PartitionMismatch {
        /// The partition named.
        partition: IndexPartition,
        /// The index space of the region being divided.
        space: IndexSpace,
    },
}

// ============================================================================
// Nodes
// ============================================================================

#[derive(Debug)]
struct IndexSpaceNode {
    domain: Domain,
    parent: Option<IndexPartition>,
    color: Color,
    children: BTreeMap<Color, IndexPartition>,
    next_child_color: u32,
    destroyed: bool,
}

#[derive(Debug)]
struct IndexPartNode {
    parent: IndexSpace,
    color: Color,
    children: BTreeMap<Color, IndexSpace>,
    disjoint: bool,
    complete: bool,
    destroyed: bool,
}

#[derive(Debug, Clone, Copy)]
struct FieldInfo {
    slot: u32,
    size: usize,
}

#[derive(Debug, Default)]
struct FieldSpaceNode {
    fields: BTreeMap<FieldId, FieldInfo>,
    free_slots: Vec<u32>,
    next_slot: u32,
    destroyed: bool,
}

#[derive(Debug)]
struct RegionTreeNode {
    root: LogicalRegion,
    destroyed: bool,
}

/// One level of descent from an ancestor region toward a subregion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStep {
    /// The partition descended through.
    pub partition: IndexPartition,
    /// Its color under the region above.
    pub partition_color: Color,
    /// The subspace descended into.
    pub subspace: IndexSpace,
    /// Its color under the partition.
    pub subspace_color: Color,
}

// ============================================================================
// Forest
// ============================================================================

#[derive(Debug, Default)]
struct ForestInner {
    index_spaces: FxHashMap<IndexSpace, IndexSpaceNode>,
    index_parts: FxHashMap<IndexPartition, IndexPartNode>,
    field_spaces: FxHashMap<FieldSpaceId, FieldSpaceNode>,
    region_trees: FxHashMap<RegionTreeId, RegionTreeNode>,
    next_index_space: u32,
    next_index_part: u32,
    next_field_space: u32,
    next_tree: u32,
    // Keyed by (smaller, larger) raw index space ids.
    disjoint_cache: FxHashMap<(u32, u32), bool>,
}

/// Shared structural state for every region tree in a runtime.
#[derive(Debug, Default)]
pub struct RegionTreeForest {
    inner: RwLock<ForestInner>,
}

impl RegionTreeForest {
    /// An empty forest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Index spaces and partitions
    // ------------------------------------------------------------------

    /// Creates a top-level index space over `domain`.
    pub fn create_index_space(&self, domain: Domain) -> IndexSpace {
        let mut inner = self.inner.write();
        let handle = IndexSpace(inner.next_index_space);
        inner.next_index_space += 1;
        inner.index_spaces.insert(
            handle,
            IndexSpaceNode {
                domain,
                parent: None,
                color: Color(0),
                children: BTreeMap::new(),
                next_child_color: 0,
                destroyed: false,
            },
        );
        debug!(space = handle.0, "created index space");
        handle
    }

    /// Partitions `parent` according to `coloring`.
    ///
    /// Each coloring entry becomes a child subspace of the stated color.
    /// When `disjoint` is `None` the forest computes pairwise disjointness
    /// itself; a stated value is trusted (and checked in debug builds).
    pub fn create_index_partition(
        &self,
        parent: IndexSpace,
        coloring: &Coloring,
        disjoint: Option<bool>,
    ) -> Result<IndexPartition, TreeError> {
        if coloring.is_empty() {
            return Err(TreeError::EmptyColoring);
        }
        let mut inner = self.inner.write();
        let parent_domain = {
            let node = inner
                .index_spaces
                .get(&parent)
                .ok_or(TreeError::UnknownIndexSpace(parent))?;
            if node.destroyed {
                return Err(TreeError::Destroyed);
            }
            node.domain.clone()
        };
        for (color, domain) in coloring {
            if !parent_domain.subsumes(domain) {
                return Err(TreeError::ColoringNotSubset(*color));
            }
        }

        let computed_disjoint = || {
            let domains: Vec<&Domain> = coloring.values().collect();
            for (i, a) in domains.iter().enumerate() {
                for b in &domains[i + 1..] {
                    if a.overlaps(b) {
                        return false;
                    }
                }
            }
            true
        };
        let is_disjoint = match disjoint {
            Some(stated) => {
                debug_assert_eq!(
                    stated,
                    computed_disjoint(),
                    "stated disjointness disagrees with the coloring"
                );
                stated
            }
            None => computed_disjoint(),
        };
        let coverage = coloring
            .values()
            .fold(Domain::empty(), |acc, d| acc.union(d));
        let is_complete = coverage == parent_domain;

        let handle = IndexPartition(inner.next_index_part);
        inner.next_index_part += 1;
        let part_color = {
            let node = inner
                .index_spaces
                .get_mut(&parent)
                .ok_or(TreeError::UnknownIndexSpace(parent))?;
            let color = Color(node.next_child_color);
            node.next_child_color += 1;
            node.children.insert(color, handle);
            color
        };

        let mut children = BTreeMap::new();
        for (color, domain) in coloring {
            let child = IndexSpace(inner.next_index_space);
            inner.next_index_space += 1;
            inner.index_spaces.insert(
                child,
                IndexSpaceNode {
                    domain: domain.clone(),
                    parent: Some(handle),
                    color: *color,
                    children: BTreeMap::new(),
                    next_child_color: 0,
                    destroyed: false,
                },
            );
            children.insert(*color, child);
        }
        inner.index_parts.insert(
            handle,
            IndexPartNode {
                parent,
                color: part_color,
                children,
                disjoint: is_disjoint,
                complete: is_complete,
                destroyed: false,
            },
        );
        debug!(
            partition = handle.0,
            parent = parent.0,
            children = coloring.len(),
            disjoint = is_disjoint,
            complete = is_complete,
            "created index partition"
        );
        Ok(handle)
    }

    /// The partition of `space` colored `color`.
    pub fn index_partition_by_color(
        &self,
        space: IndexSpace,
        color: Color,
    ) -> Result<IndexPartition, TreeError> {
        let inner = self.inner.read();
        let node = inner
            .index_spaces
            .get(&space)
            .ok_or(TreeError::UnknownIndexSpace(space))?;
        node.children
            .get(&color)
            .copied()
            .ok_or(TreeError::UnknownColor(color))
    }

    /// The child subspace of `part` colored `color`.
    pub fn get_index_subspace(
        &self,
        part: IndexPartition,
        color: Color,
    ) -> Result<IndexSpace, TreeError> {
        let inner = self.inner.read();
        let node = inner
            .index_parts
            .get(&part)
            .ok_or(TreeError::UnknownIndexPartition(part))?;
        node.children
            .get(&color)
            .copied()
            .ok_or(TreeError::UnknownColor(color))
    }

    /// The domain of an index space.
    pub fn index_space_domain(&self, space: IndexSpace) -> Result<Domain, TreeError> {
        let inner = self.inner.read();
        inner
            .index_spaces
            .get(&space)
            .map(|n| n.domain.clone())
            .ok_or(TreeError::UnknownIndexSpace(space))
    }

    /// Whether the partition's children are pairwise disjoint.
    pub fn is_partition_disjoint(&self, part: IndexPartition) -> Result<bool, TreeError> {
        let inner = self.inner.read();
        inner
            .index_parts
            .get(&part)
            .map(|n| n.disjoint)
            .ok_or(TreeError::UnknownIndexPartition(part))
    }

    /// Whether the partition's children cover the parent exactly.
    pub fn is_partition_complete(&self, part: IndexPartition) -> Result<bool, TreeError> {
        let inner = self.inner.read();
        inner
            .index_parts
            .get(&part)
            .map(|n| n.complete)
            .ok_or(TreeError::UnknownIndexPartition(part))
    }

    /// Whether two index spaces share no points. Results are memoized.
    pub fn are_spaces_disjoint(&self, a: IndexSpace, b: IndexSpace) -> Result<bool, TreeError> {
        if a == b {
            let inner = self.inner.read();
            let node = inner
                .index_spaces
                .get(&a)
                .ok_or(TreeError::UnknownIndexSpace(a))?;
            return Ok(node.domain.is_empty());
        }
        let key = (a.0.min(b.0), a.0.max(b.0));
        {
            let inner = self.inner.read();
            if let Some(&hit) = inner.disjoint_cache.get(&key) {
                return Ok(hit);
            }
        }
        let mut inner = self.inner.write();
        let da = &inner
            .index_spaces
            .get(&a)
            .ok_or(TreeError::UnknownIndexSpace(a))?
            .domain;
        let db = &inner
            .index_spaces
            .get(&b)
            .ok_or(TreeError::UnknownIndexSpace(b))?
            .domain;
        let disjoint = !da.overlaps(db);
        inner.disjoint_cache.insert(key, disjoint);
        Ok(disjoint)
    }

    /// Whether two children of `part` are disjoint.
    ///
    /// Disjoint partitions answer from structure alone; aliased partitions
    /// fall back to the domain test.
    pub fn are_children_disjoint(
        &self,
        part: IndexPartition,
        c1: Color,
        c2: Color,
    ) -> Result<bool, TreeError> {
        let (s1, s2, structurally) = {
            let inner = self.inner.read();
            let node = inner
                .index_parts
                .get(&part)
                .ok_or(TreeError::UnknownIndexPartition(part))?;
            let s1 = *node.children.get(&c1).ok_or(TreeError::UnknownColor(c1))?;
            let s2 = *node.children.get(&c2).ok_or(TreeError::UnknownColor(c2))?;
            (s1, s2, node.disjoint)
        };
        if c1 == c2 {
            return Ok(false);
        }
        if structurally {
            return Ok(true);
        }
        self.are_spaces_disjoint(s1, s2)
    }

    /// Whether two partitions of the same index space cover disjoint points.
    pub fn are_partitions_disjoint(
        &self,
        p1: IndexPartition,
        p2: IndexPartition,
    ) -> Result<bool, TreeError> {
        if p1 == p2 {
            return Ok(false);
        }
        let (cov1, cov2) = {
            let inner = self.inner.read();
            let n1 = inner
                .index_parts
                .get(&p1)
                .ok_or(TreeError::UnknownIndexPartition(p1))?;
            let n2 = inner
                .index_parts
                .get(&p2)
                .ok_or(TreeError::UnknownIndexPartition(p2))?;
            let cov = |n: &IndexPartNode| {
                n.children.values().try_fold(Domain::empty(), |acc, c| {
                    inner
                        .index_spaces
                        .get(c)
                        .map(|node| acc.union(&node.domain))
                        .ok_or(TreeError::UnknownIndexSpace(*c))
                })
            };
            (cov(n1)?, cov(n2)?)
        };
        Ok(!cov1.overlaps(&cov2))
    }

    /// Marks an index space destroyed. Subtree handles stay resolvable for
    /// in-flight analysis; new partitions of it are refused.
    pub fn destroy_index_space(&self, space: IndexSpace) -> Result<(), TreeError> {
        let mut inner = self.inner.write();
        let node = inner
            .index_spaces
            .get_mut(&space)
            .ok_or(TreeError::UnknownIndexSpace(space))?;
        node.destroyed = true;
        debug!(space = space.0, "destroyed index space");
        Ok(())
    }

    /// Marks an index partition destroyed.
    pub fn destroy_index_partition(&self, part: IndexPartition) -> Result<(), TreeError> {
        let mut inner = self.inner.write();
        let node = inner
            .index_parts
            .get_mut(&part)
            .ok_or(TreeError::UnknownIndexPartition(part))?;
        node.destroyed = true;
        debug!(partition = part.0, "destroyed index partition");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Field spaces
    // ------------------------------------------------------------------

    /// Creates an empty field space.
    pub fn create_field_space(&self) -> FieldSpaceId {
        let mut inner = self.inner.write();
        let handle = FieldSpaceId(inner.next_field_space);
        inner.next_field_space += 1;
        inner.field_spaces.insert(handle, FieldSpaceNode::default());
        debug!(field_space = handle.0, "created field space");
        handle
    }

    /// Allocates `field` with elements of `size` bytes, returning its slot.
    ///
    /// Slots index [`FieldMask`] bits. Freed slots are recycled before new
    /// ones are handed out, so a space can cycle through arbitrarily many
    /// field ids as long as no more than [`MAX_FIELDS`] are live at once.
    pub fn allocate_field(
        &self,
        fs: FieldSpaceId,
        field: FieldId,
        size: usize,
    ) -> Result<u32, TreeError> {
        let mut inner = self.inner.write();
        let node = inner
            .field_spaces
            .get_mut(&fs)
            .ok_or(TreeError::UnknownFieldSpace(fs))?;
        if node.destroyed {
            return Err(TreeError::Destroyed);
        }
        if node.fields.contains_key(&field) {
            return Err(TreeError::DuplicateField(field));
        }
        let slot = if let Some(slot) = node.free_slots.pop() {
            slot
        } else {
            if node.next_slot as usize >= MAX_FIELDS {
                return Err(TreeError::FieldSlotsExhausted);
            }
            let slot = node.next_slot;
            node.next_slot += 1;
            slot
        };
        node.fields.insert(field, FieldInfo { slot, size });
        Ok(slot)
    }

    /// Frees `field`, recycling its slot.
    pub fn free_field(&self, fs: FieldSpaceId, field: FieldId) -> Result<(), TreeError> {
        let mut inner = self.inner.write();
        let node = inner
            .field_spaces
            .get_mut(&fs)
            .ok_or(TreeError::UnknownFieldSpace(fs))?;
        let info = node
            .fields
            .remove(&field)
            .ok_or(TreeError::UnknownField(field))?;
        node.free_slots.push(info.slot);
        Ok(())
    }

    /// The slot backing `field`.
    pub fn field_slot(&self, fs: FieldSpaceId, field: FieldId) -> Result<u32, TreeError> {
        let inner = self.inner.read();
        let node = inner
            .field_spaces
            .get(&fs)
            .ok_or(TreeError::UnknownFieldSpace(fs))?;
        node.fields
            .get(&field)
            .map(|i| i.slot)
            .ok_or(TreeError::UnknownField(field))
    }

    /// Element size of `field` in bytes.
    pub fn field_size(&self, fs: FieldSpaceId, field: FieldId) -> Result<usize, TreeError> {
        let inner = self.inner.read();
        let node = inner
            .field_spaces
            .get(&fs)
            .ok_or(TreeError::UnknownFieldSpace(fs))?;
        node.fields
            .get(&field)
            .map(|i| i.size)
            .ok_or(TreeError::UnknownField(field))
    }

    /// Translates named fields into their slot mask.
    pub fn requirement_mask(
        &self,
        fs: FieldSpaceId,
        fields: &[FieldId],
    ) -> Result<FieldMask, TreeError> {
        let inner = self.inner.read();
        let node = inner
            .field_spaces
            .get(&fs)
            .ok_or(TreeError::UnknownFieldSpace(fs))?;
        let mut mask = FieldMask::new();
        for field in fields {
            let info = node
                .fields
                .get(field)
                .ok_or(TreeError::UnknownField(*field))?;
            mask.set(info.slot as usize);
        }
        Ok(mask)
    }

    /// The `(slot, size)` pairs of every allocated field in `mask`,
    /// ascending by slot. This fixes the block order of instance layouts.
    pub fn slot_sizes(
        &self,
        fs: FieldSpaceId,
        mask: &FieldMask,
    ) -> Result<Vec<(u32, usize)>, TreeError> {
        let inner = self.inner.read();
        let node = inner
            .field_spaces
            .get(&fs)
            .ok_or(TreeError::UnknownFieldSpace(fs))?;
        let mut pairs: Vec<(u32, usize)> = node
            .fields
            .values()
            .filter(|info| mask.test(info.slot as usize))
            .map(|info| (info.slot, info.size))
            .collect();
        pairs.sort_unstable_by_key(|&(slot, _)| slot);
        Ok(pairs)
    }

    /// Marks a field space destroyed; allocation on it is refused.
    pub fn destroy_field_space(&self, fs: FieldSpaceId) -> Result<(), TreeError> {
        let mut inner = self.inner.write();
        let node = inner
            .field_spaces
            .get_mut(&fs)
            .ok_or(TreeError::UnknownFieldSpace(fs))?;
        node.destroyed = true;
        debug!(field_space = fs.0, "destroyed field space");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Logical regions
    // ------------------------------------------------------------------

    /// Creates a top-level logical region, rooting a fresh region tree.
    pub fn create_logical_region(
        &self,
        index_space: IndexSpace,
        field_space: FieldSpaceId,
    ) -> Result<LogicalRegion, TreeError> {
        let mut inner = self.inner.write();
        if !inner.index_spaces.contains_key(&index_space) {
            return Err(TreeError::UnknownIndexSpace(index_space));
        }
        if !inner.field_spaces.contains_key(&field_space) {
            return Err(TreeError::UnknownFieldSpace(field_space));
        }
        let tree_id = RegionTreeId(inner.next_tree);
        inner.next_tree += 1;
        let region = LogicalRegion {
            index_space,
            field_space,
            tree_id,
        };
        inner.region_trees.insert(
            tree_id,
            RegionTreeNode {
                root: region,
                destroyed: false,
            },
        );
        debug!(
            tree = tree_id.0,
            space = index_space.0,
            field_space = field_space.0,
            "created logical region"
        );
        Ok(region)
    }

    /// The logical partition of `region` induced by `part`.
    pub fn get_logical_partition(
        &self,
        region: LogicalRegion,
        part: IndexPartition,
    ) -> Result<LogicalPartition, TreeError> {
        let inner = self.inner.read();
        let node = inner
            .index_parts
            .get(&part)
            .ok_or(TreeError::UnknownIndexPartition(part))?;
        if node.parent != region.index_space {
            return Err(TreeError::PartitionMismatch {
                partition: part,
                space: region.index_space,
            });
        }
        Ok(LogicalPartition {
            index_partition: part,
            field_space: region.field_space,
            tree_id: region.tree_id,
        })
    }

    /// The index space a partition subdivides.
    pub fn partition_parent(&self, part: IndexPartition) -> Result<IndexSpace, TreeError> {
        let inner = self.inner.read();
        inner
            .index_parts
            .get(&part)
            .map(|node| node.parent)
            .ok_or(TreeError::UnknownIndexPartition(part))
    }

    /// The subregion of `part` colored `color`.
    pub fn get_logical_subregion(
        &self,
        part: LogicalPartition,
        color: Color,
    ) -> Result<LogicalRegion, TreeError> {
        let subspace = self.get_index_subspace(part.index_partition, color)?;
        Ok(LogicalRegion {
            index_space: subspace,
            field_space: part.field_space,
            tree_id: part.tree_id,
        })
    }

    /// The root region of a tree.
    pub fn region_tree_root(&self, tree: RegionTreeId) -> Result<LogicalRegion, TreeError> {
        let inner = self.inner.read();
        let node = inner
            .region_trees
            .get(&tree)
            .ok_or(TreeError::UnknownRegionTree(tree))?;
        if node.destroyed {
            return Err(TreeError::Destroyed);
        }
        Ok(node.root)
    }

    /// Marks a region tree destroyed.
    pub fn destroy_region_tree(&self, tree: RegionTreeId) -> Result<(), TreeError> {
        let mut inner = self.inner.write();
        let node = inner
            .region_trees
            .get_mut(&tree)
            .ok_or(TreeError::UnknownRegionTree(tree))?;
        node.destroyed = true;
        debug!(tree = tree.0, "destroyed region tree");
        Ok(())
    }

    /// The descent chain from `ancestor` down to `target`.
    ///
    /// Walks parent links up from `target` and reverses. An empty path
    /// means the two are the same space. [`TreeError::NotSubregion`] means
    /// `target` is not in `ancestor`'s subtree.
    pub fn region_path(
        &self,
        ancestor: IndexSpace,
        target: IndexSpace,
    ) -> Result<Vec<PathStep>, TreeError> {
        let inner = self.inner.read();
        if !inner.index_spaces.contains_key(&ancestor) {
            return Err(TreeError::UnknownIndexSpace(ancestor));
        }
        let mut steps = Vec::new();
        let mut cursor = target;
        while cursor != ancestor {
            let node = inner
                .index_spaces
                .get(&cursor)
                .ok_or(TreeError::UnknownIndexSpace(cursor))?;
            let Some(part) = node.parent else {
                return Err(TreeError::NotSubregion);
            };
            let part_node = inner
                .index_parts
                .get(&part)
                .ok_or(TreeError::UnknownIndexPartition(part))?;
            steps.push(PathStep {
                partition: part,
                partition_color: part_node.color,
                subspace: cursor,
                subspace_color: node.color,
            });
            cursor = part_node.parent;
        }
        steps.reverse();
        Ok(steps)
    }
}
