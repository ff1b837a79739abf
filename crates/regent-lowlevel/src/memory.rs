// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Memories and raw instance allocations.
//!
//! A memory is a capacity budget; an instance is a zero-initialized byte
//! buffer charged against one. Layout (how points and fields map onto the
//! bytes) is the business of the layer above; here an instance is only
//! `(id, memory, size, bytes)`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::machine::Fabric;
use crate::processor::index_to_raw;

/// Handle for one memory.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Memory(pub(crate) u32);

impl Memory {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the underlying raw id.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// The kind of a memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MemKind {
    /// Large, reachable from every processor.
    System,
    /// Small and fast; typically affine to a subset of processors.
    Scratch,
}

/// Identifier of one instance allocation, unique within a fabric.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct InstanceId(pub(crate) u64);

impl InstanceId {
    /// Returns the underlying raw id.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Errors from memory operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    /// The allocation would exceed the memory's remaining capacity.
    #[error("out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes asked for.
        requested: usize,
        /// Bytes left in the memory.
        available: usize,
    },
    /// The memory handle does not belong to this fabric.
    #[error("unknown memory")]
    UnknownMemory,
}

pub(crate) struct MemState {
    pub(crate) kind: MemKind,
    pub(crate) capacity: usize,
    usage: Mutex<usize>,
}

impl MemState {
    pub(crate) fn new(kind: MemKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            usage: Mutex::new(0),
        }
    }
}

/// A live byte buffer charged against a memory.
///
/// Cloning shares the buffer; the bytes live until every clone is dropped,
/// but the capacity charge is released by the first [`Fabric::free_instance`].
#[derive(Clone)]
pub struct InstanceHandle {
    id: InstanceId,
    memory: Memory,
    size: usize,
    data: Arc<Mutex<Vec<u8>>>,
    freed: Arc<AtomicBool>,
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("id", &self.id)
            .field("memory", &self.memory)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl InstanceHandle {
    /// This instance's id.
    #[must_use]
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// The memory the instance is charged against.
    #[must_use]
    pub fn memory(&self) -> Memory {
        self.memory
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `f` with shared access to the bytes.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.lock())
    }

    /// Runs `f` with exclusive access to the bytes.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.lock())
    }
}

impl Fabric {
    /// All memories, in id order.
    #[must_use]
    pub fn memories(&self) -> Vec<Memory> {
        (0..self.inner().mems.len())
            .map(|i| Memory(index_to_raw(i)))
            .collect()
    }

    /// All memories of `kind`, in id order.
    #[must_use]
    pub fn memories_of_kind(&self, kind: MemKind) -> Vec<Memory> {
        self.inner()
            .mems
            .iter()
            .enumerate()
            .filter(|(_, st)| st.kind == kind)
            .map(|(i, _)| Memory(index_to_raw(i)))
            .collect()
    }

    /// The kind of `mem`, if the handle is known to this fabric.
    #[must_use]
    pub fn memory_kind(&self, mem: Memory) -> Option<MemKind> {
        self.inner().mems.get(mem.index()).map(|st| st.kind)
    }

    /// Total capacity of `mem` in bytes.
    #[must_use]
    pub fn memory_capacity(&self, mem: Memory) -> Option<usize> {
        self.inner().mems.get(mem.index()).map(|st| st.capacity)
    }

    /// Remaining capacity of `mem` in bytes.
    #[must_use]
    pub fn memory_available(&self, mem: Memory) -> Option<usize> {
        self.inner()
            .mems
            .get(mem.index())
            .map(|st| st.capacity.saturating_sub(*st.usage.lock()))
    }

    /// Allocates a zero-initialized instance of `size` bytes in `mem`.
    pub fn allocate_instance(&self, mem: Memory, size: usize) -> Result<InstanceHandle, MemoryError> {
        let st = self
            .inner()
            .mems
            .get(mem.index())
            .ok_or(MemoryError::UnknownMemory)?;
        {
            let mut used = st.usage.lock();
            let available = st.capacity.saturating_sub(*used);
            if size > available {
                return Err(MemoryError::OutOfMemory {
                    requested: size,
                    available,
                });
            }
            *used += size;
        }
        let id = InstanceId(
            self.inner()
                .next_instance
                .fetch_add(1, Ordering::Relaxed),
        );
        Ok(InstanceHandle {
            id,
            memory: mem,
            size,
            data: Arc::new(Mutex::new(vec![0u8; size])),
            freed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Releases the capacity held by `inst`. Safe to call once per instance;
    /// repeats are ignored.
    pub fn free_instance(&self, inst: &InstanceHandle) {
        if inst.freed.swap(true, Ordering::AcqRel) {
            warn!(instance = inst.id.raw(), "instance freed twice");
            return;
        }
        match self.inner().mems.get(inst.memory.index()) {
            Some(st) => {
                let mut used = st.usage.lock();
                match used.checked_sub(inst.size) {
                    Some(rest) => *used = rest,
                    None => {
                        debug_assert!(false, "BUG: memory usage underflow");
                        *used = 0;
                    }
                }
            }
            None => debug_assert!(false, "BUG: instance charged to unknown memory"),
        }
    }
}
