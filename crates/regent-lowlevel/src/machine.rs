// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Machine description and the fabric that realizes it.
//!
//! A [`MachineDesc`] is a plain description: which processors exist, which
//! memories, and which processor/memory pairs are affine. [`Fabric::start`]
//! turns one into live worker threads plus the event, memory, and
//! reservation tables every other module hangs off.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info};

use crate::event::EventTable;
use crate::memory::{MemKind, MemState, Memory};
use crate::processor::{index_to_raw, worker_loop, ProcKind, ProcState, Processor};
use crate::reservation::ReservationTable;

/// One processor in a [`MachineDesc`].
#[derive(Clone, Copy, Debug)]
pub struct ProcDesc {
    /// What the processor runs.
    pub kind: ProcKind,
}

/// One memory in a [`MachineDesc`].
#[derive(Clone, Copy, Debug)]
pub struct MemoryDesc {
    /// What kind of memory.
    pub kind: MemKind,
    /// Capacity in bytes.
    pub capacity: usize,
}

/// Declared processor/memory affinity.
///
/// Indices refer to positions in the describing [`MachineDesc`]'s lists.
/// Higher bandwidth ranks earlier in placement decisions.
#[derive(Clone, Copy, Debug)]
pub struct Affinity {
    /// Index into [`MachineDesc::processors`].
    pub processor: usize,
    /// Index into [`MachineDesc::memories`].
    pub memory: usize,
    /// Relative bandwidth; only the ordering matters.
    pub bandwidth: u32,
}

/// Description of the machine a fabric should realize.
#[derive(Clone, Debug)]
pub struct MachineDesc {
    /// Processors, in id order.
    pub processors: Vec<ProcDesc>,
    /// Memories, in id order.
    pub memories: Vec<MemoryDesc>,
    /// Affinity edges; empty means "everything reaches everything equally".
    pub affinities: Vec<Affinity>,
}

impl MachineDesc {
    /// A flat machine: `cpus` CPU processors, `utilities` utility processors,
    /// and one system memory of `memory_capacity` bytes affine to all of
    /// them.
    #[must_use]
    pub fn symmetric(cpus: usize, utilities: usize, memory_capacity: usize) -> Self {
        let mut processors = Vec::with_capacity(cpus + utilities);
        processors.extend(std::iter::repeat_n(ProcDesc { kind: ProcKind::Cpu }, cpus));
        processors.extend(std::iter::repeat_n(
            ProcDesc {
                kind: ProcKind::Utility,
            },
            utilities,
        ));
        let affinities = (0..processors.len())
            .map(|p| Affinity {
                processor: p,
                memory: 0,
                bandwidth: 100,
            })
            .collect();
        Self {
            processors,
            memories: vec![MemoryDesc {
                kind: MemKind::System,
                capacity: memory_capacity,
            }],
            affinities,
        }
    }

    fn validate(&self) -> Result<(), FabricError> {
        if self.processors.is_empty() {
            return Err(FabricError::NoProcessors);
        }
        for a in &self.affinities {
            if a.processor >= self.processors.len() || a.memory >= self.memories.len() {
                return Err(FabricError::InvalidAffinity);
            }
        }
        Ok(())
    }
}

impl Default for MachineDesc {
    fn default() -> Self {
        Self::symmetric(2, 1, 64 << 20)
    }
}

/// Errors from bringing a fabric up.
#[derive(Debug, Error)]
pub enum FabricError {
    /// A machine needs at least one processor.
    #[error("machine has no processors")]
    NoProcessors,
    /// An affinity edge referenced a processor or memory that does not exist.
    #[error("affinity references unknown processor or memory")]
    InvalidAffinity,
    /// The OS refused to spawn a worker thread.
    #[error("worker thread spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

pub(crate) struct FabricInner {
    pub(crate) events: EventTable,
    pub(crate) procs: Vec<ProcState>,
    pub(crate) mems: Vec<MemState>,
    pub(crate) resvs: ReservationTable,
    pub(crate) affinities: Vec<Affinity>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) next_instance: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running machine substrate.
///
/// Cheap to clone; all clones share the same machine. Worker threads keep
/// the substrate alive until [`Fabric::shutdown`] joins them.
#[derive(Clone)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

impl Fabric {
    pub(crate) fn inner(&self) -> &FabricInner {
        &self.inner
    }

    pub(crate) fn inner_arc(&self) -> Arc<FabricInner> {
        Arc::clone(&self.inner)
    }

    /// Brings up the machine `desc` describes and starts its workers.
    pub fn start(desc: MachineDesc) -> Result<Self, FabricError> {
        desc.validate()?;
        let MachineDesc {
            processors,
            memories,
            affinities,
        } = desc;

        let mut procs = Vec::with_capacity(processors.len());
        let mut cpu_n = 0usize;
        let mut util_n = 0usize;
        for pd in &processors {
            let name = match pd.kind {
                ProcKind::Cpu => {
                    cpu_n += 1;
                    format!("regent-cpu{}", cpu_n - 1)
                }
                ProcKind::Utility => {
                    util_n += 1;
                    format!("regent-util{}", util_n - 1)
                }
            };
            procs.push(ProcState::new(pd.kind, name));
        }
        let mems = memories
            .iter()
            .map(|md| MemState::new(md.kind, md.capacity))
            .collect();

        let fabric = Self {
            inner: Arc::new(FabricInner {
                events: EventTable::new(),
                procs,
                mems,
                resvs: ReservationTable::new(),
                affinities,
                shutdown: AtomicBool::new(false),
                next_instance: AtomicU64::new(1),
                workers: Mutex::new(Vec::new()),
            }),
        };

        let names: Vec<String> = fabric.inner.procs.iter().map(|st| st.name.clone()).collect();
        for (i, name) in names.into_iter().enumerate() {
            let thread_inner = fabric.inner_arc();
            match std::thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(&thread_inner, i))
            {
                Ok(handle) => fabric.inner.workers.lock().push(handle),
                Err(e) => {
                    fabric.shutdown();
                    return Err(FabricError::Spawn(e));
                }
            }
        }
        info!(
            cpus = cpu_n,
            utilities = util_n,
            memories = fabric.inner.mems.len(),
            "fabric started"
        );
        Ok(fabric)
    }

    /// Stops the workers and joins them. Idempotent. Must not be called from
    /// a fabric worker thread.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for st in &self.inner.procs {
            st.notify();
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.workers.lock());
        for h in handles {
            if h.join().is_err() {
                error!("processor worker panicked during shutdown");
            }
        }
        info!("fabric stopped");
    }

    /// Memories reachable from `proc`, best-ranked first (bandwidth
    /// descending, then id). With no declared affinities every memory is
    /// reachable, in id order.
    #[must_use]
    pub fn affine_memories(&self, proc: Processor) -> Vec<Memory> {
        let mut ranked: Vec<(u32, u32)> = self
            .inner
            .affinities
            .iter()
            .filter(|a| a.processor == proc.index())
            .map(|a| (a.bandwidth, index_to_raw(a.memory)))
            .collect();
        if ranked.is_empty() {
            return self.memories();
        }
        ranked.sort_by(|x, y| y.0.cmp(&x.0).then(x.1.cmp(&y.1)));
        let mut out: Vec<Memory> = Vec::with_capacity(ranked.len());
        for (_, m) in ranked {
            if !out.contains(&Memory(m)) {
                out.push(Memory(m));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_machine_is_rejected() {
        let desc = MachineDesc {
            processors: Vec::new(),
            memories: Vec::new(),
            affinities: Vec::new(),
        };
        assert!(matches!(Fabric::start(desc), Err(FabricError::NoProcessors)));
    }

    #[test]
    fn bogus_affinity_is_rejected() {
        let mut desc = MachineDesc::symmetric(1, 0, 1 << 10);
        desc.affinities.push(Affinity {
            processor: 7,
            memory: 0,
            bandwidth: 1,
        });
        assert!(matches!(
            Fabric::start(desc),
            Err(FabricError::InvalidAffinity)
        ));
    }

    #[test]
    fn affinity_ranking_prefers_bandwidth_then_id() {
        let desc = MachineDesc {
            processors: vec![ProcDesc { kind: ProcKind::Cpu }],
            memories: vec![
                MemoryDesc {
                    kind: MemKind::System,
                    capacity: 1 << 20,
                },
                MemoryDesc {
                    kind: MemKind::Scratch,
                    capacity: 1 << 10,
                },
            ],
            affinities: vec![
                Affinity {
                    processor: 0,
                    memory: 0,
                    bandwidth: 10,
                },
                Affinity {
                    processor: 0,
                    memory: 1,
                    bandwidth: 90,
                },
            ],
        };
        let f = match Fabric::start(desc) {
            Ok(f) => f,
            Err(e) => unreachable!("BUG: fabric start failed in test: {e}"),
        };
        let procs = f.processors();
        let ranked = f.affine_memories(procs[0]);
        assert_eq!(
            ranked,
            vec![Memory(1), Memory(0)],
            "scratch has higher bandwidth and must rank first"
        );
        f.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let f = match Fabric::start(MachineDesc::symmetric(1, 1, 1 << 10)) {
            Ok(f) => f,
            Err(e) => unreachable!("BUG: fabric start failed in test: {e}"),
        };
        f.shutdown();
        f.shutdown();
    }
}
