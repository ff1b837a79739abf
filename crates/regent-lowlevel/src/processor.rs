// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Processors: named worker threads with event-gated spawning.
//!
//! Each processor owns a FIFO job queue drained by one dedicated thread, so
//! jobs spawned to the same processor never run concurrently with each other.
//! When the queue drains, the processor invokes its registered idle handler;
//! the scheduling layer above uses that hook to pump ready work and to steal.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::event::{fire_or_report, Event};
use crate::machine::{Fabric, FabricInner};

/// Handle for one processor.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Processor(pub(crate) u32);

impl Processor {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the underlying raw id.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// The kind of work a processor runs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ProcKind {
    /// Application task bodies.
    Cpu,
    /// Runtime-internal work: deferred copies, collection, bookkeeping.
    Utility,
}

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Idle hook; returns whether it made progress (dispatched or stole work).
pub type IdleHandler = Arc<dyn Fn() -> bool + Send + Sync>;

struct ProcQueue {
    jobs: VecDeque<Job>,
    wakes: u32,
}

pub(crate) struct ProcState {
    pub(crate) kind: ProcKind,
    pub(crate) name: String,
    queue: Mutex<ProcQueue>,
    cv: Condvar,
    idle: Mutex<Option<IdleHandler>>,
}

impl ProcState {
    pub(crate) fn new(kind: ProcKind, name: String) -> Self {
        Self {
            kind,
            name,
            queue: Mutex::new(ProcQueue {
                jobs: VecDeque::new(),
                wakes: 0,
            }),
            cv: Condvar::new(),
            idle: Mutex::new(None),
        }
    }

    pub(crate) fn notify(&self) {
        self.cv.notify_one();
    }
}

impl FabricInner {
    pub(crate) fn enqueue(&self, proc: Processor, job: Job) {
        match self.procs.get(proc.index()) {
            Some(st) => {
                st.queue.lock().jobs.push_back(job);
                st.cv.notify_one();
            }
            None => debug_assert!(false, "BUG: enqueue on unknown processor {proc:?}"),
        }
    }
}

/// Drains one processor until shutdown.
///
/// Priority per iteration: local jobs, then the idle handler, then sleep.
/// A wake that lands during the idle pump is consumed before sleeping, so a
/// ready notification can never be lost between the pump and the wait.
pub(crate) fn worker_loop(inner: &Arc<FabricInner>, index: usize) {
    let Some(st) = inner.procs.get(index) else {
        debug_assert!(false, "BUG: worker started for unknown processor {index}");
        return;
    };
    loop {
        let job = st.queue.lock().jobs.pop_front();
        if let Some(job) = job {
            job();
            continue;
        }
        let handler = st.idle.lock().clone();
        if let Some(h) = handler {
            if h() {
                continue;
            }
        }
        let mut q = st.queue.lock();
        if q.wakes > 0 {
            q.wakes = 0;
            continue;
        }
        if !q.jobs.is_empty() {
            continue;
        }
        if inner.shutdown.load(std::sync::atomic::Ordering::Acquire) {
            break;
        }
        st.cv.wait(&mut q);
    }
    trace!(processor = index, name = %st.name, "worker exiting");
}

impl Fabric {
    /// Runs `body` on `proc` once `precondition` triggers; returns the
    /// completion event of the body.
    pub fn spawn(
        &self,
        proc: Processor,
        precondition: Event,
        body: impl FnOnce() + Send + 'static,
    ) -> Event {
        let completion = self.create_internal_event();
        let run_inner = self.inner_arc();
        let job: Job = Box::new(move || {
            body();
            fire_or_report(&run_inner.events, completion);
        });
        let queue_inner = self.inner_arc();
        self.add_waiter(precondition, move || queue_inner.enqueue(proc, job));
        completion
    }

    /// Installs the idle handler for `proc`, replacing any prior one.
    ///
    /// The handler runs on the processor's own thread whenever its job queue
    /// drains, and keeps being re-invoked while it reports progress.
    pub fn set_idle_handler(&self, proc: Processor, handler: impl Fn() -> bool + Send + Sync + 'static) {
        match self.inner().procs.get(proc.index()) {
            Some(st) => {
                *st.idle.lock() = Some(Arc::new(handler));
                st.cv.notify_one();
            }
            None => debug_assert!(false, "BUG: idle handler for unknown processor {proc:?}"),
        }
    }

    /// Nudges `proc` to run its idle handler soon.
    pub fn wake(&self, proc: Processor) {
        match self.inner().procs.get(proc.index()) {
            Some(st) => {
                {
                    let mut q = st.queue.lock();
                    q.wakes = q.wakes.saturating_add(1);
                }
                st.cv.notify_one();
            }
            None => debug_assert!(false, "BUG: wake on unknown processor {proc:?}"),
        }
    }

    /// All processors, in id order.
    #[must_use]
    pub fn processors(&self) -> Vec<Processor> {
        (0..self.inner().procs.len()).map(|i| Processor(index_to_raw(i))).collect()
    }

    /// All processors of `kind`, in id order.
    #[must_use]
    pub fn processors_of_kind(&self, kind: ProcKind) -> Vec<Processor> {
        self.inner()
            .procs
            .iter()
            .enumerate()
            .filter(|(_, st)| st.kind == kind)
            .map(|(i, _)| Processor(index_to_raw(i)))
            .collect()
    }

    /// The kind of `proc`, if the handle is known to this fabric.
    #[must_use]
    pub fn proc_kind(&self, proc: Processor) -> Option<ProcKind> {
        self.inner().procs.get(proc.index()).map(|st| st.kind)
    }
}

pub(crate) fn index_to_raw(i: usize) -> u32 {
    u32::try_from(i).unwrap_or_else(|_| {
        debug_assert!(false, "BUG: handle index {i} exceeds u32");
        u32::MAX
    })
}
