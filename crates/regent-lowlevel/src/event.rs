// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Trigger-once events.
//!
//! Events are the only completion/ordering primitive in the substrate.
//! Everything above (task launches, copies, reservation grants, operation
//! completion) is expressed as "this event has triggered".
//!
//! Semantics:
//! - An [`Event`] moves from pending to triggered exactly once and never back.
//! - [`Event::NO_EVENT`] is permanently triggered and is the identity for
//!   [`Fabric::merge_events`].
//! - Waiter callbacks run exactly once, on the thread that triggers the event
//!   (or immediately on the registering thread if the event already
//!   triggered). Callbacks must be short; long work belongs on a processor
//!   via [`Fabric::spawn`](crate::Fabric::spawn).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::machine::Fabric;

/// Handle for a trigger-once event.
///
/// # Invariants
/// - Zero is reserved for [`Event::NO_EVENT`], which is always triggered.
/// - Handles are only minted by a [`Fabric`]; a handle is meaningful only to
///   the fabric that created it.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Event(pub(crate) u64);

impl Event {
    /// The permanently-triggered event.
    pub const NO_EVENT: Self = Self(0);

    /// Returns `true` for [`Event::NO_EVENT`].
    #[must_use]
    pub const fn is_no_event(self) -> bool {
        self.0 == 0
    }

    /// Returns the underlying raw id.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// A triggerable event handle.
///
/// The creator side of an [`Event`]: whoever holds the `UserEvent` decides
/// when the condition it stands for has occurred. Copying the handle does not
/// duplicate the trigger; the first [`Fabric::trigger`] wins and the rest
/// observe [`EventError::AlreadyTriggered`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct UserEvent(Event);

impl UserEvent {
    /// The waitable side of this user event.
    #[must_use]
    pub const fn event(self) -> Event {
        self.0
    }
}

/// Errors from event operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    /// The event was already triggered.
    #[error("event already triggered")]
    AlreadyTriggered,
}

type Waiter = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct PendingEvent {
    waiters: Vec<Waiter>,
}

/// Table of pending events.
///
/// An event id present in `pending` has not triggered; an absent id has.
/// Triggering removes the entry, so the table only grows with the number of
/// in-flight events, not with history.
pub(crate) struct EventTable {
    next: AtomicU64,
    pending: Mutex<FxHashMap<u64, PendingEvent>>,
    cond: Condvar,
}

impl EventTable {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            pending: Mutex::new(FxHashMap::default()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn create_pending(&self) -> Event {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(id, PendingEvent::default());
        Event(id)
    }

    pub(crate) fn has_triggered(&self, ev: Event) -> bool {
        ev.is_no_event() || !self.pending.lock().contains_key(&ev.0)
    }

    /// Registers `w` to run once `ev` triggers; runs it inline when `ev`
    /// already has.
    pub(crate) fn add_waiter(&self, ev: Event, w: Waiter) {
        if ev.is_no_event() {
            w();
            return;
        }
        let run_now = {
            let mut map = self.pending.lock();
            match map.get_mut(&ev.0) {
                Some(p) => {
                    p.waiters.push(w);
                    None
                }
                None => Some(w),
            }
        };
        if let Some(w) = run_now {
            w();
        }
    }

    /// Moves `ev` to triggered. Returns `false` if it already was.
    pub(crate) fn fire(&self, ev: Event) -> bool {
        let waiters = {
            let mut map = self.pending.lock();
            match map.remove(&ev.0) {
                Some(p) => p.waiters,
                None => return false,
            }
        };
        self.cond.notify_all();
        for w in waiters {
            w();
        }
        true
    }

    pub(crate) fn wait(&self, ev: Event) {
        if ev.is_no_event() {
            return;
        }
        let mut map = self.pending.lock();
        while map.contains_key(&ev.0) {
            self.cond.wait(&mut map);
        }
    }
}

impl Fabric {
    /// Creates a fresh untriggered user event.
    pub fn create_user_event(&self) -> UserEvent {
        UserEvent(self.inner().events.create_pending())
    }

    /// Triggers a user event, running its waiters on this thread.
    pub fn trigger(&self, ev: UserEvent) -> Result<(), EventError> {
        if self.inner().events.fire(ev.event()) {
            Ok(())
        } else {
            Err(EventError::AlreadyTriggered)
        }
    }

    /// Returns whether `ev` has triggered.
    #[must_use]
    pub fn has_triggered(&self, ev: Event) -> bool {
        self.inner().events.has_triggered(ev)
    }

    /// Blocks the calling thread until `ev` triggers.
    ///
    /// Never call this from an event waiter callback; waiters run on the
    /// triggering thread and blocking there stalls every later waiter.
    pub fn wait(&self, ev: Event) {
        self.inner().events.wait(ev);
    }

    /// Registers a callback to run once `ev` triggers.
    pub fn add_waiter(&self, ev: Event, f: impl FnOnce() + Send + 'static) {
        self.inner().events.add_waiter(ev, Box::new(f));
    }

    /// Returns an event that triggers once every event in `preds` has.
    ///
    /// Already-triggered preconditions are dropped up front; merging nothing
    /// (or only triggered events) returns [`Event::NO_EVENT`], and merging a
    /// single pending event returns it unchanged.
    pub fn merge_events(&self, preds: &[Event]) -> Event {
        let pending: Vec<Event> = preds
            .iter()
            .copied()
            .filter(|e| !self.has_triggered(*e))
            .collect();
        match pending.as_slice() {
            [] => Event::NO_EVENT,
            [single] => *single,
            _ => {
                let merged = self.inner().events.create_pending();
                let remaining = Arc::new(AtomicUsize::new(pending.len()));
                for pred in pending {
                    let inner = self.inner_arc();
                    let remaining = Arc::clone(&remaining);
                    self.add_waiter(pred, move || {
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            fire_or_report(&inner.events, merged);
                        }
                    });
                }
                merged
            }
        }
    }

    /// Mints a pending event owned by the substrate itself.
    pub(crate) fn create_internal_event(&self) -> Event {
        self.inner().events.create_pending()
    }

    /// Fires an internally-minted event; double fires are a bug.
    pub(crate) fn fire_internal(&self, ev: Event) {
        fire_or_report(&self.inner().events, ev);
    }
}

pub(crate) fn fire_or_report(events: &EventTable, ev: Event) {
    let fired = events.fire(ev);
    debug_assert!(fired, "BUG: internal event {} fired twice", ev.raw());
}
