// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Reservations: asynchronous mutual exclusion.
//!
//! Unlike a mutex, acquiring never blocks a thread. [`Fabric::acquire`]
//! returns an event that triggers when the reservation is granted; holders
//! call [`Fabric::release`] to pass it on. Grants are strictly FIFO in
//! request-arrival order, so chained acquisition in a fixed handle order
//! cannot deadlock.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::event::Event;
use crate::machine::Fabric;

/// Handle for one reservation.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Reservation(pub(crate) u32);

impl Reservation {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the underlying raw id.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

struct ResvState {
    held: bool,
    pending: VecDeque<Event>,
}

pub(crate) struct ReservationTable {
    states: Mutex<Vec<ResvState>>,
}

impl ReservationTable {
    pub(crate) fn new() -> Self {
        Self {
            states: Mutex::new(Vec::new()),
        }
    }
}

impl Fabric {
    /// Creates a new, unheld reservation.
    pub fn create_reservation(&self) -> Reservation {
        let mut states = self.inner().resvs.states.lock();
        states.push(ResvState {
            held: false,
            pending: VecDeque::new(),
        });
        Reservation(crate::processor::index_to_raw(states.len() - 1))
    }

    /// Requests the reservation once `precondition` triggers; the returned
    /// event triggers when the reservation is granted to this request.
    pub fn acquire(&self, resv: Reservation, precondition: Event) -> Event {
        let grant = self.create_internal_event();
        let inner = self.inner_arc();
        self.add_waiter(precondition, move || {
            let grant_now = {
                let mut states = inner.resvs.states.lock();
                match states.get_mut(resv.index()) {
                    Some(st) => {
                        if st.held {
                            st.pending.push_back(grant);
                            false
                        } else {
                            st.held = true;
                            true
                        }
                    }
                    None => {
                        debug_assert!(false, "BUG: acquire on unknown reservation {resv:?}");
                        false
                    }
                }
            };
            if grant_now {
                crate::event::fire_or_report(&inner.events, grant);
            }
        });
        grant
    }

    /// Releases the reservation, granting the oldest queued request if any.
    pub fn release(&self, resv: Reservation) {
        let next = {
            let mut states = self.inner().resvs.states.lock();
            match states.get_mut(resv.index()) {
                Some(st) => {
                    debug_assert!(st.held, "BUG: release of unheld reservation {resv:?}");
                    match st.pending.pop_front() {
                        Some(grant) => Some(grant),
                        None => {
                            st.held = false;
                            None
                        }
                    }
                }
                None => {
                    debug_assert!(false, "BUG: release on unknown reservation {resv:?}");
                    None
                }
            }
        };
        if let Some(grant) = next {
            self.fire_internal(grant);
        }
    }
}
