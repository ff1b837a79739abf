// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Regent substrate: the machine model underneath the dependence analyzer.
//!
//! Everything here is deliberately dumb: trigger-once [`Event`]s, processors
//! that run opaque closures in FIFO order, memories that hand out byte
//! buffers against a capacity budget, and FIFO-granted [`Reservation`]s.
//! No privileges, no regions, no dependence analysis; those live in
//! `regent-core`, expressed entirely in terms of these primitives.
//!
//! The only stateful object is the [`Fabric`], created explicitly from a
//! [`MachineDesc`]. There are no globals; components that need the substrate
//! take a `Fabric` (cheaply clonable) as a constructor argument.

#![forbid(unsafe_code)]

mod event;
mod machine;
mod memory;
mod processor;
mod reservation;

pub use event::{Event, EventError, UserEvent};
pub use machine::{Affinity, Fabric, FabricError, MachineDesc, MemoryDesc, ProcDesc};
pub use memory::{InstanceHandle, InstanceId, MemKind, Memory, MemoryError};
pub use processor::{IdleHandler, ProcKind, Processor};
pub use reservation::Reservation;
