// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Distributed reference counting for physical managers.
//!
//! Every manager registers a collectable record on the address space that
//! owns its id. The record tracks two reference counts: valid, meaning the
//! data must stay resident, and gc, meaning only the record itself must.
//! Each count is split into an owner-local atomic and a set of remote
//! spaces holding references. A remote space keeps private local counts and
//! tells the owner only about its first and last reference of each kind, so
//! the wire carries one edge per (space, kind) rather than every increment.
//!
//! # Invariants
//!
//! - Collection happens exactly once, on the owner, after both local counts
//!   are zero and both remote sets are empty. The Active → Collected
//!   transition is claimed by compare-exchange and re-verified before the
//!   release is scheduled; a claim that raced a fresh reference backs off.
//! - The release runs on a utility processor behind the merge of every
//!   event registered through [`DistributedRegistry::defer_collection`].
//! - A collected record never returns to service. Late adds and queries
//!   answer gone instead of faulting.
//! - Messages from one space to another arrive in send order, so a remote's
//!   add edge can never be overtaken by its own earlier remove edge.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::{debug, error, trace};

use regent_lowlevel::{Event, Fabric, Processor, UserEvent};

use crate::ident::{AddressSpaceId, DistributedId};
use crate::manager::PhysicalManager;

// ============================================================================
// Errors
// ============================================================================

/// A reference message that could not be decoded.
#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum MessageError {
    /// The buffer ended before the message did.
    #[error("message truncated: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes the message requires.
        need: usize,
        /// Bytes present.
        have: usize,
    },
    /// The leading tag byte named no known message.
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    /// The kind byte named no known reference kind.
    #[error("unknown reference kind {0}")]
    UnknownKind(u8),
    /// Bytes were left over after a complete message.
    #[error("{len} stray bytes after message end")]
    Trailing {
        /// Count of bytes past the end.
        len: usize,
    },
}

/// Failure of a reference-counting operation.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// The id names no record on this space.
    #[error("unknown distributed id {0}")]
    UnknownId(DistributedId),
    /// A record for the id already exists on this space.
    #[error("{0} is already registered")]
    AlreadyRegistered(DistributedId),
    /// A record was registered on the wrong side of the owner boundary.
    #[error("{did} is owned by {owner}")]
    WrongOwner {
        /// The id in question.
        did: DistributedId,
        /// The space embedded in the id.
        owner: AddressSpaceId,
    },
    /// The record was collected; the referent no longer exists.
    #[error("{0} was already collected")]
    Gone(DistributedId),
    /// A count was decremented below zero.
    #[error("{kind} reference count underflow on {did}")]
    Underflow {
        /// The record whose count underflowed.
        did: DistributedId,
        /// Which count underflowed.
        kind: RefKind,
    },
    /// No channel is wired to the named space.
    #[error("no channel to {0}")]
    UnknownSpace(AddressSpaceId),
    /// The OS refused to spawn the router thread.
    #[error("router thread spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
    /// An inbound message failed to decode.
    #[error(transparent)]
    Message(#[from] MessageError),
}

// ============================================================================
// Reference kinds and wire messages
// ============================================================================

/// Which of a record's two counts a reference belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RefKind {
    /// The referent's data must stay resident.
    Valid,
    /// Only the record must stay alive, for example for a pending query.
    Gc,
}

impl RefKind {
    const fn wire(self) -> u8 {
        match self {
            Self::Valid => 0,
            Self::Gc => 1,
        }
    }

    fn from_wire(byte: u8) -> Result<Self, MessageError> {
        match byte {
            0 => Ok(Self::Valid),
            1 => Ok(Self::Gc),
            other => Err(MessageError::UnknownKind(other)),
        }
    }
}

impl std::fmt::Display for RefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Valid => "valid",
            Self::Gc => "gc",
        })
    }
}

const TAG_ADD_REMOTE: u8 = 0;
const TAG_REMOVE_REMOTE: u8 = 1;
const TAG_QUERY: u8 = 2;
const TAG_ALIVE: u8 = 3;
const TAG_GONE: u8 = 4;

const ADD_REMOVE_BYTES: usize = 14;
const QUERY_BYTES: usize = 13;
const STATUS_BYTES: usize = 9;

/// One message of the reference protocol.
///
/// Layout (little-endian): a tag byte, then for the edge messages a kind
/// byte, the u64 id, and the u32 sender space; queries drop the kind byte
/// and answers carry the id alone.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RefMessage {
    /// `from` now holds its first remote reference of `kind`.
    AddRemote {
        /// The record referenced.
        did: DistributedId,
        /// Which count the reference belongs to.
        kind: RefKind,
        /// The space holding the reference.
        from: AddressSpaceId,
    },
    /// `from` dropped its last remote reference of `kind`.
    RemoveRemote {
        /// The record referenced.
        did: DistributedId,
        /// Which count the reference belonged to.
        kind: RefKind,
        /// The space that dropped the reference.
        from: AddressSpaceId,
    },
    /// `from` asks the owner whether the record still exists.
    Query {
        /// The record in question.
        did: DistributedId,
        /// The space to answer.
        from: AddressSpaceId,
    },
    /// The record exists and is active.
    Alive {
        /// The record in question.
        did: DistributedId,
    },
    /// The record was collected.
    Gone {
        /// The record in question.
        did: DistributedId,
    },
}

impl RefMessage {
    /// Serialises the message to its wire form.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(ADD_REMOVE_BYTES);
        match *self {
            Self::AddRemote { did, kind, from } => {
                buf.push(TAG_ADD_REMOTE);
                buf.push(kind.wire());
                buf.extend_from_slice(&did.0.to_le_bytes());
                buf.extend_from_slice(&from.0.to_le_bytes());
            }
            Self::RemoveRemote { did, kind, from } => {
                buf.push(TAG_REMOVE_REMOTE);
                buf.push(kind.wire());
                buf.extend_from_slice(&did.0.to_le_bytes());
                buf.extend_from_slice(&from.0.to_le_bytes());
            }
            Self::Query { did, from } => {
                buf.push(TAG_QUERY);
                buf.extend_from_slice(&did.0.to_le_bytes());
                buf.extend_from_slice(&from.0.to_le_bytes());
            }
            Self::Alive { did } => {
                buf.push(TAG_ALIVE);
                buf.extend_from_slice(&did.0.to_le_bytes());
            }
            Self::Gone { did } => {
                buf.push(TAG_GONE);
                buf.extend_from_slice(&did.0.to_le_bytes());
            }
        }
        Bytes::from(buf)
    }

    /// Parses one message, validating the length and every tag.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let Some((&tag, rest)) = bytes.split_first() else {
            return Err(MessageError::Truncated { need: 1, have: 0 });
        };
        let need = match tag {
            TAG_ADD_REMOTE | TAG_REMOVE_REMOTE => ADD_REMOVE_BYTES,
            TAG_QUERY => QUERY_BYTES,
            TAG_ALIVE | TAG_GONE => STATUS_BYTES,
            other => return Err(MessageError::UnknownTag(other)),
        };
        if bytes.len() < need {
            return Err(MessageError::Truncated {
                need,
                have: bytes.len(),
            });
        }
        if bytes.len() > need {
            return Err(MessageError::Trailing {
                len: bytes.len() - need,
            });
        }
        Ok(match tag {
            TAG_ADD_REMOTE | TAG_REMOVE_REMOTE => {
                let kind = RefKind::from_wire(rest[0])?;
                let did = DistributedId(read_u64(rest, 1));
                let from = AddressSpaceId(read_u32(rest, 9));
                if tag == TAG_ADD_REMOTE {
                    Self::AddRemote { did, kind, from }
                } else {
                    Self::RemoveRemote { did, kind, from }
                }
            }
            TAG_QUERY => Self::Query {
                did: DistributedId(read_u64(rest, 0)),
                from: AddressSpaceId(read_u32(rest, 8)),
            },
            TAG_ALIVE => Self::Alive {
                did: DistributedId(read_u64(rest, 0)),
            },
            _ => Self::Gone {
                did: DistributedId(read_u64(rest, 0)),
            },
        })
    }
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

// ============================================================================
// Collectable records
// ============================================================================

const ACTIVE: u8 = 0;
const COLLECTED: u8 = 1;

/// One record: local counts, remote holders, and the collection latch.
///
/// On the owner the remote sets are authoritative; on a borrowing space
/// they stay empty and only the local counts move. `edge` serialises a
/// borrower's first/last transitions so the owner never sees a remove edge
/// before the add edge it undoes.
struct Collectable {
    did: DistributedId,
    valid: AtomicI64,
    gc: AtomicI64,
    state: AtomicU8,
    remote_valid: Mutex<FxHashSet<AddressSpaceId>>,
    remote_gc: Mutex<FxHashSet<AddressSpaceId>>,
    edge: Mutex<()>,
    preconditions: Mutex<Vec<Event>>,
    collected_event: UserEvent,
    manager: Mutex<Option<Arc<PhysicalManager>>>,
}

impl Collectable {
    fn count(&self, kind: RefKind) -> &AtomicI64 {
        match kind {
            RefKind::Valid => &self.valid,
            RefKind::Gc => &self.gc,
        }
    }

    fn remote_set(&self, kind: RefKind) -> &Mutex<FxHashSet<AddressSpaceId>> {
        match kind {
            RefKind::Valid => &self.remote_valid,
            RefKind::Gc => &self.remote_gc,
        }
    }

    fn is_clear(&self) -> bool {
        self.valid.load(Ordering::Acquire) == 0
            && self.gc.load(Ordering::Acquire) == 0
            && self.remote_valid.lock().is_empty()
            && self.remote_gc.lock().is_empty()
    }
}

// ============================================================================
// Liveness queries
// ============================================================================

struct QueryWaiter {
    done: UserEvent,
    alive: Arc<Mutex<Option<bool>>>,
}

/// Pending answer to a liveness question.
///
/// Owner-local questions resolve immediately; questions about a foreign id
/// resolve when the owner's answer arrives.
#[derive(Clone, Debug)]
pub struct LivenessQuery {
    event: Event,
    alive: Arc<Mutex<Option<bool>>>,
}

impl LivenessQuery {
    fn resolved(alive: bool) -> Self {
        Self {
            event: Event::NO_EVENT,
            alive: Arc::new(Mutex::new(Some(alive))),
        }
    }

    /// Event that triggers once the answer is in.
    #[must_use]
    pub const fn event(&self) -> Event {
        self.event
    }

    /// The answer, `None` until [`LivenessQuery::event`] has triggered.
    #[must_use]
    pub fn alive(&self) -> Option<bool> {
        *self.alive.lock()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Per-space table of collectable records and the wiring between spaces.
///
/// Spaces exchange encoded [`RefMessage`]s over `crossbeam` channels; the
/// sender set is indexed by space id, and each space drains its own inbox on
/// a router thread. A space that never shares references may run with an
/// empty sender set.
pub struct DistributedRegistry {
    space: AddressSpaceId,
    fabric: Fabric,
    collect_proc: Processor,
    senders: Vec<Sender<Bytes>>,
    entries: Mutex<FxHashMap<DistributedId, Arc<Collectable>>>,
    pending_queries: Mutex<FxHashMap<DistributedId, Vec<QueryWaiter>>>,
}

impl std::fmt::Debug for DistributedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRegistry")
            .field("space", &self.space)
            .field("entries", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl DistributedRegistry {
    /// Creates the registry for `space`.
    ///
    /// `collect_proc` is where deferred releases run; it should be a utility
    /// processor so collections never queue behind application tasks.
    #[must_use]
    pub fn new(
        space: AddressSpaceId,
        fabric: Fabric,
        collect_proc: Processor,
        senders: Vec<Sender<Bytes>>,
    ) -> Self {
        Self {
            space,
            fabric,
            collect_proc,
            senders,
            entries: Mutex::new(FxHashMap::default()),
            pending_queries: Mutex::new(FxHashMap::default()),
        }
    }

    /// The space this registry serves.
    #[must_use]
    pub const fn space(&self) -> AddressSpaceId {
        self.space
    }

    /// Registers a manager owned by this space.
    ///
    /// The registration itself holds one valid reference; dropping it is
    /// what eventually lets the record collect.
    pub fn register(&self, manager: Arc<PhysicalManager>) -> Result<(), DistributedError> {
        let did = manager.did();
        if did.owner() != self.space {
            return Err(DistributedError::WrongOwner {
                did,
                owner: did.owner(),
            });
        }
        self.insert_entry(did, Some(manager), 1)?;
        debug!(space = %self.space, did = %did, "registered collectable");
        Ok(())
    }

    /// Registers a proxy for a record owned by another space.
    ///
    /// The proxy starts with zero references; the first
    /// [`DistributedRegistry::add_valid_ref`] or
    /// [`DistributedRegistry::add_gc_ref`] sends the owner an add edge.
    pub fn register_remote(&self, did: DistributedId) -> Result<(), DistributedError> {
        if did.owner() == self.space {
            return Err(DistributedError::WrongOwner {
                did,
                owner: self.space,
            });
        }
        self.insert_entry(did, None, 0)?;
        trace!(space = %self.space, did = %did, "registered remote proxy");
        Ok(())
    }

    fn insert_entry(
        &self,
        did: DistributedId,
        manager: Option<Arc<PhysicalManager>>,
        initial_valid: i64,
    ) -> Result<(), DistributedError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&did) {
            return Err(DistributedError::AlreadyRegistered(did));
        }
        entries.insert(
            did,
            Arc::new(Collectable {
                did,
                valid: AtomicI64::new(initial_valid),
                gc: AtomicI64::new(0),
                state: AtomicU8::new(ACTIVE),
                remote_valid: Mutex::new(FxHashSet::default()),
                remote_gc: Mutex::new(FxHashSet::default()),
                edge: Mutex::new(()),
                preconditions: Mutex::new(Vec::new()),
                collected_event: self.fabric.create_user_event(),
                manager: Mutex::new(manager),
            }),
        );
        Ok(())
    }

    fn entry(&self, did: DistributedId) -> Result<Arc<Collectable>, DistributedError> {
        self.entries
            .lock()
            .get(&did)
            .map(Arc::clone)
            .ok_or(DistributedError::UnknownId(did))
    }

    /// The live manager behind `did`, if this space holds one.
    ///
    /// Returns `None` for proxies and for collected records.
    #[must_use]
    pub fn manager(&self, did: DistributedId) -> Option<Arc<PhysicalManager>> {
        let entry = self.entries.lock().get(&did).map(Arc::clone)?;
        let manager = entry.manager.lock();
        manager.clone()
    }

    /// Whether the record is known and not yet collected, judged locally.
    pub fn is_live(&self, did: DistributedId) -> Result<bool, DistributedError> {
        let entry = self.entry(did)?;
        Ok(entry.state.load(Ordering::Acquire) == ACTIVE)
    }

    /// Event that triggers once the record's release has run.
    ///
    /// On a borrowing space the event triggers when a gone answer retires
    /// the proxy.
    pub fn collection_event(&self, did: DistributedId) -> Result<Event, DistributedError> {
        let entry = self.entry(did)?;
        Ok(entry.collected_event.event())
    }

    /// Holds the record's release until `precondition` triggers.
    ///
    /// Collection may still be claimed while preconditions are pending; only
    /// the release of the backing allocation waits.
    pub fn defer_collection(
        &self,
        did: DistributedId,
        precondition: Event,
    ) -> Result<(), DistributedError> {
        let entry = self.entry(did)?;
        let mut preconditions = entry.preconditions.lock();
        if entry.state.load(Ordering::Acquire) == COLLECTED {
            return Err(DistributedError::Gone(did));
        }
        preconditions.push(precondition);
        Ok(())
    }

    /// Takes one valid reference on `did`.
    pub fn add_valid_ref(&self, did: DistributedId) -> Result<(), DistributedError> {
        self.add_ref(did, RefKind::Valid)
    }

    /// Drops one valid reference on `did`.
    pub fn remove_valid_ref(&self, did: DistributedId) -> Result<(), DistributedError> {
        self.remove_ref(did, RefKind::Valid)
    }

    /// Takes one gc reference on `did`.
    pub fn add_gc_ref(&self, did: DistributedId) -> Result<(), DistributedError> {
        self.add_ref(did, RefKind::Gc)
    }

    /// Drops one gc reference on `did`.
    pub fn remove_gc_ref(&self, did: DistributedId) -> Result<(), DistributedError> {
        self.remove_ref(did, RefKind::Gc)
    }

    fn add_ref(&self, did: DistributedId, kind: RefKind) -> Result<(), DistributedError> {
        let entry = self.entry(did)?;
        if did.owner() == self.space {
            self.add_local(&entry, kind)
        } else {
            self.add_borrowed(&entry, kind)
        }
    }

    fn remove_ref(&self, did: DistributedId, kind: RefKind) -> Result<(), DistributedError> {
        let entry = self.entry(did)?;
        if did.owner() == self.space {
            self.remove_local(&entry, kind)
        } else {
            self.remove_borrowed(&entry, kind)
        }
    }

    /// Owner-side add. The increment lands first; if the record turns out
    /// collected the increment is undone and `try_collect` resolves any
    /// claim that backed off because of it.
    fn add_local(&self, entry: &Arc<Collectable>, kind: RefKind) -> Result<(), DistributedError> {
        entry.count(kind).fetch_add(1, Ordering::AcqRel);
        if entry.state.load(Ordering::Acquire) == COLLECTED {
            entry.count(kind).fetch_sub(1, Ordering::AcqRel);
            self.try_collect(entry);
            return Err(DistributedError::Gone(entry.did));
        }
        trace!(space = %self.space, did = %entry.did, kind = %kind, "added local ref");
        Ok(())
    }

    fn remove_local(&self, entry: &Arc<Collectable>, kind: RefKind) -> Result<(), DistributedError> {
        let prev = entry.count(kind).fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            entry.count(kind).fetch_add(1, Ordering::AcqRel);
            error!(space = %self.space, did = %entry.did, kind = %kind, "reference count underflow");
            debug_assert!(
                false,
                "BUG: {kind} reference count underflow on {did}",
                did = entry.did
            );
            return Err(DistributedError::Underflow {
                did: entry.did,
                kind,
            });
        }
        trace!(space = %self.space, did = %entry.did, kind = %kind, remaining = prev - 1, "removed local ref");
        if prev == 1 {
            self.try_collect(entry);
        }
        Ok(())
    }

    /// Borrower-side add. Held under the edge lock so the add edge reaches
    /// the channel before any remove edge that undoes it.
    fn add_borrowed(&self, entry: &Arc<Collectable>, kind: RefKind) -> Result<(), DistributedError> {
        let _edge = entry.edge.lock();
        if entry.state.load(Ordering::Acquire) == COLLECTED {
            return Err(DistributedError::Gone(entry.did));
        }
        let prev = entry.count(kind).fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            if let Err(e) = self.send_to(
                entry.did.owner(),
                &RefMessage::AddRemote {
                    did: entry.did,
                    kind,
                    from: self.space,
                },
            ) {
                entry.count(kind).fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        }
        trace!(space = %self.space, did = %entry.did, kind = %kind, edge = (prev == 0), "added borrowed ref");
        Ok(())
    }

    fn remove_borrowed(
        &self,
        entry: &Arc<Collectable>,
        kind: RefKind,
    ) -> Result<(), DistributedError> {
        let _edge = entry.edge.lock();
        let prev = entry.count(kind).fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            entry.count(kind).fetch_add(1, Ordering::AcqRel);
            error!(space = %self.space, did = %entry.did, kind = %kind, "reference count underflow");
            debug_assert!(
                false,
                "BUG: {kind} reference count underflow on {did}",
                did = entry.did
            );
            return Err(DistributedError::Underflow {
                did: entry.did,
                kind,
            });
        }
        if prev == 1 {
            if let Err(e) = self.send_to(
                entry.did.owner(),
                &RefMessage::RemoveRemote {
                    did: entry.did,
                    kind,
                    from: self.space,
                },
            ) {
                entry.count(kind).fetch_add(1, Ordering::AcqRel);
                return Err(e);
            }
        }
        trace!(space = %self.space, did = %entry.did, kind = %kind, edge = (prev == 1), "removed borrowed ref");
        Ok(())
    }

    /// Collects the record if every count source is clear.
    ///
    /// The claim order is: check, claim by compare-exchange, re-check. A
    /// reference that landed between the claim and the re-check re-arms the
    /// record instead of leaking it; the undoing side then calls back in
    /// here, so whichever side observed the final clear state collects.
    fn try_collect(&self, entry: &Arc<Collectable>) {
        if !entry.is_clear() {
            return;
        }
        if entry
            .state
            .compare_exchange(ACTIVE, COLLECTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if !entry.is_clear() {
            entry.state.store(ACTIVE, Ordering::Release);
            return;
        }
        let preconditions = std::mem::take(&mut *entry.preconditions.lock());
        let precondition = self.fabric.merge_events(&preconditions);
        let fabric = self.fabric.clone();
        let released = Arc::clone(entry);
        debug!(space = %self.space, did = %entry.did, waits = preconditions.len(), "collecting");
        self.fabric.spawn(self.collect_proc, precondition, move || {
            if let Some(manager) = released.manager.lock().take() {
                manager.release(&fabric);
            }
            if let Err(e) = fabric.trigger(released.collected_event) {
                debug_assert!(false, "BUG: collected event fired twice: {e}");
                error!(did = %released.did, error = %e, "collected event fired twice");
            }
        });
    }

    // ------------------------------------------------------------------------
    // Message plumbing
    // ------------------------------------------------------------------------

    fn send_to(&self, space: AddressSpaceId, msg: &RefMessage) -> Result<(), DistributedError> {
        let sender = self
            .senders
            .get(space.0 as usize)
            .ok_or(DistributedError::UnknownSpace(space))?;
        if sender.send(msg.encode()).is_err() {
            trace!(space = %space, "message dropped after channel close");
        }
        Ok(())
    }

    /// Applies one inbound message.
    ///
    /// Add and remove edges and queries arrive on the owner; answers arrive
    /// on the space that asked.
    pub fn handle_message(&self, msg: &RefMessage) -> Result<(), DistributedError> {
        trace!(space = %self.space, ?msg, "handling message");
        match *msg {
            RefMessage::AddRemote { did, kind, from } => self.on_add_remote(did, kind, from),
            RefMessage::RemoveRemote { did, kind, from } => self.on_remove_remote(did, kind, from),
            RefMessage::Query { did, from } => self.on_query(did, from),
            RefMessage::Alive { did } => {
                self.resolve_queries(did, true);
                Ok(())
            }
            RefMessage::Gone { did } => {
                self.on_gone(did);
                Ok(())
            }
        }
    }

    fn on_add_remote(
        &self,
        did: DistributedId,
        kind: RefKind,
        from: AddressSpaceId,
    ) -> Result<(), DistributedError> {
        let entry = self.entry(did)?;
        entry.remote_set(kind).lock().insert(from);
        if entry.state.load(Ordering::Acquire) == COLLECTED {
            entry.remote_set(kind).lock().remove(&from);
            self.try_collect(&entry);
            debug!(space = %self.space, did = %did, from = %from, "remote add raced collection");
        }
        Ok(())
    }

    fn on_remove_remote(
        &self,
        did: DistributedId,
        kind: RefKind,
        from: AddressSpaceId,
    ) -> Result<(), DistributedError> {
        let entry = self.entry(did)?;
        let removed = entry.remote_set(kind).lock().remove(&from);
        if !removed {
            error!(space = %self.space, did = %did, from = %from, kind = %kind, "remote reference was not held");
            debug_assert!(false, "BUG: remove of unheld remote {kind} ref on {did}");
            return Err(DistributedError::Underflow { did, kind });
        }
        self.try_collect(&entry);
        Ok(())
    }

    /// Answers a liveness question. Unknown ids answer gone: the question
    /// may legitimately outlive the record.
    fn on_query(&self, did: DistributedId, from: AddressSpaceId) -> Result<(), DistributedError> {
        let alive = self
            .entries
            .lock()
            .get(&did)
            .is_some_and(|e| e.state.load(Ordering::Acquire) == ACTIVE);
        let reply = if alive {
            RefMessage::Alive { did }
        } else {
            RefMessage::Gone { did }
        };
        self.send_to(from, &reply)
    }

    fn on_gone(&self, did: DistributedId) {
        let entry = self.entries.lock().get(&did).map(Arc::clone);
        if let Some(entry) = entry {
            if entry
                .state
                .compare_exchange(ACTIVE, COLLECTED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!(space = %self.space, did = %did, "referent gone, proxy retired");
                if let Err(e) = self.fabric.trigger(entry.collected_event) {
                    debug_assert!(false, "BUG: collected event fired twice: {e}");
                    error!(did = %did, error = %e, "collected event fired twice");
                }
            }
        }
        self.resolve_queries(did, false);
    }

    fn resolve_queries(&self, did: DistributedId, alive: bool) {
        let waiters = self.pending_queries.lock().remove(&did).unwrap_or_default();
        for waiter in waiters {
            *waiter.alive.lock() = Some(alive);
            if let Err(e) = self.fabric.trigger(waiter.done) {
                debug_assert!(false, "BUG: query event fired twice: {e}");
                error!(did = %did, error = %e, "query event fired twice");
            }
        }
    }

    /// Asks whether `did` still exists.
    ///
    /// Owner-local questions resolve before returning. Questions about a
    /// foreign id go to the owner; the returned query resolves when the
    /// answer comes back, and a gone answer also retires the local proxy if
    /// one exists.
    pub fn query_liveness(&self, did: DistributedId) -> Result<LivenessQuery, DistributedError> {
        if did.owner() == self.space {
            let alive = match self.entries.lock().get(&did) {
                Some(e) => e.state.load(Ordering::Acquire) == ACTIVE,
                None => return Err(DistributedError::UnknownId(did)),
            };
            return Ok(LivenessQuery::resolved(alive));
        }
        let done = self.fabric.create_user_event();
        let alive = Arc::new(Mutex::new(None));
        self.pending_queries
            .lock()
            .entry(did)
            .or_default()
            .push(QueryWaiter {
                done,
                alive: Arc::clone(&alive),
            });
        self.send_to(did.owner(), &RefMessage::Query { did, from: self.space })?;
        Ok(LivenessQuery {
            event: done.event(),
            alive,
        })
    }

    // ------------------------------------------------------------------------
    // Router
    // ------------------------------------------------------------------------

    /// Spawns the thread that drains this space's inbox.
    ///
    /// The thread exits when it receives an empty frame (see
    /// [`DistributedRegistry::stop_router`]) or when every sender is gone.
    /// Undecodable messages are logged and dropped.
    pub fn start_router(
        self: &Arc<Self>,
        inbox: Receiver<Bytes>,
    ) -> Result<JoinHandle<()>, DistributedError> {
        let registry = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("{}-router", self.space))
            .spawn(move || {
                while let Ok(raw) = inbox.recv() {
                    if raw.is_empty() {
                        break;
                    }
                    match RefMessage::decode(&raw) {
                        Ok(msg) => {
                            if let Err(e) = registry.handle_message(&msg) {
                                error!(space = %registry.space, error = %e, "message handling failed");
                            }
                        }
                        Err(e) => {
                            error!(space = %registry.space, error = %e, "dropped undecodable message");
                        }
                    }
                }
                trace!(space = %registry.space, "router exiting");
            })?;
        Ok(handle)
    }

    /// Posts the stop frame to this space's own inbox.
    ///
    /// Messages already queued are still delivered; the router exits after
    /// them.
    pub fn stop_router(&self) -> Result<(), DistributedError> {
        let sender = self
            .senders
            .get(self.space.0 as usize)
            .ok_or(DistributedError::UnknownSpace(self.space))?;
        if sender.send(Bytes::new()).is_err() {
            trace!(space = %self.space, "stop frame dropped after channel close");
        }
        Ok(())
    }
}

/// Builds the channel mesh for `n` spaces in one process.
///
/// Returns one full sender set per space (index it by destination space id)
/// and each space's inbox receiver, in space order.
#[must_use]
pub fn local_channels(n: usize) -> (Vec<Vec<Sender<Bytes>>>, Vec<Receiver<Bytes>>) {
    let mut inboxes = Vec::with_capacity(n);
    let mut receivers = Vec::with_capacity(n);
    for _ in 0..n {
        let (tx, rx) = crossbeam_channel::unbounded();
        inboxes.push(tx);
        receivers.push(rx);
    }
    let senders = (0..n).map(|_| inboxes.clone()).collect();
    (senders, receivers)
}

// ============================================================================
// Tests
// ============================================================================
