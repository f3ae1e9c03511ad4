//! Server-side per-peer sequencing state.
//!
//! The [`SessionTable`] maps a peer address to its [`Session`].  Every read
//! and write goes through one table-wide mutex: the existence check, the
//! insert of a new peer, the sequence comparison and the counter advance for
//! a single datagram all happen under one [`SessionGuard`], so two tasks
//! racing on a new peer's first packets can never create two sessions.
//!
//! Nothing here touches the network.  Callers compute their reply while the
//! guard is held, drop it, and only then send.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::packet::{flags, Packet};
use crate::state::SessionState;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One peer's handshake and sequencing progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Identity key.
    pub peer: SocketAddr,
    pub state: SessionState,
    /// Sequence number this peer must present next.
    pub expected_seq: u32,
    /// Last acknowledgement value transmitted to this peer.
    pub last_ack_sent: u32,
    /// Sequence number carried by the last `SYN|ACK` sent to this peer.
    pub last_reply_seq: u32,
    /// When the last checksum-valid packet from this peer was processed.
    pub last_activity: Instant,
}

/// Outcome of comparing an incoming sequence number to the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// In order; the expected counter has advanced.
    Accepted,
    /// Not the packet we were waiting for; nothing changed.
    OutOfSequence { expected: u32 },
}

impl Session {
    fn from_syn(peer: SocketAddr, syn: &Packet) -> Self {
        Self {
            peer,
            state: SessionState::Connected,
            expected_seq: syn.header.seq.wrapping_add(1),
            last_ack_sent: syn.header.ack,
            last_reply_seq: 0,
            last_activity: Instant::now(),
        }
    }

    /// Accept `packet` if it carries the expected sequence number.
    ///
    /// On a match the expected counter advances by one.  On a mismatch the
    /// session is left untouched so the correct packet is still expected.
    pub fn validate_and_advance(&mut self, packet: &Packet) -> SequenceCheck {
        if packet.header.seq != self.expected_seq {
            return SequenceCheck::OutOfSequence {
                expected: self.expected_seq,
            };
        }
        self.expected_seq = self.expected_seq.wrapping_add(1);
        self.last_activity = Instant::now();
        SequenceCheck::Accepted
    }

    /// `true` when `packet` is a resend of the last packet this session
    /// accepted (the creating SYN or the latest data packet).
    ///
    /// Such a packet was answered already; its reply may have been lost.
    pub fn is_resend_of_last(&self, packet: &Packet) -> bool {
        packet.header.seq.wrapping_add(1) == self.expected_seq
    }
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Result of [`SessionGuard::get_or_create`].
#[derive(Debug)]
pub enum Lookup<'a> {
    /// First valid SYN from this peer; the session was just inserted.
    Created(&'a mut Session),
    /// The peer already has a session.
    Existing(&'a mut Session),
    /// Unknown peer and the packet is not a handshake; discard it.
    NotHandshake,
}

impl Lookup<'_> {
    pub fn is_new(&self) -> bool {
        matches!(self, Lookup::Created(_))
    }
}

// ---------------------------------------------------------------------------
// SessionTable
// ---------------------------------------------------------------------------

/// Thread-safe peer table guarded by a single mutex.
#[derive(Debug, Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<SocketAddr, Session>>,
}

/// Exclusive access to the table for one logical update.
pub struct SessionGuard<'a> {
    map: MutexGuard<'a, HashMap<SocketAddr, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the table lock.
    ///
    /// A poisoned lock is recovered: sessions are only written with fully
    /// computed values, so a panicking holder cannot leave one half-updated.
    pub fn lock(&self) -> SessionGuard<'_> {
        SessionGuard {
            map: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Copy of the session for `peer`, if any.
    pub fn get(&self, peer: &SocketAddr) -> Option<Session> {
        self.lock().map.get(peer).cloned()
    }

    /// Copy of every session, ordered by peer address.
    pub fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.lock().map.values().cloned().collect();
        sessions.sort_by_key(|s| s.peer);
        sessions
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop sessions with no accepted traffic for at least `max_idle`.
    ///
    /// Returns how many were removed.
    pub fn expire_idle(&self, max_idle: Duration) -> usize {
        let mut guard = self.lock();
        let before = guard.map.len();
        guard
            .map
            .retain(|_, session| session.last_activity.elapsed() < max_idle);
        before - guard.map.len()
    }
}

impl SessionGuard<'_> {
    /// Find the session for `peer`, creating it if `packet` is a SYN.
    ///
    /// A new session expects `packet.seq + 1` next and records
    /// `packet.ack` as the last acknowledgement sent.
    pub fn get_or_create(&mut self, peer: SocketAddr, packet: &Packet) -> Lookup<'_> {
        match self.map.entry(peer) {
            Entry::Occupied(entry) => Lookup::Existing(entry.into_mut()),
            Entry::Vacant(entry) if packet.has_flags(flags::SYN) => {
                Lookup::Created(entry.insert(Session::from_syn(peer, packet)))
            }
            Entry::Vacant(_) => Lookup::NotHandshake,
        }
    }
}
