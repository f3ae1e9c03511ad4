//! Per-datagram decision logic for the server.
//!
//! [`Dispatcher::handle`] turns one received datagram into either a reply
//! packet or nothing.  It never touches a socket, which keeps the session
//! lock away from network I/O: the reply is fully built while the lock is
//! held, and [`crate::server`] sends it afterwards.
//!
//! | Incoming                                   | Reply                         |
//! |--------------------------------------------|-------------------------------|
//! | shorter than a header                      | none                          |
//! | checksum mismatch                          | `ACK|ERR`, ack = seq, empty   |
//! | valid, discard mode on                     | none                          |
//! | SYN from unknown peer                      | `SYN|ACK`, ack = seq + 1      |
//! | non-SYN from unknown peer                  | none                          |
//! | known peer, resend of last accepted packet | same `SYN|ACK` as last time   |
//! | known peer, out of sequence                | `ACK|ERR`, ack = seq, "resend"|
//! | known peer, in sequence                    | `SYN|ACK`, ack = seq + 1      |

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LockResult, Mutex, MutexGuard, PoisonError};

use crate::packet::{flags, Packet};
use crate::session::{Lookup, SequenceCheck, SessionTable};

/// Sequence number the server puts on handshake replies.
pub const INITIAL_SERVER_SEQ: u32 = 0;

/// Payload of every `SYN|ACK`.
pub const CONFIRMATION_PAYLOAD: &[u8] = b"connection confirmed";

/// Payload of an out-of-sequence NACK.
pub const RESEND_PAYLOAD: &[u8] = b"resend packet";

/// Running counters, one per dispatch outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchMetrics {
    pub received: u64,
    pub malformed: u64,
    pub checksum_nacks: u64,
    pub discarded: u64,
    pub unknown_dropped: u64,
    pub sessions_created: u64,
    pub duplicate_syns: u64,
    pub duplicate_data: u64,
    pub accepted: u64,
    pub sequence_nacks: u64,
}

/// Shared server state: the session table, the discard toggle and metrics.
#[derive(Debug, Default)]
pub struct Dispatcher {
    sessions: SessionTable,
    discard: AtomicBool,
    metrics: Mutex<DispatchMetrics>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_discard_mode(discard: bool) -> Self {
        let dispatcher = Self::new();
        dispatcher.set_discard_mode(discard);
        dispatcher
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// `true` while checksum-valid packets are being dropped unanswered.
    pub fn discard_mode(&self) -> bool {
        self.discard.load(Ordering::SeqCst)
    }

    pub fn set_discard_mode(&self, on: bool) {
        self.discard.store(on, Ordering::SeqCst);
        log::info!("[server] discard mode {}", if on { "on" } else { "off" });
    }

    /// Flip discard mode and return the new value.
    pub fn toggle_discard_mode(&self) -> bool {
        let on = !self.discard.fetch_xor(true, Ordering::SeqCst);
        log::info!("[server] discard mode {}", if on { "on" } else { "off" });
        on
    }

    /// Access metrics
    pub fn metrics(&self) -> LockResult<MutexGuard<'_, DispatchMetrics>> {
        self.metrics.lock()
    }

    /// Decide what to send back for one datagram from `peer`.
    ///
    /// Returns `None` when the datagram must be dropped without a reply.
    /// The returned packet has not been encoded; its checksum is stamped on
    /// send.
    pub fn handle(&self, datagram: &[u8], peer: SocketAddr) -> Option<Packet> {
        self.count(|m| m.received += 1);

        let packet = match Packet::decode(datagram) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("[server] drop from {peer}: {e}");
                self.count(|m| m.malformed += 1);
                return None;
            }
        };

        if !packet.verify_checksum() {
            log::warn!(
                "[server] bad checksum from {peer} {packet} (expected {:#06x}); → NACK",
                packet.compute_checksum()
            );
            self.count(|m| m.checksum_nacks += 1);
            return Some(Packet::new(
                INITIAL_SERVER_SEQ,
                packet.header.seq,
                flags::NACK,
                Vec::new(),
            ));
        }

        if self.discard_mode() {
            log::info!("[server] discard mode: dropped {packet} from {peer}");
            self.count(|m| m.discarded += 1);
            return None;
        }

        log::debug!("[server] ← {packet} from {peer}");

        let (reply, outcome) = {
            let mut sessions = self.sessions.lock();
            match sessions.get_or_create(peer, &packet) {
                Lookup::NotHandshake => {
                    log::warn!("[server] {peer} has no session and sent no SYN; dropped");
                    (None, Outcome::UnknownDropped)
                }
                Lookup::Created(session) => {
                    log::info!(
                        "[server] new session for {peer}, expecting seq={}",
                        session.expected_seq
                    );
                    session.last_reply_seq = INITIAL_SERVER_SEQ;
                    let ack = packet.header.seq.wrapping_add(1);
                    (Some(syn_ack(INITIAL_SERVER_SEQ, ack)), Outcome::SessionCreated)
                }
                Lookup::Existing(session) if session.is_resend_of_last(&packet) => {
                    log::debug!(
                        "[server] {peer} resent seq={}; repeating the last SYN|ACK",
                        packet.header.seq
                    );
                    let reply = syn_ack(session.last_reply_seq, session.expected_seq);
                    let outcome = if packet.has_flags(flags::SYN) {
                        Outcome::DuplicateSyn
                    } else {
                        Outcome::DuplicateData
                    };
                    (Some(reply), outcome)
                }
                Lookup::Existing(session) => match session.validate_and_advance(&packet) {
                    SequenceCheck::OutOfSequence { expected } => {
                        log::warn!(
                            "[server] {peer} sent seq={} but seq={expected} was expected; → NACK",
                            packet.header.seq
                        );
                        let nack = Packet::new(
                            INITIAL_SERVER_SEQ,
                            packet.header.seq,
                            flags::NACK,
                            RESEND_PAYLOAD,
                        );
                        (Some(nack), Outcome::SequenceNack)
                    }
                    SequenceCheck::Accepted => {
                        let ack = packet.header.seq.wrapping_add(1);
                        let seq = session.last_ack_sent.wrapping_add(1);
                        session.last_ack_sent = ack;
                        session.last_reply_seq = seq;
                        (Some(syn_ack(seq, ack)), Outcome::Accepted)
                    }
                },
            }
        };

        self.count(|m| match outcome {
            Outcome::UnknownDropped => m.unknown_dropped += 1,
            Outcome::SessionCreated => m.sessions_created += 1,
            Outcome::DuplicateSyn => m.duplicate_syns += 1,
            Outcome::DuplicateData => m.duplicate_data += 1,
            Outcome::SequenceNack => m.sequence_nacks += 1,
            Outcome::Accepted => m.accepted += 1,
        });
        if let Some(reply) = &reply {
            log::debug!("[server] → {reply} to {peer}");
        }
        reply
    }

    fn count(&self, update: impl FnOnce(&mut DispatchMetrics)) {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics);
    }
}

/// What the session table decided for a checksum-valid packet.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    UnknownDropped,
    SessionCreated,
    DuplicateSyn,
    DuplicateData,
    SequenceNack,
    Accepted,
}

fn syn_ack(seq: u32, ack: u32) -> Packet {
    Packet::new(seq, ack, flags::SYN | flags::ACK, CONFIRMATION_PAYLOAD)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 6000))
    }

    fn wire(seq: u32, ack: u32, flag_bits: u16, payload: &[u8]) -> Vec<u8> {
        Packet::new(seq, ack, flag_bits, payload).encode().unwrap()
    }

    fn handshake(d: &Dispatcher, seq: u32) -> Packet {
        d.handle(&wire(seq, 0, flags::SYN, b"hello"), peer())
            .expect("SYN must be answered")
    }

    #[test]
    fn short_datagram_is_dropped() {
        let d = Dispatcher::new();
        assert_eq!(d.handle(&[1, 2, 3], peer()), None);
        assert_eq!(d.metrics().unwrap().malformed, 1);
        assert!(d.sessions().is_empty());
    }

    #[test]
    fn corrupted_packet_gets_nack_without_session() {
        let d = Dispatcher::new();
        let mut bytes = wire(5, 0, flags::SYN, b"hello");
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        let reply = d.handle(&bytes, peer()).unwrap();
        assert_eq!(reply.header.flags, flags::NACK);
        assert_eq!(reply.header.ack, 5);
        assert!(reply.payload.is_empty());
        assert!(d.sessions().is_empty());
        assert_eq!(d.metrics().unwrap().checksum_nacks, 1);
    }

    #[test]
    fn first_syn_creates_session_and_gets_syn_ack() {
        let d = Dispatcher::new();
        let reply = handshake(&d, 1);
        assert!(reply.has_flags(flags::SYN | flags::ACK));
        assert_eq!(reply.header.ack, 2);
        assert_eq!(reply.header.seq, INITIAL_SERVER_SEQ);
        assert_eq!(reply.payload, CONFIRMATION_PAYLOAD);
        assert_eq!(d.sessions().get(&peer()).unwrap().expected_seq, 2);
    }

    #[test]
    fn unknown_peer_without_syn_is_dropped() {
        let d = Dispatcher::new();
        assert_eq!(d.handle(&wire(1, 0, 0, b"data"), peer()), None);
        assert!(d.sessions().is_empty());
        assert_eq!(d.metrics().unwrap().unknown_dropped, 1);
    }

    #[test]
    fn discard_mode_drops_valid_packets_only() {
        let d = Dispatcher::with_discard_mode(true);
        assert_eq!(d.handle(&wire(1, 0, flags::SYN, b""), peer()), None);
        assert!(d.sessions().is_empty());

        // Corrupted packets are still NACKed.
        let mut bytes = wire(1, 0, flags::SYN, b"x");
        bytes[0] ^= 0x80;
        assert!(d.handle(&bytes, peer()).is_some());

        assert!(!d.toggle_discard_mode());
        assert!(d.handle(&wire(1, 0, flags::SYN, b""), peer()).is_some());
    }

    #[test]
    fn out_of_order_then_in_order() {
        let d = Dispatcher::new();
        handshake(&d, 10);
        let n = d.sessions().get(&peer()).unwrap().expected_seq;
        assert_eq!(n, 11);

        let reply = d.handle(&wire(n + 5, 0, 0, b"early"), peer()).unwrap();
        assert_eq!(reply.header.flags, flags::NACK);
        assert_eq!(reply.header.ack, n + 5);
        assert_eq!(reply.payload, RESEND_PAYLOAD);
        assert_eq!(d.sessions().get(&peer()).unwrap().expected_seq, n);

        let reply = d.handle(&wire(n, 0, 0, b"on time"), peer()).unwrap();
        assert!(reply.has_flags(flags::SYN | flags::ACK));
        assert_eq!(reply.header.ack, n + 1);
        assert_eq!(d.sessions().get(&peer()).unwrap().expected_seq, n + 1);
    }

    #[test]
    fn accepted_reply_tracks_last_ack_sent() {
        let d = Dispatcher::new();
        // The SYN's ack field seeds last_ack_sent.
        d.handle(&wire(1, 40, flags::SYN, b""), peer()).unwrap();

        let reply = d.handle(&wire(2, 0, 0, b"a"), peer()).unwrap();
        assert_eq!(reply.header.seq, 41);
        assert_eq!(reply.header.ack, 3);

        let reply = d.handle(&wire(3, 0, 0, b"b"), peer()).unwrap();
        assert_eq!(reply.header.seq, 4);
        assert_eq!(reply.header.ack, 4);
        assert_eq!(d.sessions().get(&peer()).unwrap().last_ack_sent, 4);
    }

    #[test]
    fn repeated_first_syn_is_reacknowledged_consistently() {
        let d = Dispatcher::new();
        let first = handshake(&d, 7);
        let second = handshake(&d, 7);
        assert_eq!(first.header.ack, second.header.ack);
        assert!(second.has_flags(flags::SYN | flags::ACK));
        assert_eq!(d.sessions().len(), 1);
        assert_eq!(d.sessions().get(&peer()).unwrap().expected_seq, 8);
        assert_eq!(d.metrics().unwrap().duplicate_syns, 1);
    }

    #[test]
    fn resent_data_gets_the_same_acknowledgement() {
        let d = Dispatcher::new();
        d.handle(&wire(1, 40, flags::SYN, b""), peer()).unwrap();
        let first = d.handle(&wire(2, 0, 0, b"a"), peer()).unwrap();

        // The reply to seq=2 was lost; the client sends seq=2 again.
        let again = d.handle(&wire(2, 0, 0, b"a"), peer()).unwrap();
        assert_eq!(again, first);
        assert!(!again.has_flags(flags::ERR));

        let s = d.sessions().get(&peer()).unwrap();
        assert_eq!(s.expected_seq, 3);
        assert_eq!(s.last_ack_sent, 3);
        let metrics = d.metrics().unwrap();
        assert_eq!(metrics.duplicate_data, 1);
        assert_eq!(metrics.accepted, 1);
        assert_eq!(metrics.sequence_nacks, 0);
        drop(metrics);

        // The next packet carries on from the original reply.
        let next = d.handle(&wire(3, 0, 0, b"b"), peer()).unwrap();
        assert_eq!(next.header.seq, 4);
        assert_eq!(next.header.ack, 4);
    }

    #[test]
    fn older_resends_are_still_nacked() {
        let d = Dispatcher::new();
        handshake(&d, 1);
        d.handle(&wire(2, 0, 0, b"a"), peer()).unwrap();
        d.handle(&wire(3, 0, 0, b"b"), peer()).unwrap();

        let reply = d.handle(&wire(2, 0, 0, b"a"), peer()).unwrap();
        assert_eq!(reply.header.flags, flags::NACK);
        assert_eq!(d.sessions().get(&peer()).unwrap().expected_seq, 4);
    }

    #[test]
    fn fresh_syn_after_failed_attempt_is_accepted() {
        let d = Dispatcher::new();
        handshake(&d, 1);
        let reply = handshake(&d, 2);
        assert!(reply.has_flags(flags::SYN | flags::ACK));
        assert_eq!(reply.header.ack, 3);
    }
}
