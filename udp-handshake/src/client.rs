//! Client side: the handshake state machine and post-handshake data sends.
//!
//! A [`Client`] owns one ephemeral UDP socket and talks to exactly one
//! server.  Exchanges are strictly sequential: send one packet, wait (bounded
//! by the receive timeout) for one reply, validate it, return.  There is never
//! more than one packet in flight.
//!
//! Reply validation is ordered: checksum first, then flags, then the ack
//! number.  A reply that fails the checksum is not inspected further.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::time::{timeout_at, Instant};

use crate::config::ClientConfig;
use crate::packet::{flags, Packet, PacketError};
use crate::socket::{Socket, SocketError};
use crate::state::HandshakeState;

/// Payload carried by the client's SYN.
pub const HANDSHAKE_PAYLOAD: &[u8] = b"connection request";

/// Failures surfaced to the caller.  None of them is retried internally.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no reply from {peer} within {timeout:?}")]
    Timeout { peer: SocketAddr, timeout: Duration },
    #[error("reply failed checksum verification")]
    ChecksumMismatch,
    #[error("reply is not a valid packet: {0}")]
    Malformed(PacketError),
    #[error("unexpected flags {got:#06x} in reply")]
    UnexpectedFlags { got: u16 },
    #[error("ack mismatch: expected {expected}, got {got}")]
    AckMismatch { expected: u32, got: u32 },
    #[error("server rejected packet seq={seq}")]
    Rejected { seq: u32 },
    #[error("connection not established (state {0})")]
    NotEstablished(HandshakeState),
    #[error("gave up after {attempts} attempts ({nacks} NACKs, {timeouts} timeouts)")]
    RetriesExhausted {
        attempts: u32,
        nacks: u32,
        timeouts: u32,
    },
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Client handle for one server.
#[derive(Debug)]
pub struct Client {
    socket: Socket,
    peer: SocketAddr,
    recv_timeout: Duration,
    state: HandshakeState,
    /// Sequence number the next originated packet will carry.
    next_seq: u32,
    /// Ack number from the SYN-ACK that established the connection.
    remote_ack: Option<u32>,
    /// Last sequence number seen from the server.
    peer_seq: Option<u32>,
    /// Ignore replies in the retry harness and resend regardless.
    discard_replies: bool,
}

impl Client {
    /// Wrap an already-bound socket.
    pub fn new(socket: Socket, peer: SocketAddr, recv_timeout: Duration, initial_seq: u32) -> Self {
        Self {
            socket,
            peer,
            recv_timeout,
            state: HandshakeState::Idle,
            next_seq: initial_seq,
            remote_ack: None,
            peer_seq: None,
            discard_replies: false,
        }
    }

    /// Bind an ephemeral socket and target the configured server.
    pub async fn open(config: &ClientConfig) -> Result<Self, HandshakeError> {
        let server = config.server();
        let local = match server.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = Socket::bind(local).await?;
        log::debug!("[client] bound {} → {server}", socket.local_addr);
        Ok(Self::new(
            socket,
            server,
            config.recv_timeout,
            config.initial_sequence,
        ))
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_established()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// Sequence number the next originated packet will carry.
    pub fn next_sequence_number(&self) -> u32 {
        self.next_seq
    }

    /// Ack number of the SYN-ACK that established the connection.
    pub fn remote_ack_number(&self) -> Option<u32> {
        self.remote_ack
    }

    pub fn discard_replies(&self) -> bool {
        self.discard_replies
    }

    pub fn set_discard_replies(&mut self, on: bool) {
        self.discard_replies = on;
    }

    /// Run one handshake attempt.
    ///
    /// Sends a SYN with a freshly allocated sequence number `S` and waits for
    /// a checksum-valid `SYN|ACK` acknowledging `S + 1`.  On success the
    /// client is ESTABLISHED and the server's payload is returned as text.
    /// Any failure leaves the client FAILED; calling `initiate` again starts
    /// over with `S + 1`.
    pub async fn initiate(&mut self) -> Result<String, HandshakeError> {
        let seq = self.allocate_seq();
        self.remote_ack = None;

        match self.handshake(seq).await {
            Ok(confirmation) => {
                self.state = HandshakeState::Established;
                log::info!("[client] established with {} (seq={seq})", self.peer);
                Ok(confirmation)
            }
            Err(e) => {
                self.state = HandshakeState::Failed;
                log::warn!("[client] handshake with {} failed: {e}", self.peer);
                Err(e)
            }
        }
    }

    async fn handshake(&mut self, seq: u32) -> Result<String, HandshakeError> {
        let mut syn = Packet::new(seq, 0, flags::SYN, HANDSHAKE_PAYLOAD);
        self.socket.send_to(&mut syn, self.peer).await?;
        self.state = HandshakeState::SynSent;
        log::debug!("[client] → {syn}; waiting up to {:?}", self.recv_timeout);

        let reply = self.recv_reply().await?;
        log::debug!("[client] ← {reply}");

        if !reply.verify_checksum() {
            return Err(HandshakeError::ChecksumMismatch);
        }
        if !reply.has_flags(flags::SYN | flags::ACK) {
            return Err(HandshakeError::UnexpectedFlags {
                got: reply.header.flags,
            });
        }
        let expected = seq.wrapping_add(1);
        if reply.header.ack != expected {
            return Err(HandshakeError::AckMismatch {
                expected,
                got: reply.header.ack,
            });
        }

        self.remote_ack = Some(reply.header.ack);
        self.peer_seq = Some(reply.header.seq);
        Ok(reply.payload_text())
    }

    /// Send one data packet on an established connection.
    ///
    /// The server must answer with an acknowledgement of `seq + 1`.  A NACK
    /// comes back as [`HandshakeError::Rejected`].  On any failure the
    /// sequence number is not consumed, so the next `send` is a resend.
    pub async fn send(&mut self, payload: &[u8]) -> Result<String, HandshakeError> {
        if !self.is_connected() {
            return Err(HandshakeError::NotEstablished(self.state));
        }

        let seq = self.allocate_seq();
        let result = self.exchange_data(seq, payload).await;
        if let Err(e) = &result {
            self.next_seq = seq;
            log::warn!("[client] data seq={seq} not acknowledged: {e}");
        }
        result
    }

    async fn exchange_data(&mut self, seq: u32, payload: &[u8]) -> Result<String, HandshakeError> {
        let ack = self.peer_seq.map_or(0, |s| s.wrapping_add(1));
        let mut packet = Packet::new(seq, ack, 0, payload);
        self.socket.send_to(&mut packet, self.peer).await?;
        log::debug!("[client] → {packet}");

        let reply = self.recv_reply().await?;
        log::debug!("[client] ← {reply}");

        if !reply.verify_checksum() {
            return Err(HandshakeError::ChecksumMismatch);
        }
        if reply.has_flags(flags::ERR) {
            return Err(HandshakeError::Rejected { seq });
        }
        if !reply.has_flags(flags::ACK) {
            return Err(HandshakeError::UnexpectedFlags {
                got: reply.header.flags,
            });
        }
        let expected = seq.wrapping_add(1);
        if reply.header.ack != expected {
            return Err(HandshakeError::AckMismatch {
                expected,
                got: reply.header.ack,
            });
        }

        self.peer_seq = Some(reply.header.seq);
        Ok(reply.payload_text())
    }

    /// Hand out the next sequence number.
    pub(crate) fn allocate_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = seq.wrapping_add(1);
        seq
    }

    pub(crate) async fn send_raw(&self, bytes: &[u8]) -> Result<(), HandshakeError> {
        self.socket.send_raw(bytes, self.peer).await?;
        Ok(())
    }

    /// Wait for one datagram from the server.
    ///
    /// Datagrams from other addresses are skipped without extending the
    /// deadline.  The checksum is left for the caller to verify.
    pub(crate) async fn recv_reply(&self) -> Result<Packet, HandshakeError> {
        let deadline = Instant::now() + self.recv_timeout;
        loop {
            let received = timeout_at(deadline, self.socket.recv_from())
                .await
                .map_err(|_| HandshakeError::Timeout {
                    peer: self.peer,
                    timeout: self.recv_timeout,
                })?;
            match received {
                Ok((packet, addr)) if addr == self.peer => return Ok(packet),
                Ok((_, addr)) => log::debug!("[client] ignoring datagram from {addr}"),
                Err(SocketError::Packet(e)) => return Err(HandshakeError::Malformed(e)),
                Err(e) => return Err(e.into()),
            }
        }
    }
}
