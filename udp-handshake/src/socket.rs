//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::packet::Packet`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::packet::{Packet, PacketError, MAX_DATAGRAM};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The datagram could not be framed as a packet.
    #[error("packet framing error: {0}")]
    Packet(#[from] PacketError),
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, packet-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks behind an
/// `Arc`.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Encode `packet` (stamping its checksum) and send it as one datagram.
    pub async fn send_to(&self, packet: &mut Packet, dest: SocketAddr) -> Result<(), SocketError> {
        let bytes = packet.encode()?;
        self.send_raw(&bytes, dest).await
    }

    /// Send pre-framed bytes unchanged.
    pub async fn send_raw(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), SocketError> {
        self.inner.send_to(bytes, dest).await?;
        Ok(())
    }

    /// Receive the next datagram as raw bytes, capped at [`MAX_DATAGRAM`].
    pub async fn recv_datagram(&self) -> Result<(Vec<u8>, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, addr))
    }

    /// Receive the next datagram and decode it into a [`Packet`].
    ///
    /// Returns `(packet, sender_address)`.  The checksum is not verified;
    /// datagrams shorter than a header come back as `Err`.
    pub async fn recv_from(&self) -> Result<(Packet, SocketAddr), SocketError> {
        let (bytes, addr) = self.recv_datagram().await?;
        let packet = Packet::decode(&bytes)?;
        Ok((packet, addr))
    }
}
