//! `udp-handshake` — a checksummed SYN / SYN-ACK handshake and sequence
//! validation over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐   SYN / data   ┌──────────────────────────────┐
//!  │  Client  │───────────────▶│ Server (recv loop)           │
//!  │  (FSM)   │                │   └─ task per datagram       │
//!  └────┬─────┘◀───────────────│        └─ Dispatcher         │
//!       │    SYN|ACK / NACK    │             └─ SessionTable  │
//!       │                      └──────────────┬───────────────┘
//!  ┌────▼──────┐                         ┌────▼──────┐
//!  │  Socket   │                         │  Socket   │
//!  └───────────┘                         └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]      — wire format and CRC-based checksum
//! - [`state`]       — client and session state enums
//! - [`socket`]      — async UDP socket abstraction
//! - [`session`]     — per-peer sequencing table
//! - [`dispatcher`]  — per-datagram server decision logic
//! - [`server`]      — concurrent receive loop
//! - [`client`]      — handshake state machine and data sends
//! - [`retry`]       — backoff and the manipulated-packet retry harness
//! - [`config`]      — defaults and environment overrides

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod packet;
pub mod retry;
pub mod server;
pub mod session;
pub mod socket;
pub mod state;

pub use client::{Client, HandshakeError};
pub use config::{ClientConfig, ServerConfig};
pub use dispatcher::Dispatcher;
pub use packet::{flags, Packet, PacketError};
pub use retry::{RetryPolicy, RetryReport};
pub use server::{Server, ServerError};
pub use session::{Session, SessionTable};
pub use state::{HandshakeState, SessionState};
