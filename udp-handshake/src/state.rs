//! Finite-state-machine types for both ends of the handshake.
//!
//! Transitions live with their owners: [`crate::client::Client`] drives
//! [`HandshakeState`], [`crate::session`] assigns [`SessionState`].

/// Client-side handshake progress.
///
/// ```text
///  IDLE ──initiate()──▶ SYN_SENT ──valid SYN-ACK──▶ ESTABLISHED
///                          │
///                          └──timeout / bad reply──▶ FAILED ──initiate()──▶ SYN_SENT
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Nothing sent yet.
    #[default]
    Idle,
    /// SYN is on the wire; waiting for SYN-ACK.
    SynSent,
    /// Peer acknowledged our SYN with the expected ack number.
    Established,
    /// Last attempt timed out or the reply did not validate.
    Failed,
}

impl HandshakeState {
    /// `true` once a handshake attempt has succeeded.
    pub fn is_established(self) -> bool {
        self == Self::Established
    }
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::SynSent => "SYN_SENT",
            Self::Established => "ESTABLISHED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Server-side view of one peer.
///
/// Only `Connected` is assigned today; a session is created in that state on
/// first valid SYN and stays there until it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Connected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => f.write_str("CONNECTED"),
        }
    }
}
