//! Bounded retry with backoff, and the manipulated-packet retry harness.
//!
//! The harness sends a SYN whose checksum was computed over one payload but
//! which carries a different payload on the wire.  A correct server answers
//! with a NACK every time, which exercises the client's resend path end to
//! end.  Each attempt uses a fresh sequence number; attempts are separated
//! by [`Backoff`] delays and capped by [`RetryPolicy::max_attempts`].

use std::time::Duration;

use crate::client::{Client, HandshakeError};
use crate::packet::{flags, Packet, PacketError};

/// Payload the checksum is computed over.
pub const ORIGINAL_PAYLOAD: &[u8] = b"initial text";

/// Payload actually put on the wire.
pub const TAMPERED_PAYLOAD: &[u8] = b"initial text -> tampered!";

/// How many times to send and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total sends, including the first.
    pub max_attempts: u32,
    /// Pause before the first resend.
    pub initial_backoff: Duration,
    /// Ceiling for the pause after repeated back-off.
    pub max_backoff: Duration,
    /// Growth factor per resend; `1` keeps the pause fixed.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Same pause before every resend.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: delay,
            max_backoff: delay,
            multiplier: 1,
        }
    }
}

/// Pause generator for one retry sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            current: policy.initial_backoff.min(policy.max_backoff),
        }
    }

    /// Pause to use now; the next call returns the grown value.
    ///
    /// Growth is capped at `max_backoff`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .saturating_mul(self.policy.multiplier.max(1))
            .min(self.policy.max_backoff);
        delay
    }
}

/// What happened across the attempts of a successful harness run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempts: u32,
    pub nacks: u32,
    pub timeouts: u32,
    /// Replies ignored because the client was in discard mode.
    pub discarded: u32,
}

/// Frame a SYN whose checksum covers [`ORIGINAL_PAYLOAD`] but whose payload
/// is [`TAMPERED_PAYLOAD`].
pub fn manipulated_datagram(seq: u32) -> Result<Vec<u8>, PacketError> {
    let mut packet = Packet::new(seq, 0, flags::SYN, ORIGINAL_PAYLOAD);
    packet.header.checksum = packet.compute_checksum();
    packet.payload = TAMPERED_PAYLOAD.to_vec();
    packet.to_wire()
}

impl Client {
    /// Send manipulated packets until the server accepts one or `policy`
    /// runs out.
    ///
    /// Per attempt: send, wait for one reply, then
    /// - in client discard mode, ignore the reply and resend;
    /// - on a checksum-valid `SYN|ACK` without `ERR`, stop with the report;
    /// - otherwise (NACK, timeout, unreadable reply) pause and resend.
    ///
    /// Returns [`HandshakeError::RetriesExhausted`] once `max_attempts`
    /// sends have gone unaccepted.
    pub async fn send_manipulated(
        &mut self,
        policy: RetryPolicy,
    ) -> Result<RetryReport, HandshakeError> {
        let mut backoff = Backoff::new(policy);
        let mut report = RetryReport::default();

        while report.attempts < policy.max_attempts {
            report.attempts += 1;
            let seq = self.allocate_seq();
            self.send_raw(&manipulated_datagram(seq).map_err(HandshakeError::Malformed)?)
                .await?;
            log::debug!("[retry] attempt {} → manipulated seq={seq}", report.attempts);

            match self.recv_reply().await {
                Ok(_) if self.discard_replies() => {
                    report.discarded += 1;
                    log::info!("[retry] discard mode: ignoring reply to seq={seq}");
                }
                Ok(reply) if is_acceptance(&reply) => {
                    log::info!("[retry] seq={seq} accepted after {} attempts", report.attempts);
                    return Ok(report);
                }
                Ok(reply) => {
                    report.nacks += 1;
                    log::info!("[retry] seq={seq} refused with {reply}");
                }
                Err(HandshakeError::Timeout { .. }) => {
                    report.timeouts += 1;
                    log::info!("[retry] no reply to seq={seq}");
                }
                Err(HandshakeError::Malformed(e)) => {
                    report.nacks += 1;
                    log::info!("[retry] unreadable reply to seq={seq}: {e}");
                }
                Err(e) => return Err(e),
            }

            if report.attempts < policy.max_attempts {
                let delay = backoff.next_delay();
                log::debug!("[retry] resending in {delay:?}");
                tokio::time::sleep(delay).await;
            }
        }

        log::warn!(
            "[retry] giving up after {} attempts ({} NACKs, {} timeouts)",
            report.attempts,
            report.nacks,
            report.timeouts
        );
        Err(HandshakeError::RetriesExhausted {
            attempts: report.attempts,
            nacks: report.nacks,
            timeouts: report.timeouts,
        })
    }
}

fn is_acceptance(reply: &Packet) -> bool {
    reply.verify_checksum()
        && reply.has_flags(flags::SYN | flags::ACK)
        && !reply.has_flags(flags::ERR)
}
