//! Concurrent UDP handshake server.
//!
//! ```text
//!            recv loop (one task)
//!                  │ datagram, peer
//!        ┌─────────┼─────────┐
//!        ▼         ▼         ▼        one spawned task per datagram
//!   Dispatcher::handle (lock → decide → unlock)
//!        │         │         │
//!        └──── Arc<Socket>::send_to ──▶ peer
//! ```
//!
//! Unless `max_in_flight` is set, the receive loop never waits on a
//! handler.  Handlers share the socket and the [`Dispatcher`] through
//! `Arc`s; ordering between datagrams from the same peer is whatever the
//! scheduler produces, and the session table's single lock keeps each
//! decision atomic.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::socket::{Socket, SocketError};

/// Shortest interval between idle-session sweeps.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: SocketError,
    },
    #[error(transparent)]
    Socket(#[from] SocketError),
}

pub struct Server {
    socket: Arc<Socket>,
    dispatcher: Arc<Dispatcher>,
    limit: Option<Arc<Semaphore>>,
    idle_timeout: Option<Duration>,
}

impl Server {
    /// Bind the listening socket described by `config`.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let addr = config.socket_addr();
        let socket = Socket::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        log::info!(
            "[server] listening on {} (discard mode {})",
            socket.local_addr,
            if config.discard_mode { "on" } else { "off" }
        );
        Ok(Self {
            socket: Arc::new(socket),
            dispatcher: Arc::new(Dispatcher::with_discard_mode(config.discard_mode)),
            limit: config.max_in_flight.map(|n| Arc::new(Semaphore::new(n))),
            idle_timeout: config.session_idle_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// Shared handle to the decision core, for toggling discard mode or
    /// reading sessions and metrics while the server runs.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Serve until the process exits.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serve until `shutdown` completes.
    ///
    /// Receive errors are logged and the loop continues; already spawned
    /// handlers are left to finish on their own.  With `max_in_flight` set,
    /// intake pauses until a handler finishes, but shutdown still wins.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        tokio::pin!(shutdown);

        let sweep_period = self
            .idle_timeout
            .map(|idle| (idle / 2).max(MIN_SWEEP_PERIOD))
            .unwrap_or(Duration::from_secs(3600));
        let mut sweep = tokio::time::interval(sweep_period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    self.stop();
                    return Ok(());
                }

                _ = sweep.tick(), if self.idle_timeout.is_some() => {
                    if let Some(idle) = self.idle_timeout {
                        let removed = self.dispatcher.sessions().expire_idle(idle);
                        if removed > 0 {
                            log::info!("[server] expired {removed} idle sessions");
                        }
                    }
                }

                result = self.socket.recv_datagram() => {
                    let (datagram, peer) = match result {
                        Ok(v) => v,
                        Err(e) => {
                            log::warn!("[server] receive failed: {e}");
                            continue;
                        }
                    };
                    let permit = tokio::select! {
                        _ = &mut shutdown => {
                            self.stop();
                            return Ok(());
                        }
                        permit = self.acquire_permit() => permit,
                    };
                    self.spawn_handler(datagram, peer, permit);
                }
            }
        }
    }

    fn stop(&self) {
        log::info!(
            "[server] shutting down; {} sessions",
            self.dispatcher.sessions().len()
        );
    }

    /// Wait for a handler slot; `None` when intake is unbounded.
    async fn acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        let limit = Arc::clone(self.limit.as_ref()?);
        // The semaphore is never closed.
        limit.acquire_owned().await.ok()
    }

    fn spawn_handler(
        &self,
        datagram: Vec<u8>,
        peer: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let socket = Arc::clone(&self.socket);
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            let _permit = permit;
            if let Some(mut reply) = dispatcher.handle(&datagram, peer) {
                if let Err(e) = socket.send_to(&mut reply, peer).await {
                    log::warn!("[server] reply to {peer} failed: {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{flags, Packet};
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn bind_reports_ephemeral_port() {
        let server = Server::bind(&loopback_config()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.dispatcher().sessions().is_empty());
    }

    #[tokio::test]
    async fn shutdown_future_stops_the_loop() {
        let server = Server::bind(&loopback_config()).await.unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            server.run_until(tokio::time::sleep(Duration::from_millis(20))),
        )
        .await
        .expect("server did not stop");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn idle_sessions_are_swept() {
        let config = ServerConfig {
            session_idle_timeout: Some(Duration::from_millis(200)),
            ..loopback_config()
        };
        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addr();
        let dispatcher = server.dispatcher();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        let peer = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut syn = Packet::new(1, 0, flags::SYN, b"hi".to_vec());
        peer.send_to(&mut syn, addr).await.unwrap();
        let (reply, _) = peer.recv_from().await.unwrap();
        assert!(reply.has_flags(flags::SYN | flags::ACK));
        assert_eq!(dispatcher.sessions().len(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(dispatcher.sessions().is_empty());

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn in_flight_limit_still_serves_every_datagram() {
        let config = ServerConfig {
            max_in_flight: Some(1),
            ..loopback_config()
        };
        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addr();
        let task = tokio::spawn(server.run());

        let peers = bind_peers(4).await;
        for (i, peer) in peers.iter().enumerate() {
            let mut syn = Packet::new(i as u32 * 10, 0, flags::SYN, Vec::new());
            peer.send_to(&mut syn, addr).await.unwrap();
        }
        for (i, peer) in peers.iter().enumerate() {
            let (reply, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from())
                .await
                .expect("no reply")
                .unwrap();
            assert_eq!(reply.header.ack, i as u32 * 10 + 1);
        }
        task.abort();
    }

    #[tokio::test]
    async fn shutdown_wins_while_waiting_for_a_handler_slot() {
        let config = ServerConfig {
            max_in_flight: Some(1),
            ..loopback_config()
        };
        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addr();
        let dispatcher = server.dispatcher();

        // Occupy the only slot so the next datagram blocks intake.
        let limit = Arc::clone(server.limit.as_ref().unwrap());
        let held = limit.acquire_owned().await.unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        let peer = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut syn = Packet::new(1, 0, flags::SYN, Vec::new());
        peer.send_to(&mut syn, addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dispatcher.sessions().is_empty());

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("server stuck waiting for a slot")
            .unwrap()
            .unwrap();
        drop(held);
    }

    async fn bind_peers(n: usize) -> Vec<Socket> {
        let mut sockets = Vec::with_capacity(n);
        for _ in 0..n {
            sockets.push(Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        }
        sockets
    }
}
