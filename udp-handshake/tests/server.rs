//! Integration tests for server-side sequencing, driven by raw sockets.
//!
//! These bypass [`udp_handshake::Client`] so they can send duplicated,
//! reordered and corrupted datagrams on purpose.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use udp_handshake::{
    dispatcher::{Dispatcher, RESEND_PAYLOAD},
    flags,
    socket::Socket,
    Packet, Server, ServerConfig,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start_server() -> (SocketAddr, Arc<Dispatcher>) {
    let config = ServerConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        ..ServerConfig::default()
    };
    let server = Server::bind(&config).await.expect("bind server");
    let addr = server.local_addr();
    let dispatcher = server.dispatcher();
    tokio::spawn(server.run());
    (addr, dispatcher)
}

async fn raw_peer() -> Socket {
    Socket::bind("127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind peer socket")
}

async fn send(peer: &Socket, server: SocketAddr, seq: u32, flag_bits: u16, payload: &[u8]) {
    let mut packet = Packet::new(seq, 0, flag_bits, payload);
    peer.send_to(&mut packet, server).await.expect("send");
}

async fn reply(peer: &Socket) -> Packet {
    let (packet, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from())
        .await
        .expect("no reply within 2s")
        .expect("recv failed");
    assert!(packet.verify_checksum(), "server reply has a bad checksum");
    packet
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Two SYNs from one peer sent back to back produce one session and two
/// identical acknowledgements.
#[tokio::test]
async fn simultaneous_syns_create_one_session() {
    let (addr, dispatcher) = start_server().await;
    let peer = raw_peer().await;

    send(&peer, addr, 50, flags::SYN, b"Handshake").await;
    send(&peer, addr, 50, flags::SYN, b"Handshake").await;
    let a = reply(&peer).await;
    let b = reply(&peer).await;

    assert_eq!(a.header.ack, 51);
    assert_eq!(b.header.ack, 51);
    assert!(a.has_flags(flags::SYN | flags::ACK));
    assert!(b.has_flags(flags::SYN | flags::ACK));
    assert_eq!(dispatcher.sessions().len(), 1);
    assert_eq!(dispatcher.sessions().get(&peer.local_addr).unwrap().expected_seq, 51);
}

/// A packet ahead of the expected one is NACKed without moving the counter;
/// the expected packet is then accepted.
#[tokio::test]
async fn out_of_order_is_nacked_then_in_order_accepted() {
    let (addr, dispatcher) = start_server().await;
    let peer = raw_peer().await;

    send(&peer, addr, 1, flags::SYN, b"Handshake").await;
    reply(&peer).await;
    let n = dispatcher.sessions().get(&peer.local_addr).unwrap().expected_seq;

    send(&peer, addr, n + 5, 0, b"too early").await;
    let nack = reply(&peer).await;
    assert!(nack.has_flags(flags::NACK));
    assert_eq!(nack.header.ack, n + 5);
    assert_eq!(nack.payload, RESEND_PAYLOAD);
    assert_eq!(dispatcher.sessions().get(&peer.local_addr).unwrap().expected_seq, n);

    send(&peer, addr, n, 0, b"on time").await;
    let ack = reply(&peer).await;
    assert!(ack.has_flags(flags::SYN | flags::ACK));
    assert!(!ack.has_flags(flags::ERR));
    assert_eq!(ack.header.ack, n + 1);
    assert_eq!(dispatcher.sessions().get(&peer.local_addr).unwrap().expected_seq, n + 1);
}

/// A flipped payload bit is NACKed and creates no session.
#[tokio::test]
async fn corrupted_syn_is_nacked_without_session() {
    let (addr, dispatcher) = start_server().await;
    let peer = raw_peer().await;

    let mut syn = Packet::new(9, 0, flags::SYN, b"Handshake de conexao".to_vec());
    let mut bytes = syn.encode().unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    peer.send_raw(&bytes, addr).await.unwrap();

    let nack = reply(&peer).await;
    assert!(nack.has_flags(flags::NACK));
    assert_eq!(nack.header.seq, 0);
    assert_eq!(nack.header.ack, 9);
    assert!(nack.payload.is_empty());
    assert!(dispatcher.sessions().is_empty());
}

/// Many peers handshaking at once each get their own, correct session.
#[tokio::test]
async fn many_peers_handshake_concurrently() {
    let (addr, dispatcher) = start_server().await;
    let mut rng = rand::rng();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let seq: u32 = rng.random_range(0..u32::MAX);
        handles.push(tokio::spawn(async move {
            let peer = raw_peer().await;
            send(&peer, addr, seq, flags::SYN, b"Handshake").await;
            let ack = reply(&peer).await;
            (peer.local_addr, seq, ack.header.ack)
        }));
    }

    for handle in handles {
        let (local, seq, ack) = handle.await.unwrap();
        assert_eq!(ack, seq + 1);
        assert_eq!(dispatcher.sessions().get(&local).unwrap().expected_seq, seq + 1);
    }
    assert_eq!(dispatcher.sessions().len(), 16);
}

/// Packets that are neither valid handshakes nor from a known peer get no
/// reply at all.
#[tokio::test]
async fn unknown_peer_data_is_silently_dropped() {
    let (addr, dispatcher) = start_server().await;
    let peer = raw_peer().await;

    send(&peer, addr, 3, 0, b"data first").await;
    peer.send_raw(&[0u8; 4], addr).await.unwrap();

    let silence = tokio::time::timeout(Duration::from_millis(200), peer.recv_from()).await;
    assert!(silence.is_err(), "expected no reply");
    assert!(dispatcher.sessions().is_empty());

    let metrics = dispatcher.metrics().unwrap();
    assert_eq!(metrics.unknown_dropped, 1);
    assert_eq!(metrics.malformed, 1);
}
