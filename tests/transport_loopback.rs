//! End-to-end exercises over real UDP loopback sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use gatelink::config::TransportConfig;
use gatelink::error::CloseReason;
use gatelink::integrity::CookieOracle;
use gatelink::transport::{ReceivedMessage, Transport};

fn test_config() -> TransportConfig {
    let mut config = TransportConfig::default();
    config.port = 0;
    config
}

fn loopback_addr(transport: &Transport) -> SocketAddr {
    let port = transport.local_addr().expect("bound").port();
    format!("127.0.0.1:{}", port).parse().expect("valid addr")
}

fn sink() -> (
    Arc<Mutex<Vec<ReceivedMessage>>>,
    Box<dyn FnMut(ReceivedMessage) + Send>,
) {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let writer = messages.clone();
    (
        messages,
        Box::new(move |msg| {
            writer.lock().push(msg);
        }),
    )
}

fn pump(a: &mut Transport, b: &mut Transport, ticks: usize) {
    for _ in 0..ticks {
        a.tick();
        b.tick();
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn reliable_send_is_acked_and_delivered_once() {
    let (delivered, callback) = sink();
    let mut server = Transport::bind(test_config())
        .expect("bind server")
        .with_message_callback(callback);
    let mut client = Transport::bind(test_config()).expect("bind client");
    let server_addr = loopback_addr(&server);

    client
        .send_to(server_addr, b"ping", "DEFAULT")
        .expect("send");
    assert_eq!(client.reliable_pending(server_addr), 1);

    pump(&mut server, &mut client, 25);

    let messages = delivered.lock();
    assert_eq!(messages.len(), 1, "reliable payload delivered exactly once");
    assert_eq!(messages[0].payload, b"ping");
    assert_eq!(messages[0].peer, messages[0].client_id.parse().expect("id"));

    assert_eq!(
        client.reliable_pending(server_addr),
        0,
        "ack empties the reliable queue"
    );
    assert!(client.average_rtt(server_addr).is_some());
}

#[test]
fn connect_handshake_reaches_connected() {
    let mut server = Transport::bind(test_config()).expect("bind server");
    let mut client = Transport::bind(test_config()).expect("bind client");
    let server_addr = loopback_addr(&server);

    client.connect(server_addr).expect("connect");
    assert!(!client.is_connected(server_addr));

    pump(&mut server, &mut client, 25);

    assert!(client.is_connected(server_addr));
    assert_eq!(server.connection_count(), 1);
}

#[test]
fn broadcast_reaches_every_peer() {
    let (delivered_a, callback_a) = sink();
    let (delivered_b, callback_b) = sink();
    let mut peer_a = Transport::bind(test_config())
        .expect("bind a")
        .with_message_callback(callback_a);
    let mut peer_b = Transport::bind(test_config())
        .expect("bind b")
        .with_message_callback(callback_b);
    let mut server = Transport::bind(test_config()).expect("bind server");

    let addr_a = loopback_addr(&peer_a);
    let addr_b = loopback_addr(&peer_b);
    server.send_to(addr_a, b"hello a", "REALTIME").expect("send");
    server.send_to(addr_b, b"hello b", "REALTIME").expect("send");

    server.broadcast(b"round", "DEFAULT");

    for _ in 0..25 {
        server.tick();
        peer_a.tick();
        peer_b.tick();
        std::thread::sleep(Duration::from_millis(2));
    }

    assert!(delivered_a.lock().iter().any(|m| m.payload == b"round"));
    assert!(delivered_b.lock().iter().any(|m| m.payload == b"round"));
}

#[test]
fn integrity_gate_withholds_then_delivers() {
    let secret = [5u8; 32];
    let (delivered, callback) = sink();
    let mut server = Transport::bind(test_config())
        .expect("bind server")
        .with_message_callback(callback)
        .with_integrity_oracle(Box::new(CookieOracle::new(secret)));
    let mut client = Transport::bind(test_config())
        .expect("bind client")
        .with_challenge_responder(Box::new(move |challenge| {
            CookieOracle::answer(&secret, challenge)
        }));
    let server_addr = loopback_addr(&server);

    // The first payload arrives before verification and is withheld;
    // REALTIME keeps it from being retransmitted after the gate opens.
    client
        .send_to(server_addr, b"too early", "REALTIME")
        .expect("send");
    pump(&mut server, &mut client, 25);
    assert!(delivered.lock().iter().all(|m| m.payload != b"too early"));

    // The challenge/response completed during the pump; data now flows.
    client
        .send_to(server_addr, b"after verify", "DEFAULT")
        .expect("send");
    pump(&mut server, &mut client, 25);
    assert!(delivered.lock().iter().any(|m| m.payload == b"after verify"));
}

#[test]
fn integrity_failures_end_in_ban() {
    let secret = [5u8; 32];
    let (delivered, callback) = sink();
    let mut server = Transport::bind(test_config())
        .expect("bind server")
        .with_message_callback(callback)
        .with_integrity_oracle(Box::new(CookieOracle::new(secret)));
    // Responder answers every challenge with garbage.
    let mut client = Transport::bind(test_config())
        .expect("bind client")
        .with_challenge_responder(Box::new(|_| vec![0u8; 32]));
    let server_addr = loopback_addr(&server);

    for _ in 0..6 {
        let _ = client.send_to(server_addr, b"data", "DEFAULT");
        pump(&mut server, &mut client, 10);
        if *server.metrics.bans_total.lock() > 0 {
            break;
        }
    }

    assert!(*server.metrics.integrity_failures_total.lock() >= 3);
    assert!(*server.metrics.bans_total.lock() >= 1);
    assert_eq!(
        server.connection_count(),
        0,
        "banned peer removed from the connection table"
    );
    assert!(delivered.lock().is_empty());
}

#[test]
fn disconnect_notifies_peer_and_flushes_state() {
    let mut server = Transport::bind(test_config()).expect("bind server");
    let mut client = Transport::bind(test_config()).expect("bind client");
    let server_addr = loopback_addr(&server);

    client.connect(server_addr).expect("connect");
    pump(&mut server, &mut client, 25);
    assert_eq!(server.connection_count(), 1);

    client.disconnect(server_addr, CloseReason::Requested);
    assert_eq!(client.connection_count(), 0);

    pump(&mut server, &mut client, 25);
    assert_eq!(
        server.connection_count(),
        0,
        "peer honors the disconnect notification"
    );
}

#[test]
fn fragmented_payload_survives_loopback() {
    let (delivered, callback) = sink();
    let mut server = Transport::bind(test_config())
        .expect("bind server")
        .with_message_callback(callback);
    let mut client = Transport::bind(test_config()).expect("bind client");
    let server_addr = loopback_addr(&server);

    // Stays under max_packet_size per fragment but far above
    // fragment_size, so the payload travels in pieces.
    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    client
        .send_to(server_addr, &payload, "DEFAULT")
        .expect("send");

    pump(&mut server, &mut client, 25);

    let messages = delivered.lock();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload, payload);
}
