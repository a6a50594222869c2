//! Integration test: encrypted sessions over loopback TCP.
//!
//! Covers the key exchange and codec end to end, message delivery between
//! two connection managers, superseding a connection, and teardown on
//! hostile peers.

use std::net::SocketAddr;
use std::time::Duration;

use archipel_core::{decrypt, encrypt, SessionKey, SessionKeyExchange};
use archipel_network::framing::{read_frame, write_frame};
use archipel_network::handshake::perform_handshake;
use archipel_network::{
    ConnectionEvent, ConnectionManager, ConnectionSettings, ConnectionState, Error, Shutdown,
};
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(5);

fn manager() -> (ConnectionManager, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let settings = ConnectionSettings {
        accept_poll: Duration::from_millis(200),
        ..Default::default()
    };
    (ConnectionManager::new(settings, tx, Shutdown::new()), rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> (String, Vec<u8>) {
    loop {
        if let ConnectionEvent::Message { peer_id, payload } = next_event(rx).await {
            return (peer_id, payload);
        }
    }
}

/// Accept one connection on a fresh loopback listener and run the handshake
async fn loopback_pair() -> ((TcpStream, SessionKey), (TcpStream, SessionKey)) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let key = perform_handshake(&mut stream, TIMEOUT).await.unwrap();
        (stream, key)
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    let client_key = perform_handshake(&mut client, TIMEOUT).await.unwrap();
    ((client, client_key), server.await.unwrap())
}

#[tokio::test]
async fn hello_survives_the_wire_and_resists_a_third_party() {
    let ((mut a, key_a), (mut b, key_b)) = loopback_pair().await;
    assert_eq!(key_a, key_b);

    let message = encrypt(key_a.as_bytes(), b"hello", None).unwrap();
    write_frame(&mut a, &message).await.unwrap();

    let received = read_frame(&mut b).await.unwrap().unwrap();
    assert_eq!(decrypt(key_b.as_bytes(), &received, None).unwrap(), b"hello");

    let mut intruder_key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut intruder_key);
    assert!(matches!(
        decrypt(&intruder_key, &received, None),
        Err(archipel_core::Error::Authentication)
    ));
}

#[tokio::test]
async fn managers_exchange_messages_both_ways() {
    let (alice, mut alice_events) = manager();
    let (bob, mut bob_events) = manager();

    let bob_addr = bob.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    alice.connect("bob", bob_addr).await.unwrap();
    assert_eq!(alice.state("bob").await, ConnectionState::Connected);

    let alice_id = match next_event(&mut bob_events).await {
        ConnectionEvent::Connected {
            peer_id, inbound, ..
        } => {
            assert!(inbound);
            peer_id
        }
        other => panic!("unexpected event: {:?}", other),
    };
    // Inbound sessions are keyed by the remote ip:port
    assert!(alice_id.parse::<SocketAddr>().is_ok());

    alice.send("bob", b"hello").await.unwrap();
    assert_eq!(
        next_message(&mut bob_events).await,
        (alice_id.clone(), b"hello".to_vec())
    );

    bob.send(&alice_id, b"hi alice").await.unwrap();
    assert_eq!(
        next_message(&mut alice_events).await,
        ("bob".to_string(), b"hi alice".to_vec())
    );

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn second_connect_supersedes_the_first() {
    let (manager, _events) = manager();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = tokio::spawn(async move {
        let mut sessions = Vec::new();
        for _ in 0..2 {
            let (mut stream, _) = listener.accept().await.unwrap();
            let key = perform_handshake(&mut stream, TIMEOUT).await.unwrap();
            sessions.push((stream, key));
        }
        sessions
    });

    manager.connect("peer", addr).await.unwrap();
    manager.connect("peer", addr).await.unwrap();

    let mut sessions = acceptor.await.unwrap();
    let (mut second, second_key) = sessions.pop().unwrap();
    let (mut first, _) = sessions.pop().unwrap();

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(TIMEOUT, first.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "first socket should be closed");
    assert_eq!(manager.connection_count().await, 1);

    manager.send("peer", b"still here").await.unwrap();
    let frame = read_frame(&mut second).await.unwrap().unwrap();
    assert_eq!(
        decrypt(second_key.as_bytes(), &frame, None).unwrap(),
        b"still here"
    );
}

#[tokio::test]
async fn send_after_disconnect_is_not_connected() {
    let (alice, _alice_events) = manager();
    let (bob, _bob_events) = manager();

    let bob_addr = bob.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    alice.connect("bob", bob_addr).await.unwrap();
    assert!(alice.disconnect("bob").await);

    assert!(matches!(
        alice.send("bob", b"late").await,
        Err(Error::NotConnected(_))
    ));
    assert_eq!(alice.state("bob").await, ConnectionState::Disconnected);

    bob.shutdown().await;
}

#[tokio::test]
async fn garbage_handshake_registers_nothing() {
    let (bob, _events) = manager();
    let bob_addr = bob.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let mut client = TcpStream::connect(bob_addr).await.unwrap();
    client.write_all(b"not a key").await.unwrap();
    client.shutdown().await.unwrap();

    // Bob drops the stream once the handshake fails
    let mut buf = [0u8; 64];
    let mut total = 0;
    loop {
        let n = tokio::time::timeout(TIMEOUT, client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        if n == 0 {
            break;
        }
        total += n;
    }
    assert_eq!(total, 32, "only bob's public key precedes the close");
    assert_eq!(bob.connection_count().await, 0);

    bob.shutdown().await;
}

#[tokio::test]
async fn repeated_authentication_failures_close_the_session() {
    let (bob, mut bob_events) = manager();
    let bob_addr = bob.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let mut client = TcpStream::connect(bob_addr).await.unwrap();
    perform_handshake(&mut client, TIMEOUT).await.unwrap();

    let peer_id = match next_event(&mut bob_events).await {
        ConnectionEvent::Connected { peer_id, .. } => peer_id,
        other => panic!("unexpected event: {:?}", other),
    };

    let wrong_key = [7u8; 32];
    for _ in 0..ConnectionSettings::default().max_auth_failures {
        let forged = encrypt(&wrong_key, b"forged", None).unwrap();
        write_frame(&mut client, &forged).await.unwrap();
    }

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(TIMEOUT, client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    match next_event(&mut bob_events).await {
        ConnectionEvent::Disconnected { peer_id: closed } => assert_eq!(closed, peer_id),
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(bob.state(&peer_id).await, ConnectionState::Failed);
    assert_eq!(bob.connection_count().await, 0);

    bob.shutdown().await;
}

#[tokio::test]
async fn handshake_finishing_after_shutdown_is_dropped() {
    let (bob, _events) = manager();
    let bob_addr = bob.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let mut client = TcpStream::connect(bob_addr).await.unwrap();
    let mut bob_key = [0u8; 32];
    client.read_exact(&mut bob_key).await.unwrap();

    bob.shutdown().await;
    assert_eq!(bob.connection_count().await, 0);

    // Complete the exchange only once the manager is stopped
    let late = SessionKeyExchange::new();
    client.write_all(&late.public_key_bytes()).await.unwrap();

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(TIMEOUT, client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "session should be closed, not registered");
    assert_eq!(bob.connection_count().await, 0);
    assert!(bob.connected_peers().await.is_empty());
}

#[tokio::test]
async fn connect_after_shutdown_is_refused() {
    let (alice, _alice_events) = manager();
    let (bob, _bob_events) = manager();
    let bob_addr = bob.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    alice.shutdown().await;

    assert!(matches!(
        alice.connect("bob", bob_addr).await,
        Err(Error::Connection(_))
    ));
    assert_eq!(alice.connection_count().await, 0);

    bob.shutdown().await;
}
