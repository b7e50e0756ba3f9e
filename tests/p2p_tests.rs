//! P2P layer over real sockets: handshake gating, self-connect detection,
//! and share traffic after verack.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use common::test_net;
use peerpool_node::network::peer::{run_peer, PeerEvent};
use peerpool_node::network::P2pMessage;

async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (client, server)
}

#[tokio::test]
async fn handshake_completes_and_messages_flow() {
    let net = test_net();
    let (a_stream, b_stream) = socket_pair().await;
    let (a_events_tx, mut a_events) = mpsc::channel(16);
    let (b_events_tx, mut b_events) = mpsc::channel(16);

    let a_addr = a_stream.peer_addr().unwrap();
    let b_addr = b_stream.peer_addr().unwrap();
    tokio::spawn(run_peer(
        a_stream,
        a_addr,
        1,
        false,
        Arc::clone(&net),
        111,
        None,
        a_events_tx,
    ));
    tokio::spawn(run_peer(
        b_stream,
        b_addr,
        2,
        true,
        Arc::clone(&net),
        222,
        None,
        b_events_tx,
    ));

    let a_connected = expect_connected(&mut a_events).await;
    let b_connected = expect_connected(&mut b_events).await;

    // Side A pushes a ping-level message across; B surfaces it as an event
    a_connected
        .send(P2pMessage::GetAddrs { count: 4 })
        .await
        .unwrap();
    match next_event(&mut b_events).await {
        PeerEvent::Message { message, .. } => {
            assert_eq!(message, P2pMessage::GetAddrs { count: 4 });
        }
        _ => panic!("expected a message event"),
    }
    let _ = b_connected;
}

#[tokio::test]
async fn self_connection_is_detected_and_dropped() {
    let net = test_net();
    let (a_stream, b_stream) = socket_pair().await;
    let (a_events_tx, mut a_events) = mpsc::channel(16);
    let (b_events_tx, _b_events) = mpsc::channel(16);

    let a_addr = a_stream.peer_addr().unwrap();
    let b_addr = b_stream.peer_addr().unwrap();
    // Same nonce on both ends: the node has dialed itself
    tokio::spawn(run_peer(
        a_stream,
        a_addr,
        1,
        false,
        Arc::clone(&net),
        777,
        None,
        a_events_tx,
    ));
    tokio::spawn(run_peer(
        b_stream,
        b_addr,
        2,
        true,
        Arc::clone(&net),
        777,
        None,
        b_events_tx,
    ));

    match next_event(&mut a_events).await {
        PeerEvent::Disconnected {
            reason, misbehaved, ..
        } => {
            assert!(reason.contains("self"));
            assert!(misbehaved.is_none());
        }
        _ => panic!("expected self-connect disconnect"),
    }
}

async fn next_event(events: &mut mpsc::Receiver<PeerEvent>) -> PeerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event timeout")
        .expect("channel open")
}

async fn expect_connected(
    events: &mut mpsc::Receiver<PeerEvent>,
) -> mpsc::Sender<P2pMessage> {
    match next_event(events).await {
        PeerEvent::Connected { outbound, info, .. } => {
            assert!(info.protocol_version >= 3500);
            outbound
        }
        PeerEvent::Disconnected { reason, .. } => panic!("disconnected: {}", reason),
        PeerEvent::Message { .. } => panic!("message before connected"),
    }
}
