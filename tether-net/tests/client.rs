//! Client lifecycle against a real server and against a hand-driven socket.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::*;
use tether_core::HEARTBEAT_PAYLOAD;
use tether_net::{
    channel_listener, Client, ClientEvent, ConnectionState, Error, ProtocolConfig, ServerEvent,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use ConnectionState::*;

#[test]
fn send_without_connection_fails_locally() {
    let client = Client::new(&ProtocolConfig::default()).unwrap();
    assert!(matches!(client.send(b"hi"), Err(Error::NotConnected)));
    assert_eq!(client.state(), Disconnected);
    client.disconnect();
    client.disconnect();
    assert!(!client.is_connected());
}

#[test]
fn oversized_payload_rejected_before_queueing() {
    let protocol = ProtocolConfig {
        max_frame_len: 8,
        ..Default::default()
    };
    let client = Client::new(&protocol).unwrap();
    assert!(matches!(client.send(&[0u8; 9]), Err(Error::Encode(_))));
}

#[tokio::test]
async fn connect_send_and_idempotent_disconnect() {
    let (server, mut server_events) = start_server(&ProtocolConfig::default()).await;
    let client = Client::new(&ProtocolConfig::default()).unwrap();
    let (listener, mut events) = channel_listener();

    client.connect(listener, "127.0.0.1", server.local_addr().port());
    assert_eq!(next(&mut events).await, ClientEvent::Status(Connecting));
    assert_eq!(next(&mut events).await, ClientEvent::Status(Connected));
    assert!(client.is_connected());

    let (id, _) = expect_opened(&mut server_events).await;
    client.send(b"one").unwrap();
    client.send(b"two").unwrap();
    assert_eq!(next(&mut server_events).await, ServerEvent::Data(id, Bytes::from_static(b"one")));
    assert_eq!(next(&mut server_events).await, ServerEvent::Data(id, Bytes::from_static(b"two")));

    client.disconnect();
    client.disconnect();
    assert_eq!(next(&mut events).await, ClientEvent::Status(Disconnected));
    assert_quiet(&mut events, Duration::from_millis(200)).await;
    assert!(matches!(client.send(b"late"), Err(Error::NotConnected)));

    assert_eq!(next(&mut server_events).await, ServerEvent::Closed(id));
}

#[tokio::test]
async fn connect_failure_is_reported_through_listener() {
    // Grab a free port, then close it so nothing is listening there.
    let port = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };
    let client = Client::new(&ProtocolConfig::default()).unwrap();
    let (listener, mut events) = channel_listener();

    client.connect(listener, "127.0.0.1", port);
    assert_eq!(next(&mut events).await, ClientEvent::Status(Connecting));
    assert!(matches!(next(&mut events).await, ClientEvent::ConnectFailed(_)));
    assert_eq!(next(&mut events).await, ClientEvent::Status(Disconnected));
    assert_eq!(client.state(), Disconnected);
    assert!(matches!(client.send(b"hi"), Err(Error::NotConnected)));
}

#[tokio::test]
async fn disconnect_while_connecting_wins() {
    let (server, _server_events) = start_server(&ProtocolConfig::default()).await;
    let client = Client::new(&ProtocolConfig::default()).unwrap();
    let (listener, mut events) = channel_listener();

    client.connect(listener, "127.0.0.1", server.local_addr().port());
    client.disconnect();

    assert_eq!(next(&mut events).await, ClientEvent::Status(Connecting));
    let mut last = None;
    while let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(300), events.recv()).await {
        last = Some(ev);
    }
    assert_eq!(last, Some(ClientEvent::Status(Disconnected)));
    assert_eq!(client.state(), Disconnected);
}

#[tokio::test]
async fn receives_server_frames_in_order() {
    let (server, mut server_events) = start_server(&ProtocolConfig::default()).await;
    let client = Client::new(&ProtocolConfig::default()).unwrap();
    let (listener, mut events) = channel_listener();
    client.connect(listener, "127.0.0.1", server.local_addr().port());
    assert_eq!(next(&mut events).await, ClientEvent::Status(Connecting));
    assert_eq!(next(&mut events).await, ClientEvent::Status(Connected));
    let (id, _) = expect_opened(&mut server_events).await;

    server.send(id, "你好".as_bytes()).unwrap();
    server.broadcast(b"all").unwrap();
    assert_eq!(next(&mut events).await, ClientEvent::Data(Bytes::from("你好".as_bytes())));
    assert_eq!(next(&mut events).await, ClientEvent::Data(Bytes::from_static(b"all")));
}

#[tokio::test]
async fn server_close_disconnects_client() {
    let (server, mut server_events) = start_server(&ProtocolConfig::default()).await;
    let client = Client::new(&ProtocolConfig::default()).unwrap();
    let (listener, mut events) = channel_listener();
    client.connect(listener, "127.0.0.1", server.local_addr().port());
    assert_eq!(next(&mut events).await, ClientEvent::Status(Connecting));
    assert_eq!(next(&mut events).await, ClientEvent::Status(Connected));
    let (id, _) = expect_opened(&mut server_events).await;

    assert!(server.close(id));
    assert_eq!(next(&mut events).await, ClientEvent::Status(Disconnected));
    assert!(!client.is_connected());
    client.disconnect();
    assert_quiet(&mut events, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn reconnect_after_disconnect() {
    let (server, _server_events) = start_server(&ProtocolConfig::default()).await;
    let port = server.local_addr().port();
    let client = Client::new(&ProtocolConfig::default()).unwrap();

    let (first, mut first_events) = channel_listener();
    client.connect(first, "127.0.0.1", port);
    assert_eq!(next(&mut first_events).await, ClientEvent::Status(Connecting));
    assert_eq!(next(&mut first_events).await, ClientEvent::Status(Connected));

    let (second, mut second_events) = channel_listener();
    client.connect(second, "127.0.0.1", port);
    assert_eq!(next(&mut first_events).await, ClientEvent::Status(Disconnected));
    assert_eq!(next(&mut second_events).await, ClientEvent::Status(Connecting));
    assert_eq!(next(&mut second_events).await, ClientEvent::Status(Connected));
    assert!(client.is_connected());
}

#[tokio::test]
async fn heartbeats_flow_while_connected_and_stop_when_suspended() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let client = Client::new(&fast_protocol()).unwrap();
    let (events_listener, mut events) = channel_listener();
    client.connect(events_listener, "127.0.0.1", port);
    let (mut sock, _) = listener.accept().await.unwrap();
    assert_eq!(next(&mut events).await, ClientEvent::Status(Connecting));
    assert_eq!(next(&mut events).await, ClientEvent::Status(Connected));

    for _ in 0..2 {
        let payload = tokio::time::timeout(WAIT, read_frame(&mut sock))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, &HEARTBEAT_PAYLOAD[..]);
    }

    client.set_heartbeat_enabled(false);
    // A heartbeat already in flight may still land; drain it, then expect silence.
    let _ = tokio::time::timeout(Duration::from_millis(300), async {
        while read_frame(&mut sock).await.is_some() {}
    })
    .await;
    let silent = tokio::time::timeout(Duration::from_millis(400), read_frame(&mut sock)).await;
    assert!(silent.is_err(), "heartbeat sent while suspended");
}

#[tokio::test]
async fn heartbeats_from_server_are_not_delivered() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let client = Client::new(&ProtocolConfig::default()).unwrap();
    let (events_listener, mut events) = channel_listener();
    client.connect(events_listener, "127.0.0.1", port);
    let (mut sock, _) = listener.accept().await.unwrap();
    assert_eq!(next(&mut events).await, ClientEvent::Status(Connecting));
    assert_eq!(next(&mut events).await, ClientEvent::Status(Connected));

    write_frame(&mut sock, &HEARTBEAT_PAYLOAD).await;
    write_frame(&mut sock, b"x").await;
    assert_eq!(next(&mut events).await, ClientEvent::Data(Bytes::from_static(b"x")));
}

#[tokio::test]
async fn oversized_header_from_server_disconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let protocol = ProtocolConfig {
        max_frame_len: 64,
        ..Default::default()
    };
    let client = Client::new(&protocol).unwrap();
    let (events_listener, mut events) = channel_listener();
    client.connect(events_listener, "127.0.0.1", port);
    let (mut sock, _) = listener.accept().await.unwrap();
    assert_eq!(next(&mut events).await, ClientEvent::Status(Connecting));
    assert_eq!(next(&mut events).await, ClientEvent::Status(Connected));

    sock.write_all(&1_000_000u32.to_le_bytes()).await.unwrap();
    assert_eq!(next(&mut events).await, ClientEvent::Status(Disconnected));
    expect_eof(&mut sock).await;
}
