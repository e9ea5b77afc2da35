//! `Client` over a real TCP socket.
//!
//! A blocking broker stand-in runs on a std thread, reads what the client
//! writes and answers with canned frames.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use stomp_relay::{
    Client, ClientEvent, ConnError, ConnectOptions, ConnectionState, EventReceiver, Heartbeat,
    TcpConnector,
};

/// Helper to find an available port
fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn options() -> ConnectOptions {
    ConnectOptions::default()
        .login("user", "pass")
        .heartbeat(Heartbeat::disabled())
        .connect_timeout(Duration::from_secs(5))
        .reconnect(false)
}

/// Read one frame (up to and including its NUL), skipping heartbeats.
fn read_frame(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).expect("client closed mid-frame");
        match byte[0] {
            0 if out.is_empty() => continue,
            b'\n' if out.is_empty() => continue,
            0 => return String::from_utf8(out).expect("client wrote invalid utf-8"),
            b => out.push(b),
        }
    }
}

async fn next_event(events: &mut EventReceiver) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

// ============================================================================
// Handshake failures
// ============================================================================

#[tokio::test]
async fn error_frame_during_connect_is_reported() {
    let port = get_available_port();
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let connect = read_frame(&mut stream);
        assert!(connect.starts_with("CONNECT\n"));
        assert!(connect.contains("\nlogin:user\n"));
        assert!(connect.contains("\npasscode:pass\n"));

        let error_frame = "ERROR\nmessage:Authentication failed\n\nInvalid credentials\0";
        stream.write_all(error_frame.as_bytes()).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let (client, mut events) = Client::new(TcpConnector::new(addr), options());
    client.activate().await;

    match next_event(&mut events).await {
        ClientEvent::Error(ConnError::Server(err)) => {
            assert_eq!(err.message, "Authentication failed");
            assert_eq!(err.body, Some("Invalid credentials".to_string()));
        }
        other => panic!("expected server error, got {:?}", other),
    }
    client.wait_for_state(ConnectionState::Disconnected).await;

    server.join().unwrap();
}

#[tokio::test]
async fn close_before_connected_is_reported() {
    let port = get_available_port();
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_frame(&mut stream);
        drop(stream);
    });

    let (client, mut events) = Client::new(TcpConnector::new(addr), options());
    client.activate().await;

    match next_event(&mut events).await {
        ClientEvent::TransportClosed(info) => assert!(info.code.is_none()),
        // a reset instead of an orderly shutdown is also acceptable
        ClientEvent::TransportError(_) => {}
        other => panic!("expected transport closure, got {:?}", other),
    }

    server.join().unwrap();
}

#[tokio::test]
async fn connection_refused_is_a_transport_error() {
    let port = get_available_port();
    let addr = format!("127.0.0.1:{}", port);

    let (client, mut events) = Client::new(TcpConnector::new(addr.clone()), options());
    client.activate().await;

    match next_event(&mut events).await {
        ClientEvent::TransportError(reason) => assert!(reason.contains(&addr), "{}", reason),
        other => panic!("expected transport error, got {:?}", other),
    }
    client.wait_for_state(ConnectionState::Disconnected).await;
}

// ============================================================================
// Full session
// ============================================================================

#[tokio::test]
async fn connect_publish_and_disconnect() {
    let port = get_available_port();
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let connect = read_frame(&mut stream);
        assert!(connect.contains("\naccept-version:1.2,1.1,1.0\n"));
        stream
            .write_all(b"CONNECTED\nversion:1.2\nheart-beat:0,0\n\n\0")
            .unwrap();

        let send = read_frame(&mut stream);
        assert_eq!(
            send,
            "SEND\ndestination:/queue/tcp\ncontent-length:5\n\nhello"
        );

        let disconnect = read_frame(&mut stream);
        assert!(disconnect.starts_with("DISCONNECT\n"));
        let receipt = disconnect
            .lines()
            .find_map(|l| l.strip_prefix("receipt:"))
            .expect("DISCONNECT without receipt")
            .to_string();
        let reply = format!("RECEIPT\nreceipt-id:{}\n\n\0", receipt);
        stream.write_all(reply.as_bytes()).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let (client, mut events) = Client::new(TcpConnector::new(addr), options());
    client.activate().await;
    match next_event(&mut events).await {
        ClientEvent::Connected(info) => assert_eq!(info.version, stomp_relay::Version::V1_2),
        other => panic!("expected Connected, got {:?}", other),
    }

    client
        .publish(stomp_relay::Publish::new("/queue/tcp").text("hello"))
        .await
        .unwrap();
    client.deactivate().await;

    assert!(matches!(next_event(&mut events).await, ClientEvent::Disconnected));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    server.join().unwrap();
}
