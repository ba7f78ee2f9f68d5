use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use strand_keys::{parse_authorized_key, FixedKeyRegistry};
use strand_rpc::transport::tcp::{TcpAcceptor, TcpTransport};
use strand_rpc::{handler_fn, Client, Error, Packet, Server};
use tokio::sync::mpsc;

/// An ed25519-shaped authorized-keys line and its wire blob.
fn key_material(seed: u8) -> (String, Vec<u8>) {
    let algorithm = "ssh-ed25519";
    let mut blob = Vec::new();
    blob.extend_from_slice(&u32::try_from(algorithm.len()).unwrap().to_be_bytes());
    blob.extend_from_slice(algorithm.as_bytes());
    blob.extend_from_slice(&32_u32.to_be_bytes());
    blob.extend_from_slice(&[seed; 32]);

    (format!("{algorithm} {}", BASE64.encode(&blob)), blob)
}

async fn start_echo_server() -> String {
    let (_, alice_blob) = key_material(1);
    let registry = Arc::new(FixedKeyRegistry::new().with_key("alice", alice_blob));

    let acceptor = TcpAcceptor::bind("127.0.0.1:0", registry).await.unwrap();
    let addr = acceptor.local_addr().unwrap();

    let server = Server::new();
    server.register_handler(
        "echo",
        handler_fn(|session| async move {
            while let Ok(Some(packet)) = session.recv().await {
                let _ignored = session.send(packet).await;
            }
        }),
    );

    drop(tokio::spawn(async move {
        server.serve(acceptor).await.unwrap();
    }));

    addr.to_string()
}

#[tokio::test]
async fn streaming_echo_over_tcp() {
    let addr = start_echo_server().await;
    let (alice_line, _) = key_material(1);

    let transport = TcpTransport::connect(&addr, "alice", &alice_line)
        .await
        .unwrap();
    let client = Client::new(Box::new(transport));

    let session = client.open_streaming("echo", 0, 0).await.unwrap();

    session.send(Packet::new(b"over the wire".to_vec())).await.unwrap();
    assert_eq!(
        session.recv().await.unwrap().unwrap().data,
        b"over the wire"
    );

    client.close().await;
}

#[tokio::test]
async fn unary_echo_over_tcp() {
    let addr = start_echo_server().await;
    let (alice_line, _) = key_material(1);

    let transport = TcpTransport::connect(&addr, "alice", &alice_line)
        .await
        .unwrap();
    let client = Client::new(Box::new(transport));

    let session = client.open_unary("echo").await.unwrap();
    let response = session.call(Packet::new(b"marco".to_vec())).await.unwrap();
    assert_eq!(response.data, b"marco");

    client.close().await;
}

#[tokio::test]
async fn unknown_session_is_rejected_over_tcp() {
    let addr = start_echo_server().await;
    let (alice_line, _) = key_material(1);

    let transport = TcpTransport::connect(&addr, "alice", &alice_line)
        .await
        .unwrap();
    let client = Client::new(Box::new(transport));

    let err = client.open_streaming("nope", 0, 0).await.unwrap_err();
    assert!(matches!(err, Error::Rejected { name, .. } if name == "nope"));

    client.close().await;
}

#[tokio::test]
async fn wrong_identity_is_turned_away() {
    let addr = start_echo_server().await;
    let (alice_line, _) = key_material(1);

    // bob offering alice's key is a mismatch, not a new registration. The
    // server's verdict must survive its side tearing the connection down:
    // the client reads the reason, not a dead socket.
    let err = TcpTransport::connect(&addr, "bob", &alice_line)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Handshake(reason) if reason.contains("different identity")));
}

#[tokio::test]
async fn unparseable_key_is_turned_away() {
    let addr = start_echo_server().await;

    let err = TcpTransport::connect(&addr, "alice", "not a key at all")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Handshake(reason) if reason.contains("unparseable")));
}

#[tokio::test]
async fn dropping_the_transport_ends_the_connection() {
    let (_, alice_blob) = key_material(1);
    let registry = Arc::new(FixedKeyRegistry::new().with_key("alice", alice_blob));

    let acceptor = TcpAcceptor::bind("127.0.0.1:0", registry).await.unwrap();
    let addr = acceptor.local_addr().unwrap().to_string();

    let server = Server::new();
    let (ended_tx, mut ended_rx) = mpsc::channel(1);
    server.register_handler(
        "watch",
        handler_fn(move |session| {
            let ended = ended_tx.clone();
            async move {
                while let Ok(Some(_)) = session.recv().await {}
                let _ignored = ended.send(()).await;
            }
        }),
    );

    drop(tokio::spawn(async move {
        server.serve(acceptor).await.unwrap();
    }));

    let (alice_line, _) = key_material(1);
    let transport = TcpTransport::connect(&addr, "alice", &alice_line)
        .await
        .unwrap();
    let client = Client::new(Box::new(transport));

    let session = client.open_streaming("watch", 0, 0).await.unwrap();

    // No close(): dropping the client must stop the driver task and close
    // the connection, and the server must observe the end.
    drop(client);

    tokio::time::timeout(Duration::from_secs(5), ended_rx.recv())
        .await
        .expect("server never saw the connection end")
        .unwrap();

    drop(session);
}

#[test]
fn key_material_is_parseable() {
    let (line, blob) = key_material(1);
    let key = parse_authorized_key(&line).unwrap();
    assert_eq!(key.fingerprint(), blob.as_slice());
}
