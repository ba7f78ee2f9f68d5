use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use strand_keys::FixedKeyRegistry;
use strand_rpc::transport::memory::{self, MemoryConnector};
use strand_rpc::transport::BoxedChannel;
use strand_rpc::{handler_fn, Client, Error, Packet, Server, Transport};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

fn alice_key() -> Vec<u8> {
    b"blob-alice".to_vec()
}

/// Echoes every packet back; a `ping` gets two `pong`s instead.
fn echo_server() -> Arc<Server> {
    let server = Arc::new(Server::new());

    server.register_handler(
        "echo",
        handler_fn(|session| async move {
            while let Ok(Some(packet)) = session.recv().await {
                if packet.data == b"ping" {
                    let _ignored = session.send(Packet::new(b"pong".to_vec())).await;
                    let _ignored = session.send(Packet::new(b"pong".to_vec())).await;
                } else {
                    let _ignored = session.send(packet).await;
                }
            }
        }),
    );

    server.register_handler("empty", handler_fn(|_session| async move {}));

    server
}

/// Serve `server` over an in-process transport that knows alice's key.
fn start(server: Arc<Server>) -> MemoryConnector {
    let registry = Arc::new(FixedKeyRegistry::new().with_key("alice", alice_key()));
    let (connector, listener) = memory::pair(registry);

    drop(tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    }));

    connector
}

async fn connect(connector: &MemoryConnector) -> Client {
    let transport = connector.connect("alice", alice_key()).await.unwrap();
    Client::new(Box::new(transport))
}

#[tokio::test]
async fn ping_gets_two_pongs() {
    let connector = start(echo_server());
    let client = connect(&connector).await;

    let session = client.open_streaming("echo", 0, 0).await.unwrap();

    session.send(Packet::new(b"ping".to_vec())).await.unwrap();

    assert_eq!(session.recv().await.unwrap().unwrap().data, b"pong");
    assert_eq!(session.recv().await.unwrap().unwrap().data, b"pong");

    client.close().await;
}

#[tokio::test]
async fn unknown_session_is_rejected() {
    let connector = start(echo_server());
    let client = connect(&connector).await;

    let err = client.open_streaming("nope", 0, 0).await.unwrap_err();
    assert!(matches!(err, Error::Rejected { name, .. } if name == "nope"));

    // The rejection must not have burned the connection.
    let session = client.open_streaming("echo", 0, 0).await.unwrap();
    session.send(Packet::new(b"hi".to_vec())).await.unwrap();
    assert_eq!(session.recv().await.unwrap().unwrap().data, b"hi");

    client.close().await;
}

#[tokio::test]
async fn live_session_names_are_unique() {
    let connector = start(echo_server());
    let client = connect(&connector).await;

    let session = client.open_streaming("echo", 0, 0).await.unwrap();

    let err = client.open_streaming("echo", 0, 0).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateSession(name) if name == "echo"));

    // Closing frees the name for reuse.
    session.close();
    let reopened = client.open_streaming("echo", 0, 0).await.unwrap();

    reopened.send(Packet::new(b"again".to_vec())).await.unwrap();
    assert_eq!(reopened.recv().await.unwrap().unwrap().data, b"again");

    client.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_immediate() {
    let connector = start(echo_server());
    let client = connect(&connector).await;

    let session = client.open_streaming("echo", 0, 0).await.unwrap();

    session.close();
    session.close();
    assert!(session.is_closed());

    let err = session.send(Packet::new(b"late".to_vec())).await.unwrap_err();
    assert!(matches!(err, Error::SessionClosed));

    // Receiving after close is a clean end of stream, not an error.
    assert!(session.recv().await.unwrap().is_none());

    client.close().await;
    client.close().await;
}

#[tokio::test]
async fn packets_from_one_sender_arrive_in_order() {
    let connector = start(echo_server());
    let client = connect(&connector).await;

    let session = client.open_streaming("echo", 0, 0).await.unwrap();

    for label in ["a", "b", "c", "d"] {
        session
            .send(Packet::new(label.as_bytes().to_vec()))
            .await
            .unwrap();
    }

    for label in ["a", "b", "c", "d"] {
        assert_eq!(session.recv().await.unwrap().unwrap().data, label.as_bytes());
    }

    client.close().await;
}

#[tokio::test]
async fn concurrent_senders_each_deliver_exactly_once() {
    let connector = start(echo_server());
    let client = connect(&connector).await;

    let session = client.open_streaming("echo", 0, 0).await.unwrap();

    let count = 16_u32;
    for i in 0..count {
        let sender = session.clone();
        drop(tokio::spawn(async move {
            sender
                .send(Packet::new(format!("packet-{i}").into_bytes()))
                .await
                .unwrap();
        }));
    }

    let mut seen = BTreeSet::new();
    for _ in 0..count {
        let packet = session.recv().await.unwrap().unwrap();
        assert!(seen.insert(packet.data), "duplicate delivery");
    }

    let expected: BTreeSet<_> = (0..count)
        .map(|i| format!("packet-{i}").into_bytes())
        .collect();
    assert_eq!(seen, expected);

    client.close().await;
}

#[tokio::test]
async fn peer_finishing_is_a_clean_end_of_stream() {
    let connector = start(echo_server());
    let client = connect(&connector).await;

    // The `empty` handler returns immediately, closing its end.
    let session = client.open_streaming("empty", 0, 0).await.unwrap();

    assert!(session.recv().await.unwrap().is_none());

    client.close().await;
}

#[tokio::test]
async fn unary_call_round_trips() {
    let connector = start(echo_server());
    let client = connect(&connector).await;

    let session = client.open_unary("echo").await.unwrap();

    let response = session.call(Packet::new(b"marco".to_vec())).await.unwrap();
    assert_eq!(response.data, b"marco");

    let response = session.call(Packet::new(b"polo".to_vec())).await.unwrap();
    assert_eq!(response.data, b"polo");

    session.close().await;
    let err = session.call(Packet::new(b"late".to_vec())).await.unwrap_err();
    assert!(matches!(err, Error::SessionClosed));

    client.close().await;
}

#[tokio::test]
async fn typed_messages_round_trip() {
    #[derive(serde::Serialize, serde::Deserialize)]
    struct Note {
        body: String,
        urgent: bool,
    }

    let connector = start(echo_server());
    let client = connect(&connector).await;

    let session = client.open_streaming("echo", 0, 0).await.unwrap();

    session
        .send_msg(&Note {
            body: "hello".to_owned(),
            urgent: true,
        })
        .await
        .unwrap();

    let note: Note = session.recv_msg().await.unwrap().unwrap();
    assert_eq!(note.body, "hello");
    assert!(note.urgent);

    client.close().await;
}

#[tokio::test]
async fn unauthorized_identity_cannot_connect() {
    let connector = start(echo_server());

    // mallory offers alice's key under her own name.
    let err = connector.connect("mallory", alice_key()).await.unwrap_err();
    assert!(matches!(err, Error::Handshake(_)));

    // alice herself still gets in afterwards.
    let client = connect(&connector).await;
    client.close().await;
}

#[tokio::test]
async fn dropping_a_client_tears_the_connection_down() {
    let server = Arc::new(Server::new());
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

    let connector = start(server);
    let client = connect(&connector).await;

    let session = client.open_streaming("watch", 0, 0).await.unwrap();

    // No close(): dropping the client alone must end the connection. The
    // session handle stays alive so the teardown cannot be mistaken for a
    // session-level close.
    drop(client);

    tokio::time::timeout(Duration::from_secs(5), ended_rx.recv())
        .await
        .expect("handler never saw the connection end")
        .unwrap();

    drop(session);
}

/// Transport handing out a single prearranged pipe, so a test can play the
/// peer's side of the stream directly.
struct PipeTransport {
    io: Mutex<Option<DuplexStream>>,
}

#[async_trait]
impl Transport for PipeTransport {
    async fn open_channel(&self, _name: &str) -> strand_rpc::Result<BoxedChannel> {
        let io = self.io.lock().unwrap().take().expect("single channel");
        Ok(Box::new(io))
    }

    fn close(&self) {}
}

#[tokio::test]
async fn stream_failure_surfaces_through_recv() {
    let (local, mut remote) = tokio::io::duplex(1024);

    let client = Client::new(Box::new(PipeTransport {
        io: Mutex::new(Some(local)),
    }));
    let session = client.open_streaming("raw", 0, 0).await.unwrap();

    // A frame promising more payload than ever arrives, then the pipe ends.
    remote.write_all(&8_u32.to_be_bytes()).await.unwrap();
    remote.write_all(b"abc").await.unwrap();
    drop(remote);

    let err = session.recv().await.unwrap_err();
    assert!(matches!(err, Error::Wire(_)));

    // The failure is reported once; afterwards the stream reads as ended.
    assert!(session.recv().await.unwrap().is_none());

    client.close().await;
}

#[tokio::test]
async fn closed_server_stops_accepting() {
    let server = echo_server();
    let connector = start(Arc::clone(&server));

    let client = connect(&connector).await;

    server.close();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = connector.connect("alice", alice_key()).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));

    // The connection accepted before the close keeps working.
    let session = client.open_streaming("echo", 0, 0).await.unwrap();
    session.send(Packet::new(b"still here".to_vec())).await.unwrap();
    assert_eq!(session.recv().await.unwrap().unwrap().data, b"still here");

    client.close().await;
}
