//! TCP transport: one socket per connection, one yamux stream per channel.
//!
//! The first stream a client opens carries a `hello` frame with its claimed
//! identity and public key; the server answers with a verdict after
//! consulting its [`KeyRegistry`]. Every stream after that opens with an
//! `open` frame naming the session, answered the same way. Frames are
//! length-prefixed JSON, the same framing the sessions themselves use.
//!
//! yamux drives all streams through a single connection object, so each
//! side runs a driver task that owns the connection and polls it; streams
//! are handed out from there.
//!
//! The handshake carries the public key but does not prove possession of
//! the matching private key, and the link is cleartext. On an untrusted
//! network this transport belongs behind a secure channel.

use std::collections::VecDeque;
use std::fmt;
use std::future::{poll_fn, Future};
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strand_keys::{parse_authorized_key, KeyRegistry, Principal};
use strand_wire::{read_packet, write_packet, Packet};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{BoxedChannel, ChannelRequest, IncomingConnection, Listener, Transport};
use crate::{Error, Result};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const OPEN_BACKLOG: usize = 16;

type MuxStream = Compat<yamux::Stream>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlFrame {
    /// First frame on a connection: the client introduces itself. The key
    /// travels in authorized-keys text form.
    Hello { identity: String, public_key: String },
    /// First frame on every later stream: names the session the stream is
    /// for.
    Open { name: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct Verdict {
    ok: bool,
    #[serde(default)]
    reason: String,
}

struct OpenStreamRequest {
    frame: ControlFrame,
    reply: oneshot::Sender<Result<BoxedChannel>>,
}

/// Client side of a TCP connection.
pub struct TcpTransport {
    opens: mpsc::Sender<OpenStreamRequest>,
    cancel: CancellationToken,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport").finish_non_exhaustive()
    }
}

impl TcpTransport {
    /// Dial `addr` and run the handshake, claiming `identity` with
    /// `public_key` (one line of authorized-keys text).
    pub async fn connect(addr: &str, identity: &str, public_key: &str) -> Result<Self> {
        let socket = TcpStream::connect(addr).await?;

        let connection = yamux::Connection::new(
            socket.compat(),
            yamux::Config::default(),
            yamux::Mode::Client,
        );

        let (open_tx, open_rx) = mpsc::channel(OPEN_BACKLOG);
        let cancel = CancellationToken::new();

        drop(tokio::spawn(drive_client(connection, open_rx, cancel.clone())));

        let (reply_tx, reply_rx) = oneshot::channel();

        open_tx
            .send(OpenStreamRequest {
                frame: ControlFrame::Hello {
                    identity: identity.to_owned(),
                    public_key: public_key.to_owned(),
                },
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let hello = timeout(HANDSHAKE_TIMEOUT, reply_rx)
            .await
            .map_err(|_| Error::Handshake("handshake timed out".to_owned()))?
            .map_err(|_| Error::ConnectionClosed)??;

        // The hello stream has served its purpose.
        drop(hello);

        Ok(Self {
            opens: open_tx,
            cancel,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open_channel(&self, name: &str) -> Result<BoxedChannel> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.opens
            .send(OpenStreamRequest {
                frame: ControlFrame::Open {
                    name: name.to_owned(),
                },
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        reply_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        // A transport dropped without close() would otherwise leave the
        // driver task running and the socket open.
        self.cancel.cancel();
    }
}

/// Owns the client's yamux connection: opens streams on request and keeps
/// the connection itself polled. Exits when the connection dies; on
/// cancellation it closes the connection gracefully first, so frames yamux
/// still holds reach the peer instead of vanishing in a reset socket.
async fn drive_client(
    mut connection: yamux::Connection<Compat<TcpStream>>,
    mut open_rx: mpsc::Receiver<OpenStreamRequest>,
    cancel: CancellationToken,
) {
    let mut cancelled = pin!(cancel.cancelled());
    let mut pending: VecDeque<OpenStreamRequest> = VecDeque::new();
    let mut opens_exhausted = false;
    let mut closing = false;

    poll_fn(|cx| {
        if !closing && cancelled.as_mut().poll(cx).is_ready() {
            closing = true;
        }

        if closing {
            return match connection.poll_close(cx) {
                Poll::Ready(result) => {
                    if let Err(err) = result {
                        debug!(%err, "connection close failed");
                    }
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            };
        }

        if !opens_exhausted {
            loop {
                match open_rx.poll_recv(cx) {
                    Poll::Ready(Some(request)) => pending.push_back(request),
                    Poll::Ready(None) => {
                        opens_exhausted = true;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }

        while !pending.is_empty() {
            match connection.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    if let Some(request) = pending.pop_front() {
                        drop(tokio::spawn(negotiate_stream(stream.compat(), request)));
                    }
                }
                Poll::Ready(Err(err)) => {
                    debug!(%err, "connection failed");
                    for request in pending.drain(..) {
                        let _ignored = request
                            .reply
                            .send(Err(Error::Io(std::io::Error::other(err.to_string()))));
                    }
                    return Poll::Ready(());
                }
                Poll::Pending => break,
            }
        }

        // Drives the connection's internals. The server never opens
        // streams toward us, so inbound ones are dropped on sight.
        loop {
            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => drop(stream),
                Poll::Ready(Some(Err(err))) => {
                    debug!(%err, "connection terminated");
                    return Poll::Ready(());
                }
                Poll::Ready(None) => return Poll::Ready(()),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;
}

/// Send the stream's opening frame, await the verdict, and hand the stream
/// back through the request's reply slot.
async fn negotiate_stream(mut channel: MuxStream, request: OpenStreamRequest) {
    let verdict = negotiate(&mut channel, &request.frame).await;

    let reply = verdict.map(|()| Box::new(channel) as BoxedChannel);
    let _ignored = request.reply.send(reply);
}

async fn negotiate<C>(channel: &mut C, frame: &ControlFrame) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    write_packet(channel, &Packet::from_msg(frame)?).await?;

    let Some(packet) = read_packet(channel).await? else {
        return Err(Error::ConnectionClosed);
    };

    let verdict: Verdict = packet.to_msg()?;
    if verdict.ok {
        return Ok(());
    }

    Err(match frame {
        ControlFrame::Hello { .. } => Error::Handshake(verdict.reason),
        ControlFrame::Open { name } => Error::Rejected {
            name: name.clone(),
            reason: verdict.reason,
        },
    })
}

async fn send_verdict<C>(channel: &mut C, ok: bool, reason: &str) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let verdict = Verdict {
        ok,
        reason: reason.to_owned(),
    };

    write_packet(channel, &Packet::from_msg(&verdict)?).await?;

    Ok(())
}

/// Deliver a failure verdict and shut the stream down, pushing the frame
/// through the mux so it is on the wire before the connection is torn down.
async fn refuse<C>(channel: &mut C, reason: &str)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(err) = send_verdict(channel, false, reason).await {
        debug!(%err, "failed to deliver rejection");
        return;
    }

    let _ignored = channel.shutdown().await;
}

/// Server side: accepts sockets and authenticates each one against the
/// registry before surfacing it.
pub struct TcpAcceptor {
    listener: TcpListener,
    registry: Arc<dyn KeyRegistry>,
}

impl fmt::Debug for TcpAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpAcceptor")
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

impl TcpAcceptor {
    pub async fn bind(addr: &str, registry: Arc<dyn KeyRegistry>) -> Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            registry,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&mut self) -> Result<Option<Box<dyn IncomingConnection>>> {
        loop {
            let (socket, remote) = self.listener.accept().await?;

            let connection = yamux::Connection::new(
                socket.compat(),
                yamux::Config::default(),
                yamux::Mode::Server,
            );

            let (stream_tx, mut stream_rx) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();

            drop(tokio::spawn(drive_server(connection, stream_tx, cancel.clone())));

            match timeout(HANDSHAKE_TIMEOUT, authenticate(&*self.registry, &mut stream_rx)).await {
                Ok(Ok(principal)) => {
                    info!(%remote, principal = %principal.name, "accepted connection");

                    return Ok(Some(Box::new(TcpConnection {
                        principal,
                        streams: stream_rx,
                        cancel,
                    })));
                }
                Ok(Err(err)) => {
                    warn!(%remote, %err, "rejecting connection");
                    cancel.cancel();
                }
                Err(_) => {
                    warn!(%remote, "handshake timed out");
                    cancel.cancel();
                }
            }
        }
    }
}

/// Run the hello exchange on a fresh connection's first stream.
async fn authenticate(
    registry: &dyn KeyRegistry,
    streams: &mut mpsc::UnboundedReceiver<MuxStream>,
) -> Result<Principal> {
    let Some(mut control) = streams.recv().await else {
        return Err(Error::ConnectionClosed);
    };

    let Some(packet) = read_packet(&mut control).await? else {
        return Err(Error::ConnectionClosed);
    };

    let frame: ControlFrame = packet.to_msg()?;

    let ControlFrame::Hello {
        identity,
        public_key,
    } = frame
    else {
        refuse(&mut control, "expected hello").await;
        return Err(Error::Handshake("peer did not introduce itself".to_owned()));
    };

    let Some(key) = parse_authorized_key(&public_key) else {
        refuse(&mut control, "unparseable public key").await;
        return Err(Error::Handshake("unparseable public key".to_owned()));
    };

    match registry.authorize(&identity, key.fingerprint()).await {
        Ok(principal) => {
            send_verdict(&mut control, true, "").await?;
            Ok(principal)
        }
        Err(err) => {
            refuse(&mut control, &err.to_string()).await;
            Err(Error::Handshake(err.to_string()))
        }
    }
}

/// Owns a server-side yamux connection, forwarding inbound streams. Exits
/// when the connection dies; on cancellation it closes the connection
/// gracefully, flushing anything yamux still holds (a rejection verdict,
/// in particular) before the socket goes away.
async fn drive_server(
    mut connection: yamux::Connection<Compat<TcpStream>>,
    streams: mpsc::UnboundedSender<MuxStream>,
    cancel: CancellationToken,
) {
    let mut cancelled = pin!(cancel.cancelled());
    let mut closing = false;

    poll_fn(|cx| {
        if !closing && cancelled.as_mut().poll(cx).is_ready() {
            closing = true;
        }

        if closing {
            return match connection.poll_close(cx) {
                Poll::Ready(result) => {
                    if let Err(err) = result {
                        debug!(%err, "connection close failed");
                    }
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            };
        }

        loop {
            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    if streams.send(stream.compat()).is_err() {
                        // Receiver gone: the connection is being torn down.
                        return Poll::Ready(());
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    debug!(%err, "connection terminated");
                    return Poll::Ready(());
                }
                Poll::Ready(None) => return Poll::Ready(()),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;
}

struct TcpConnection {
    principal: Principal,
    streams: mpsc::UnboundedReceiver<MuxStream>,
    cancel: CancellationToken,
}

#[async_trait]
impl IncomingConnection for TcpConnection {
    fn principal(&self) -> &Principal {
        &self.principal
    }

    async fn next_channel(&mut self) -> Result<Option<Box<dyn ChannelRequest>>> {
        loop {
            let Some(mut stream) = self.streams.recv().await else {
                return Ok(None);
            };

            // The stream's opening frame names the session. A stream that
            // opens wrong is dropped; the rest of the connection stands.
            let packet = match read_packet(&mut stream).await {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(err) => {
                    warn!(%err, "malformed session open");
                    continue;
                }
            };

            let frame: ControlFrame = match packet.to_msg() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(%err, "malformed session open");
                    continue;
                }
            };

            let ControlFrame::Open { name } = frame else {
                warn!("unexpected hello after handshake");
                continue;
            };

            return Ok(Some(Box::new(TcpChannelRequest { name, stream })));
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct TcpChannelRequest {
    name: String,
    stream: MuxStream,
}

#[async_trait]
impl ChannelRequest for TcpChannelRequest {
    fn name(&self) -> &str {
        &self.name
    }

    async fn accept(mut self: Box<Self>) -> Result<BoxedChannel> {
        send_verdict(&mut self.stream, true, "").await?;
        Ok(Box::new(self.stream))
    }

    async fn reject(mut self: Box<Self>, reason: &str) {
        if let Err(err) = send_verdict(&mut self.stream, false, reason).await {
            debug!(%err, "failed to deliver rejection");
        }
    }
}
