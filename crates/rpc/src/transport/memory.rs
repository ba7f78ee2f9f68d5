//! In-process transport over [`tokio::io::duplex`] pipes.
//!
//! No sockets, no serialized handshake: connect and channel-open requests
//! travel over mpsc channels and the verdicts come back over oneshots. The
//! listener still runs every connect through the [`KeyRegistry`], so the
//! authorization path is exercised exactly as it is over TCP.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use strand_keys::{KeyRegistry, Principal};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::transport::{BoxedChannel, ChannelRequest, IncomingConnection, Listener, Transport};
use crate::{Error, Result};

const CONNECT_BACKLOG: usize = 16;
const OPEN_BACKLOG: usize = 16;
const DUPLEX_BUFFER: usize = 64 * 1024;

struct ConnectRequest {
    identity: String,
    public_key: Vec<u8>,
    opens: mpsc::Receiver<OpenRequest>,
    verdict: oneshot::Sender<Result<(), String>>,
}

struct OpenRequest {
    name: String,
    io: DuplexStream,
    verdict: oneshot::Sender<Result<(), String>>,
}

/// Create a connected connector/listener pair sharing the given registry.
#[must_use]
pub fn pair(registry: Arc<dyn KeyRegistry>) -> (MemoryConnector, MemoryListener) {
    let (tx, rx) = mpsc::channel(CONNECT_BACKLOG);

    (
        MemoryConnector { connects: tx },
        MemoryListener {
            connects: rx,
            registry,
        },
    )
}

/// Dial side of an in-process transport. Cloneable; every clone dials the
/// same listener.
#[derive(Clone)]
pub struct MemoryConnector {
    connects: mpsc::Sender<ConnectRequest>,
}

impl fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnector").finish_non_exhaustive()
    }
}

impl MemoryConnector {
    /// Dial the listener, claiming `identity` with the offered key blob.
    /// Resolves once the listener's registry has ruled on the claim.
    pub async fn connect(
        &self,
        identity: impl Into<String>,
        public_key: impl Into<Vec<u8>>,
    ) -> Result<MemoryTransport> {
        let (open_tx, open_rx) = mpsc::channel(OPEN_BACKLOG);
        let (verdict_tx, verdict_rx) = oneshot::channel();

        self.connects
            .send(ConnectRequest {
                identity: identity.into(),
                public_key: public_key.into(),
                opens: open_rx,
                verdict: verdict_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        match verdict_rx.await {
            Ok(Ok(())) => Ok(MemoryTransport {
                opens: Mutex::new(Some(open_tx)),
            }),
            Ok(Err(reason)) => Err(Error::Handshake(reason)),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }
}

/// An accepted in-process connection, from the dialing side.
pub struct MemoryTransport {
    opens: Mutex<Option<mpsc::Sender<OpenRequest>>>,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_channel(&self, name: &str) -> Result<BoxedChannel> {
        let opens = self
            .opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(opens) = opens else {
            return Err(Error::ConnectionClosed);
        };

        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
        let (verdict_tx, verdict_rx) = oneshot::channel();

        opens
            .send(OpenRequest {
                name: name.to_owned(),
                io: remote,
                verdict: verdict_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        match verdict_rx.await {
            Ok(Ok(())) => Ok(Box::new(local)),
            Ok(Err(reason)) => Err(Error::Rejected {
                name: name.to_owned(),
                reason,
            }),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    fn close(&self) {
        // Dropping the sender ends the peer's channel-request stream.
        drop(
            self.opens
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        // A transport dropped without close() still ends the peer's
        // channel-request stream.
        self.close();
    }
}

/// Accept side of an in-process transport.
pub struct MemoryListener {
    connects: mpsc::Receiver<ConnectRequest>,
    registry: Arc<dyn KeyRegistry>,
}

impl fmt::Debug for MemoryListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryListener").finish_non_exhaustive()
    }
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<Option<Box<dyn IncomingConnection>>> {
        while let Some(request) = self.connects.recv().await {
            match self
                .registry
                .authorize(&request.identity, &request.public_key)
                .await
            {
                Ok(principal) => {
                    info!(principal = %principal.name, "accepted connection");
                    let _ignored = request.verdict.send(Ok(()));

                    return Ok(Some(Box::new(MemoryConnection {
                        principal,
                        opens: request.opens,
                    })));
                }
                Err(err) => {
                    warn!(identity = %request.identity, %err, "rejecting connection");
                    let _ignored = request.verdict.send(Err(err.to_string()));
                }
            }
        }

        Ok(None)
    }
}

struct MemoryConnection {
    principal: Principal,
    opens: mpsc::Receiver<OpenRequest>,
}

#[async_trait]
impl IncomingConnection for MemoryConnection {
    fn principal(&self) -> &Principal {
        &self.principal
    }

    async fn next_channel(&mut self) -> Result<Option<Box<dyn ChannelRequest>>> {
        Ok(self
            .opens
            .recv()
            .await
            .map(|open| Box::new(MemoryChannelRequest { open }) as Box<dyn ChannelRequest>))
    }
}

struct MemoryChannelRequest {
    open: OpenRequest,
}

#[async_trait]
impl ChannelRequest for MemoryChannelRequest {
    fn name(&self) -> &str {
        &self.open.name
    }

    async fn accept(self: Box<Self>) -> Result<BoxedChannel> {
        let _ignored = self.open.verdict.send(Ok(()));
        Ok(Box::new(self.open.io))
    }

    async fn reject(self: Box<Self>, reason: &str) {
        let _ignored = self.open.verdict.send(Err(reason.to_owned()));
    }
}
