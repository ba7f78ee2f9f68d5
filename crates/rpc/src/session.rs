//! Session handles: the API surface an application talks to.
//!
//! A [`StreamingSession`] fronts a channel pumped by the engine in
//! `crate::engine`; a [`UnarySession`] skips the engine entirely and does
//! its request/response exchange directly on the channel. Both are cheap to
//! clone and safe to share across tasks.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use strand_wire::{read_packet, write_packet, Packet};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::engine;
use crate::transport::BoxedChannel;
use crate::{Error, Result};

/// A long-lived, bidirectional packet stream.
///
/// Sends and receives move through bounded queues, so a slow reader
/// backpressures the writer instead of buffering without limit. Closing is
/// idempotent and takes effect immediately: packets still in the queues are
/// dropped, not delivered.
#[derive(Clone)]
pub struct StreamingSession {
    inner: Arc<StreamingInner>,
}

struct StreamingInner {
    name: String,
    principal: Option<strand_keys::Principal>,
    outbound: Mutex<Option<mpsc::Sender<Packet>>>,
    inbound: AsyncMutex<mpsc::Receiver<Packet>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    failure: engine::FailureSlot,
}

impl StreamingInner {
    /// The verdict for a stream that stopped: the engine's latched error if
    /// one was recorded and the session was not closed locally, otherwise a
    /// clean end of stream. The error is handed out once.
    fn ended(&self) -> Result<Option<Packet>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }

        match self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}

impl StreamingSession {
    pub(crate) fn spawn(
        name: String,
        principal: Option<strand_keys::Principal>,
        channel: BoxedChannel,
        send_queue: usize,
        recv_queue: usize,
        cancel: CancellationToken,
    ) -> Self {
        // A capacity of zero asks for the tightest hand-off there is.
        let (outbound_tx, outbound_rx) = mpsc::channel(send_queue.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(recv_queue.max(1));

        let failure = engine::FailureSlot::default();

        engine::spawn(
            name.clone(),
            channel,
            outbound_rx,
            inbound_tx,
            cancel.clone(),
            Arc::clone(&failure),
        );

        Self {
            inner: Arc::new(StreamingInner {
                name,
                principal,
                outbound: Mutex::new(Some(outbound_tx)),
                inbound: AsyncMutex::new(inbound_rx),
                closed: AtomicBool::new(false),
                cancel,
                failure,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The peer's authenticated identity. `None` on the dialing side, where
    /// the peer is whoever was dialed.
    #[must_use]
    pub fn principal(&self) -> Option<&strand_keys::Principal> {
        self.inner.principal.as_ref()
    }

    /// Queue a packet for the peer. Blocks while the send queue is full.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        let sender = self
            .inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(sender) = sender else {
            return Err(Error::SessionClosed);
        };

        sender.send(packet).await.map_err(|_| Error::SessionClosed)
    }

    /// The next packet from the peer. `Ok(None)` marks a clean end of
    /// stream (the peer finished sending, or the session was closed); it is
    /// never conflated with an error. A session torn down by a stream
    /// failure instead surfaces that failure from the first `recv` to
    /// observe it, then reads as ended.
    ///
    /// Receiving is single-consumer: concurrent calls on clones of the same
    /// session queue up behind one another.
    pub async fn recv(&self) -> Result<Option<Packet>> {
        let mut inbound = self.inner.inbound.lock().await;

        tokio::select! {
            // Checked first so a buffered packet is never delivered after
            // close.
            biased;

            () = self.inner.cancel.cancelled() => self.inner.ended(),
            packet = inbound.recv() => match packet {
                Some(packet) => Ok(Some(packet)),
                None => self.inner.ended(),
            },
        }
    }

    /// [`send`](Self::send), marshalling the value as a JSON payload.
    pub async fn send_msg<T: Serialize>(&self, value: &T) -> Result<()> {
        self.send(Packet::from_msg(value)?).await
    }

    /// [`recv`](Self::recv), unmarshalling the payload as JSON.
    pub async fn recv_msg<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.recv().await? {
            Some(packet) => Ok(Some(packet.to_msg()?)),
            None => Ok(None),
        }
    }

    /// Close the session. Idempotent; the first call wins and the rest are
    /// no-ops. In-flight packets on either queue are dropped.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        drop(
            self.inner
                .outbound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        self.inner.cancel.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingSession")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// A request/response session: one packet out, one packet back, repeat.
///
/// Calls are serialized; a second call issued while one is in flight waits
/// its turn. There is no engine and no queue, the exchange happens directly
/// on the channel.
#[derive(Clone)]
pub struct UnarySession {
    inner: Arc<UnaryInner>,
}

struct UnaryInner {
    name: String,
    io: AsyncMutex<Option<BoxedChannel>>,
    closed: AtomicBool,
}

impl UnarySession {
    pub(crate) fn new(name: String, channel: BoxedChannel) -> Self {
        Self {
            inner: Arc::new(UnaryInner {
                name,
                io: AsyncMutex::new(Some(channel)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Send a request and block until the peer's response arrives. A peer
    /// that ends the channel without responding is [`Error::SessionClosed`].
    pub async fn call(&self, request: Packet) -> Result<Packet> {
        let mut io = self.inner.io.lock().await;

        let Some(channel) = io.as_mut() else {
            return Err(Error::SessionClosed);
        };

        write_packet(channel, &request).await?;

        match read_packet(channel).await? {
            Some(response) => Ok(response),
            None => Err(Error::SessionClosed),
        }
    }

    /// [`call`](Self::call) with JSON request and response payloads.
    pub async fn call_msg<Req, Res>(&self, request: &Req) -> Result<Res>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let response = self.call(Packet::from_msg(request)?).await?;
        Ok(response.to_msg()?)
    }

    /// Close the session. Idempotent. Waits for an in-flight call to
    /// finish before releasing the channel.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        drop(self.inner.io.lock().await.take());
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for UnarySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnarySession")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
