//! The seam between session management and the bytes underneath.
//!
//! Session managers never touch sockets directly. A client owns a
//! [`Transport`] and asks it for named channels; a server drains a
//! [`Listener`] for authenticated connections and each connection for
//! channel requests. Everything above this module works the same over an
//! in-process pipe ([`memory`]) and a multiplexed TCP connection ([`tcp`]).

use async_trait::async_trait;
use strand_keys::Principal;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::Result;

pub mod memory;
pub mod tcp;

/// Byte stream backing one channel.
pub trait ChannelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelIo for T {}

pub type BoxedChannel = Box<dyn ChannelIo>;

/// Client side of an established connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ask the peer for a channel dedicated to the named session. Resolves
    /// once the peer has accepted; a refusal is [`Error::Rejected`].
    ///
    /// [`Error::Rejected`]: crate::Error::Rejected
    async fn open_channel(&self, name: &str) -> Result<BoxedChannel>;

    /// Tear the connection down. Idempotent. No further channels can be
    /// opened; whether channels already handed out survive is up to the
    /// transport (TCP drops them with the connection, the in-process pipes
    /// drain independently).
    fn close(&self);
}

/// Server side: a source of authenticated inbound connections.
///
/// Implementations authenticate during `accept`, so a connection that
/// reaches the caller already carries a resolved [`Principal`]. Failed
/// handshakes are logged and swallowed; they never surface here.
#[async_trait]
pub trait Listener: Send {
    /// The next authenticated connection, or `Ok(None)` once the listener
    /// is exhausted.
    async fn accept(&mut self) -> Result<Option<Box<dyn IncomingConnection>>>;
}

/// One authenticated peer, yielding its channel requests in order.
#[async_trait]
pub trait IncomingConnection: Send {
    /// The identity resolved during the handshake.
    fn principal(&self) -> &Principal;

    /// The peer's next request for a named channel, or `Ok(None)` when the
    /// connection is gone.
    async fn next_channel(&mut self) -> Result<Option<Box<dyn ChannelRequest>>>;
}

/// A pending channel request; the server must accept or reject it.
#[async_trait]
pub trait ChannelRequest: Send {
    /// The session name the peer asked for.
    fn name(&self) -> &str;

    async fn accept(self: Box<Self>) -> Result<BoxedChannel>;

    async fn reject(self: Box<Self>, reason: &str);
}
