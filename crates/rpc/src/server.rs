//! Server-side session management.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::session::StreamingSession;
use crate::transport::{IncomingConnection, Listener};
use crate::Result;

/// Application logic for one named session.
///
/// Invoked once per accepted session, on its own task. The session is
/// closed when the handler returns, so a handler that wants the
/// conversation to continue must keep running.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    async fn handle(&self, session: StreamingSession);
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> SessionHandler for FnHandler<F>
where
    F: Fn(StreamingSession) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, session: StreamingSession) {
        (self.0)(session).await;
    }
}

/// Adapt an async closure into a [`SessionHandler`].
pub fn handler_fn<F, Fut>(f: F) -> impl SessionHandler + 'static
where
    F: Fn(StreamingSession) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnHandler(f)
}

type HandlerMap = Arc<RwLock<HashMap<String, Arc<dyn SessionHandler>>>>;

/// Accepts authenticated connections and dispatches their sessions to the
/// registered handlers by name.
///
/// [`close`](Self::close) stops the accept loop only: connections already
/// accepted keep running until their peers are done with them.
pub struct Server {
    handlers: HandlerMap,
    cancel: CancellationToken,
    send_queue: usize,
    recv_queue: usize,
}

impl Server {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            cancel: CancellationToken::new(),
            send_queue: 0,
            recv_queue: 0,
        }
    }

    /// Bound the per-session packet queues. The default is the tightest
    /// bound available.
    #[must_use]
    pub fn with_queue_sizes(mut self, send_queue: usize, recv_queue: usize) -> Self {
        self.send_queue = send_queue;
        self.recv_queue = recv_queue;
        self
    }

    /// Register `handler` for sessions named `name`, replacing any previous
    /// registration. Takes effect for sessions opened from now on.
    pub fn register_handler(&self, name: impl Into<String>, handler: impl SessionHandler + 'static) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let _ignored = handlers.insert(name.into(), Arc::new(handler));
    }

    /// Drain the listener, serving each connection on its own task, until
    /// the listener is exhausted, it fails, or [`close`](Self::close) is
    /// called.
    pub async fn serve<L: Listener>(&self, mut listener: L) -> Result<()> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("server closed, no longer accepting");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted? {
                    Some(connection) => {
                        drop(tokio::spawn(serve_connection(
                            Arc::clone(&self.handlers),
                            connection,
                            self.send_queue,
                            self.recv_queue,
                        )));
                    }
                    None => return Ok(()),
                }
            }
        }
    }

    /// Stop accepting. Idempotent; in-flight connections are unaffected.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("send_queue", &self.send_queue)
            .field("recv_queue", &self.recv_queue)
            .finish_non_exhaustive()
    }
}

async fn serve_connection(
    handlers: HandlerMap,
    mut connection: Box<dyn IncomingConnection>,
    send_queue: usize,
    recv_queue: usize,
) {
    let principal = connection.principal().clone();

    // Scoped to this connection: when the peer goes away, every session it
    // opened is wound down through this token.
    let cancel = CancellationToken::new();

    loop {
        let request = match connection.next_channel().await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                error!(principal = %principal.name, %err, "failed to receive session request");
                break;
            }
        };

        let name = request.name().to_owned();

        let handler = {
            let handlers = handlers.read().unwrap_or_else(PoisonError::into_inner);
            handlers.get(&name).cloned()
        };

        let Some(handler) = handler else {
            warn!(principal = %principal.name, session = %name, "no handler for session");
            request.reject("unknown session name").await;
            continue;
        };

        let channel = match request.accept().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(session = %name, %err, "failed to accept session");
                continue;
            }
        };

        let session = StreamingSession::spawn(
            name.clone(),
            Some(principal.clone()),
            channel,
            send_queue,
            recv_queue,
            cancel.child_token(),
        );

        info!(principal = %principal.name, session = %name, "session opened");

        let handler_session = session.clone();
        drop(tokio::spawn(async move {
            handler.handle(handler_session).await;
            session.close();
        }));
    }

    debug!(principal = %principal.name, "connection closed");
    cancel.cancel();
}
