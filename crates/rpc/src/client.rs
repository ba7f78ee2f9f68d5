//! Client-side session management.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::{StreamingSession, UnarySession};
use crate::transport::tcp::TcpTransport;
use crate::transport::Transport;
use crate::{Error, Result};

enum SessionEntry {
    /// Name reserved while the open is in flight; holds the slot without
    /// holding the lock across transport I/O.
    Pending,
    Streaming(StreamingSession),
    Unary(UnarySession),
}

impl SessionEntry {
    fn is_live(&self) -> bool {
        match self {
            Self::Pending => true,
            Self::Streaming(session) => !session.is_closed(),
            Self::Unary(session) => !session.is_closed(),
        }
    }
}

/// One authenticated connection to a server, multiplexing named sessions.
///
/// Session names are unique among live sessions: opening a name that is
/// already open (or still opening) is [`Error::DuplicateSession`], while a
/// name whose previous session has been closed is free for reuse.
pub struct Client {
    transport: Box<dyn Transport>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Client {
    #[must_use]
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            sessions: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Dial a TCP server at `addr` and authenticate as `identity` with
    /// `public_key` (one line of authorized-keys text).
    pub async fn connect(addr: &str, identity: &str, public_key: &str) -> Result<Self> {
        let transport = TcpTransport::connect(addr, identity, public_key).await?;
        Ok(Self::new(Box::new(transport)))
    }

    /// Open a streaming session under `name`.
    ///
    /// `send_queue` and `recv_queue` bound the number of packets buffered in
    /// each direction; zero is treated as the tightest bound available.
    pub async fn open_streaming(
        &self,
        name: &str,
        send_queue: usize,
        recv_queue: usize,
    ) -> Result<StreamingSession> {
        self.reserve(name)?;

        match self.transport.open_channel(name).await {
            Ok(channel) => {
                let session = StreamingSession::spawn(
                    name.to_owned(),
                    None,
                    channel,
                    send_queue,
                    recv_queue,
                    self.cancel.child_token(),
                );

                self.install(name, SessionEntry::Streaming(session.clone()));
                debug!(session = %name, "opened streaming session");

                Ok(session)
            }
            Err(err) => {
                self.release(name);
                Err(err)
            }
        }
    }

    /// Open a request/response session under `name`.
    pub async fn open_unary(&self, name: &str) -> Result<UnarySession> {
        self.reserve(name)?;

        match self.transport.open_channel(name).await {
            Ok(channel) => {
                let session = UnarySession::new(name.to_owned(), channel);

                self.install(name, SessionEntry::Unary(session.clone()));
                debug!(session = %name, "opened unary session");

                Ok(session)
            }
            Err(err) => {
                self.release(name);
                Err(err)
            }
        }
    }

    /// Close every session and tear down the transport. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let entries: Vec<_> = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            sessions.drain().map(|(_, entry)| entry).collect()
        };

        for entry in entries {
            match entry {
                SessionEntry::Pending => {}
                SessionEntry::Streaming(session) => session.close(),
                SessionEntry::Unary(session) => session.close().await,
            }
        }

        self.cancel.cancel();
        self.transport.close();
    }

    fn reserve(&self, name: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }

        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);

        match sessions.entry(name.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live() {
                    return Err(Error::DuplicateSession(name.to_owned()));
                }
                let _ignored = occupied.insert(SessionEntry::Pending);
                Ok(())
            }
            Entry::Vacant(vacant) => {
                let _ = vacant.insert(SessionEntry::Pending);
                Ok(())
            }
        }
    }

    fn install(&self, name: &str, entry: SessionEntry) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let _ignored = sessions.insert(name.to_owned(), entry);
    }

    fn release(&self, name: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let _ignored = sessions.remove(name);
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
