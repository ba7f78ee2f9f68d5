use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A live session with this name already exists on the connection.
    /// Close it (or let it finish) before reopening.
    #[error("session {0} is already open")]
    DuplicateSession(String),

    /// The peer refused to open the session, typically because no handler
    /// is registered under that name.
    #[error("session {name} rejected by peer: {reason}")]
    Rejected { name: String, reason: String },

    /// The session has been closed, locally or by the peer.
    #[error("session is closed")]
    SessionClosed,

    /// The underlying connection is gone; no further sessions can be
    /// opened and in-flight operations will not complete.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The peer rejected the connection itself during the handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Wire(#[from] strand_wire::CodecError),

    #[error("transport i/o failure")]
    Io(#[from] std::io::Error),
}
