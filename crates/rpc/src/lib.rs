//! Named sessions multiplexed over an authenticated connection.
//!
//! A [`Client`] opens sessions by name on a [`Transport`]; a [`Server`]
//! accepts them from a [`Listener`] and dispatches each to the
//! [`SessionHandler`] registered under that name. Sessions come in two
//! shapes: [`StreamingSession`] for long-lived bidirectional packet
//! exchange, and [`UnarySession`] for request/response calls.
//!
//! The transports in [`transport`] decide how the bytes move and who the
//! peer is; who the peer is *allowed to be* is the business of the
//! [`KeyRegistry`] implementations in [`strand_keys`].

mod client;
mod engine;
mod error;
mod server;
mod session;
pub mod transport;

pub use client::Client;
pub use error::{Error, Result};
pub use server::{handler_fn, Server, SessionHandler};
pub use session::{StreamingSession, UnarySession};
pub use strand_keys::{KeyRegistry, Principal};
pub use strand_wire::Packet;
pub use transport::{Listener, Transport};
