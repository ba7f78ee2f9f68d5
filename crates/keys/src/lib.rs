//! Identity registry: decides whether an offered public key authorizes a
//! claimed identity.
//!
//! The registry is the authentication boundary of a strand server. The
//! transport performs the handshake and hands the claimed identity plus the
//! offered key to [`KeyRegistry::authorize`]; the registry answers with the
//! [`Principal`] that owns the key, or an [`AuthError`] explaining why the
//! connection must be rejected.

use async_trait::async_trait;
use thiserror::Error;

mod fixed;
mod github;
mod parse;

pub use fixed::FixedKeyRegistry;
pub use github::GithubKeyRegistry;
pub use parse::{parse_authorized_key, PublicKey};

/// The authenticated identity attached to a connection.
///
/// Resolved exactly once, at handshake time; every session opened on the
/// connection carries the same principal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

impl Principal {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// The key source has never heard of the claimed identity. Terminal; a
    /// retry will not help.
    #[error("identity {0} is not known to the key source")]
    UnknownIdentity(String),

    /// The key source answered, but not usefully. Terminal for this attempt;
    /// the caller may try again later.
    #[error("key source unavailable (status {0})")]
    SourceUnavailable(u16),

    /// The key source could not be reached at all.
    #[error("failed to reach key source")]
    Fetch(#[from] reqwest::Error),

    /// The key source answered with a body that contained no parseable key.
    #[error("key source returned an unparseable key list")]
    MalformedResponse,

    /// The identity exists but none of its registered keys match the one
    /// offered.
    #[error("no key registered for {0} matches the offered key")]
    KeyNotRegistered(String),

    /// The offered key is registered, but to someone else.
    #[error("the offered key is registered to a different identity than {claimed}")]
    IdentityMismatch { claimed: String },
}

/// Pluggable authority mapping a claimed identity and offered public key to
/// an authorization decision.
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    /// Authorize `identity` offering `public_key` (the key's wire blob, as
    /// found base64-encoded in authorized-keys text form).
    ///
    /// May block on network I/O; callers must tolerate this.
    async fn authorize(&self, identity: &str, public_key: &[u8]) -> Result<Principal, AuthError>;
}
