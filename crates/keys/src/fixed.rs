use std::collections::HashMap;

use async_trait::async_trait;

use crate::{AuthError, KeyRegistry, Principal};

/// Registry with a fixed, in-memory key table.
///
/// Useful for tests and for deployments that distribute keys out of band
/// instead of consulting a remote source. Honors the same contract as the
/// remote-backed registry: a key registered to somebody else is a mismatch,
/// not a miss.
#[derive(Debug, Default)]
pub struct FixedKeyRegistry {
    owners: HashMap<Vec<u8>, String>,
}

impl FixedKeyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `public_key` (a key wire blob) as belonging to `identity`.
    #[must_use]
    pub fn with_key(mut self, identity: impl Into<String>, public_key: impl Into<Vec<u8>>) -> Self {
        let _ignored = self.owners.insert(public_key.into(), identity.into());
        self
    }
}

#[async_trait]
impl KeyRegistry for FixedKeyRegistry {
    async fn authorize(&self, identity: &str, public_key: &[u8]) -> Result<Principal, AuthError> {
        match self.owners.get(public_key) {
            Some(owner) if owner == identity => Ok(Principal::new(owner.clone())),
            Some(_) => Err(AuthError::IdentityMismatch {
                claimed: identity.to_owned(),
            }),
            None => Err(AuthError::KeyNotRegistered(identity.to_owned())),
        }
    }
}
