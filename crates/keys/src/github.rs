use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::parse::parse_authorized_key;
use crate::{AuthError, KeyRegistry, Principal};

const DEFAULT_BASE_URL: &str = "https://github.com";

/// Registry backed by GitHub's public key lists
/// (`https://github.com/<user>.keys`).
///
/// Fingerprint-to-identity mappings are cached forever: there is no eviction
/// or refresh, so a key revoked upstream stays authorized until the process
/// restarts. Revocation is rare enough in the target use case that this is an
/// accepted limitation.
#[derive(Debug)]
pub struct GithubKeyRegistry {
    http: reqwest::Client,
    base_url: String,
    cache: RwLock<HashMap<Vec<u8>, String>>,
}

impl GithubKeyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Point the registry at another host serving `<identity>.keys` lists.
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            let _ = base_url.pop();
        }

        Self {
            http: reqwest::Client::new(),
            base_url,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Cache lookup. `Ok(None)` is a miss; a hit for a different identity is
    /// a mismatch error, never a silent miss.
    fn lookup_cached(
        &self,
        claimed: &str,
        fingerprint: &[u8],
    ) -> Result<Option<Principal>, AuthError> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);

        match cache.get(fingerprint) {
            Some(owner) if owner == claimed => Ok(Some(Principal::new(owner.clone()))),
            Some(_) => Err(AuthError::IdentityMismatch {
                claimed: claimed.to_owned(),
            }),
            None => Ok(None),
        }
    }

    async fn fetch_keys(&self, identity: &str) -> Result<Vec<Vec<u8>>, AuthError> {
        let url = format!("{}/{identity}.keys", self.base_url);
        let response = self.http.get(&url).send().await?;

        match response.status().as_u16() {
            200 => {}
            404 => return Err(AuthError::UnknownIdentity(identity.to_owned())),
            status => return Err(AuthError::SourceUnavailable(status)),
        }

        let body = response.text().await?;

        let mut keys = Vec::new();
        let mut saw_content = false;

        for line in body.lines() {
            if line.trim().is_empty() {
                continue;
            }
            saw_content = true;

            // A malformed entry in someone's list must not block the others.
            match parse_authorized_key(line) {
                Some(key) => keys.push(key.blob),
                None => warn!(%identity, line, "skipping unparseable public key line"),
            }
        }

        if keys.is_empty() && saw_content {
            return Err(AuthError::MalformedResponse);
        }

        debug!(%identity, count = keys.len(), "fetched key list");

        Ok(keys)
    }
}

impl Default for GithubKeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyRegistry for GithubKeyRegistry {
    async fn authorize(&self, identity: &str, public_key: &[u8]) -> Result<Principal, AuthError> {
        if let Some(principal) = self.lookup_cached(identity, public_key)? {
            return Ok(principal);
        }

        let keys = self.fetch_keys(identity).await?;

        {
            let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
            for key in keys {
                // First writer wins: a fingerprint already attributed to one
                // identity is never remapped when it shows up in another
                // identity's list.
                let _ = cache.entry(key).or_insert_with(|| identity.to_owned());
            }
        }

        match self.lookup_cached(identity, public_key)? {
            Some(principal) => Ok(principal),
            None => Err(AuthError::KeyNotRegistered(identity.to_owned())),
        }
    }
}
