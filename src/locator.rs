//! third party location resolution
//!
//! Adding a third party caveat needs the discharger's public key so that
//! the caveat id can be encrypted to it. A [ThirdPartyLocator] resolves a
//! location string to that key and the protocol version the discharger
//! speaks. [ThirdPartyStore] is the static in-memory implementation; an
//! HTTP implementation that asks the discharger itself lives in
//! [crate::httpbakery].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::crypto::PublicKey;
use crate::error::LocatorError;
use crate::version::Version;

/// What a minter needs to know about a third party discharger.
#[derive(Debug, Clone, PartialEq)]
pub struct ThirdPartyInfo {
    /// The key third party caveat ids are encrypted to.
    pub public_key: PublicKey,

    /// The latest bakery protocol version the discharger supports.
    pub version: Version,
}

/// Resolves a third party location to its public key and protocol version.
#[async_trait]
pub trait ThirdPartyLocator: Send + Sync {
    async fn third_party_info(&self, location: &str) -> Result<ThirdPartyInfo, LocatorError>;
}

/// A [ThirdPartyLocator] backed by a static map.
///
/// Unless [allow_insecure](ThirdPartyStore::allow_insecure) has been
/// called, only `https` locations resolve.
pub struct ThirdPartyStore {
    allow_insecure: bool,
    entries: Mutex<HashMap<String, ThirdPartyInfo>>,
}

impl ThirdPartyStore {
    pub fn new() -> ThirdPartyStore {
        ThirdPartyStore {
            allow_insecure: false,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Permits resolving non-HTTPS locations. Intended for tests.
    pub fn allow_insecure(mut self) -> ThirdPartyStore {
        self.allow_insecure = true;
        self
    }

    /// Associates third party information with a location.
    pub fn add_info(&self, location: &str, info: ThirdPartyInfo) {
        self.entries
            .lock()
            .expect("third party store lock")
            .insert(location.trim_end_matches('/').to_string(), info);
    }
}

impl Default for ThirdPartyStore {
    fn default() -> Self {
        ThirdPartyStore::new()
    }
}

#[async_trait]
impl ThirdPartyLocator for ThirdPartyStore {
    async fn third_party_info(&self, location: &str) -> Result<ThirdPartyInfo, LocatorError> {
        if !self.allow_insecure && !location.starts_with("https://") {
            return Err(LocatorError::InsecureLocation(location.to_string()));
        }
        self.entries
            .lock()
            .expect("third party store lock")
            .get(location.trim_end_matches('/'))
            .cloned()
            .ok_or_else(|| LocatorError::NotFound(location.to_string()))
    }
}
