//! root key storage
//!
//! Every minted macaroon is keyed on a root key held by the minting
//! service; the macaroon id records which one, so the key can be fetched
//! again at verification time. Evicting a key from the store revokes every
//! macaroon minted under it.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::StoreError;

/// length in bytes of a generated root key
pub const ROOT_KEY_LEN: usize = 24;

/// A symmetric macaroon root key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct RootKey(Vec<u8>);

impl RootKey {
    /// generates a fresh random key
    pub fn generate() -> RootKey {
        let mut bytes = vec![0u8; ROOT_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        RootKey(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> RootKey {
        RootKey(bytes)
    }
}

impl Deref for RootKey {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for RootKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        write!(f, "RootKey(..)")
    }
}

/// Storage for macaroon root keys.
#[async_trait]
pub trait RootKeyStore: Send + Sync {
    /// Returns the key with the given id, or [StoreError::NotFound] if it
    /// has never existed or has been evicted.
    async fn get(&self, id: &[u8]) -> Result<RootKey, StoreError>;

    /// Returns a key fresh enough for minting a new macaroon together with
    /// its id. The store may rotate and return the current epoch's key.
    async fn root_key(&self) -> Result<(RootKey, Vec<u8>), StoreError>;
}

struct StoredKey {
    key: RootKey,
    created: DateTime<Utc>,
}

struct MemInner {
    keys: HashMap<String, StoredKey>,
    current: Option<String>,
    next_id: u64,
}

/// In-memory [RootKeyStore].
///
/// With an expiry configured, a fresh key is generated once the current
/// one has aged past it, and keys older than twice the expiry are evicted,
/// which bounds how long an already-minted macaroon stays verifiable.
pub struct MemRootKeyStore {
    expiry: Option<Duration>,
    inner: Mutex<MemInner>,
}

impl MemRootKeyStore {
    /// a store with a single never-rotated key
    pub fn new() -> MemRootKeyStore {
        MemRootKeyStore {
            expiry: None,
            inner: Mutex::new(MemInner {
                keys: HashMap::new(),
                current: None,
                next_id: 0,
            }),
        }
    }

    /// a store that rotates its minting key every `expiry`
    pub fn new_with_expiry(expiry: Duration) -> MemRootKeyStore {
        MemRootKeyStore {
            expiry: Some(expiry),
            ..MemRootKeyStore::new()
        }
    }
}

impl Default for MemRootKeyStore {
    fn default() -> Self {
        MemRootKeyStore::new()
    }
}

#[async_trait]
impl RootKeyStore for MemRootKeyStore {
    async fn get(&self, id: &[u8]) -> Result<RootKey, StoreError> {
        let id = std::str::from_utf8(id).map_err(|_| StoreError::NotFound)?;
        let mut inner = self.inner.lock().expect("root key store lock");
        let now = Utc::now();
        let expired = match (self.expiry, inner.keys.get(id)) {
            (Some(expiry), Some(stored)) => now - stored.created > expiry * 2,
            _ => false,
        };
        if expired {
            inner.keys.remove(id);
            return Err(StoreError::NotFound);
        }
        inner
            .keys
            .get(id)
            .map(|stored| stored.key.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn root_key(&self) -> Result<(RootKey, Vec<u8>), StoreError> {
        let mut inner = self.inner.lock().expect("root key store lock");
        let now = Utc::now();

        if let Some(id) = inner.current.clone() {
            if let Some(stored) = inner.keys.get(&id) {
                let fresh = match self.expiry {
                    None => true,
                    Some(expiry) => now - stored.created <= expiry,
                };
                if fresh {
                    return Ok((stored.key.clone(), id.into_bytes()));
                }
            }
        }

        // Rotate: evict anything no longer verifiable, then mint an epoch.
        if let Some(expiry) = self.expiry {
            inner.keys.retain(|_, stored| now - stored.created <= expiry * 2);
        }
        let id = inner.next_id.to_string();
        inner.next_id += 1;
        let key = RootKey::generate();
        inner.keys.insert(
            id.clone(),
            StoredKey {
                key: key.clone(),
                created: now,
            },
        );
        inner.current = Some(id.clone());
        Ok((key, id.into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip() {
        let store = MemRootKeyStore::new();
        let (key, id) = store.root_key().await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), key);
    }

    #[tokio::test]
    async fn stable_key_without_expiry() {
        let store = MemRootKeyStore::new();
        let (k1, id1) = store.root_key().await.unwrap();
        let (k2, id2) = store.root_key().await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(k1, k2);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = MemRootKeyStore::new();
        assert_eq!(store.get(b"42").await, Err(StoreError::NotFound));
    }

    #[tokio::test]
    async fn rotation_after_expiry() {
        // A zero expiry means every mint rotates.
        let store = MemRootKeyStore::new_with_expiry(Duration::zero());
        let (_, id1) = store.root_key().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let (_, id2) = store.root_key().await.unwrap();
        assert_ne!(id1, id2);
    }
}
