//! macaroon minting
//!
//! The [Oven] bakes macaroons. Every macaroon is minted for one or more
//! operations (see [Op]); the operations are recorded in the macaroon id
//! so that [Oven::macaroon_ops] can recover exactly what a presented
//! macaroon authorizes. Small operation sets are embedded in the id
//! directly; larger ones are stored in a [MultiOpStore] under a
//! content-hashed `multi-` entity and referenced from the id, keeping ids
//! bounded.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::bakery;
use crate::checker::{MacaroonOpStore, Op};
use crate::checkers::{Caveat, Namespace};
use crate::crypto::KeyPair;
use crate::error::{Error, StoreError};
use crate::locator::ThirdPartyLocator;
use crate::macaroon::Macaroon;
use crate::store::{MemRootKeyStore, RootKeyStore};
use crate::version::Version;

/// Operation sets too large to embed in a macaroon id are stored here,
/// keyed by a deterministic content-hashed entity name.
#[async_trait]
pub trait MultiOpStore: Send + Sync {
    async fn put_ops(&self, entity: &str, ops: &[Op]) -> Result<(), StoreError>;

    async fn get_ops(&self, entity: &str) -> Result<Vec<Op>, StoreError>;
}

/// In-memory [MultiOpStore].
#[derive(Default)]
pub struct MemMultiOpStore {
    entries: Mutex<HashMap<String, Vec<Op>>>,
}

impl MemMultiOpStore {
    pub fn new() -> MemMultiOpStore {
        MemMultiOpStore::default()
    }
}

#[async_trait]
impl MultiOpStore for MemMultiOpStore {
    async fn put_ops(&self, entity: &str, ops: &[Op]) -> Result<(), StoreError> {
        self.entries
            .lock()
            .expect("multi-op store lock")
            .insert(entity.to_string(), ops.to_vec());
        Ok(())
    }

    async fn get_ops(&self, entity: &str) -> Result<Vec<Op>, StoreError> {
        self.entries
            .lock()
            .expect("multi-op store lock")
            .get(entity)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

/// Sorts and deduplicates an operation set. Two macaroons minted for the
/// same set of operations share the same canonical form, and therefore the
/// same multi-op entity.
pub fn canonical_ops(ops: &[Op]) -> Vec<Op> {
    let mut ops = ops.to_vec();
    ops.sort();
    ops.dedup();
    ops
}

/// Returns the `multi-<sha256>` entity name for a canonical operation set.
pub fn ops_entity(ops: &[Op]) -> String {
    let mut hasher = Sha256::new();
    for op in ops {
        hasher.update(op.entity.as_bytes());
        hasher.update(b"\n");
        hasher.update(op.action.as_bytes());
        hasher.update(b"\n");
    }
    format!("multi-{}", hex::encode(hasher.finalize()))
}

/// the structured id envelope minted into every macaroon
#[derive(Serialize, Deserialize)]
struct MacaroonId {
    #[serde(rename = "v")]
    version: u32,

    /// random bytes making ids unique even under one root key
    #[serde(rename = "n", with = "crate::macaroon::b64_bytes")]
    nonce: Vec<u8>,

    /// root key storage id
    #[serde(rename = "k", with = "crate::macaroon::b64_bytes")]
    storage_id: Vec<u8>,

    #[serde(rename = "ops")]
    ops: Vec<IdOp>,
}

#[derive(Serialize, Deserialize)]
struct IdOp {
    #[serde(rename = "e")]
    entity: String,

    #[serde(rename = "a")]
    actions: Vec<String>,
}

/// Configuration for [Oven]. All fields are optional except that a
/// service adding third party caveats needs `key` (and usually
/// `locator`).
#[derive(Default)]
pub struct OvenParams {
    /// Key pair used to encrypt third party caveat ids.
    pub key: Option<KeyPair>,

    /// The location minted macaroons carry.
    pub location: String,

    /// Resolves third party locations when adding caveats.
    pub locator: Option<Arc<dyn ThirdPartyLocator>>,

    /// Namespace first party caveats are written in; the standard
    /// namespace by default.
    pub namespace: Option<Namespace>,

    /// Root key storage; a fresh in-memory store by default.
    pub root_key_store: Option<Arc<dyn RootKeyStore>>,

    /// Storage for large operation sets. Without one, every operation set
    /// is embedded in the macaroon id, however large.
    pub ops_store: Option<Arc<dyn MultiOpStore>>,
}

/// Mints macaroons carrying operation sets in their ids, and recovers
/// those operations at verification time.
pub struct Oven {
    key: Option<KeyPair>,
    location: String,
    locator: Option<Arc<dyn ThirdPartyLocator>>,
    namespace: Namespace,
    root_key_store: Arc<dyn RootKeyStore>,
    ops_store: Option<Arc<dyn MultiOpStore>>,
    ops_entity_threshold: usize,
}

impl Oven {
    pub fn new(p: OvenParams) -> Oven {
        Oven {
            key: p.key,
            location: p.location,
            locator: p.locator,
            namespace: p
                .namespace
                .unwrap_or_else(|| crate::checkers::Checker::new().namespace().clone()),
            root_key_store: p
                .root_key_store
                .unwrap_or_else(|| Arc::new(MemRootKeyStore::new())),
            ops_store: p.ops_store,
            ops_entity_threshold: 4,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn key(&self) -> Option<&KeyPair> {
        self.key.as_ref()
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn locator(&self) -> Option<&dyn ThirdPartyLocator> {
        self.locator.as_deref()
    }

    /// Sets how many operations may be embedded in a macaroon id before
    /// the set is moved to the multi-op store. Has no effect without an
    /// ops store.
    pub fn set_ops_entity_threshold(&mut self, threshold: usize) {
        self.ops_entity_threshold = threshold;
    }

    /// Takes a macaroon out of the oven.
    ///
    /// The macaroon authorizes exactly `ops`, which must be non-empty;
    /// the login operation never shares a macaroon with any other. When
    /// `expiry` is given a `time-before` caveat is added, then each of
    /// `caveats` is attached in order.
    pub async fn new_macaroon(
        &self,
        version: Version,
        expiry: Option<chrono::DateTime<chrono::Utc>>,
        caveats: &[Caveat],
        ops: &[Op],
    ) -> Result<bakery::Macaroon, Error> {
        if ops.is_empty() {
            return Err(Error::InvalidOp(
                "cannot mint a macaroon associated with no operations".to_string(),
            ));
        }
        for op in ops {
            validate_op(op)?;
        }
        let ops = canonical_ops(ops);
        if ops.iter().any(Op::is_login) && ops.len() > 1 {
            return Err(Error::InvalidOp(
                "login operation cannot be combined with other operations".to_string(),
            ));
        }

        let (root_key, storage_id) = self.root_key_store.root_key().await?;
        let id_ops = self.encode_ops(&ops).await?;
        let mut nonce = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let id = serde_json::to_vec(&MacaroonId {
            version: version.as_u32(),
            nonce,
            storage_id,
            ops: id_ops,
        })
        .map_err(|e| Error::VerificationFailed(format!("cannot marshal macaroon id: {}", e)))?;

        let mut m = bakery::Macaroon::new(
            &root_key,
            id,
            &self.location,
            version,
            self.namespace.clone(),
        );
        if let Some(expiry) = expiry {
            self.add_caveat(&mut m, &crate::checkers::time_before_caveat(expiry))
                .await?;
        }
        for caveat in caveats {
            self.add_caveat(&mut m, caveat).await?;
        }
        Ok(m)
    }

    /// Attaches a caveat using the oven's key and locator.
    pub async fn add_caveat(
        &self,
        m: &mut bakery::Macaroon,
        caveat: &Caveat,
    ) -> Result<(), Error> {
        m.add_caveat(caveat, self.key.as_ref(), self.locator.as_deref())
            .await
    }

    async fn encode_ops(&self, ops: &[Op]) -> Result<Vec<IdOp>, Error> {
        let mut by_entity: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for op in ops {
            by_entity
                .entry(op.entity.as_str())
                .or_default()
                .push(op.action.clone());
        }
        let store = match &self.ops_store {
            Some(store) if by_entity.len() > 1 || ops.len() > self.ops_entity_threshold => store,
            _ => {
                return Ok(by_entity
                    .into_iter()
                    .map(|(entity, actions)| IdOp {
                        entity: entity.to_string(),
                        actions,
                    })
                    .collect());
            }
        };
        let entity = ops_entity(ops);
        store.put_ops(&entity, ops).await?;
        Ok(vec![IdOp {
            entity,
            actions: vec!["*".to_string()],
        }])
    }

    async fn decode_ops(&self, id_ops: Vec<IdOp>) -> Result<Vec<Op>, Error> {
        let mut ops = Vec::new();
        for id_op in id_ops {
            if id_op.entity.starts_with("multi-") {
                let store = self.ops_store.as_ref().ok_or(Error::NotFound)?;
                match store.get_ops(&id_op.entity).await {
                    Ok(stored) => ops.extend(stored),
                    Err(StoreError::NotFound) => return Err(Error::NotFound),
                    Err(e) => return Err(e.into()),
                }
                continue;
            }
            for action in id_op.actions {
                ops.push(Op::new(id_op.entity.clone(), action));
            }
        }
        Ok(ops)
    }
}

#[async_trait]
impl MacaroonOpStore for Oven {
    /// Verifies the signature chain of the first macaroon in `ms` against
    /// its discharges and returns the operations it authorizes along with
    /// every first party caveat condition that must still be checked.
    async fn macaroon_ops(&self, ms: &[Macaroon]) -> Result<(Vec<Op>, Vec<String>), Error> {
        let first = ms.first().ok_or_else(|| {
            Error::VerificationFailed("no macaroons in slice".to_string())
        })?;
        let id: MacaroonId = serde_json::from_slice(first.id()).map_err(|e| {
            Error::VerificationFailed(format!("cannot decode macaroon id: {}", e))
        })?;

        let root_key = match self.root_key_store.get(&id.storage_id).await {
            Ok(key) => key,
            Err(StoreError::NotFound) => {
                debug!(
                    storage_id = %String::from_utf8_lossy(&id.storage_id),
                    "macaroon root key not found"
                );
                return Err(Error::NotFound);
            }
            Err(e) => return Err(e.into()),
        };

        let conditions = first
            .verify(&root_key, &ms[1..])
            .map_err(|e| Error::VerificationFailed(e.to_string()))?;
        let ops = self.decode_ops(id.ops).await?;
        Ok((ops, conditions))
    }
}

fn validate_op(op: &Op) -> Result<(), Error> {
    if op.entity.is_empty() || op.action.is_empty() {
        return Err(Error::InvalidOp(format!(
            "invalid operation {:?}",
            op
        )));
    }
    if op.is_login() {
        return Ok(());
    }
    for reserved in ["login-", "multi-"] {
        if op.entity.starts_with(reserved) || op.entity == reserved.trim_end_matches('-') {
            return Err(Error::InvalidOp(format!(
                "entity {:?} uses reserved prefix {:?}",
                op.entity, reserved
            )));
        }
    }
    Ok(())
}
