//! the bakery macaroon wrapper and the service facade
//!
//! [Macaroon] augments the primitive macaroon with the context needed to
//! attach caveats after minting: the bakery protocol version it was minted
//! at and the caveat namespace its conditions are written in. [Bakery]
//! bundles an [Oven](crate::oven::Oven) and a
//! [Checker](crate::checker::Checker) with a single set of parameters, the
//! usual starting point for a service.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::authorizer::{Authorizer, ClosedAuthorizer};
use crate::checker::{Checker, CheckerParams};
use crate::checkers::{self, Caveat, Namespace};
use crate::crypto::{KeyPair, PublicKey};
use crate::error::Error;
use crate::identity::{IdentityClient, NoIdentities};
use crate::locator::{ThirdPartyInfo, ThirdPartyLocator};
use crate::macaroon;
use crate::oven::{MultiOpStore, Oven, OvenParams};
use crate::store::{RootKey, RootKeyStore};
use crate::version::Version;

/// The location of third party caveats discharged by the client itself
/// rather than over the network. See [local_third_party_caveat].
pub const LOCAL_LOCATION_PREFIX: &str = "local ";

/// A macaroon together with the bakery version and caveat namespace it was
/// minted under, which are needed to attach further caveats to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Macaroon {
    #[serde(rename = "m")]
    macaroon: macaroon::Macaroon,

    #[serde(rename = "v")]
    version: Version,

    #[serde(rename = "ns")]
    namespace: Namespace,
}

impl Macaroon {
    /// Mints a macaroon with the given id, keyed on `root_key`.
    pub fn new(
        root_key: &[u8],
        id: impl Into<Vec<u8>>,
        location: &str,
        version: Version,
        namespace: Namespace,
    ) -> Macaroon {
        Macaroon {
            macaroon: macaroon::Macaroon::new(root_key, id, location),
            version,
            namespace,
        }
    }

    /// the wrapped primitive macaroon
    pub fn macaroon(&self) -> &macaroon::Macaroon {
        &self.macaroon
    }

    pub fn into_macaroon(self) -> macaroon::Macaroon {
        self.macaroon
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Attaches a caveat.
    ///
    /// A first party caveat is written into the macaroon's namespace; a
    /// caveat in an unregistered namespace degrades to an always-failing
    /// `error` condition rather than silently losing the restriction.
    ///
    /// A third party caveat needs `key` to encrypt the caveat id, and
    /// `locator` to find the discharger's public key unless the location
    /// is local (see [local_third_party_caveat]).
    pub async fn add_caveat(
        &mut self,
        caveat: &Caveat,
        key: Option<&KeyPair>,
        locator: Option<&dyn ThirdPartyLocator>,
    ) -> Result<(), Error> {
        let Some(location) = caveat.location.as_deref().filter(|loc| !loc.is_empty()) else {
            let condition = match &caveat.namespace {
                None => caveat.condition.clone(),
                Some(uri) => match self.namespace.resolve_caveat(uri, &caveat.condition) {
                    Some(cond) => cond,
                    None => {
                        checkers::error_caveat(format!(
                            "caveat {:?} in unregistered namespace {:?}",
                            caveat.condition, uri
                        ))
                        .condition
                    }
                },
            };
            self.macaroon.add_first_party_caveat(&condition);
            return Ok(());
        };

        let key = key.ok_or_else(|| {
            Error::CannotAddCaveat("no private key to encrypt third party caveat".to_string())
        })?;
        let info = match parse_local_location(location) {
            Some(info) => info,
            None => {
                let locator = locator.ok_or_else(|| {
                    Error::CannotAddCaveat("no locator when adding third party caveat".to_string())
                })?;
                locator.third_party_info(location).await?
            }
        };

        let root_key = RootKey::generate();
        let id = crate::codec::encode_caveat(
            &caveat.condition,
            &root_key,
            &info,
            self.macaroon.id(),
            key,
            &self.namespace,
            self.version,
        )?;
        self.macaroon.add_third_party_caveat(&root_key, id, location)?;
        Ok(())
    }

    /// Attaches each caveat in turn; see [Macaroon::add_caveat].
    pub async fn add_caveats(
        &mut self,
        caveats: &[Caveat],
        key: Option<&KeyPair>,
        locator: Option<&dyn ThirdPartyLocator>,
    ) -> Result<(), Error> {
        for caveat in caveats {
            self.add_caveat(caveat, key, locator).await?;
        }
        Ok(())
    }
}

/// Returns a third party caveat addressed to the holder of the given key,
/// dischargeable by the client itself without contacting any service.
/// Used by the agent login protocol to prove possession of a key.
pub fn local_third_party_caveat(key: &PublicKey, version: Version) -> Caveat {
    Caveat::third_party(
        format!("local {} {}", version.as_u32(), key.to_base64()),
        "true",
    )
}

/// Parses the location of a caveat created by [local_third_party_caveat].
pub(crate) fn parse_local_location(location: &str) -> Option<ThirdPartyInfo> {
    let rest = location.strip_prefix(LOCAL_LOCATION_PREFIX)?;
    let (version, key) = match rest.split_once(' ') {
        Some((v, key)) => (v.parse::<u32>().ok().map(Version::from_u32_clamped)?, key),
        // Old form with no version field.
        None => (Version::V1, rest),
    };
    Some(ThirdPartyInfo {
        public_key: PublicKey::from_base64(key).ok()?,
        version,
    })
}

/// Reports whether a third party caveat location denotes a locally
/// dischargeable caveat.
pub fn is_local_location(location: &str) -> bool {
    location == "local" || location.starts_with(LOCAL_LOCATION_PREFIX)
}

/// Configuration for [Bakery]. All fields have workable defaults for a
/// stand-alone service; a service that adds third party caveats needs at
/// least `key` and `locator`.
#[derive(Default)]
pub struct BakeryParams {
    /// The location minted macaroons carry.
    pub location: String,

    /// The service key pair, used to encrypt third party caveat ids.
    pub key: Option<KeyPair>,

    /// Resolves third party locations when adding caveats.
    pub locator: Option<Arc<dyn ThirdPartyLocator>>,

    /// Root key storage; an in-memory store by default.
    pub root_key_store: Option<Arc<dyn RootKeyStore>>,

    /// Storage for large operation sets referenced from macaroon ids.
    pub ops_store: Option<Arc<dyn MultiOpStore>>,

    /// First party caveat checker; the standard checkers by default.
    pub checker: Option<checkers::Checker>,

    /// Authorization fallback for operations no macaroon covers;
    /// [ClosedAuthorizer] by default.
    pub authorizer: Option<Arc<dyn Authorizer>>,

    /// Identity service client; [NoIdentities] by default.
    pub identity_client: Option<Arc<dyn IdentityClient>>,
}

/// An [Oven] and a [Checker] sharing one configuration: the oven mints and
/// attenuates macaroons that the checker will accept.
pub struct Bakery {
    oven: Arc<Oven>,
    checker: Checker,
}

impl Bakery {
    pub fn new(p: BakeryParams) -> Bakery {
        let first_party = p.checker.unwrap_or_default();
        let namespace = first_party.namespace().clone();
        let oven = Arc::new(Oven::new(OvenParams {
            key: p.key,
            location: p.location,
            locator: p.locator,
            namespace: Some(namespace),
            root_key_store: p.root_key_store,
            ops_store: p.ops_store,
        }));
        let checker = Checker::new(CheckerParams {
            checker: Some(first_party),
            authorizer: Some(p.authorizer.unwrap_or_else(|| Arc::new(ClosedAuthorizer))),
            identity_client: Some(p.identity_client.unwrap_or_else(|| Arc::new(NoIdentities))),
            macaroon_opstore: oven.clone(),
        });
        Bakery { oven, checker }
    }

    pub fn oven(&self) -> &Arc<Oven> {
        &self.oven
    }

    pub fn checker(&self) -> &Checker {
        &self.checker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::LATEST_VERSION;

    fn std_namespace() -> Namespace {
        checkers::Checker::new().namespace().clone()
    }

    #[tokio::test]
    async fn first_party_caveats_are_namespaced() {
        let mut m = Macaroon::new(
            b"root key",
            b"id".to_vec(),
            "here",
            LATEST_VERSION,
            std_namespace(),
        );
        m.add_caveat(&Caveat::first_party("is something"), None, None)
            .await
            .unwrap();
        let conds = m.macaroon().verify(b"root key", &[]).unwrap();
        assert_eq!(conds, vec!["is something".to_string()]);
    }

    #[tokio::test]
    async fn unregistered_namespace_becomes_error_caveat() {
        let mut m = Macaroon::new(
            b"root key",
            b"id".to_vec(),
            "here",
            LATEST_VERSION,
            std_namespace(),
        );
        let cav = Caveat {
            condition: "is something".to_string(),
            namespace: Some("http://elsewhere".to_string()),
            location: None,
        };
        m.add_caveat(&cav, None, None).await.unwrap();
        let conds = m.macaroon().verify(b"root key", &[]).unwrap();
        assert!(conds[0].starts_with("error "));
    }

    #[tokio::test]
    async fn third_party_caveat_requires_key() {
        let mut m = Macaroon::new(
            b"root key",
            b"id".to_vec(),
            "here",
            LATEST_VERSION,
            std_namespace(),
        );
        let cav = Caveat::third_party("https://auth.example.com", "user is bob");
        assert!(matches!(
            m.add_caveat(&cav, None, None).await,
            Err(Error::CannotAddCaveat(_))
        ));
    }

    #[tokio::test]
    async fn local_caveat_skips_the_locator() {
        let agent_key = KeyPair::new();
        let service_key = KeyPair::new();
        let mut m = Macaroon::new(
            b"root key",
            b"id".to_vec(),
            "here",
            LATEST_VERSION,
            std_namespace(),
        );
        let cav = local_third_party_caveat(&agent_key.public(), LATEST_VERSION);
        m.add_caveat(&cav, Some(&service_key), None).await.unwrap();

        let caveats = m.macaroon().caveats();
        assert_eq!(caveats.len(), 1);
        assert!(is_local_location(caveats[0].location.as_deref().unwrap()));

        let info = crate::codec::decode_caveat(&agent_key, &caveats[0].id).unwrap();
        assert_eq!(info.condition, "true");
    }

    #[test]
    fn local_location_parsing() {
        let key = KeyPair::new().public();
        let loc = format!("local 3 {}", key.to_base64());
        let info = parse_local_location(&loc).unwrap();
        assert_eq!(info.public_key, key);
        assert_eq!(info.version, Version::V3);

        let old = format!("local {}", key.to_base64());
        assert_eq!(parse_local_location(&old).unwrap().version, Version::V1);

        assert!(parse_local_location("https://elsewhere").is_none());
    }

    #[tokio::test]
    async fn macaroon_json_round_trip() {
        let mut m = Macaroon::new(
            b"root key",
            b"id".to_vec(),
            "here",
            LATEST_VERSION,
            std_namespace(),
        );
        m.add_caveat(&Caveat::first_party("is something"), None, None)
            .await
            .unwrap();
        let data = serde_json::to_string(&m).unwrap();
        let decoded: Macaroon = serde_json::from_str(&data).unwrap();
        assert_eq!(decoded, m);
    }
}
