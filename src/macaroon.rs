//! the macaroon primitive
//!
//! A macaroon is a bearer token carrying a chain of caveats, each bound
//! into an HMAC-SHA256 signature chain so that holders can append caveats
//! (attenuating the token) but never remove them.
//!
//! First party caveats carry a condition checked by the target service.
//! Third party caveats carry an opaque id addressed to an external
//! discharger together with a verification id: the caveat's root key
//! encrypted under the signature chain at the point the caveat was added.
//! The discharger proves the caveat's condition held by minting a discharge
//! macaroon keyed on that root key, which the client must bind to the
//! primary before presenting the bundle.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};

type HmacSha256 = Hmac<Sha256>;

/// length in bytes of a macaroon signature
pub const SIGNATURE_LEN: usize = 32;

const VID_NONCE_LEN: usize = 24;

/// errors from macaroon construction or verification
#[derive(Error, Clone, Debug, PartialEq)]
pub enum MacaroonError {
    #[error("signature mismatch after caveat verification")]
    InvalidSignature,

    #[error("cannot find discharge macaroon for caveat {0:?}")]
    MissingDischarge(String),

    #[error("discharge macaroon used more than once")]
    DischargeReused,

    #[error("caveat condition is not valid utf-8")]
    BadCondition,

    #[error("malformed verification id")]
    BadVerificationId,
}

/// a single restriction on a [Macaroon]'s use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caveat {
    /// The caveat identifier: a condition string for first party caveats,
    /// an opaque encrypted blob addressed to the discharger for third
    /// party ones.
    #[serde(rename = "cid", with = "b64_bytes")]
    pub id: Vec<u8>,

    /// The caveat's root key encrypted under the signature chain.
    /// Present exactly for third party caveats.
    #[serde(
        rename = "vid",
        default,
        skip_serializing_if = "Option::is_none",
        with = "b64_bytes_opt"
    )]
    pub verification_id: Option<Vec<u8>>,

    /// Location hint for the third party that can discharge this caveat.
    #[serde(rename = "cl", default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Caveat {
    pub fn is_third_party(&self) -> bool {
        self.verification_id.is_some()
    }
}

/// A chained-HMAC bearer token.
///
/// The signature is keyed on a root key private to the minting service;
/// appending a caveat folds the caveat into the signature, so the chain can
/// only ever be extended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macaroon {
    #[serde(rename = "location", default, skip_serializing_if = "String::is_empty")]
    location: String,

    #[serde(rename = "identifier", with = "b64_bytes")]
    id: Vec<u8>,

    #[serde(rename = "caveats", default, skip_serializing_if = "Vec::is_empty")]
    caveats: Vec<Caveat>,

    #[serde(rename = "signature", with = "hex_sig")]
    signature: [u8; SIGNATURE_LEN],
}

impl Macaroon {
    /// Mints a new macaroon with the given id, keyed on `root_key`.
    pub fn new(root_key: &[u8], id: impl Into<Vec<u8>>, location: impl Into<String>) -> Self {
        let id = id.into();
        let signature = keyed_hash(&derive_key(root_key), &id);
        Macaroon {
            location: location.into(),
            id,
            caveats: Vec::new(),
            signature,
        }
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn caveats(&self) -> &[Caveat] {
        &self.caveats
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_LEN] {
        &self.signature
    }

    /// Appends a first party caveat, folding the condition into the
    /// signature chain.
    pub fn add_first_party_caveat(&mut self, condition: &str) {
        let id = condition.as_bytes().to_vec();
        self.signature = keyed_hash(&self.signature, &id);
        self.caveats.push(Caveat {
            id,
            verification_id: None,
            location: None,
        });
    }

    /// Appends a third party caveat addressed to the discharger at
    /// `location`. `caveat_root_key` is the secret the discharger will key
    /// its discharge macaroon on; it is sealed into the verification id
    /// under the current signature so the target service can recover it
    /// during verification.
    pub fn add_third_party_caveat(
        &mut self,
        caveat_root_key: &[u8],
        id: impl Into<Vec<u8>>,
        location: impl Into<String>,
    ) -> Result<(), MacaroonError> {
        let id = id.into();
        let verification_id = seal_vid(&self.signature, caveat_root_key)?;
        self.signature = keyed_hash_pair(&self.signature, &verification_id, &id);
        self.caveats.push(Caveat {
            id,
            verification_id: Some(verification_id),
            location: Some(location.into()),
        });
        Ok(())
    }

    /// Returns a copy of `discharge` bound to this macaroon: its signature
    /// becomes `HMAC(self.signature, discharge.signature)`, preventing the
    /// discharge from being replayed against any other primary.
    pub fn bind_discharge(&self, discharge: &Macaroon) -> Macaroon {
        let mut bound = discharge.clone();
        bound.signature = keyed_hash(&self.signature, &discharge.signature);
        bound
    }

    /// Binds every discharge to this macaroon, returning the bundle with
    /// the primary first.
    pub fn prepare_for_request(&self, discharges: &[Macaroon]) -> Vec<Macaroon> {
        let mut ms = Vec::with_capacity(discharges.len() + 1);
        ms.push(self.clone());
        for d in discharges {
            ms.push(self.bind_discharge(d));
        }
        ms
    }

    /// Verifies the signature chain of this macaroon and its discharges
    /// against `root_key`.
    ///
    /// Every third party caveat must be matched by a bound discharge in
    /// `discharges`, each discharge must be used exactly once, and every
    /// signature must check out. On success, returns all first party caveat
    /// conditions in the tree: the primary's conditions in order, then each
    /// discharge subtree's in caveat order.
    ///
    /// The conditions are not checked here; that is the verifier's job.
    pub fn verify(
        &self,
        root_key: &[u8],
        discharges: &[Macaroon],
    ) -> Result<Vec<String>, MacaroonError> {
        let mut used = vec![false; discharges.len()];
        let mut conditions = Vec::new();
        self.verify_node(root_key, None, discharges, &mut used, &mut conditions)?;
        if let Some(i) = used.iter().position(|u| !u) {
            return Err(MacaroonError::MissingDischarge(format!(
                "discharge macaroon {:?} was not used",
                String::from_utf8_lossy(&discharges[i].id)
            )));
        }
        Ok(conditions)
    }

    fn verify_node(
        &self,
        root_key: &[u8],
        primary_signature: Option<&[u8; SIGNATURE_LEN]>,
        discharges: &[Macaroon],
        used: &mut [bool],
        conditions: &mut Vec<String>,
    ) -> Result<(), MacaroonError> {
        let mut sig = keyed_hash(&derive_key(root_key), &self.id);
        // (discharge index, recovered caveat root key), in caveat order
        let mut sub = Vec::new();

        for cav in &self.caveats {
            match &cav.verification_id {
                None => {
                    let cond = std::str::from_utf8(&cav.id)
                        .map_err(|_| MacaroonError::BadCondition)?;
                    conditions.push(cond.to_string());
                    sig = keyed_hash(&sig, &cav.id);
                }
                Some(vid) => {
                    // The vid was sealed under the chain signature as it
                    // stood before this caveat was appended.
                    let caveat_key = open_vid(&sig, vid)?;
                    sig = keyed_hash_pair(&sig, vid, &cav.id);

                    let index = discharges
                        .iter()
                        .position(|d| d.id == cav.id)
                        .ok_or_else(|| {
                            MacaroonError::MissingDischarge(
                                String::from_utf8_lossy(&cav.id).into_owned(),
                            )
                        })?;
                    if used[index] {
                        return Err(MacaroonError::DischargeReused);
                    }
                    used[index] = true;
                    sub.push((index, caveat_key));
                }
            }
        }

        match primary_signature {
            None => {
                if sig != self.signature {
                    return Err(MacaroonError::InvalidSignature);
                }
            }
            Some(primary_sig) => {
                let bound = keyed_hash(primary_sig, &sig);
                if bound != self.signature {
                    return Err(MacaroonError::InvalidSignature);
                }
            }
        }

        // The bundle's discharges are all bound to the outermost primary.
        let primary_sig = primary_signature.unwrap_or(&self.signature);
        for (index, caveat_key) in sub {
            discharges[index].verify_node(
                &caveat_key,
                Some(primary_sig),
                discharges,
                used,
                conditions,
            )?;
        }
        Ok(())
    }
}

/// HMAC-SHA256 of `data` under `key`.
fn keyed_hash(key: &[u8], data: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn keyed_hash_pair(key: &[u8], d1: &[u8], d2: &[u8]) -> [u8; SIGNATURE_LEN] {
    let h1 = keyed_hash(key, d1);
    let h2 = keyed_hash(key, d2);
    let mut both = [0u8; SIGNATURE_LEN * 2];
    both[..SIGNATURE_LEN].copy_from_slice(&h1);
    both[SIGNATURE_LEN..].copy_from_slice(&h2);
    keyed_hash(key, &both)
}

/// Stretches an arbitrary-length root key into a fixed-size HMAC key.
fn derive_key(root_key: &[u8]) -> [u8; SIGNATURE_LEN] {
    keyed_hash(b"macaroons-key-generator", root_key)
}

fn seal_vid(signature: &[u8; SIGNATURE_LEN], root_key: &[u8]) -> Result<Vec<u8>, MacaroonError> {
    let cipher = XChaCha20Poly1305::new(signature.into());
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, root_key)
        .map_err(|_| MacaroonError::BadVerificationId)?;
    let mut vid = Vec::with_capacity(VID_NONCE_LEN + ciphertext.len());
    vid.extend_from_slice(&nonce);
    vid.extend_from_slice(&ciphertext);
    Ok(vid)
}

fn open_vid(signature: &[u8; SIGNATURE_LEN], vid: &[u8]) -> Result<Vec<u8>, MacaroonError> {
    if vid.len() < VID_NONCE_LEN {
        return Err(MacaroonError::BadVerificationId);
    }
    let (nonce, ciphertext) = vid.split_at(VID_NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(signature.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| MacaroonError::BadVerificationId)
}

pub(crate) mod b64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s).map_err(serde::de::Error::custom)
    }
}

mod b64_bytes_opt {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&BASE64.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        match s {
            Some(s) => Ok(Some(BASE64.decode(s).map_err(serde::de::Error::custom)?)),
            None => Ok(None),
        }
    }
}

mod hex_sig {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::SIGNATURE_LEN;

    pub fn serialize<S: Serializer>(
        sig: &[u8; SIGNATURE_LEN],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(sig))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; SIGNATURE_LEN], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 32 bytes"))
    }
}
