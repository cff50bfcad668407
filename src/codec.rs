//! third party caveat id encoding
//!
//! A third party caveat id is an envelope that only the addressed
//! discharger can open. It carries the caveat's condition and root key
//! (and, from version 2, the primary macaroon's id), encrypted to the
//! discharger's public key with the minter's key pair so the discharger
//! can also authenticate who wrote it.
//!
//! Two wire encodings exist: version 1 is a base64 JSON form that stays
//! UTF-8 safe for old macaroon versions; version 2 is the compact binary
//! form. The minter encodes with the highest version both it and the
//! discharger speak.

use serde::{Deserialize, Serialize};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::checkers::Namespace;
use crate::crypto::{self, KeyPair, PublicKey, KEY_LEN, NONCE_LEN};
use crate::error::Error;
use crate::locator::ThirdPartyInfo;
use crate::version::Version;

/// A third party caveat as decoded by the discharger.
#[derive(Debug, Clone)]
pub struct ThirdPartyCaveatInfo {
    /// The condition the third party is being asked to check.
    pub condition: String,

    /// The public key of the service that added the caveat.
    pub first_party_public_key: PublicKey,

    /// The caveat's root key; the discharge macaroon must be keyed on it.
    pub root_key: Vec<u8>,

    /// The full encoded caveat id, which becomes the discharge macaroon's
    /// id.
    pub caveat_id: Vec<u8>,

    /// The id of the primary macaroon the caveat was added to. Empty for
    /// version 1 ids, which predate it.
    pub macaroon_id: Vec<u8>,

    /// The caveat id encoding version.
    pub version: Version,

    /// The first party's caveat namespace.
    pub namespace: Namespace,
}

#[derive(Serialize, Deserialize)]
struct CaveatPlaintextV2 {
    #[serde(rename = "c")]
    condition: String,
    #[serde(rename = "k", with = "crate::macaroon::b64_bytes")]
    root_key: Vec<u8>,
    #[serde(rename = "i", with = "crate::macaroon::b64_bytes")]
    macaroon_id: Vec<u8>,
    #[serde(rename = "ns")]
    namespace: Namespace,
}

#[derive(Serialize, Deserialize)]
struct CaveatIdV1 {
    #[serde(rename = "ThirdPartyPublicKey")]
    third_party_public_key: PublicKey,
    #[serde(rename = "FirstPartyPublicKey")]
    first_party_public_key: PublicKey,
    #[serde(rename = "Nonce", with = "crate::macaroon::b64_bytes")]
    nonce: Vec<u8>,
    /// base64 box ciphertext of [CaveatPlaintextV1]
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Serialize, Deserialize)]
struct CaveatPlaintextV1 {
    #[serde(rename = "Condition")]
    condition: String,
    #[serde(rename = "RootKey", with = "crate::macaroon::b64_bytes")]
    root_key: Vec<u8>,
}

/// Encrypts a third party caveat id addressed to `third_party`.
///
/// `version` is the bakery version of the macaroon the caveat is being
/// added to; the id is encoded with the highest caveat encoding that both
/// it and the discharger support.
pub fn encode_caveat(
    condition: &str,
    root_key: &[u8],
    third_party: &ThirdPartyInfo,
    primary_id: &[u8],
    key: &KeyPair,
    ns: &Namespace,
    version: Version,
) -> Result<Vec<u8>, Error> {
    if third_party.version >= Version::V2 && version >= Version::V2 {
        encode_caveat_v2(condition, root_key, third_party, primary_id, key, ns)
    } else {
        encode_caveat_v1(condition, root_key, third_party, key)
    }
}

fn encode_caveat_v2(
    condition: &str,
    root_key: &[u8],
    third_party: &ThirdPartyInfo,
    primary_id: &[u8],
    key: &KeyPair,
    ns: &Namespace,
) -> Result<Vec<u8>, Error> {
    let plaintext = serde_json::to_vec(&CaveatPlaintextV2 {
        condition: condition.to_string(),
        root_key: root_key.to_vec(),
        macaroon_id: primary_id.to_vec(),
        namespace: ns.clone(),
    })
    .map_err(|e| Error::VerificationFailed(format!("cannot marshal caveat: {}", e)))?;

    let (nonce, ciphertext) = crypto::box_encrypt(&third_party.public_key, key, &plaintext)
        .map_err(|_| Error::VerificationFailed("cannot encrypt caveat id".to_string()))?;

    let mut id = Vec::with_capacity(1 + KEY_LEN + NONCE_LEN + ciphertext.len());
    id.push(2);
    id.extend_from_slice(&key.public().to_bytes());
    id.extend_from_slice(&nonce);
    id.extend_from_slice(&ciphertext);
    Ok(id)
}

fn encode_caveat_v1(
    condition: &str,
    root_key: &[u8],
    third_party: &ThirdPartyInfo,
    key: &KeyPair,
) -> Result<Vec<u8>, Error> {
    let plaintext = serde_json::to_vec(&CaveatPlaintextV1 {
        condition: condition.to_string(),
        root_key: root_key.to_vec(),
    })
    .map_err(|e| Error::VerificationFailed(format!("cannot marshal caveat: {}", e)))?;

    let (nonce, ciphertext) = crypto::box_encrypt(&third_party.public_key, key, &plaintext)
        .map_err(|_| Error::VerificationFailed("cannot encrypt caveat id".to_string()))?;

    let wrapper = serde_json::to_vec(&CaveatIdV1 {
        third_party_public_key: third_party.public_key.clone(),
        first_party_public_key: key.public(),
        nonce: nonce.to_vec(),
        id: BASE64.encode(ciphertext),
    })
    .map_err(|e| Error::VerificationFailed(format!("cannot marshal caveat id: {}", e)))?;

    Ok(BASE64.encode(wrapper).into_bytes())
}

/// Decrypts a third party caveat id addressed to `key`, recovering the
/// caveat's condition, root key and (for version 2 ids) the primary
/// macaroon id.
pub fn decode_caveat(key: &KeyPair, caveat_id: &[u8]) -> Result<ThirdPartyCaveatInfo, Error> {
    match caveat_id.first() {
        Some(2) => decode_caveat_v2(key, caveat_id),
        Some(b'{') => decode_caveat_v1(key, caveat_id, caveat_id),
        Some(_) => {
            let decoded = BASE64.decode(caveat_id).map_err(|_| {
                Error::VerificationFailed("cannot decode caveat id".to_string())
            })?;
            decode_caveat_v1(key, &decoded, caveat_id)
        }
        None => Err(Error::VerificationFailed("empty caveat id".to_string())),
    }
}

fn decode_caveat_v2(key: &KeyPair, caveat_id: &[u8]) -> Result<ThirdPartyCaveatInfo, Error> {
    // version byte, first party key, nonce, box overhead
    if caveat_id.len() < 1 + KEY_LEN + NONCE_LEN + 16 {
        return Err(Error::VerificationFailed(
            "caveat id too short".to_string(),
        ));
    }
    let first_party_public_key = PublicKey::from_bytes(&caveat_id[1..1 + KEY_LEN])?;
    let nonce: [u8; NONCE_LEN] = caveat_id[1 + KEY_LEN..1 + KEY_LEN + NONCE_LEN]
        .try_into()
        .expect("nonce slice has fixed length");
    let ciphertext = &caveat_id[1 + KEY_LEN + NONCE_LEN..];

    let plaintext = crypto::box_decrypt(&first_party_public_key, key, &nonce, ciphertext)
        .map_err(|_| Error::VerificationFailed("cannot decrypt caveat id".to_string()))?;
    let plain: CaveatPlaintextV2 = serde_json::from_slice(&plaintext)
        .map_err(|e| Error::VerificationFailed(format!("cannot unmarshal caveat: {}", e)))?;

    Ok(ThirdPartyCaveatInfo {
        condition: plain.condition,
        first_party_public_key,
        root_key: plain.root_key,
        caveat_id: caveat_id.to_vec(),
        macaroon_id: plain.macaroon_id,
        version: Version::V2,
        namespace: plain.namespace,
    })
}

fn decode_caveat_v1(
    key: &KeyPair,
    decoded: &[u8],
    original_id: &[u8],
) -> Result<ThirdPartyCaveatInfo, Error> {
    let wrapper: CaveatIdV1 = serde_json::from_slice(decoded)
        .map_err(|e| Error::VerificationFailed(format!("cannot unmarshal caveat id: {}", e)))?;
    if wrapper.third_party_public_key != key.public() {
        return Err(Error::VerificationFailed(
            "caveat id is not addressed to this discharger".to_string(),
        ));
    }
    let nonce: [u8; NONCE_LEN] = wrapper
        .nonce
        .as_slice()
        .try_into()
        .map_err(|_| Error::VerificationFailed("bad caveat id nonce".to_string()))?;
    let ciphertext = BASE64
        .decode(&wrapper.id)
        .map_err(|_| Error::VerificationFailed("cannot decode caveat ciphertext".to_string()))?;

    let plaintext =
        crypto::box_decrypt(&wrapper.first_party_public_key, key, &nonce, &ciphertext)
            .map_err(|_| Error::VerificationFailed("cannot decrypt caveat id".to_string()))?;
    let plain: CaveatPlaintextV1 = serde_json::from_slice(&plaintext)
        .map_err(|e| Error::VerificationFailed(format!("cannot unmarshal caveat: {}", e)))?;

    Ok(ThirdPartyCaveatInfo {
        condition: plain.condition,
        first_party_public_key: wrapper.first_party_public_key,
        root_key: plain.root_key,
        caveat_id: original_id.to_vec(),
        macaroon_id: Vec::new(),
        version: Version::V1,
        namespace: Namespace::new(),
    })
}
