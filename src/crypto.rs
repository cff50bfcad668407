//! cryptographic operations
//!
//! Third party caveat ids are encrypted to the discharger with an
//! authenticated public-key box (X25519 key agreement with
//! XSalsa20-Poly1305), so only the addressed third party can read the
//! caveat's condition and root key, and the third party can authenticate
//! the first party that wrote it.
//!
//! The implementation is based on [crypto_box](https://github.com/RustCrypto/nacl-compat).

use std::fmt::Display;
use std::str::FromStr;

use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::SalsaBox;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::Error;

/// length in bytes of a public or private key
pub const KEY_LEN: usize = 32;

/// length in bytes of a box nonce
pub const NONCE_LEN: usize = 24;

/// pair of keys used by a service to encrypt third party caveats
/// and by a discharger to decrypt them
#[derive(Debug, Clone)]
pub struct KeyPair {
    secret: crypto_box::SecretKey,
}

impl KeyPair {
    /// generates a fresh random key pair
    pub fn new() -> Self {
        KeyPair {
            secret: crypto_box::SecretKey::generate(&mut OsRng),
        }
    }

    pub fn from_private(key: PrivateKey) -> Self {
        KeyPair { secret: key.0 }
    }

    pub fn private(&self) -> PrivateKey {
        PrivateKey(self.secret.clone())
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.secret.public_key())
    }
}

impl Default for KeyPair {
    fn default() -> Self {
        Self::new()
    }
}

/// the private part of a [KeyPair]
///
/// The underlying key material is zeroized on drop.
#[derive(Clone)]
pub struct PrivateKey(crypto_box::SecretKey);

impl PrivateKey {
    /// serializes to a byte array
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    /// deserializes from a byte array
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Error::VerificationFailed(format!("invalid key size {}", bytes.len())))?;
        Ok(PrivateKey(crypto_box::SecretKey::from(bytes)))
    }

    /// returns the matching public key
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.public_key())
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        write!(f, "PrivateKey(..)")
    }
}

/// the public part of a [KeyPair]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(crypto_box::PublicKey);

impl PublicKey {
    /// serializes to a byte array
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        *self.0.as_bytes()
    }

    /// serializes to the standard base64 form used on the wire
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// deserializes from a byte array
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Error::VerificationFailed(format!("invalid key size {}", bytes.len())))?;
        Ok(PublicKey(crypto_box::PublicKey::from(bytes)))
    }

    pub fn from_base64(s: &str) -> Result<Self, Error> {
        let bytes = BASE64
            .decode(s)
            .map_err(|e| Error::VerificationFailed(format!("invalid key encoding: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl FromStr for PublicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PublicKey::from_base64(s)
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// Encrypts `plaintext` so that only the holder of the private part of
/// `peer` can read it, authenticated with our key pair. Returns the nonce
/// and the ciphertext.
pub(crate) fn box_encrypt(
    peer: &PublicKey,
    key: &KeyPair,
    plaintext: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>), crypto_box::aead::Error> {
    let sbox = SalsaBox::new(&peer.0, &key.secret);
    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let ciphertext = sbox.encrypt(&nonce, plaintext)?;
    Ok((nonce.into(), ciphertext))
}

/// Reverses [box_encrypt] using our private key and the sender's public key.
pub(crate) fn box_decrypt(
    peer: &PublicKey,
    key: &KeyPair,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, crypto_box::aead::Error> {
    let sbox = SalsaBox::new(&peer.0, &key.secret);
    let nonce = crypto_box::aead::Nonce::<SalsaBox>::from(*nonce);
    sbox.decrypt(&nonce, ciphertext)
}
