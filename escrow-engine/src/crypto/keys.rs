//! secp256k1 key material
//!
//! Public keys travel as 64 raw bytes (uncompressed point without the `0x04`
//! format byte), usually hex encoded. Secret keys are 32-byte scalars.

use std::fmt;

use rand::rngs::OsRng;
use secp256k1::{PublicKey, Secp256k1, SecretKey};

use crate::{error::EscrowError, EscrowResult};

/// Length of a public key without the format byte
pub const PUBLIC_KEY_LEN: usize = 64;

/// Length of a secret scalar
pub const SECRET_KEY_LEN: usize = 32;

const UNCOMPRESSED_TAG: u8 = 0x04;

/// A locally generated secp256k1 key pair
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new key pair from the operating system CSPRNG
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::new(&mut OsRng))
    }

    /// Build the pair for an existing secret scalar
    pub fn from_secret(secret: SecretKey) -> Self {
        let secp = Secp256k1::signing_only();
        let public = PublicKey::from_secret_key(&secp, &secret);
        Self { secret, public }
    }

    /// Parse a 64-character hex secret
    pub fn from_secret_hex(secret_hex: &str) -> EscrowResult<Self> {
        Ok(Self::from_secret(secret_key_from_hex(secret_hex)?))
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Public point as 64 bytes, no format prefix
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        public_key_to_bytes(&self.public)
    }

    /// Public point as 128 hex characters
    pub fn public_hex(&self) -> String {
        hex::encode(self.public_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

/// Generate a fresh key pair
pub fn generate_keypair() -> KeyPair {
    KeyPair::generate()
}

/// Serialize a public key as 64 bytes without the format byte
pub fn public_key_to_bytes(public: &PublicKey) -> [u8; PUBLIC_KEY_LEN] {
    let full = public.serialize_uncompressed();
    let mut out = [0u8; PUBLIC_KEY_LEN];
    out.copy_from_slice(&full[1..]);
    out
}

/// Decode a public key from 64 raw bytes, or 65 bytes with the `0x04` prefix
pub fn public_key_from_bytes(bytes: &[u8]) -> EscrowResult<PublicKey> {
    let mut encoded = [0u8; PUBLIC_KEY_LEN + 1];
    match bytes.len() {
        PUBLIC_KEY_LEN => {
            encoded[0] = UNCOMPRESSED_TAG;
            encoded[1..].copy_from_slice(bytes);
        }
        len if len == PUBLIC_KEY_LEN + 1 && bytes[0] == UNCOMPRESSED_TAG => {
            encoded.copy_from_slice(bytes);
        }
        len => {
            return Err(EscrowError::invalid_public_key(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LEN, len
            )))
        }
    }

    PublicKey::from_slice(&encoded).map_err(|e| EscrowError::invalid_public_key(e.to_string()))
}

/// Decode a hex public key, `0x` prefix optional
pub fn public_key_from_hex(public_hex: &str) -> EscrowResult<PublicKey> {
    let bytes = hex::decode(strip_hex_prefix(public_hex.trim()))
        .map_err(|e| EscrowError::invalid_public_key(format!("bad hex: {}", e)))?;
    public_key_from_bytes(&bytes)
}

/// Decode a 32-byte hex secret, `0x` prefix optional
pub fn secret_key_from_hex(secret_hex: &str) -> EscrowResult<SecretKey> {
    let bytes = hex::decode(strip_hex_prefix(secret_hex.trim()))
        .map_err(|e| EscrowError::invalid_credential(format!("bad private key hex: {}", e)))?;
    if bytes.len() != SECRET_KEY_LEN {
        return Err(EscrowError::invalid_credential(format!(
            "private key must be {} bytes, got {}",
            SECRET_KEY_LEN,
            bytes.len()
        )));
    }
    SecretKey::from_slice(&bytes).map_err(|e| EscrowError::invalid_credential(e.to_string()))
}

pub(crate) fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}
