//! Payload encryption
//!
//! Hybrid ECIES encryption protecting manifests and results at rest in shared
//! storage, plus the secp256k1 key helpers it builds on.

pub mod ecies;
pub mod keys;

pub use ecies::{concat_kdf, decrypt, encrypt, encrypt_to_bytes, is_encrypted, ECIES_HEADER};
pub use keys::{
    generate_keypair, public_key_from_bytes, public_key_from_hex, public_key_to_bytes,
    secret_key_from_hex, KeyPair, PUBLIC_KEY_LEN, SECRET_KEY_LEN,
};
pub use secp256k1::{PublicKey, SecretKey};
