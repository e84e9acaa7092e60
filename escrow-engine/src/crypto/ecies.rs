//! ECIES over secp256k1 with AES-CTR and HMAC-SHA256
//!
//! Blob layout, byte exact with payloads already sitting in shared storage:
//!
//! ```text
//! 0x04 ‖ R (64) ‖ IV (16) ‖ ciphertext ‖ tag (32)
//! ```
//!
//! `R` is the ephemeral public point. Key material is the NIST SP 800-56A
//! concatenation KDF over the ECDH x coordinate, 32 bytes long: the first 16
//! bytes key the cipher, the SHA-256 of the last 16 bytes keys the MAC. The
//! tag covers `IV ‖ ciphertext ‖ associated_data`.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use secp256k1::{ecdh, PublicKey, SecretKey};
use sha2::{Digest, Sha256};

use super::keys::{public_key_from_bytes, KeyPair, PUBLIC_KEY_LEN};
use crate::{error::EscrowError, EscrowResult};

/// Format byte that opens every blob
pub const ECIES_HEADER: u8 = 0x04;

/// Derived key material length
pub const KEY_LEN: usize = 32;

/// Cipher block size, which is also the IV length
pub const IV_LEN: usize = 16;

/// HMAC-SHA256 output length
pub const TAG_LEN: usize = 32;

const BODY_START: usize = 1 + PUBLIC_KEY_LEN;
const MIN_BLOB_LEN: usize = BODY_START + IV_LEN + TAG_LEN;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Whether `data` carries the ECIES header byte
pub fn is_encrypted(data: &[u8]) -> bool {
    data.first() == Some(&ECIES_HEADER)
}

/// Encrypt `plaintext` to `recipient`
pub fn encrypt(plaintext: &[u8], recipient: &PublicKey, shared_mac_data: &[u8]) -> EscrowResult<Vec<u8>> {
    let ephemeral = KeyPair::generate();
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    encrypt_with(plaintext, recipient, shared_mac_data, &ephemeral, &iv)
}

/// Encrypt to a recipient given as raw key bytes (64, or 65 with prefix)
pub fn encrypt_to_bytes(
    plaintext: &[u8],
    recipient: &[u8],
    shared_mac_data: &[u8],
) -> EscrowResult<Vec<u8>> {
    let recipient = public_key_from_bytes(recipient)?;
    encrypt(plaintext, &recipient, shared_mac_data)
}

pub(crate) fn encrypt_with(
    plaintext: &[u8],
    recipient: &PublicKey,
    shared_mac_data: &[u8],
    ephemeral: &KeyPair,
    iv: &[u8; IV_LEN],
) -> EscrowResult<Vec<u8>> {
    let (key_enc, key_mac) = derive_keys(ephemeral.secret(), recipient);

    let mut ciphertext = plaintext.to_vec();
    apply_keystream(&key_enc, iv, &mut ciphertext)?;

    let mut blob = Vec::with_capacity(MIN_BLOB_LEN + ciphertext.len());
    blob.push(ECIES_HEADER);
    blob.extend_from_slice(&ephemeral.public_bytes());
    blob.extend_from_slice(iv);
    blob.extend_from_slice(&ciphertext);

    let tag = compute_tag(&key_mac, &blob[BODY_START..], shared_mac_data)?;
    blob.extend_from_slice(&tag);
    Ok(blob)
}

/// Decrypt a blob with the recipient's secret key
///
/// Fails with `wrong ecies header` when the first byte is not `0x04` and with
/// `Failed to verify tag` when the MAC does not match, which is also what a
/// wrong key produces.
pub fn decrypt(blob: &[u8], secret: &SecretKey, shared_mac_data: &[u8]) -> EscrowResult<Vec<u8>> {
    if !is_encrypted(blob) {
        return Err(EscrowError::decryption("wrong ecies header"));
    }
    if blob.len() < MIN_BLOB_LEN {
        return Err(EscrowError::decryption(format!(
            "blob of {} bytes is shorter than the {} byte minimum",
            blob.len(),
            MIN_BLOB_LEN
        )));
    }

    let ephemeral = public_key_from_bytes(&blob[1..BODY_START]).map_err(|e| {
        EscrowError::decryption(format!("Failed to generate shared secret: {}", e))
    })?;
    let (key_enc, key_mac) = derive_keys(secret, &ephemeral);

    let tag_start = blob.len() - TAG_LEN;
    let body = &blob[BODY_START..tag_start];

    let mut mac = HmacSha256::new_from_slice(&key_mac)
        .map_err(|e| EscrowError::internal(format!("hmac key: {}", e)))?;
    mac.update(body);
    mac.update(shared_mac_data);
    mac.verify_slice(&blob[tag_start..])
        .map_err(|_| EscrowError::decryption("Failed to verify tag"))?;

    let (iv, ciphertext) = body.split_at(IV_LEN);
    let mut plaintext = ciphertext.to_vec();
    apply_keystream(&key_enc, iv, &mut plaintext)?;
    Ok(plaintext)
}

/// NIST SP 800-56A concatenation KDF over SHA-256
///
/// Blocks are `SHA256(be32(counter) ‖ secret)` with the counter starting at 1.
pub fn concat_kdf(secret: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 32);
    let mut counter: u32 = 1;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(secret);
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

fn derive_keys(secret: &SecretKey, public: &PublicKey) -> ([u8; KEY_LEN / 2], [u8; 32]) {
    let point = ecdh::shared_secret_point(public, secret);
    let key = concat_kdf(&point[..32], KEY_LEN);

    let mut key_enc = [0u8; KEY_LEN / 2];
    key_enc.copy_from_slice(&key[..KEY_LEN / 2]);

    let key_mac: [u8; 32] = Sha256::digest(&key[KEY_LEN / 2..]).into();
    (key_enc, key_mac)
}

fn apply_keystream(key: &[u8], iv: &[u8], buf: &mut [u8]) -> EscrowResult<()> {
    let mut cipher = Aes128Ctr::new_from_slices(key, iv)
        .map_err(|e| EscrowError::internal(format!("cipher init: {}", e)))?;
    cipher.apply_keystream(buf);
    Ok(())
}

fn compute_tag(key_mac: &[u8], body: &[u8], shared_mac_data: &[u8]) -> EscrowResult<[u8; TAG_LEN]> {
    let mut mac = HmacSha256::new_from_slice(key_mac)
        .map_err(|e| EscrowError::internal(format!("hmac key: {}", e)))?;
    mac.update(body);
    mac.update(shared_mac_data);
    Ok(mac.finalize().into_bytes().into())
}
