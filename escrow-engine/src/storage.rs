//! Shared object storage for manifests and results
//!
//! Payloads are JSON documents, optionally ECIES-encrypted to a recipient
//! before upload. Objects are content-addressed: the key is `s3` followed by
//! the SHA-1 of the stored bytes, and the hash recorded on the ledger is the
//! SHA-1 of the plaintext JSON.
//!
//! The plaintext is the same text Python's `json.dumps(doc, sort_keys=True)`
//! produces (`", "` and `": "` separators, non-ASCII escaped), so hashes agree
//! with other parties computing them from the same document.

use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use secp256k1::{PublicKey, SecretKey};
use serde::Serialize;
use serde_json::ser::Formatter;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    crypto::ecies,
    error::EscrowError,
    retry::{with_backoff, RetryPolicy, Sleeper},
    EscrowResult,
};

/// Prefix of every storage key
pub const KEY_PREFIX: &str = "s3";

/// Storage collaborator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Blob store addressed by opaque keys
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data`, returning its key
    async fn put(&self, data: Vec<u8>) -> Result<String, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

/// Hex SHA-1 digest
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Key under which `data` is stored
pub fn content_key(data: &[u8]) -> String {
    format!("{}{}", KEY_PREFIX, sha1_hex(data))
}

/// JSON formatter producing the canonical payload text
struct CanonicalFormatter;

impl Formatter for CanonicalFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    /// Printable ASCII as is, everything else as UTF-16 `\uXXXX` escapes
    fn write_string_fragment<W: ?Sized + io::Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        for c in fragment.chars() {
            if c.is_ascii() && c != '\x7f' {
                writer.write_all(&[c as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}

/// Canonical text of `payload`: sorted keys, spaced separators, ASCII only
pub fn canonical_json(payload: &serde_json::Value) -> EscrowResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, CanonicalFormatter);
    payload.serialize(&mut serializer)?;
    Ok(out)
}

/// Object store kept in process memory
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    failing_puts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` puts fail as unavailable
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Raw stored bytes, for inspection
    pub async fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, data: Vec<u8>) -> Result<String, StorageError> {
        let failing = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Unavailable("injected failure".to_string()));
        }

        let key = content_key(&data);
        self.objects.write().await.insert(key.clone(), data);
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

/// A downloaded object, classified by its leading byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredPayload {
    Encrypted(Vec<u8>),
    Plain(Vec<u8>),
}

impl StoredPayload {
    pub fn classify(bytes: Vec<u8>) -> Self {
        if ecies::is_encrypted(&bytes) {
            Self::Encrypted(bytes)
        } else {
            Self::Plain(bytes)
        }
    }

    /// Plaintext bytes, decrypting with `secret` when needed
    pub fn open(self, secret: Option<&SecretKey>, shared_mac_data: &[u8]) -> EscrowResult<Vec<u8>> {
        match self {
            Self::Plain(bytes) => Ok(bytes),
            Self::Encrypted(blob) => {
                let secret = secret.ok_or_else(|| {
                    EscrowError::decryption("payload is encrypted and no private key was given")
                })?;
                ecies::decrypt(&blob, secret, shared_mac_data)
            }
        }
    }
}

/// Where an uploaded payload ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPayload {
    /// SHA-1 hex of the canonical JSON text
    pub hash: String,
    pub key: String,
}

/// JSON payload upload and download over an [`ObjectStore`]
#[derive(Clone)]
pub struct PayloadStore {
    store: Arc<dyn ObjectStore>,
    sleeper: Arc<dyn Sleeper>,
    retry: RetryPolicy,
    shared_mac_data: Vec<u8>,
}

impl PayloadStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        sleeper: Arc<dyn Sleeper>,
        retry: RetryPolicy,
        shared_mac_data: Vec<u8>,
    ) -> Self {
        Self {
            store,
            sleeper,
            retry,
            shared_mac_data,
        }
    }

    /// Serialize `payload` canonically, encrypt it to `recipient` if given,
    /// and store it
    pub async fn upload(
        &self,
        payload: &serde_json::Value,
        recipient: Option<&PublicKey>,
    ) -> EscrowResult<UploadedPayload> {
        let plaintext = canonical_json(payload)?;
        let hash = sha1_hex(&plaintext);
        let body = match recipient {
            Some(public) => ecies::encrypt(&plaintext, public, &self.shared_mac_data)?,
            None => plaintext,
        };

        let store = &self.store;
        let key = with_backoff(&self.retry, self.sleeper.as_ref(), "upload", || {
            let data = body.clone();
            async move { store.put(data).await }
        })
        .await?;

        info!(
            "Uploaded {} payload {} ({} bytes)",
            if recipient.is_some() { "encrypted" } else { "plain" },
            key,
            body.len()
        );
        Ok(UploadedPayload { hash, key })
    }

    /// Fetch and parse the payload at `key`, decrypting when it is encrypted
    pub async fn download(
        &self,
        key: &str,
        secret: Option<&SecretKey>,
    ) -> EscrowResult<serde_json::Value> {
        let bytes = self.store.get(key).await?;
        let payload = StoredPayload::classify(bytes);
        debug!(
            "Downloaded {} ({})",
            key,
            if matches!(payload, StoredPayload::Encrypted(_)) {
                "encrypted"
            } else {
                "plain"
            }
        );
        let plaintext = payload.open(secret, &self.shared_mac_data)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::KeyPair, retry::RecordingSleeper};
    use serde_json::json;
    use std::time::Duration;

    const MAC: &[u8] = b"9da0d3721774843193737244a0f3355191f66ff7321e83eae83f7f746eb34350";

    fn payloads(store: Arc<MemoryStore>, sleeper: RecordingSleeper) -> PayloadStore {
        PayloadStore::new(
            store,
            Arc::new(sleeper),
            RetryPolicy::new(3, Duration::from_secs(1), 2.0),
            MAC.to_vec(),
        )
    }

    #[test]
    fn test_content_key() {
        assert_eq!(
            content_key(b"abc"),
            "s3a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_canonical_json_text() {
        let doc = json!({"b": 2, "a": [1, 2, 3], "c": {"z": null, "y": true}});
        assert_eq!(
            canonical_json(&doc).unwrap(),
            br#"{"a": [1, 2, 3], "b": 2, "c": {"y": true, "z": null}}"#.to_vec()
        );

        let text = json!({"x": "caf\u{e9} \u{20ac}\u{1f600}", "q": "a\"b\n"});
        assert_eq!(
            String::from_utf8(canonical_json(&text).unwrap()).unwrap(),
            r#"{"q": "a\"b\n", "x": "caf\u00e9 \u20ac\ud83d\ude00"}"#
        );
    }

    #[tokio::test]
    async fn test_encrypted_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let payloads = payloads(store.clone(), RecordingSleeper::new());
        let pair = KeyPair::generate();
        let doc = json!({"b": 2, "a": [1, 2, 3]});

        let uploaded = payloads.upload(&doc, Some(pair.public())).await.unwrap();
        assert_eq!(uploaded.hash, "b7572d0fe99573dcb28892d9c4e3a325dd0cccc5");
        assert!(uploaded.key.starts_with(KEY_PREFIX));

        let raw = store.raw(&uploaded.key).await.unwrap();
        assert!(ecies::is_encrypted(&raw));

        let back = payloads.download(&uploaded.key, Some(pair.secret())).await.unwrap();
        assert_eq!(back, doc);
    }

    #[tokio::test]
    async fn test_plain_payload_needs_no_key() {
        let store = Arc::new(MemoryStore::new());
        let payloads = payloads(store.clone(), RecordingSleeper::new());
        let doc = json!({"results": [0, 1]});

        let uploaded = payloads.upload(&doc, None).await.unwrap();
        assert!(!ecies::is_encrypted(&store.raw(&uploaded.key).await.unwrap()));
        assert_eq!(payloads.download(&uploaded.key, None).await.unwrap(), doc);
    }

    #[tokio::test]
    async fn test_encrypted_payload_without_key_fails() {
        let payloads = payloads(Arc::new(MemoryStore::new()), RecordingSleeper::new());
        let pair = KeyPair::generate();
        let uploaded = payloads.upload(&json!({}), Some(pair.public())).await.unwrap();

        assert!(matches!(
            payloads.download(&uploaded.key, None).await,
            Err(EscrowError::Decryption(_))
        ));
        let stranger = KeyPair::generate();
        assert!(matches!(
            payloads.download(&uploaded.key, Some(stranger.secret())).await,
            Err(EscrowError::Decryption(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_retries_transient_failures() {
        let store = Arc::new(MemoryStore::new());
        let sleeper = RecordingSleeper::new();
        let payloads = payloads(store.clone(), sleeper.clone());
        store.fail_next_puts(2);

        payloads.upload(&json!({"x": 1}), None).await.unwrap();
        assert_eq!(
            sleeper.recorded(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_upload_gives_up() {
        let store = Arc::new(MemoryStore::new());
        let payloads = payloads(store.clone(), RecordingSleeper::new());
        store.fail_next_puts(10);

        assert!(matches!(
            payloads.upload(&json!({"x": 1}), None).await,
            Err(EscrowError::Storage(StorageError::Unavailable(_)))
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let payloads = payloads(Arc::new(MemoryStore::new()), RecordingSleeper::new());
        assert!(matches!(
            payloads.download("s3missing", None).await,
            Err(EscrowError::Storage(StorageError::NotFound(_)))
        ));
    }
}
