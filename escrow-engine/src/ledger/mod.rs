//! Ledger collaborator interface
//!
//! The ledger (a deployed escrow contract plus its factory and token) is the
//! only durable store and the only source of truth for escrow state. This
//! module defines what the engine sends to it and reads from it; it never
//! reimplements contract rules.

pub mod memory;

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message, PublicKey, Secp256k1,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::{
    crypto::keys::{public_key_to_bytes, strip_hex_prefix},
    error::EscrowError,
    EscrowResult,
};

pub use memory::MemoryLedger;

/// Keccak-256 digest
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// 20-byte account or contract address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Address owned by a public key: last 20 bytes of keccak(point)
    pub fn from_public_key(public: &PublicKey) -> Self {
        let digest = keccak256(&public_key_to_bytes(public));
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[12..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// EIP-55 mixed-case checksum encoding
    pub fn to_checksum(&self) -> String {
        let lower = hex::encode(self.0);
        let digest = keccak256(lower.as_bytes());

        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for (i, c) in lower.chars().enumerate() {
            let nibble = (digest[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
            if c.is_ascii_alphabetic() && nibble >= 8 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_checksum())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_checksum())
    }
}

impl FromStr for Address {
    type Err = EscrowError;

    /// Accepts any letter case; checksums are compared by value, not by casing
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = strip_hex_prefix(s.trim());
        if trimmed.len() != 40 {
            return Err(EscrowError::invalid_credential(format!(
                "address must be 40 hex characters: {}",
                s
            )));
        }
        let decoded = hex::decode(trimmed)
            .map_err(|e| EscrowError::invalid_credential(format!("bad address {}: {}", s, e)))?;
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_checksum())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// State-changing contract methods the engine invokes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum ContractCall {
    /// Deploy a new escrow factory (sent to the zero address)
    DeployFactory,
    /// Factory: create an escrow, trusting the sender plus `trusted_handlers`
    CreateEscrow { trusted_handlers: Vec<Address> },
    /// Token: move `amount` base units from the sender to `to`
    Transfer { to: Address, amount: u128 },
    /// Escrow: extend the trusted handler set
    AddTrustedHandlers { handlers: Vec<Address> },
    /// Escrow: configure oracles, stakes (percent) and the manifest pointer
    Setup {
        reputation_oracle: Address,
        recording_oracle: Address,
        reputation_oracle_stake: u8,
        recording_oracle_stake: u8,
        manifest_url: String,
        manifest_hash: String,
    },
    /// Escrow: record intermediate results
    StoreResults { url: String, hash: String },
    /// Escrow: pay every recipient and record final results
    BulkPayout {
        recipients: Vec<Address>,
        amounts: Vec<u128>,
        url: String,
        hash: String,
        tx_id: u64,
    },
    Complete,
    Abort,
    Cancel,
    /// Key-value store: set `key` under the sender's namespace
    SetKv { key: String, value: String },
}

impl ContractCall {
    /// Contract method name, for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeployFactory => "deployFactory",
            Self::CreateEscrow { .. } => "createEscrow",
            Self::Transfer { .. } => "transfer",
            Self::AddTrustedHandlers { .. } => "addTrustedHandlers",
            Self::Setup { .. } => "setup",
            Self::StoreResults { .. } => "storeResults",
            Self::BulkPayout { .. } => "bulkPayOut",
            Self::Complete => "complete",
            Self::Abort => "abort",
            Self::Cancel => "cancel",
            Self::SetKv { .. } => "set",
        }
    }
}

/// Read-only contract queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerQuery {
    Status,
    Balance,
    ManifestUrl,
    ManifestHash,
    IntermediateResultsUrl,
    FinalResultsUrl,
    BulkPaid,
    IsTrustedHandler(Address),
    /// Whether code is deployed at the address
    HasCode,
    /// Key-value store: `key` in `owner`'s namespace, empty when unset
    KvGet { owner: Address, key: String },
}

/// Value returned by a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerValue {
    Uint(u128),
    Bool(bool),
    Text(String),
}

impl LedgerValue {
    pub fn as_uint(&self) -> Result<u128, LedgerError> {
        match self {
            Self::Uint(v) => Ok(*v),
            other => Err(LedgerError::unexpected("uint", other)),
        }
    }

    pub fn as_bool(&self) -> Result<bool, LedgerError> {
        match self {
            Self::Bool(v) => Ok(*v),
            other => Err(LedgerError::unexpected("bool", other)),
        }
    }

    pub fn into_text(self) -> Result<String, LedgerError> {
        match self {
            Self::Text(v) => Ok(v),
            other => Err(LedgerError::unexpected("text", &other)),
        }
    }
}

/// Events emitted by a confirmed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    FactoryDeployed { factory: Address },
    EscrowLaunched { escrow: Address },
    Transfer { from: Address, to: Address, amount: u128 },
    BulkTransfer { tx_id: u64, bulk_count: usize },
}

/// Confirmation that a transaction was mined
#[derive(Debug, Clone)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_number: u64,
    /// False when the transaction was mined but reverted
    pub success: bool,
    pub events: Vec<LedgerEvent>,
    pub confirmed_at: DateTime<Utc>,
}

/// Transaction before signing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub from: Address,
    pub to: Address,
    pub call: ContractCall,
    pub nonce: u64,
    pub gas: u64,
}

impl UnsignedTransaction {
    /// Digest that gets signed: keccak of the canonical JSON encoding
    pub fn signing_hash(&self) -> EscrowResult<[u8; 32]> {
        Ok(keccak256(&serde_json::to_vec(self)?))
    }
}

/// Transaction with a recoverable secp256k1 signature
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub transaction: UnsignedTransaction,
    pub signature: [u8; 64],
    pub recovery_id: i32,
    pub hash: String,
}

impl SignedTransaction {
    /// Address whose key produced the signature
    pub fn recover_signer(&self) -> EscrowResult<Address> {
        let digest = self.transaction.signing_hash()?;
        let message = Message::from_digest_slice(&digest)
            .map_err(|e| EscrowError::internal(format!("signing digest: {}", e)))?;
        let recovery_id = RecoveryId::from_i32(self.recovery_id)
            .map_err(|e| EscrowError::transaction(format!("bad recovery id: {}", e)))?;
        let signature = RecoverableSignature::from_compact(&self.signature, recovery_id)
            .map_err(|e| EscrowError::transaction(format!("bad signature: {}", e)))?;
        let public = Secp256k1::verification_only()
            .recover_ecdsa(&message, &signature)
            .map_err(|e| EscrowError::transaction(format!("signature recovery failed: {}", e)))?;
        Ok(Address::from_public_key(&public))
    }
}

/// Errors reported by the ledger collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Refused before inclusion (bad signature, nonce, unknown signer)
    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// No contract deployed at the queried address
    #[error("no contract at {0}")]
    NoContract(Address),

    /// Node unreachable or misbehaving
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// A read returned a value of the wrong type
    #[error("expected {expected} value, got {got}")]
    UnexpectedValue { expected: String, got: String },
}

impl LedgerError {
    fn unexpected(expected: &str, got: &LedgerValue) -> Self {
        Self::UnexpectedValue {
            expected: expected.to_string(),
            got: format!("{:?}", got),
        }
    }
}

/// The external ledger
///
/// `submit_transaction` resolves once the transaction is mined (receipt) or
/// refused; callers bound the wait with their own timeout.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn submit_transaction(&self, signed: SignedTransaction) -> Result<Receipt, LedgerError>;

    async fn read_state(&self, contract: &Address, query: LedgerQuery) -> Result<LedgerValue, LedgerError>;

    /// Pending transaction count for `address`
    async fn get_nonce(&self, address: &Address) -> Result<u64, LedgerError>;
}
