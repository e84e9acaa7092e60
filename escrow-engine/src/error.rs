//! Error types for the escrow engine
//!
//! Crypto and credential failures are raised to the caller because carrying on
//! would be unsafe. Ledger failures are recovered by the dispatcher and only
//! reach lifecycle callers as a `false` return, so most of the variants below
//! are used internally and logged rather than surfaced.

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::storage::StorageError;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Address does not correspond to the private key it was paired with
    #[error("Credential mismatch: private key does not derive address {address}")]
    CredentialMismatch { address: String },

    /// Malformed address or private key encoding
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// Bytes that do not decode to a point on the curve
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Bad header or failed tag verification
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Every credential and every retry round failed
    #[error("Transaction failure: {0}")]
    Transaction(String),

    /// A submission appeared to succeed but the post-read disagrees
    #[error("State mismatch: expected {expected}, observed {observed}")]
    StateMismatch { expected: String, observed: String },

    /// Lifecycle precondition not met
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Ledger collaborator errors
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Storage collaborator errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token amount conversion errors
    #[error("Amount error: {0}")]
    Amount(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create a credential mismatch error
    pub fn credential_mismatch<S: Into<String>>(address: S) -> Self {
        Self::CredentialMismatch {
            address: address.into(),
        }
    }

    /// Create an invalid credential error
    pub fn invalid_credential<S: Into<String>>(msg: S) -> Self {
        Self::InvalidCredential(msg.into())
    }

    /// Create an invalid public key error
    pub fn invalid_public_key<S: Into<String>>(msg: S) -> Self {
        Self::InvalidPublicKey(msg.into())
    }

    /// Create a decryption error
    pub fn decryption<S: Into<String>>(msg: S) -> Self {
        Self::Decryption(msg.into())
    }

    /// Create a transaction failure
    pub fn transaction<S: Into<String>>(msg: S) -> Self {
        Self::Transaction(msg.into())
    }

    /// Create a state mismatch error
    pub fn state_mismatch<E: ToString, O: ToString>(expected: E, observed: O) -> Self {
        Self::StateMismatch {
            expected: expected.to_string(),
            observed: observed.to_string(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an amount error
    pub fn amount<S: Into<String>>(msg: S) -> Self {
        Self::Amount(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<config::ConfigError> for EscrowError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
