//! Escrow job engine for a decentralized task marketplace
//!
//! This crate drives escrow contracts on an external ledger using:
//! - ECIES (secp256k1, AES-128-CTR, HMAC-SHA256) to protect payloads at rest
//! - A status machine mirrored from the ledger and confirmed by read-back
//! - A raffle dispatcher that rotates signing credentials with backoff

pub mod config;
pub mod credentials;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod ledger;
pub mod logging;
pub mod models;
pub mod registry;
pub mod retry;
pub mod storage;
pub mod units;

pub use config::EscrowConfig;
pub use credentials::{validate_credentials, Credential};
pub use error::EscrowError;
pub use job::{Job, JobContext};
pub use models::{Manifest, Payout, SetupParams, Status};

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
