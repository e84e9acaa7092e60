//! Engine configuration
//!
//! Every setting has a default. `EscrowConfig::from_env` overlays
//! `ESCROW_*` environment variables on top of those defaults, e.g.
//! `ESCROW_GAS_LIMIT=6700000` or `ESCROW_RETRIES=4`.

use std::time::Duration;

use serde::Deserialize;

use crate::{
    dispatch::DispatcherConfig,
    error::EscrowError,
    ledger::Address,
    logging::LoggingConfig,
    retry::RetryPolicy,
    EscrowResult,
};

/// Default authenticated data bound into every ECIES tag
pub const DEFAULT_SHARED_MAC: &str = "9da0d3721774843193737244a0f3355191f66ff7321e83eae83f7f746eb34350";

/// Default payment token contract
pub const DEFAULT_TOKEN_ADDRESS: &str = "0x9b0ff099c4e8df24ec077e0ccd46571f915afb25";

/// Default key-value store holding published encryption keys
pub const DEFAULT_KVSTORE_ADDRESS: &str = "0xbcF8274FAb0cbeD0099B2cAFe862035a6217Bf44";

/// Configuration shared by every job
#[derive(Debug, Clone)]
pub struct EscrowConfig {
    /// Associated data for ECIES tags; both sides must agree on it
    pub shared_mac_data: Vec<u8>,
    pub token_address: Address,
    /// Key-value store contract for the public key registry
    pub kvstore_address: Address,
    /// Existing factory to create escrows with; deployed on demand if unset
    pub factory_address: Option<Address>,
    pub dispatcher: DispatcherConfig,
    /// Default raffle retry policy for lifecycle operations
    pub retry: RetryPolicy,
    /// Retry policy for storage uploads
    pub storage_retry: RetryPolicy,
    /// Encrypt final results to the recipient key on payout
    pub encrypt_final_results: bool,
    pub logging: LoggingConfig,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            shared_mac_data: DEFAULT_SHARED_MAC.as_bytes().to_vec(),
            token_address: Address::from_bytes([
                0x9b, 0x0f, 0xf0, 0x99, 0xc4, 0xe8, 0xdf, 0x24, 0xec, 0x07, 0x7e, 0x0c, 0xcd, 0x46,
                0x57, 0x1f, 0x91, 0x5a, 0xfb, 0x25,
            ]),
            kvstore_address: Address::from_bytes([
                0xbc, 0xf8, 0x27, 0x4f, 0xab, 0x0c, 0xbe, 0xd0, 0x09, 0x9b, 0x2c, 0xaf, 0xe8, 0x62,
                0x03, 0x5a, 0x62, 0x17, 0xbf, 0x44,
            ]),
            factory_address: None,
            dispatcher: DispatcherConfig::default(),
            retry: RetryPolicy::default(),
            storage_retry: RetryPolicy::new(3, Duration::from_secs(5), 2.0),
            encrypt_final_results: true,
            logging: LoggingConfig::default(),
        }
    }
}

/// Flat settings as read from config sources
#[derive(Debug, Deserialize)]
struct RawSettings {
    shared_mac: String,
    token_address: String,
    kvstore_address: String,
    factory_address: Option<String>,
    gas_limit: u64,
    receipt_timeout_secs: u64,
    retries: u32,
    retry_delay_secs: f64,
    retry_backoff: f64,
    storage_retries: u32,
    storage_retry_delay_secs: f64,
    encrypt_final_results: bool,
    log_filter: String,
}

impl EscrowConfig {
    /// Defaults overlaid with `ESCROW_*` environment variables
    pub fn from_env() -> EscrowResult<Self> {
        Self::from_source(
            config::Environment::with_prefix("ESCROW")
                .prefix_separator("_")
                .try_parsing(true),
        )
    }

    /// Defaults overlaid with an arbitrary config source
    pub fn from_source<S>(source: S) -> EscrowResult<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let defaults = Self::default();
        let settings = config::Config::builder()
            .set_default("shared_mac", DEFAULT_SHARED_MAC)?
            .set_default("token_address", DEFAULT_TOKEN_ADDRESS)?
            .set_default("kvstore_address", DEFAULT_KVSTORE_ADDRESS)?
            .set_default("gas_limit", defaults.dispatcher.gas_limit as i64)?
            .set_default(
                "receipt_timeout_secs",
                defaults.dispatcher.receipt_timeout.as_secs() as i64,
            )?
            .set_default("retries", defaults.retry.retries as i64)?
            .set_default("retry_delay_secs", defaults.retry.delay.as_secs_f64())?
            .set_default("retry_backoff", defaults.retry.backoff)?
            .set_default("storage_retries", defaults.storage_retry.retries as i64)?
            .set_default(
                "storage_retry_delay_secs",
                defaults.storage_retry.delay.as_secs_f64(),
            )?
            .set_default("encrypt_final_results", defaults.encrypt_final_results)?
            .set_default("log_filter", defaults.logging.filter.clone())?
            .add_source(source)
            .build()?;

        let raw: RawSettings = settings.try_deserialize()?;
        Self::from_raw(raw, defaults)
    }

    fn from_raw(raw: RawSettings, defaults: Self) -> EscrowResult<Self> {
        let factory_address = match raw.factory_address.as_deref() {
            Some(addr) if !addr.trim().is_empty() => Some(addr.parse().map_err(|e| {
                EscrowError::config(format!("factory_address: {}", e))
            })?),
            _ => None,
        };

        Ok(Self {
            shared_mac_data: raw.shared_mac.into_bytes(),
            token_address: raw
                .token_address
                .parse()
                .map_err(|e| EscrowError::config(format!("token_address: {}", e)))?,
            kvstore_address: raw
                .kvstore_address
                .parse()
                .map_err(|e| EscrowError::config(format!("kvstore_address: {}", e)))?,
            factory_address,
            dispatcher: DispatcherConfig {
                gas_limit: raw.gas_limit,
                receipt_timeout: Duration::from_secs(raw.receipt_timeout_secs),
            },
            retry: RetryPolicy::new(
                raw.retries,
                seconds("retry_delay_secs", raw.retry_delay_secs)?,
                backoff(raw.retry_backoff)?,
            ),
            storage_retry: RetryPolicy::new(
                raw.storage_retries,
                seconds("storage_retry_delay_secs", raw.storage_retry_delay_secs)?,
                raw.retry_backoff,
            ),
            encrypt_final_results: raw.encrypt_final_results,
            logging: LoggingConfig {
                filter: raw.log_filter,
                ..defaults.logging
            },
        })
    }
}

fn seconds(name: &str, value: f64) -> EscrowResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| EscrowError::config(format!("{}: {}", name, e)))
}

fn backoff(value: f64) -> EscrowResult<f64> {
    if value.is_finite() && value >= 1.0 {
        Ok(value)
    } else {
        Err(EscrowError::config(format!(
            "retry_backoff must be at least 1, got {}",
            value
        )))
    }
}
