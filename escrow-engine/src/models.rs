//! Core data models for the escrow engine
//!
//! This module contains the escrow status machine as the ledger reports it,
//! the job manifest, and the parameter types of the lifecycle operations.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{error::EscrowError, ledger::Address, EscrowResult};

/// Escrow status enum, in the ledger's numeric order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Escrow exists but is not yet funded or configured
    Launched,
    /// Funded and configured, awaiting payouts
    Pending,
    /// At least one payout made, funds remain
    Partial,
    /// Balance fully paid out
    Paid,
    /// Finalized after payout
    Complete,
    /// Cancelled, funds refunded to the launcher
    Cancelled,
}

impl Status {
    /// Decode the ledger's status code
    pub fn from_code(code: u128) -> Option<Self> {
        match code {
            0 => Some(Self::Launched),
            1 => Some(Self::Pending),
            2 => Some(Self::Partial),
            3 => Some(Self::Paid),
            4 => Some(Self::Complete),
            5 => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Launched => 0,
            Self::Pending => 1,
            Self::Partial => 2,
            Self::Paid => 3,
            Self::Complete => 4,
            Self::Cancelled => 5,
        }
    }

    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled)
    }

    /// Check if this state allows funding and configuration
    pub fn can_setup(&self) -> bool {
        matches!(self, Self::Launched)
    }

    /// Check if this state allows payouts
    pub fn can_pay_out(&self) -> bool {
        matches!(self, Self::Pending | Self::Partial)
    }

    /// Check if this state accepts intermediate results
    pub fn can_store_results(&self) -> bool {
        matches!(self, Self::Pending | Self::Partial)
    }

    pub fn can_complete(&self) -> bool {
        matches!(self, Self::Paid)
    }

    /// Check if this state allows abort or cancel (nothing paid out yet)
    pub fn can_withdraw(&self) -> bool {
        matches!(self, Self::Launched | Self::Pending)
    }

    /// Validate a status transition
    pub fn validate_transition(&self, to: Status) -> EscrowResult<()> {
        let valid = match (self, to) {
            (Self::Launched, Self::Pending) => true,
            (Self::Launched, Self::Cancelled) => true,
            (Self::Pending, Self::Partial) => true,
            (Self::Pending, Self::Paid) => true,
            (Self::Pending, Self::Cancelled) => true,
            (Self::Partial, Self::Partial) => true,
            (Self::Partial, Self::Paid) => true,
            (Self::Paid, Self::Complete) => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(EscrowError::invalid_state(format!(
                "Invalid status transition {} -> {}",
                self, to
            )))
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Job manifest
///
/// The engine reads the pricing and oracle fields; everything else a
/// requester puts in the manifest is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub task_bid_price: Decimal,
    pub job_total_tasks: u64,
    /// Fraction of each payout owed to each oracle, e.g. `0.05`
    pub oracle_stake: Decimal,
    pub reputation_oracle_addr: Address,
    pub recording_oracle_addr: Address,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Manifest {
    pub fn from_value(value: serde_json::Value) -> EscrowResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> EscrowResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Funded amount: bid price times task count
    pub fn amount(&self) -> EscrowResult<Decimal> {
        if self.task_bid_price.is_sign_negative() {
            return Err(EscrowError::amount("task_bid_price must not be negative"));
        }
        self.task_bid_price
            .checked_mul(Decimal::from(self.job_total_tasks))
            .ok_or_else(|| EscrowError::amount("manifest amount overflows"))
    }
}

/// A single payout line in a bulk payout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub recipient: Address,
    pub amount: Decimal,
}

impl Payout {
    pub fn new(recipient: Address, amount: Decimal) -> Self {
        Self { recipient, amount }
    }
}

/// Oracle configuration applied by `setup`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupParams {
    pub reputation_oracle: Address,
    pub recording_oracle: Address,
    /// Fractions in `[0, 1]`
    pub reputation_oracle_stake: Decimal,
    pub recording_oracle_stake: Decimal,
    pub manifest_url: String,
    pub manifest_hash: String,
}
