//! Raffle transaction dispatcher
//!
//! Submits one contract call, trying the primary credential and then each
//! fallback in order. A whole pass over the candidates is a round; failed
//! rounds are retried after an exponentially growing wait. The first
//! credential whose transaction is mined successfully wins.
//!
//! A receipt timeout is ambiguous: the transaction may still have been
//! included. After a timeout the signer's nonce is read again, and if it
//! moved past the one used, rotation stops with
//! [`DispatchOutcome::Unconfirmed`]. The caller settles that case by reading
//! ledger state and never by sending the operation again.

use std::{sync::Arc, time::Duration};

use tracing::{error, info, warn};

use crate::{
    credentials::Credential,
    error::EscrowError,
    ledger::{Address, ContractCall, Ledger, Receipt, UnsignedTransaction},
    retry::{RetryPolicy, Sleeper},
    EscrowResult,
};

/// Submission settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub gas_limit: u64,
    /// How long to wait for a receipt before abandoning an attempt
    pub receipt_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            gas_limit: 4_712_388,
            receipt_timeout: Duration::from_secs(240),
        }
    }
}

/// A contract call aimed at a contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub contract: Address,
    pub call: ContractCall,
}

impl Operation {
    pub fn new(contract: Address, call: ContractCall) -> Self {
        Self { contract, call }
    }
}

/// Result of a dispatch
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Mined successfully; `credential` signed the winning transaction
    Confirmed {
        receipt: Receipt,
        credential: Credential,
        attempts: u32,
    },
    /// Included on the ledger (nonce consumed) but no receipt arrived
    Unconfirmed {
        credential: Credential,
        nonce: u64,
        attempts: u32,
    },
    /// Every credential failed in every round
    Exhausted { attempts: u32, last_error: String },
}

impl DispatchOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Confirmed { attempts, .. }
            | Self::Unconfirmed { attempts, .. }
            | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Result of one signed submission
enum Attempt {
    Mined(Receipt),
    /// Receipt timed out after the nonce was consumed
    Included { nonce: u64 },
}

/// Primary first, then fallbacks, skipping repeated addresses
pub fn raffle_order<'a>(primary: &'a Credential, fallbacks: &'a [Credential]) -> Vec<&'a Credential> {
    let mut order = vec![primary];
    for candidate in fallbacks {
        if !order.iter().any(|c| c.address() == candidate.address()) {
            order.push(candidate);
        }
    }
    order
}

/// Signs and submits operations with credential raffling
#[derive(Clone)]
pub struct Dispatcher {
    ledger: Arc<dyn Ledger>,
    sleeper: Arc<dyn Sleeper>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(ledger: Arc<dyn Ledger>, sleeper: Arc<dyn Sleeper>, config: DispatcherConfig) -> Self {
        Self {
            ledger,
            sleeper,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Submit `operation`, raffling over `primary` and `fallbacks`
    pub async fn submit(
        &self,
        operation: &Operation,
        primary: &Credential,
        fallbacks: &[Credential],
        policy: &RetryPolicy,
    ) -> DispatchOutcome {
        let candidates = raffle_order(primary, fallbacks);
        let method = operation.call.name();
        let mut attempts = 0;
        let mut last_error = String::new();

        for round in 0..=policy.retries {
            if round > 0 {
                let delay = policy.delay_for(round - 1);
                warn!(
                    "(x{}) {} to {} failed with every credential. Retrying in {:?}",
                    round, method, operation.contract, delay
                );
                self.sleeper.sleep(delay).await;
            }

            for credential in &candidates {
                attempts += 1;
                match self.attempt(operation, credential).await {
                    Ok(Attempt::Mined(receipt)) => {
                        info!(
                            "{} to {} confirmed in block {} signed by {}",
                            method,
                            operation.contract,
                            receipt.block_number,
                            credential.address()
                        );
                        return DispatchOutcome::Confirmed {
                            receipt,
                            credential: (*credential).clone(),
                            attempts,
                        };
                    }
                    Ok(Attempt::Included { nonce }) => {
                        warn!(
                            "{} to {} signed by {} was included at nonce {} without a receipt; not resubmitting",
                            method,
                            operation.contract,
                            credential.address(),
                            nonce
                        );
                        return DispatchOutcome::Unconfirmed {
                            credential: (*credential).clone(),
                            nonce,
                            attempts,
                        };
                    }
                    Err(e) => {
                        warn!(
                            "{} signed by {} failed: {}",
                            method,
                            credential.address(),
                            e
                        );
                        last_error = e.to_string();
                    }
                }
            }
        }

        error!(
            "{} to {} exhausted after {} attempts: {}",
            method, operation.contract, attempts, last_error
        );
        DispatchOutcome::Exhausted {
            attempts,
            last_error,
        }
    }

    /// One signed submission with a fresh nonce
    async fn attempt(&self, operation: &Operation, credential: &Credential) -> EscrowResult<Attempt> {
        let from = credential.address();
        let nonce = self.ledger.get_nonce(&from).await?;
        let transaction = UnsignedTransaction {
            from,
            to: operation.contract,
            call: operation.call.clone(),
            nonce,
            gas: self.config.gas_limit,
        };
        let signed = credential.sign(transaction)?;

        let receipt = match tokio::time::timeout(
            self.config.receipt_timeout,
            self.ledger.submit_transaction(signed),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return self.after_timeout(&from, nonce).await,
        };

        if !receipt.success {
            return Err(EscrowError::transaction(format!(
                "transaction {} reverted",
                receipt.tx_hash
            )));
        }
        Ok(Attempt::Mined(receipt))
    }

    /// Decide whether a transaction whose receipt timed out was included
    async fn after_timeout(&self, from: &Address, nonce: u64) -> EscrowResult<Attempt> {
        match self.ledger.get_nonce(from).await {
            Ok(current) if current > nonce => Ok(Attempt::Included { nonce }),
            Ok(_) => Err(EscrowError::transaction(format!(
                "no receipt within {:?}",
                self.config.receipt_timeout
            ))),
            Err(e) => {
                // Inclusion unknown: never resubmit
                warn!("Nonce of {} unreadable after timeout: {}", from, e);
                Ok(Attempt::Included { nonce })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::KeyPair,
        ledger::{LedgerEvent, MemoryLedger},
        retry::RecordingSleeper,
    };

    fn credential() -> Credential {
        Credential::from_secret(*KeyPair::generate().secret())
    }

    fn token() -> Address {
        "0x9b0ff099c4e8df24ec077e0ccd46571f915afb25".parse().unwrap()
    }

    fn dispatcher(ledger: Arc<MemoryLedger>, sleeper: RecordingSleeper) -> Dispatcher {
        Dispatcher::new(
            ledger,
            Arc::new(sleeper),
            DispatcherConfig {
                gas_limit: 4_712_388,
                receipt_timeout: Duration::from_millis(50),
            },
        )
    }

    fn deploy() -> Operation {
        Operation::new(Address::ZERO, ContractCall::DeployFactory)
    }

    #[test]
    fn test_raffle_order_dedups() {
        let a = credential();
        let b = credential();
        let fallbacks = vec![a.clone(), b.clone(), b.clone()];
        let order: Vec<Address> = raffle_order(&a, &fallbacks)
            .iter()
            .map(|c| c.address())
            .collect();
        assert_eq!(order, vec![a.address(), b.address()]);
    }

    #[tokio::test]
    async fn test_primary_wins_first_try() {
        let ledger = Arc::new(MemoryLedger::new(token()));
        let sleeper = RecordingSleeper::new();
        let dispatcher = dispatcher(ledger.clone(), sleeper.clone());
        let primary = credential();

        let outcome = dispatcher
            .submit(&deploy(), &primary, &[credential()], &RetryPolicy::none())
            .await;

        match outcome {
            DispatchOutcome::Confirmed {
                receipt,
                credential,
                attempts,
            } => {
                assert_eq!(credential.address(), primary.address());
                assert_eq!(attempts, 1);
                assert!(matches!(receipt.events[0], LedgerEvent::FactoryDeployed { .. }));
            }
            other => panic!("expected confirmation, got {:?}", other),
        }
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_third_credential_wins() {
        let ledger = Arc::new(MemoryLedger::new(token()));
        let sleeper = RecordingSleeper::new();
        let dispatcher = dispatcher(ledger.clone(), sleeper.clone());
        let primary = credential();
        let second = credential();
        let third = credential();
        ledger.reject_signer(primary.address()).await;
        ledger.reject_signer(second.address()).await;

        let outcome = dispatcher
            .submit(
                &deploy(),
                &primary,
                &[second.clone(), third.clone()],
                &RetryPolicy::new(2, Duration::from_secs(1), 2.0),
            )
            .await;

        match outcome {
            DispatchOutcome::Confirmed {
                credential,
                attempts,
                ..
            } => {
                assert_eq!(credential.address(), third.address());
                assert_eq!(attempts, 3);
            }
            other => panic!("expected confirmation, got {:?}", other),
        }
        assert_eq!(
            ledger.submissions().await,
            vec![primary.address(), second.address(), third.address()]
        );
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_follows_backoff_schedule() {
        let ledger = Arc::new(MemoryLedger::new(token()));
        let sleeper = RecordingSleeper::new();
        let dispatcher = dispatcher(ledger.clone(), sleeper.clone());
        let primary = credential();
        let fallback = credential();
        ledger.reject_signer(primary.address()).await;
        ledger.reject_signer(fallback.address()).await;

        let policy = RetryPolicy::new(3, Duration::from_millis(10), 2.0);
        let outcome = dispatcher
            .submit(&deploy(), &primary, &[fallback], &policy)
            .await;

        assert!(!outcome.is_confirmed());
        assert_eq!(outcome.attempts(), 8);
        assert_eq!(
            sleeper.recorded(),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_retries_means_single_round() {
        let ledger = Arc::new(MemoryLedger::new(token()));
        let sleeper = RecordingSleeper::new();
        let dispatcher = dispatcher(ledger.clone(), sleeper.clone());
        let primary = credential();
        ledger.reject_signer(primary.address()).await;

        let outcome = dispatcher
            .submit(&deploy(), &primary, &[], &RetryPolicy::none())
            .await;

        assert_eq!(outcome.attempts(), 1);
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_receipt_times_out_to_fallback() {
        let ledger = Arc::new(MemoryLedger::new(token()));
        let dispatcher = dispatcher(ledger.clone(), RecordingSleeper::new());
        let primary = credential();
        let fallback = credential();
        ledger.stall_signer(primary.address()).await;

        let outcome = dispatcher
            .submit(&deploy(), &primary, &[fallback.clone()], &RetryPolicy::none())
            .await;

        match outcome {
            DispatchOutcome::Confirmed { credential, .. } => {
                assert_eq!(credential.address(), fallback.address())
            }
            other => panic!("expected confirmation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_included_without_receipt_stops_rotation() {
        let ledger = Arc::new(MemoryLedger::new(token()));
        let sleeper = RecordingSleeper::new();
        let dispatcher = dispatcher(ledger.clone(), sleeper.clone());
        let primary = credential();
        let fallback = credential();
        let recipient = credential().address();
        ledger.mint(primary.address(), 10).await;
        ledger.mint(fallback.address(), 10).await;
        ledger.withhold_receipts(primary.address()).await;

        let transfer = Operation::new(token(), ContractCall::Transfer { to: recipient, amount: 4 });
        let outcome = dispatcher
            .submit(
                &transfer,
                &primary,
                &[fallback.clone()],
                &RetryPolicy::new(2, Duration::from_millis(1), 2.0),
            )
            .await;

        match outcome {
            DispatchOutcome::Unconfirmed {
                credential,
                nonce,
                attempts,
            } => {
                assert_eq!(credential.address(), primary.address());
                assert_eq!(nonce, 0);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected unconfirmed, got {:?}", other),
        }
        // Applied once, never repeated by the fallback
        assert_eq!(ledger.token_balance(&recipient).await, 4);
        assert_eq!(ledger.submissions().await, vec![primary.address()]);
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_reverts_use_fresh_nonces() {
        let ledger = Arc::new(MemoryLedger::new(token()));
        let dispatcher = dispatcher(ledger.clone(), RecordingSleeper::new());
        let primary = credential();

        // Unfunded transfer: mined but reverted every time
        let transfer = Operation::new(
            token(),
            ContractCall::Transfer {
                to: credential().address(),
                amount: 1,
            },
        );
        let outcome = dispatcher
            .submit(
                &transfer,
                &primary,
                &[],
                &RetryPolicy::new(2, Duration::from_millis(1), 1.0),
            )
            .await;

        assert!(!outcome.is_confirmed());
        assert_eq!(ledger.get_nonce(&primary.address()).await.unwrap(), 3);
    }
}
