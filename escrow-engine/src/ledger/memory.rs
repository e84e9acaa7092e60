//! In-process ledger
//!
//! Simulates the token, the escrow factory and escrow contracts closely
//! enough to drive the engine end to end: signatures and nonces are checked,
//! failed contract rules revert without side effects, and faults can be
//! injected per signer or per method.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    keccak256, Address, ContractCall, Ledger, LedgerError, LedgerEvent, LedgerQuery, LedgerValue,
    Receipt, SignedTransaction,
};
use crate::models::Status;

/// Most recipients accepted by one bulk payout
pub const BULK_MAX_COUNT: usize = 100;

#[derive(Debug, Clone)]
struct EscrowContract {
    launcher: Address,
    status: Status,
    trusted_handlers: HashSet<Address>,
    reputation_oracle: Option<Address>,
    recording_oracle: Option<Address>,
    reputation_oracle_stake: u8,
    recording_oracle_stake: u8,
    manifest_url: String,
    manifest_hash: String,
    intermediate_results_url: String,
    intermediate_results_hash: String,
    final_results_url: String,
    final_results_hash: String,
    bulk_paid: bool,
}

impl EscrowContract {
    fn new(launcher: Address, handlers: &[Address]) -> Self {
        let mut trusted_handlers: HashSet<Address> = handlers.iter().copied().collect();
        trusted_handlers.insert(launcher);
        Self {
            launcher,
            status: Status::Launched,
            trusted_handlers,
            reputation_oracle: None,
            recording_oracle: None,
            reputation_oracle_stake: 0,
            recording_oracle_stake: 0,
            manifest_url: String::new(),
            manifest_hash: String::new(),
            intermediate_results_url: String::new(),
            intermediate_results_hash: String::new(),
            final_results_url: String::new(),
            final_results_hash: String::new(),
            bulk_paid: false,
        }
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<Address, u128>,
    nonces: HashMap<Address, u64>,
    factories: HashMap<Address, Vec<Address>>,
    escrows: HashMap<Address, EscrowContract>,
    /// Key-value entries by (store contract, owner, key)
    kv: HashMap<(Address, Address, String), String>,
    block_number: u64,
    rejected_signers: HashSet<Address>,
    stalled_signers: HashSet<Address>,
    withheld_receipts: HashSet<Address>,
    noop_methods: HashSet<&'static str>,
    submissions: Vec<Address>,
}

impl LedgerState {
    fn balance(&self, address: &Address) -> u128 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    fn credit(&mut self, address: Address, amount: u128) {
        *self.balances.entry(address).or_insert(0) += amount;
    }

    fn debit(&mut self, address: Address, amount: u128) {
        if let Some(balance) = self.balances.get_mut(&address) {
            *balance -= amount;
        }
    }

    fn trusted_escrow(&self, escrow: &Address, sender: &Address) -> Result<&EscrowContract, String> {
        let contract = self
            .escrows
            .get(escrow)
            .ok_or_else(|| format!("no escrow at {}", escrow))?;
        if !contract.trusted_handlers.contains(sender) {
            return Err(format!("{} is not a trusted handler", sender));
        }
        Ok(contract)
    }
}

/// Contract address created by `creator` at `nonce`
fn contract_address(creator: &Address, nonce: u64) -> Address {
    let mut preimage = creator.as_bytes().to_vec();
    preimage.extend_from_slice(&nonce.to_be_bytes());
    let digest = keccak256(&preimage);
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest[12..]);
    Address::from_bytes(bytes)
}

/// Ledger kept in process memory
pub struct MemoryLedger {
    token: Address,
    state: RwLock<LedgerState>,
}

impl MemoryLedger {
    /// Create a ledger whose payment token lives at `token`
    pub fn new(token: Address) -> Self {
        Self {
            token,
            state: RwLock::new(LedgerState::default()),
        }
    }

    pub fn token_address(&self) -> Address {
        self.token
    }

    /// Credit `amount` token base units to `address`
    pub async fn mint(&self, address: Address, amount: u128) {
        self.state.write().await.credit(address, amount);
    }

    pub async fn token_balance(&self, address: &Address) -> u128 {
        self.state.read().await.balance(address)
    }

    /// Refuse every transaction signed by `signer`
    pub async fn reject_signer(&self, signer: Address) {
        self.state.write().await.rejected_signers.insert(signer);
    }

    /// Never answer transactions signed by `signer`
    pub async fn stall_signer(&self, signer: Address) {
        self.state.write().await.stalled_signers.insert(signer);
    }

    /// Mine transactions signed by `signer` but never return their receipts
    pub async fn withhold_receipts(&self, signer: Address) {
        self.state.write().await.withheld_receipts.insert(signer);
    }

    /// Acknowledge calls to `method` as successful without executing them
    pub async fn ignore_method(&self, method: &'static str) {
        self.state.write().await.noop_methods.insert(method);
    }

    /// Remove injected faults
    pub async fn clear_faults(&self) {
        let mut state = self.state.write().await;
        state.rejected_signers.clear();
        state.stalled_signers.clear();
        state.withheld_receipts.clear();
        state.noop_methods.clear();
    }

    /// Sender of every submission received, in order
    pub async fn submissions(&self) -> Vec<Address> {
        self.state.read().await.submissions.clone()
    }

    /// Run `call` against the state. Validates before mutating so a revert
    /// leaves nothing behind.
    fn execute(
        &self,
        state: &mut LedgerState,
        sender: Address,
        to: Address,
        nonce: u64,
        call: &ContractCall,
    ) -> Result<Vec<LedgerEvent>, String> {
        match call {
            ContractCall::DeployFactory => {
                let factory = contract_address(&sender, nonce);
                state.factories.insert(factory, Vec::new());
                Ok(vec![LedgerEvent::FactoryDeployed { factory }])
            }

            ContractCall::CreateEscrow { trusted_handlers } => {
                if !state.factories.contains_key(&to) {
                    return Err(format!("no factory at {}", to));
                }
                let escrow = contract_address(&sender, nonce);
                state
                    .escrows
                    .insert(escrow, EscrowContract::new(sender, trusted_handlers));
                if let Some(created) = state.factories.get_mut(&to) {
                    created.push(escrow);
                }
                Ok(vec![LedgerEvent::EscrowLaunched { escrow }])
            }

            ContractCall::Transfer {
                to: recipient,
                amount,
            } => {
                if to != self.token {
                    return Err(format!("{} is not the token contract", to));
                }
                if state.balance(&sender) < *amount {
                    return Err("transfer amount exceeds balance".to_string());
                }
                state.debit(sender, *amount);
                state.credit(*recipient, *amount);
                Ok(vec![LedgerEvent::Transfer {
                    from: sender,
                    to: *recipient,
                    amount: *amount,
                }])
            }

            ContractCall::AddTrustedHandlers { handlers } => {
                state.trusted_escrow(&to, &sender)?;
                if let Some(contract) = state.escrows.get_mut(&to) {
                    contract.trusted_handlers.extend(handlers.iter().copied());
                }
                Ok(Vec::new())
            }

            ContractCall::Setup {
                reputation_oracle,
                recording_oracle,
                reputation_oracle_stake,
                recording_oracle_stake,
                manifest_url,
                manifest_hash,
            } => {
                let contract = state.trusted_escrow(&to, &sender)?;
                if contract.status != Status::Launched {
                    return Err(format!("escrow is {}, not Launched", contract.status));
                }
                if state.balance(&to) == 0 {
                    return Err("escrow is not funded".to_string());
                }
                let total_stake = *reputation_oracle_stake as u16 + *recording_oracle_stake as u16;
                if *reputation_oracle_stake > 100 || *recording_oracle_stake > 100 || total_stake > 100 {
                    return Err("stakes exceed 100 percent".to_string());
                }
                if let Some(contract) = state.escrows.get_mut(&to) {
                    contract.reputation_oracle = Some(*reputation_oracle);
                    contract.recording_oracle = Some(*recording_oracle);
                    contract.reputation_oracle_stake = *reputation_oracle_stake;
                    contract.recording_oracle_stake = *recording_oracle_stake;
                    contract.manifest_url = manifest_url.clone();
                    contract.manifest_hash = manifest_hash.clone();
                    contract.status = Status::Pending;
                }
                Ok(Vec::new())
            }

            ContractCall::StoreResults { url, hash } => {
                let contract = state.trusted_escrow(&to, &sender)?;
                if !contract.status.can_store_results() {
                    return Err(format!("cannot store results while {}", contract.status));
                }
                if let Some(contract) = state.escrows.get_mut(&to) {
                    contract.intermediate_results_url = url.clone();
                    contract.intermediate_results_hash = hash.clone();
                }
                Ok(Vec::new())
            }

            ContractCall::BulkPayout {
                recipients,
                amounts,
                url,
                hash,
                tx_id,
            } => {
                let contract = state.trusted_escrow(&to, &sender)?.clone();
                if !contract.status.can_pay_out() {
                    return Err(format!("cannot pay out while {}", contract.status));
                }
                if recipients.len() != amounts.len() {
                    return Err("recipients and amounts differ in length".to_string());
                }
                if recipients.len() > BULK_MAX_COUNT {
                    return Err(format!("more than {} recipients", BULK_MAX_COUNT));
                }
                let total = amounts
                    .iter()
                    .try_fold(0u128, |acc, a| acc.checked_add(*a))
                    .ok_or_else(|| "payout total overflows".to_string())?;
                let balance = state.balance(&to);
                if total > balance {
                    return Err(format!("payout {} exceeds balance {}", total, balance));
                }

                let reputation_oracle = contract.reputation_oracle.unwrap_or(contract.launcher);
                let recording_oracle = contract.recording_oracle.unwrap_or(contract.launcher);
                let mut events = Vec::with_capacity(recipients.len() + 1);
                state.debit(to, total);
                for (recipient, amount) in recipients.iter().zip(amounts) {
                    let reputation_fee = amount * contract.reputation_oracle_stake as u128 / 100;
                    let recording_fee = amount * contract.recording_oracle_stake as u128 / 100;
                    let net = amount - reputation_fee - recording_fee;
                    state.credit(*recipient, net);
                    state.credit(reputation_oracle, reputation_fee);
                    state.credit(recording_oracle, recording_fee);
                    events.push(LedgerEvent::Transfer {
                        from: to,
                        to: *recipient,
                        amount: net,
                    });
                }

                let remaining = state.balance(&to);
                if let Some(contract) = state.escrows.get_mut(&to) {
                    contract.final_results_url = url.clone();
                    contract.final_results_hash = hash.clone();
                    contract.bulk_paid = true;
                    contract.status = if remaining == 0 {
                        Status::Paid
                    } else {
                        Status::Partial
                    };
                }
                events.push(LedgerEvent::BulkTransfer {
                    tx_id: *tx_id,
                    bulk_count: recipients.len(),
                });
                Ok(events)
            }

            ContractCall::Complete => {
                let contract = state.trusted_escrow(&to, &sender)?;
                if !contract.status.can_complete() {
                    return Err(format!("cannot complete while {}", contract.status));
                }
                if let Some(contract) = state.escrows.get_mut(&to) {
                    contract.status = Status::Complete;
                }
                Ok(Vec::new())
            }

            ContractCall::SetKv { key, value } => {
                state.kv.insert((to, sender, key.clone()), value.clone());
                Ok(Vec::new())
            }

            ContractCall::Abort | ContractCall::Cancel => {
                let contract = state.trusted_escrow(&to, &sender)?;
                if !contract.status.can_withdraw() {
                    return Err(format!("cannot {} while {}", call.name(), contract.status));
                }
                let launcher = contract.launcher;
                let refund = state.balance(&to);
                state.debit(to, refund);
                state.credit(launcher, refund);

                if matches!(call, ContractCall::Abort) {
                    // Self-destruct: the contract's code is gone
                    state.escrows.remove(&to);
                    state.balances.remove(&to);
                } else if let Some(contract) = state.escrows.get_mut(&to) {
                    contract.status = Status::Cancelled;
                }
                Ok(vec![LedgerEvent::Transfer {
                    from: to,
                    to: launcher,
                    amount: refund,
                }])
            }
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn submit_transaction(&self, signed: SignedTransaction) -> Result<Receipt, LedgerError> {
        let sender = signed.transaction.from;
        let stalled = {
            let mut state = self.state.write().await;
            state.submissions.push(sender);
            state.stalled_signers.contains(&sender)
        };
        if stalled {
            debug!("Stalling transaction {} from {}", signed.hash, sender);
            std::future::pending::<()>().await;
        }

        let signer = signed
            .recover_signer()
            .map_err(|e| LedgerError::Rejected(e.to_string()))?;
        if signer != sender {
            return Err(LedgerError::Rejected(format!(
                "signature by {} does not match sender {}",
                signer, sender
            )));
        }

        let (receipt, withheld) = {
            let mut state = self.state.write().await;
            if state.rejected_signers.contains(&sender) {
                return Err(LedgerError::Rejected(format!("signer {} refused", sender)));
            }
            let expected_nonce = state.nonces.get(&sender).copied().unwrap_or(0);
            if signed.transaction.nonce != expected_nonce {
                return Err(LedgerError::Rejected(format!(
                    "nonce {} for {}, expected {}",
                    signed.transaction.nonce, sender, expected_nonce
                )));
            }

            state.nonces.insert(sender, expected_nonce + 1);
            state.block_number += 1;
            let block_number = state.block_number;
            let tx = &signed.transaction;

            let (success, events) = if state.noop_methods.contains(tx.call.name()) {
                debug!("Acknowledging {} {} without executing it", tx.call.name(), signed.hash);
                (true, Vec::new())
            } else {
                match self.execute(&mut state, sender, tx.to, tx.nonce, &tx.call) {
                    Ok(events) => {
                        info!("Mined {} {} in block {}", tx.call.name(), signed.hash, block_number);
                        (true, events)
                    }
                    Err(reason) => {
                        warn!("Reverted {} {}: {}", tx.call.name(), signed.hash, reason);
                        (false, Vec::new())
                    }
                }
            };

            let receipt = Receipt {
                tx_hash: signed.hash.clone(),
                block_number,
                success,
                events,
                confirmed_at: Utc::now(),
            };
            (receipt, state.withheld_receipts.contains(&sender))
        };

        if withheld {
            debug!("Withholding receipt of {} from {}", receipt.tx_hash, sender);
            std::future::pending::<()>().await;
        }
        Ok(receipt)
    }

    async fn read_state(&self, contract: &Address, query: LedgerQuery) -> Result<LedgerValue, LedgerError> {
        let state = self.state.read().await;

        match &query {
            LedgerQuery::HasCode => {
                let deployed = *contract == self.token
                    || state.factories.contains_key(contract)
                    || state.escrows.contains_key(contract);
                return Ok(LedgerValue::Bool(deployed));
            }
            LedgerQuery::KvGet { owner, key } => {
                let value = state
                    .kv
                    .get(&(*contract, *owner, key.clone()))
                    .cloned()
                    .unwrap_or_default();
                return Ok(LedgerValue::Text(value));
            }
            _ => {}
        }

        let escrow = state
            .escrows
            .get(contract)
            .ok_or(LedgerError::NoContract(*contract))?;
        let value = match query {
            LedgerQuery::Status => LedgerValue::Uint(escrow.status.code() as u128),
            LedgerQuery::Balance => LedgerValue::Uint(state.balance(contract)),
            LedgerQuery::ManifestUrl => LedgerValue::Text(escrow.manifest_url.clone()),
            LedgerQuery::ManifestHash => LedgerValue::Text(escrow.manifest_hash.clone()),
            LedgerQuery::IntermediateResultsUrl => {
                LedgerValue::Text(escrow.intermediate_results_url.clone())
            }
            LedgerQuery::FinalResultsUrl => LedgerValue::Text(escrow.final_results_url.clone()),
            LedgerQuery::BulkPaid => LedgerValue::Bool(escrow.bulk_paid),
            LedgerQuery::IsTrustedHandler(handler) => {
                LedgerValue::Bool(escrow.trusted_handlers.contains(&handler))
            }
            LedgerQuery::HasCode => LedgerValue::Bool(true),
            LedgerQuery::KvGet { .. } => LedgerValue::Text(String::new()),
        };
        Ok(value)
    }

    async fn get_nonce(&self, address: &Address) -> Result<u64, LedgerError> {
        Ok(self.state.read().await.nonces.get(address).copied().unwrap_or(0))
    }
}
