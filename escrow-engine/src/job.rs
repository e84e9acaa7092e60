//! Escrow job lifecycle
//!
//! A [`Job`] drives one escrow through its states on the ledger:
//!
//! ```text
//! Launched -> Pending -> Partial* -> Paid -> Complete
//!     \          \
//!      +----------+--> Cancelled (or aborted: contract destroyed)
//! ```
//!
//! The ledger is authoritative. Every lifecycle method reads the current
//! status before acting, submits through the raffle dispatcher, and then
//! reads status and balance back to confirm the expected transition. A
//! transaction that was included but never produced a receipt is settled by
//! that same read-back; it is never sent again. Any failure along the way is
//! logged and reported as `false`; only credential and crypto errors are
//! returned as errors.

use std::sync::Arc;

use rust_decimal::Decimal;
use secp256k1::{PublicKey, SecretKey};
use tracing::{error, info, warn};

use crate::{
    config::EscrowConfig,
    credentials::Credential,
    dispatch::{DispatchOutcome, Dispatcher, Operation},
    error::EscrowError,
    ledger::{Address, ContractCall, Ledger, LedgerEvent, LedgerQuery, Receipt},
    models::{Manifest, Payout, SetupParams, Status},
    registry,
    retry::{RetryPolicy, Sleeper, TokioSleeper},
    storage::{ObjectStore, PayloadStore, UploadedPayload},
    units::{checked_total, from_base_units, stake_to_percent, to_base_units},
    EscrowResult,
};

/// Collaborators shared by jobs
#[derive(Clone)]
pub struct JobContext {
    pub ledger: Arc<dyn Ledger>,
    pub storage: Arc<dyn ObjectStore>,
    pub sleeper: Arc<dyn Sleeper>,
    pub config: Arc<EscrowConfig>,
}

impl JobContext {
    pub fn new(ledger: Arc<dyn Ledger>, storage: Arc<dyn ObjectStore>, config: Arc<EscrowConfig>) -> Self {
        Self {
            ledger,
            storage,
            sleeper: Arc::new(TokioSleeper),
            config,
        }
    }

    /// Replace the sleeper used between retry rounds
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }
}

/// One escrow job and the credentials that operate it
pub struct Job {
    ledger: Arc<dyn Ledger>,
    config: Arc<EscrowConfig>,
    dispatcher: Dispatcher,
    payloads: PayloadStore,
    credential: Credential,
    fallback_credentials: Vec<Credential>,
    retry: RetryPolicy,
    manifest: Option<Manifest>,
    amount: Option<Decimal>,
    escrow_address: Option<Address>,
    factory_address: Option<Address>,
    manifest_url: Option<String>,
    manifest_hash: Option<String>,
    last_status: Option<Status>,
    payouts_made: u64,
}

impl Job {
    fn from_parts(ctx: JobContext, credential: Credential, fallback_credentials: Vec<Credential>) -> Self {
        let dispatcher = Dispatcher::new(
            ctx.ledger.clone(),
            ctx.sleeper.clone(),
            ctx.config.dispatcher.clone(),
        );
        let payloads = PayloadStore::new(
            ctx.storage.clone(),
            ctx.sleeper.clone(),
            ctx.config.storage_retry.clone(),
            ctx.config.shared_mac_data.clone(),
        );
        Self {
            ledger: ctx.ledger,
            retry: ctx.config.retry.clone(),
            factory_address: ctx.config.factory_address,
            config: ctx.config,
            dispatcher,
            payloads,
            credential,
            fallback_credentials,
            manifest: None,
            amount: None,
            escrow_address: None,
            manifest_url: None,
            manifest_hash: None,
            last_status: None,
            payouts_made: 0,
        }
    }

    /// Prepare a new job from a manifest; nothing touches the ledger yet
    pub fn new(
        ctx: JobContext,
        credential: Credential,
        fallback_credentials: Vec<Credential>,
        manifest: Manifest,
    ) -> EscrowResult<Self> {
        let amount = manifest.amount()?;
        to_base_units(amount)?;
        stake_to_percent(manifest.oracle_stake)?;

        let mut job = Self::from_parts(ctx, credential, fallback_credentials);
        job.amount = Some(amount);
        job.manifest = Some(manifest);
        Ok(job)
    }

    /// Bind to an escrow that already exists on the ledger
    ///
    /// Reads the manifest pointer from the escrow. With `manifest_key`, the
    /// manifest itself is downloaded so `setup` and `amount` work as for a
    /// job created with [`Job::new`].
    pub async fn attach(
        ctx: JobContext,
        credential: Credential,
        fallback_credentials: Vec<Credential>,
        escrow_address: Address,
        factory_address: Option<Address>,
        manifest_key: Option<&SecretKey>,
    ) -> EscrowResult<Self> {
        let mut job = Self::from_parts(ctx, credential, fallback_credentials);
        if factory_address.is_some() {
            job.factory_address = factory_address;
        }

        let deployed = job
            .ledger
            .read_state(&escrow_address, LedgerQuery::HasCode)
            .await?
            .as_bool()?;
        if !deployed {
            return Err(EscrowError::invalid_state(format!(
                "no escrow deployed at {}",
                escrow_address
            )));
        }
        job.escrow_address = Some(escrow_address);
        job.read_status().await?;

        let url = job.read_text(LedgerQuery::ManifestUrl).await?;
        if !url.is_empty() {
            job.manifest_hash = Some(job.read_text(LedgerQuery::ManifestHash).await?);
            job.manifest_url = Some(url.clone());

            if let Some(key) = manifest_key {
                let manifest = Manifest::from_value(job.payloads.download(&url, Some(key)).await?)?;
                job.amount = Some(manifest.amount()?);
                job.manifest = Some(manifest);
            }
        }

        info!(
            "Attached to escrow {} ({:?})",
            escrow_address, job.last_status
        );
        Ok(job)
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn fallback_credentials(&self) -> &[Credential] {
        &self.fallback_credentials
    }

    pub fn escrow_address(&self) -> Option<Address> {
        self.escrow_address
    }

    pub fn factory_address(&self) -> Option<Address> {
        self.factory_address
    }

    pub fn manifest_url(&self) -> Option<&str> {
        self.manifest_url.as_deref()
    }

    pub fn manifest_hash(&self) -> Option<&str> {
        self.manifest_hash.as_deref()
    }

    /// Amount to fund the escrow with
    pub fn amount(&self) -> Option<Decimal> {
        self.amount
    }

    /// Status seen by the most recent ledger read
    pub fn last_status(&self) -> Option<Status> {
        self.last_status
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Retry policy for subsequent lifecycle operations
    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry = policy;
    }

    /// Create the escrow and upload the manifest encrypted to `recipient`
    pub async fn launch(&mut self, recipient: &PublicKey) -> bool {
        self.launch_with_handlers(recipient, &[]).await
    }

    /// [`Job::launch`] with extra trusted handlers besides the sender
    pub async fn launch_with_handlers(&mut self, recipient: &PublicKey, trusted_handlers: &[Address]) -> bool {
        let result = self.try_launch(recipient, trusted_handlers).await;
        self.report("launch", result)
    }

    /// Fund the escrow and configure it from the manifest
    pub async fn setup(&mut self) -> bool {
        match self.manifest_setup_params() {
            Ok(params) => self.setup_with(params).await,
            Err(e) => self.report("setup", Err(e)),
        }
    }

    /// Fund the escrow and configure it with explicit parameters
    pub async fn setup_with(&mut self, params: SetupParams) -> bool {
        let result = self.try_setup(params).await;
        self.report("setup", result)
    }

    /// Pay out using the configured final results encryption
    pub async fn bulk_payout(&mut self, payouts: &[Payout], results: &serde_json::Value, recipient: &PublicKey) -> bool {
        let encrypt = self.config.encrypt_final_results;
        self.bulk_payout_with(payouts, results, recipient, encrypt).await
    }

    /// Pay every payout line in one transaction and record final results
    pub async fn bulk_payout_with(
        &mut self,
        payouts: &[Payout],
        results: &serde_json::Value,
        recipient: &PublicKey,
        encrypt: bool,
    ) -> bool {
        let result = self
            .try_bulk_payout(payouts, results, encrypt.then_some(recipient))
            .await;
        self.report("bulk_payout", result)
    }

    /// Record intermediate results, encrypted to `recipient`
    pub async fn store_intermediate_results(&mut self, results: &serde_json::Value, recipient: &PublicKey) -> bool {
        let result = self.try_store_intermediate_results(results, recipient).await;
        self.report("store_intermediate_results", result)
    }

    /// Finalize a fully paid escrow
    pub async fn complete(&mut self) -> bool {
        let result = self.try_complete().await;
        self.report("complete", result)
    }

    /// Destroy the escrow and refund the launcher; only before any payout
    pub async fn abort(&mut self) -> bool {
        let result = self.try_withdraw(ContractCall::Abort).await;
        self.report("abort", result)
    }

    /// Cancel the escrow and refund the launcher; only before any payout
    pub async fn cancel(&mut self) -> bool {
        let result = self.try_withdraw(ContractCall::Cancel).await;
        self.report("cancel", result)
    }

    /// Let more addresses operate the escrow
    pub async fn add_trusted_handlers(&mut self, handlers: &[Address]) -> bool {
        let result = self.try_add_trusted_handlers(handlers).await;
        self.report("add_trusted_handlers", result)
    }

    /// Publish `public` as the encryption key of the job's credential
    pub async fn publish_public_key(&mut self, public: &PublicKey) -> bool {
        let result = self.try_publish_public_key(public).await;
        self.report("publish_public_key", result)
    }

    /// Encryption key `owner` has published, to use as a payload recipient
    pub async fn registered_public_key(&self, owner: &Address) -> EscrowResult<PublicKey> {
        registry::lookup_public_key(self.ledger.as_ref(), &self.config.kvstore_address, owner)
            .await?
            .ok_or_else(|| {
                EscrowError::invalid_public_key(format!("no public key registered for {}", owner))
            })
    }

    /// Current status on the ledger, `None` if it cannot be read
    pub async fn status(&mut self) -> Option<Status> {
        match self.read_status().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Failed to read escrow status: {}", e);
                None
            }
        }
    }

    /// Current escrow balance in tokens, `None` if it cannot be read
    pub async fn balance(&self) -> Option<Decimal> {
        let units = match self.read_balance_units().await {
            Ok(units) => units,
            Err(e) => {
                warn!("Failed to read escrow balance: {}", e);
                return None;
            }
        };
        from_base_units(units).ok()
    }

    /// Download the manifest, decrypting with `secret`
    pub async fn manifest(&self, secret: &SecretKey) -> EscrowResult<serde_json::Value> {
        let mut url = match self.read_text(LedgerQuery::ManifestUrl).await {
            Ok(url) => url,
            // No escrow yet: only the local locator exists
            Err(EscrowError::InvalidState(_)) => String::new(),
            Err(e) => {
                warn!("Failed to read manifest url from the ledger: {}", e);
                return Err(e);
            }
        };
        if url.is_empty() {
            url = self
                .manifest_url
                .clone()
                .ok_or_else(|| EscrowError::invalid_state("no manifest has been uploaded"))?;
        }
        self.payloads.download(&url, Some(secret)).await
    }

    /// Download intermediate results, decrypting with `secret`
    pub async fn intermediate_results(&self, secret: &SecretKey) -> EscrowResult<serde_json::Value> {
        self.download_recorded(LedgerQuery::IntermediateResultsUrl, secret).await
    }

    /// Download final results, decrypting with `secret` when encrypted
    pub async fn final_results(&self, secret: &SecretKey) -> EscrowResult<serde_json::Value> {
        self.download_recorded(LedgerQuery::FinalResultsUrl, secret).await
    }

    async fn try_launch(&mut self, recipient: &PublicKey, trusted_handlers: &[Address]) -> EscrowResult<()> {
        if let Some(escrow) = self.escrow_address {
            return Err(EscrowError::invalid_state(format!(
                "job already launched at {}",
                escrow
            )));
        }
        let manifest = self
            .manifest
            .as_ref()
            .ok_or_else(|| EscrowError::invalid_state("no manifest to launch"))?
            .to_value()?;

        let UploadedPayload { hash, key } = self.payloads.upload(&manifest, Some(recipient)).await?;
        self.manifest_url = Some(key);
        self.manifest_hash = Some(hash);

        let factory = self.ensure_factory().await?;
        let receipt = self
            .dispatch_for_receipt(
                factory,
                ContractCall::CreateEscrow {
                    trusted_handlers: trusted_handlers.to_vec(),
                },
            )
            .await?;
        let escrow = receipt
            .events
            .iter()
            .find_map(|event| match event {
                LedgerEvent::EscrowLaunched { escrow } => Some(*escrow),
                _ => None,
            })
            .ok_or_else(|| EscrowError::state_mismatch("EscrowLaunched event", "none"))?;
        self.escrow_address = Some(escrow);
        info!("Launched escrow {} from factory {}", escrow, factory);

        self.expect_state(Status::Launched, Some(0)).await
    }

    async fn ensure_factory(&mut self) -> EscrowResult<Address> {
        if let Some(factory) = self.factory_address {
            return Ok(factory);
        }

        let receipt = self
            .dispatch_for_receipt(Address::ZERO, ContractCall::DeployFactory)
            .await?;
        let factory = receipt
            .events
            .iter()
            .find_map(|event| match event {
                LedgerEvent::FactoryDeployed { factory } => Some(*factory),
                _ => None,
            })
            .ok_or_else(|| EscrowError::state_mismatch("FactoryDeployed event", "none"))?;

        let deployed = self
            .ledger
            .read_state(&factory, LedgerQuery::HasCode)
            .await?
            .as_bool()?;
        if !deployed {
            return Err(EscrowError::state_mismatch("factory code", "none"));
        }
        info!("Deployed escrow factory {}", factory);
        self.factory_address = Some(factory);
        Ok(factory)
    }

    fn manifest_setup_params(&self) -> EscrowResult<SetupParams> {
        let manifest = self
            .manifest
            .as_ref()
            .ok_or_else(|| EscrowError::invalid_state("setup needs a manifest"))?;
        let (manifest_url, manifest_hash) = match (&self.manifest_url, &self.manifest_hash) {
            (Some(url), Some(hash)) => (url.clone(), hash.clone()),
            _ => return Err(EscrowError::invalid_state("manifest has not been uploaded")),
        };
        Ok(SetupParams {
            reputation_oracle: manifest.reputation_oracle_addr,
            recording_oracle: manifest.recording_oracle_addr,
            reputation_oracle_stake: manifest.oracle_stake,
            recording_oracle_stake: manifest.oracle_stake,
            manifest_url,
            manifest_hash,
        })
    }

    /// Funding and configuration are two transactions. A setup interrupted
    /// between them is resumed by checking the balance instead of funding
    /// again.
    async fn try_setup(&mut self, params: SetupParams) -> EscrowResult<()> {
        let escrow = self.require_escrow()?;
        let status = self.read_status().await?;
        if !status.can_setup() {
            return Err(EscrowError::invalid_state(format!(
                "setup requires Launched, escrow is {}",
                status
            )));
        }

        let amount = self
            .amount
            .ok_or_else(|| EscrowError::invalid_state("funding amount unknown"))?;
        let units = to_base_units(amount)?;
        let reputation_stake = stake_to_percent(params.reputation_oracle_stake)?;
        let recording_stake = stake_to_percent(params.recording_oracle_stake)?;
        if reputation_stake as u16 + recording_stake as u16 > 100 {
            return Err(EscrowError::amount("oracle stakes add up to more than 1"));
        }

        let funded = self.read_balance_units().await?;
        if funded == 0 {
            let token = self.config.token_address;
            self.dispatch(token, ContractCall::Transfer { to: escrow, amount: units })
                .await?;
            let after = self.read_balance_units().await?;
            if after != units {
                return Err(EscrowError::state_mismatch(
                    format!("balance {}", units),
                    format!("balance {}", after),
                ));
            }
            info!("Funded escrow {} with {}", escrow, amount);
        } else if funded != units {
            return Err(EscrowError::state_mismatch(
                format!("balance 0 or {}", units),
                format!("balance {}", funded),
            ));
        } else {
            info!("Escrow {} already funded, configuring only", escrow);
        }

        self.dispatch(
            escrow,
            ContractCall::Setup {
                reputation_oracle: params.reputation_oracle,
                recording_oracle: params.recording_oracle,
                reputation_oracle_stake: reputation_stake,
                recording_oracle_stake: recording_stake,
                manifest_url: params.manifest_url.clone(),
                manifest_hash: params.manifest_hash.clone(),
            },
        )
        .await?;
        self.manifest_url = Some(params.manifest_url);
        self.manifest_hash = Some(params.manifest_hash);

        self.expect_state(Status::Pending, Some(units)).await
    }

    async fn try_bulk_payout(
        &mut self,
        payouts: &[Payout],
        results: &serde_json::Value,
        recipient: Option<&PublicKey>,
    ) -> EscrowResult<()> {
        let escrow = self.require_escrow()?;
        let status = self.read_status().await?;
        if !status.can_pay_out() {
            return Err(EscrowError::invalid_state(format!(
                "payout requires Pending or Partial, escrow is {}",
                status
            )));
        }
        if payouts.is_empty() {
            return Err(EscrowError::invalid_state("no payouts given"));
        }

        let amounts = payouts
            .iter()
            .map(|payout| to_base_units(payout.amount))
            .collect::<EscrowResult<Vec<u128>>>()?;
        let total = checked_total(&amounts)?;
        let balance = self.read_balance_units().await?;
        if total > balance {
            return Err(EscrowError::invalid_state(format!(
                "payout total {} exceeds balance {}",
                from_base_units(total)?,
                from_base_units(balance)?
            )));
        }

        let remaining = balance - total;
        let expected = if remaining == 0 {
            Status::Paid
        } else {
            Status::Partial
        };
        status.validate_transition(expected)?;

        let UploadedPayload { hash, key } = self.payloads.upload(results, recipient).await?;
        self.payouts_made += 1;
        self.dispatch(
            escrow,
            ContractCall::BulkPayout {
                recipients: payouts.iter().map(|payout| payout.recipient).collect(),
                amounts,
                url: key,
                hash,
                tx_id: self.payouts_made,
            },
        )
        .await?;

        self.expect_state(expected, Some(remaining)).await?;

        let paid = self
            .ledger
            .read_state(&escrow, LedgerQuery::BulkPaid)
            .await?
            .as_bool()?;
        if !paid {
            return Err(EscrowError::state_mismatch("bulk paid", "not paid"));
        }
        Ok(())
    }

    async fn try_store_intermediate_results(
        &mut self,
        results: &serde_json::Value,
        recipient: &PublicKey,
    ) -> EscrowResult<()> {
        let escrow = self.require_escrow()?;
        let status = self.read_status().await?;
        if !status.can_store_results() {
            return Err(EscrowError::invalid_state(format!(
                "cannot store results while {}",
                status
            )));
        }

        let UploadedPayload { hash, key } = self.payloads.upload(results, Some(recipient)).await?;
        self.dispatch(
            escrow,
            ContractCall::StoreResults {
                url: key.clone(),
                hash,
            },
        )
        .await?;

        let recorded = self.read_text(LedgerQuery::IntermediateResultsUrl).await?;
        if recorded != key {
            return Err(EscrowError::state_mismatch(key, recorded));
        }
        self.expect_state(status, None).await
    }

    async fn try_complete(&mut self) -> EscrowResult<()> {
        let escrow = self.require_escrow()?;
        let status = self.read_status().await?;
        if !status.can_complete() {
            return Err(EscrowError::invalid_state(format!(
                "complete requires Paid, escrow is {}",
                status
            )));
        }
        self.dispatch(escrow, ContractCall::Complete).await?;
        self.expect_state(Status::Complete, None).await
    }

    async fn try_withdraw(&mut self, call: ContractCall) -> EscrowResult<()> {
        let escrow = self.require_escrow()?;
        let status = self.read_status().await?;
        if !status.can_withdraw() {
            return Err(EscrowError::invalid_state(format!(
                "{} requires Launched or Pending, escrow is {}",
                call.name(),
                status
            )));
        }

        let aborting = matches!(call, ContractCall::Abort);
        self.dispatch(escrow, call).await?;

        if aborting {
            let deployed = self
                .ledger
                .read_state(&escrow, LedgerQuery::HasCode)
                .await?
                .as_bool()?;
            if deployed {
                return Err(EscrowError::state_mismatch("escrow destroyed", "code present"));
            }
            self.last_status = None;
            Ok(())
        } else {
            self.expect_state(Status::Cancelled, Some(0)).await
        }
    }

    async fn try_add_trusted_handlers(&mut self, handlers: &[Address]) -> EscrowResult<()> {
        let escrow = self.require_escrow()?;
        self.dispatch(
            escrow,
            ContractCall::AddTrustedHandlers {
                handlers: handlers.to_vec(),
            },
        )
        .await?;

        for handler in handlers {
            let trusted = self
                .ledger
                .read_state(&escrow, LedgerQuery::IsTrustedHandler(*handler))
                .await?
                .as_bool()?;
            if !trusted {
                return Err(EscrowError::state_mismatch(
                    format!("{} trusted", handler),
                    "untrusted",
                ));
            }
        }
        Ok(())
    }

    async fn try_publish_public_key(&mut self, public: &PublicKey) -> EscrowResult<()> {
        let kvstore = self.config.kvstore_address;
        self.dispatch(kvstore, registry::publish_call(public)).await?;

        let owner = self.credential.address();
        let published = registry::lookup_public_key(self.ledger.as_ref(), &kvstore, &owner).await?;
        if published != Some(*public) {
            return Err(EscrowError::state_mismatch(
                format!("public key of {} published", owner),
                "different or no key",
            ));
        }
        Ok(())
    }

    /// Submit through the raffle, adopting whichever credential succeeded
    ///
    /// `None` means the transaction was included without a receipt; callers
    /// settle it from ledger state.
    async fn dispatch(&mut self, contract: Address, call: ContractCall) -> EscrowResult<Option<Receipt>> {
        let operation = Operation::new(contract, call);
        let outcome = self
            .dispatcher
            .submit(&operation, &self.credential, &self.fallback_credentials, &self.retry)
            .await;

        match outcome {
            DispatchOutcome::Confirmed {
                receipt,
                credential,
                ..
            } => {
                if credential.address() != self.credential.address() {
                    info!(
                        "Switching job credential from {} to {}",
                        self.credential.address(),
                        credential.address()
                    );
                    self.credential = credential;
                }
                Ok(Some(receipt))
            }
            DispatchOutcome::Unconfirmed {
                credential, nonce, ..
            } => {
                warn!(
                    "{} from {} included at nonce {} without a receipt; settling from ledger state",
                    operation.call.name(),
                    credential.address(),
                    nonce
                );
                self.credential = credential;
                Ok(None)
            }
            DispatchOutcome::Exhausted {
                attempts,
                last_error,
            } => Err(EscrowError::transaction(format!(
                "{} failed after {} attempts: {}",
                operation.call.name(),
                attempts,
                last_error
            ))),
        }
    }

    /// [`Job::dispatch`] for calls whose receipt events are needed
    async fn dispatch_for_receipt(&mut self, contract: Address, call: ContractCall) -> EscrowResult<Receipt> {
        let method = call.name();
        self.dispatch(contract, call).await?.ok_or_else(|| {
            EscrowError::transaction(format!("{} included but its receipt never arrived", method))
        })
    }

    async fn expect_state(&mut self, expected: Status, balance: Option<u128>) -> EscrowResult<()> {
        let status = self.read_status().await?;
        if status != expected {
            return Err(EscrowError::state_mismatch(expected, status));
        }
        if let Some(expected_balance) = balance {
            let observed = self.read_balance_units().await?;
            if observed != expected_balance {
                return Err(EscrowError::state_mismatch(
                    format!("balance {}", expected_balance),
                    format!("balance {}", observed),
                ));
            }
        }
        Ok(())
    }

    fn require_escrow(&self) -> EscrowResult<Address> {
        self.escrow_address
            .ok_or_else(|| EscrowError::invalid_state("job has not been launched"))
    }

    async fn read_status(&mut self) -> EscrowResult<Status> {
        let escrow = self.require_escrow()?;
        let code = self
            .ledger
            .read_state(&escrow, LedgerQuery::Status)
            .await?
            .as_uint()?;
        let status = Status::from_code(code)
            .ok_or_else(|| EscrowError::internal(format!("unknown status code {}", code)))?;
        self.last_status = Some(status);
        Ok(status)
    }

    async fn read_balance_units(&self) -> EscrowResult<u128> {
        let escrow = self.require_escrow()?;
        Ok(self
            .ledger
            .read_state(&escrow, LedgerQuery::Balance)
            .await?
            .as_uint()?)
    }

    async fn read_text(&self, query: LedgerQuery) -> EscrowResult<String> {
        let escrow = self.require_escrow()?;
        Ok(self.ledger.read_state(&escrow, query).await?.into_text()?)
    }

    async fn download_recorded(&self, query: LedgerQuery, secret: &SecretKey) -> EscrowResult<serde_json::Value> {
        let url = self.read_text(query.clone()).await?;
        if url.is_empty() {
            return Err(EscrowError::invalid_state(format!(
                "nothing recorded for {:?}",
                query
            )));
        }
        self.payloads.download(&url, Some(secret)).await
    }

    fn report(&self, operation: &str, result: EscrowResult<()>) -> bool {
        match result {
            Ok(()) => {
                info!(
                    "{} succeeded (escrow {:?}, status {:?})",
                    operation, self.escrow_address, self.last_status
                );
                true
            }
            Err(e @ (EscrowError::InvalidState(_) | EscrowError::StateMismatch { .. })) => {
                warn!("{} not applied: {}", operation, e);
                false
            }
            Err(e) => {
                error!("{} failed: {}", operation, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::KeyPair,
        ledger::MemoryLedger,
        retry::RecordingSleeper,
        storage::MemoryStore,
    };
    use serde_json::json;
    use std::{str::FromStr, time::Duration};

    const UNIT: u128 = 1_000_000_000_000_000_000;

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        store: Arc<MemoryStore>,
        ctx: JobContext,
        credential: Credential,
    }

    async fn fixture() -> Fixture {
        let config = EscrowConfig::default();
        let ledger = Arc::new(MemoryLedger::new(config.token_address));
        let store = Arc::new(MemoryStore::new());
        let credential = Credential::from_secret(*KeyPair::generate().secret());
        ledger.mint(credential.address(), 1_000 * UNIT).await;

        let ctx = JobContext::new(ledger.clone(), store.clone(), Arc::new(config))
            .with_sleeper(Arc::new(RecordingSleeper::new()));
        Fixture {
            ledger,
            store,
            ctx,
            credential,
        }
    }

    fn manifest() -> Manifest {
        Manifest::from_value(json!({
            "task_bid_price": "1.0",
            "job_total_tasks": 100,
            "oracle_stake": "0.05",
            "reputation_oracle_addr": "0x61F9F0B31eacB420553da8BCC59DC617279731Ac",
            "recording_oracle_addr": "0x6b7E3C31F34cF38d1DFC1D9A8A59482028395809"
        }))
        .unwrap()
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn test_new_rejects_bad_stake() {
        let f = fixture().await;
        let mut bad = manifest();
        bad.oracle_stake = dec("0.055");
        assert!(matches!(
            Job::new(f.ctx, f.credential, vec![], bad),
            Err(EscrowError::Amount(_))
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_before_launch_fails() {
        let f = fixture().await;
        let mut job = Job::new(f.ctx, f.credential, vec![], manifest()).unwrap();
        assert!(!job.setup().await);
        assert!(!job.complete().await);
        assert!(!job.abort().await);
        assert_eq!(job.status().await, None);
        assert!(f.ledger.submissions().await.is_empty());
    }

    #[tokio::test]
    async fn test_launch_then_setup() {
        let f = fixture().await;
        let recipient = KeyPair::generate();
        let mut job = Job::new(f.ctx, f.credential, vec![], manifest()).unwrap();

        assert!(job.launch(recipient.public()).await);
        assert_eq!(job.last_status(), Some(Status::Launched));
        assert!(job.factory_address().is_some());
        let key = job.manifest_url().unwrap().to_string();
        assert!(f.store.raw(&key).await.is_some());

        assert!(job.setup().await);
        assert_eq!(job.status().await, Some(Status::Pending));
        assert_eq!(job.balance().await, Some(dec("100")));
        assert_eq!(job.manifest(recipient.secret()).await.unwrap()["job_total_tasks"], 100);
    }

    #[tokio::test]
    async fn test_setup_resumes_after_funding() {
        let f = fixture().await;
        let recipient = KeyPair::generate();
        let mut job = Job::new(f.ctx, f.credential.clone(), vec![], manifest()).unwrap();
        assert!(job.launch(recipient.public()).await);
        let escrow = job.escrow_address().unwrap();

        // Fund out of band, as if setup died after the transfer
        let transfer = Operation::new(
            f.ledger.token_address(),
            ContractCall::Transfer {
                to: escrow,
                amount: 100 * UNIT,
            },
        );
        let outcome = job
            .dispatcher
            .submit(&transfer, &f.credential, &[], &RetryPolicy::none())
            .await;
        assert!(outcome.is_confirmed());

        assert!(job.setup().await);
        assert_eq!(job.balance().await, Some(dec("100")));
        assert_eq!(f.ledger.token_balance(&f.credential.address()).await, 900 * UNIT);
    }

    #[tokio::test]
    async fn test_store_intermediate_results_keeps_status() {
        let f = fixture().await;
        let recipient = KeyPair::generate();
        let mut job = Job::new(f.ctx, f.credential, vec![], manifest()).unwrap();
        assert!(job.launch(recipient.public()).await);
        assert!(!job.store_intermediate_results(&json!({"a": 1}), recipient.public()).await);
        assert!(job.setup().await);

        let results = json!({"results": [true, false]});
        assert!(job.store_intermediate_results(&results, recipient.public()).await);
        assert_eq!(job.status().await, Some(Status::Pending));
        assert_eq!(job.intermediate_results(recipient.secret()).await.unwrap(), results);
    }

    #[tokio::test]
    async fn test_plaintext_final_results() {
        let f = fixture().await;
        let recipient = KeyPair::generate();
        let worker = Credential::from_secret(*KeyPair::generate().secret()).address();
        let mut job = Job::new(f.ctx, f.credential, vec![], manifest()).unwrap();
        assert!(job.launch(recipient.public()).await);
        assert!(job.setup().await);

        let results = json!({"final": "answers"});
        let payouts = [Payout::new(worker, dec("100"))];
        assert!(job.bulk_payout_with(&payouts, &results, recipient.public(), false).await);

        let stranger = KeyPair::generate();
        assert_eq!(job.final_results(stranger.secret()).await.unwrap(), results);
    }

    #[tokio::test]
    async fn test_cancel_refunds_launcher() {
        let f = fixture().await;
        let recipient = KeyPair::generate();
        let launcher = f.credential.address();
        let mut job = Job::new(f.ctx, f.credential, vec![], manifest()).unwrap();
        assert!(job.launch(recipient.public()).await);
        assert!(job.setup().await);
        assert_eq!(f.ledger.token_balance(&launcher).await, 900 * UNIT);

        assert!(job.cancel().await);
        assert_eq!(job.status().await, Some(Status::Cancelled));
        assert_eq!(f.ledger.token_balance(&launcher).await, 1_000 * UNIT);
        assert!(!job.cancel().await);
    }

    #[tokio::test]
    async fn test_add_trusted_handlers() {
        let f = fixture().await;
        let recipient = KeyPair::generate();
        let handler = Credential::from_secret(*KeyPair::generate().secret()).address();
        let mut job = Job::new(f.ctx, f.credential, vec![], manifest()).unwrap();
        assert!(!job.add_trusted_handlers(&[handler]).await);
        assert!(job.launch(recipient.public()).await);
        assert!(job.add_trusted_handlers(&[handler]).await);
    }

    #[tokio::test]
    async fn test_payout_without_receipt_is_not_repeated() {
        let f = fixture().await;
        let recipient = KeyPair::generate();
        let worker = Credential::from_secret(*KeyPair::generate().secret()).address();
        let fallback = Credential::from_secret(*KeyPair::generate().secret());

        let mut config = EscrowConfig::default();
        config.dispatcher.receipt_timeout = Duration::from_millis(50);
        let ctx = JobContext::new(f.ledger.clone(), f.store.clone(), Arc::new(config))
            .with_sleeper(Arc::new(RecordingSleeper::new()));
        let mut job = Job::new(ctx, f.credential.clone(), vec![fallback.clone()], manifest()).unwrap();
        assert!(job.launch_with_handlers(recipient.public(), &[fallback.address()]).await);
        assert!(job.setup().await);

        // The payout is mined but its receipt never comes back
        f.ledger.withhold_receipts(f.credential.address()).await;
        let payouts = [Payout::new(worker, dec("20"))];
        assert!(job.bulk_payout(&payouts, &json!({"done": 1}), recipient.public()).await);

        assert_eq!(job.status().await, Some(Status::Partial));
        assert_eq!(job.balance().await, Some(dec("80")));
        assert_eq!(f.ledger.token_balance(&worker).await, 18 * UNIT);
        assert!(!f.ledger.submissions().await.contains(&fallback.address()));
        assert_eq!(job.credential().address(), f.credential.address());
    }

    #[tokio::test]
    async fn test_launch_without_escrow_event_fails() {
        let f = fixture().await;
        let recipient = KeyPair::generate();
        f.ledger.ignore_method("createEscrow").await;

        let mut job = Job::new(f.ctx, f.credential, vec![], manifest()).unwrap();
        assert!(!job.launch(recipient.public()).await);
        assert_eq!(job.escrow_address(), None);
    }

    #[tokio::test]
    async fn test_setup_fails_when_configuration_does_not_land() {
        let f = fixture().await;
        let recipient = KeyPair::generate();
        let launcher = f.credential.address();
        let mut job = Job::new(f.ctx, f.credential, vec![], manifest()).unwrap();
        assert!(job.launch(recipient.public()).await);

        // Funding goes through, configuration is acknowledged but not applied
        f.ledger.ignore_method("setup").await;
        assert!(!job.setup().await);
        assert_eq!(job.status().await, Some(Status::Launched));
        assert_eq!(job.balance().await, Some(dec("100")));

        // A retry configures without funding twice
        f.ledger.clear_faults().await;
        assert!(job.setup().await);
        assert_eq!(job.status().await, Some(Status::Pending));
        assert_eq!(f.ledger.token_balance(&launcher).await, 900 * UNIT);
    }

    #[tokio::test]
    async fn test_payout_fails_when_nothing_was_paid() {
        let f = fixture().await;
        let recipient = KeyPair::generate();
        let worker = Credential::from_secret(*KeyPair::generate().secret()).address();
        let mut job = Job::new(f.ctx, f.credential, vec![], manifest()).unwrap();
        assert!(job.launch(recipient.public()).await);
        assert!(job.setup().await);

        f.ledger.ignore_method("bulkPayOut").await;
        let payouts = [Payout::new(worker, dec("20"))];
        assert!(!job.bulk_payout(&payouts, &json!({}), recipient.public()).await);
        assert_eq!(job.status().await, Some(Status::Pending));
        assert_eq!(job.balance().await, Some(dec("100")));
        assert_eq!(f.ledger.token_balance(&worker).await, 0);
    }

    #[tokio::test]
    async fn test_published_key_is_usable_as_recipient() {
        let f = fixture().await;
        let keys = KeyPair::generate();
        let owner = f.credential.address();
        let mut job = Job::new(f.ctx, f.credential, vec![], manifest()).unwrap();

        assert!(matches!(
            job.registered_public_key(&owner).await,
            Err(EscrowError::InvalidPublicKey(_))
        ));
        assert!(job.publish_public_key(keys.public()).await);

        let recipient = job.registered_public_key(&owner).await.unwrap();
        assert_eq!(&recipient, keys.public());
        assert!(job.launch(&recipient).await);
        assert_eq!(job.manifest(keys.secret()).await.unwrap()["job_total_tasks"], 100);
    }

    #[tokio::test]
    async fn test_manifest_surfaces_ledger_errors() {
        let f = fixture().await;
        let recipient = KeyPair::generate();
        let mut job = Job::new(f.ctx, f.credential, vec![], manifest()).unwrap();
        assert!(job.launch(recipient.public()).await);
        assert!(job.manifest(recipient.secret()).await.is_ok());

        assert!(job.abort().await);
        assert!(matches!(
            job.manifest(recipient.secret()).await,
            Err(EscrowError::Ledger(_))
        ));
    }
}
