use std::sync::Arc;

use bitcoin::{Address, Network, Txid};
use chrono::Utc;
use ord_config::InscriberConfig;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::{
    inscriber::{
        commit::CommitBuilder,
        fee::InscriberFeeCalculator,
        reveal::RevealBuilder,
        script_builder::{build_envelope, build_leaf_script, InscriptionContent},
        taproot::derive_address,
        types::{CommitRequest, PreparedInscription, RevealRequest, SignedReveal, UnsignedCommit},
        utxo_selector::SelectionOptions,
    },
    metrics::METRICS,
    signer::{KeyManager, KeyPair},
    tracker::{TrackedTransaction, TransactionStatus, TransactionTracker, TransactionType},
    traits::{HealthCheck, TransactionBroadcaster, UtxoSource},
    types::{ChainStatus, FeeRate, InscriberError, InscriptionId, Result, Utxo},
    utils::{log_failure, with_retry, BackoffStrategy, RetryPolicy},
};

pub mod commit;
pub mod fee;
pub mod reveal;
pub mod script_builder;
pub mod taproot;
pub mod test_utils;
pub mod types;
pub mod utxo_selector;

/// What to inscribe.
#[derive(Debug, Clone)]
pub struct InscriptionRequest {
    pub content: InscriptionContent,
    pub content_type: String,
    pub metadata: Vec<(Vec<u8>, Vec<u8>)>,
    pub parent: Option<InscriptionId>,
    /// Falls back to the configured default fee rate.
    pub fee_rate: Option<FeeRate>,
    /// Reveal key to reuse, a fresh one is generated otherwise.
    pub reveal_key: Option<KeyPair>,
}

impl InscriptionRequest {
    pub fn new(content: impl Into<InscriptionContent>, content_type: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            content_type: content_type.into(),
            metadata: Vec::new(),
            parent: None,
            fee_rate: None,
            reveal_key: None,
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: FeeRate) -> Self {
        self.fee_rate = Some(fee_rate);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    pub fn with_parent(mut self, parent: InscriptionId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_reveal_key(mut self, reveal_key: KeyPair) -> Self {
        self.reveal_key = Some(reveal_key);
        self
    }
}

/// Drives an inscription through commit, reveal, broadcast and confirmation.
pub struct Inscriber {
    utxo_source: Arc<dyn UtxoSource>,
    broadcaster: Arc<dyn TransactionBroadcaster>,
    health: Arc<dyn HealthCheck>,
    config: InscriberConfig,
    network: Network,
    retry_policy: RetryPolicy,
    commit_builder: CommitBuilder,
    reveal_builder: RevealBuilder,
    tracker: TransactionTracker,
}

impl Inscriber {
    pub fn new(
        config: InscriberConfig,
        utxo_source: Arc<dyn UtxoSource>,
        broadcaster: Arc<dyn TransactionBroadcaster>,
        health: Arc<dyn HealthCheck>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| InscriberError::InitializationFailed(format!("{e:#}")))?;

        let network = config.network();
        let retry_policy = RetryPolicy {
            max_retries: config.max_retries(),
            base_delay: config.retry_delay(),
            strategy: if config.fixed_retry_delay() {
                BackoffStrategy::Fixed
            } else {
                BackoffStrategy::Exponential
            },
        };

        info!(%network, "Inscriber initialized");
        Ok(Self {
            utxo_source,
            broadcaster,
            health,
            commit_builder: CommitBuilder::new(config.dust_limit()),
            reveal_builder: RevealBuilder::new(config.dust_limit()),
            config,
            network,
            retry_policy,
            tracker: TransactionTracker::new(),
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn tracker(&self) -> &TransactionTracker {
        &self.tracker
    }

    pub fn snapshot(&self) -> Vec<TrackedTransaction> {
        self.tracker.snapshot()
    }

    /// Generates the reveal key, builds the envelope and derives the address to fund.
    #[instrument(skip_all, target = "ord_inscriber::inscriber")]
    pub fn prepare_inscription(&self, request: InscriptionRequest) -> Result<PreparedInscription> {
        let fee_rate = self.fee_rate(request.fee_rate)?;
        let reveal_key = request
            .reveal_key
            .unwrap_or_else(KeyManager::generate_key_pair);

        let mut envelope =
            build_envelope(request.content, &request.content_type, request.metadata)?;
        if let Some(parent) = request.parent {
            envelope = envelope.with_parent(parent);
        }

        let script = build_leaf_script(&envelope, &reveal_key.public_key())?;
        let commitment = derive_address(reveal_key.public_key(), Some(&script), self.network)?;
        let leaf = commitment.leaf.as_ref().ok_or_else(|| {
            InscriberError::InvalidInput("commitment has no envelope leaf".to_string())
        })?;

        let reveal_fee = InscriberFeeCalculator::estimate_reveal_fee(leaf, fee_rate, 1);
        let postage = self.config.postage();
        let required_commit_amount = reveal_fee.fee + postage;

        info!(
            address = %commitment.address,
            reveal_fee = reveal_fee.fee.to_sat(),
            required = required_commit_amount.to_sat(),
            "Inscription prepared"
        );

        Ok(PreparedInscription {
            reveal_key,
            envelope,
            commitment,
            reveal_fee,
            fee_rate,
            postage,
            required_commit_amount,
        })
    }

    /// Builds the unsigned commit funding `prepared` from the UTXOs of `funding_address`.
    #[instrument(skip_all, target = "ord_inscriber::inscriber")]
    pub async fn build_commit(
        &mut self,
        prepared: &PreparedInscription,
        funding_address: &Address,
        change_address: Address,
        fee_rate: Option<FeeRate>,
        selection: SelectionOptions,
    ) -> Result<UnsignedCommit> {
        let fee_rate = self.fee_rate(fee_rate)?;

        let utxo_source = Arc::clone(&self.utxo_source);
        let candidate_utxos = with_retry(
            || utxo_source.fetch_utxos(funding_address),
            &self.retry_policy,
            "fetch_utxos",
        )
        .await
        .map_err(|e| match e {
            InscriberError::UtxoSourceFailure(_) => e,
            other => InscriberError::UtxoSourceFailure(other.to_string()),
        })?;
        debug!(count = candidate_utxos.len(), "Fetched candidate UTXOs");

        let request = CommitRequest {
            commitment: prepared.commitment.clone(),
            candidate_utxos,
            change_address,
            fee_rate,
            network: self.network,
            minimum_commit_amount: prepared.required_commit_amount,
            selection,
        };

        let result = self
            .commit_builder
            .prepare_commit_tracked(&request, &mut self.tracker);
        if let Err(err) = &result {
            log_failure(err, "build_commit");
        }
        result
    }

    /// Builds and signs the reveal spending `commit_utxo`, tracked as a child of `commit_id`.
    #[instrument(skip(self, prepared, commit_utxo, destination_address, change_address), target = "ord_inscriber::inscriber")]
    pub async fn build_reveal(
        &mut self,
        prepared: &PreparedInscription,
        commit_id: &str,
        commit_utxo: Utxo,
        destination_address: Address,
        change_address: Option<Address>,
        fee_rate: Option<FeeRate>,
    ) -> Result<SignedReveal> {
        if self.tracker.get_transaction(commit_id).is_none() {
            return Err(InscriberError::UnknownTransaction(commit_id.to_string()));
        }

        let request = RevealRequest {
            commit_utxo,
            commitment: prepared.commitment.clone(),
            destination_address,
            fee_rate: fee_rate.unwrap_or(prepared.fee_rate),
            reveal_key: prepared.reveal_key.clone(),
            change_address,
            postage: prepared.postage,
            network: self.network,
        };
        self.reveal_builder.validate(&request)?;

        let id = self
            .tracker
            .add_transaction(TransactionType::Reveal, Some(commit_id));

        // the commit output is locked to this key, every attempt signs with it
        let builder = self.reveal_builder.clone();
        let health = Arc::clone(&self.health);
        let result = with_retry(
            || builder.create_reveal(&request, &*health),
            &self.retry_policy,
            "create_reveal",
        )
        .await;

        match result {
            Ok(mut reveal) => {
                self.tracker.set_transaction_txid(&id, reveal.txid)?;
                self.tracker.add_transaction_progress_event(
                    &id,
                    "Reveal signed",
                    Utc::now(),
                    Some(json!({
                        "fee": reveal.plan.fee.to_sat(),
                        "postage": reveal.plan.postage_amount.to_sat(),
                        "change": reveal.plan.change_amount.to_sat(),
                    })),
                )?;
                reveal.tracking_id = Some(id);
                Ok(reveal)
            }
            Err(err) => {
                self.tracker.set_transaction_error(&id, &err)?;
                log_failure(&err, "build_reveal");
                Err(err)
            }
        }
    }

    /// Broadcasts a signed transaction and moves its entry to Confirming.
    #[instrument(skip(self, raw_tx_hex), target = "ord_inscriber::inscriber")]
    pub async fn broadcast(&mut self, id: &str, raw_tx_hex: &str) -> Result<Txid> {
        let status = self
            .tracker
            .get_transaction(id)
            .map(|tx| tx.status)
            .ok_or_else(|| InscriberError::UnknownTransaction(id.to_string()))?;
        if !status.can_transition_to(TransactionStatus::Confirming) {
            return Err(InscriberError::InvalidStateTransition {
                id: id.to_string(),
                from: status,
                to: TransactionStatus::Confirming,
            });
        }

        let broadcaster = Arc::clone(&self.broadcaster);
        let network = self.network;
        let result = with_retry(
            || broadcaster.broadcast(network, raw_tx_hex),
            &self.retry_policy,
            "broadcast",
        )
        .await;

        match result {
            Ok(txid) => {
                self.tracker.set_transaction_txid(id, txid)?;
                self.tracker
                    .set_transaction_status(id, TransactionStatus::Confirming)?;
                self.tracker.add_transaction_progress_event(
                    id,
                    "Broadcast",
                    Utc::now(),
                    Some(json!({ "txid": txid.to_string() })),
                )?;
                METRICS.transactions_broadcast.inc();
                info!(%txid, "Transaction broadcast");
                Ok(txid)
            }
            Err(err) => {
                let err = match err {
                    InscriberError::BroadcastFailure(_) => err,
                    other => InscriberError::BroadcastFailure(other.to_string()),
                };
                self.tracker.set_transaction_error(id, &err)?;
                log_failure(&err, "broadcast");
                Err(err)
            }
        }
    }

    /// Asks the broadcaster for the chain state of a Confirming transaction.
    /// Entries in any other state are left untouched.
    #[instrument(skip(self), target = "ord_inscriber::inscriber")]
    pub async fn poll_confirmation(&mut self, id: &str) -> Result<TransactionStatus> {
        let (status, txid) = self
            .tracker
            .get_transaction(id)
            .map(|tx| (tx.status, tx.txid))
            .ok_or_else(|| InscriberError::UnknownTransaction(id.to_string()))?;
        if status != TransactionStatus::Confirming {
            return Ok(status);
        }
        let txid = txid.ok_or_else(|| {
            InscriberError::InvalidTransaction(format!("{id} has no txid"))
        })?;

        let confirmation = self.broadcaster.get_status(self.network, &txid).await?;
        debug!(?confirmation, "Polled confirmation");

        if confirmation.status == ChainStatus::Rejected {
            let err = InscriberError::BroadcastFailure(format!("{txid} was rejected"));
            self.tracker.set_transaction_error(id, &err)?;
            log_failure(&err, "poll_confirmation");
            return Ok(TransactionStatus::Failed);
        }

        if confirmation.confirmations >= self.config.required_confirmations() {
            self.tracker
                .set_transaction_status(id, TransactionStatus::Confirmed)?;
            self.tracker.add_transaction_progress_event(
                id,
                "Confirmed",
                Utc::now(),
                Some(json!({ "confirmations": confirmation.confirmations })),
            )?;
            info!(%txid, confirmations = confirmation.confirmations, "Transaction confirmed");
            return Ok(TransactionStatus::Confirmed);
        }

        Ok(TransactionStatus::Confirming)
    }

    fn fee_rate(&self, requested: Option<FeeRate>) -> Result<FeeRate> {
        match (requested, self.config.default_fee_rate) {
            (Some(fee_rate), _) => Ok(fee_rate),
            (None, Some(default)) => FeeRate::from_sat_per_vb(default),
            (None, None) => Err(InscriberError::InvalidFeeRate(
                "no fee rate given and no default configured".to_string(),
            )),
        }
    }
}
