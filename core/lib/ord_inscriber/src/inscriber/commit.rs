use bitcoin::{
    absolute::LockTime, transaction::Version, Address, Amount, Network, OutPoint, Psbt, ScriptBuf,
    Sequence, Transaction, TxIn, TxOut, Witness,
};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::{
    inscriber::{
        types::{CommitPlan, CommitRequest, UnsignedCommit, COMMIT_TX_TAPSCRIPT_OUTPUT_INDEX},
        utxo_selector::UtxoSelector,
    },
    metrics::METRICS,
    tracker::{TransactionTracker, TransactionType},
    types::{InscriberError, Result, Utxo, DUST_LIMIT},
};

type ProgressSink<'a> = dyn FnMut(&str, serde_json::Value) -> Result<()> + 'a;

/// Builds the unsigned funding transaction paying the commit address.
/// It never sees spending keys: the PSBT goes to an external signer.
#[derive(Debug, Clone)]
pub struct CommitBuilder {
    dust_limit: Amount,
}

impl Default for CommitBuilder {
    fn default() -> Self {
        Self::new(DUST_LIMIT)
    }
}

impl CommitBuilder {
    pub fn new(dust_limit: Amount) -> Self {
        Self { dust_limit }
    }

    #[instrument(skip(self, request), target = "ord_inscriber::commit")]
    pub fn prepare_commit(&self, request: &CommitRequest) -> Result<UnsignedCommit> {
        self.validate(request)?;
        self.build(request, &mut |_, _| Ok(()))
    }

    /// Same as [`Self::prepare_commit`], recording the build as a tracked commit transaction.
    #[instrument(skip(self, request, tracker), target = "ord_inscriber::commit")]
    pub fn prepare_commit_tracked(
        &self,
        request: &CommitRequest,
        tracker: &mut TransactionTracker,
    ) -> Result<UnsignedCommit> {
        self.validate(request)?;

        let id = tracker.add_transaction(TransactionType::Commit, None);
        let result = self.build(request, &mut |message, data| {
            tracker.add_transaction_progress_event(&id, message, Utc::now(), Some(data))
        });

        match result {
            Ok(mut commit) => {
                tracker.set_transaction_txid(&id, commit.txid)?;
                commit.tracking_id = Some(id);
                Ok(commit)
            }
            Err(err) => {
                tracker.set_transaction_error(&id, &err)?;
                Err(err)
            }
        }
    }

    fn validate(&self, request: &CommitRequest) -> Result<()> {
        if request.fee_rate.sat_per_kvb() == 0 {
            return Err(InscriberError::InvalidFeeRate(request.fee_rate.to_string()));
        }
        check_network(&request.change_address, request.network, "change")?;
        check_network(&request.commitment.address, request.network, "commit")?;
        Ok(())
    }

    fn build(&self, request: &CommitRequest, progress: &mut ProgressSink<'_>) -> Result<UnsignedCommit> {
        let required_commit_amount = request.minimum_commit_amount.max(self.dust_limit);

        let usable: Vec<Utxo> = request
            .candidate_utxos
            .iter()
            .filter(|utxo| {
                if utxo.script_pubkey.is_none() {
                    warn!(outpoint = %utxo.outpoint(), "Skipping UTXO without script_pubkey");
                    return false;
                }
                true
            })
            .cloned()
            .collect();

        if usable.is_empty() {
            return Err(InscriberError::InvalidUtxo(
                "no candidate UTXO has a script_pubkey".to_string(),
            ));
        }

        // commit output is p2tr; anything but p2wpkh change is sized as p2tr
        let mut options = request.selection.clone();
        if request.change_address.script_pubkey().is_p2wpkh() {
            options.p2wpkh_outputs = 1;
            options.p2tr_outputs = 1;
        } else {
            options.p2wpkh_outputs = 0;
            options.p2tr_outputs = 2;
        }

        let selection = UtxoSelector::select(
            &usable,
            required_commit_amount,
            request.fee_rate,
            &options,
        )?;
        progress(
            "UTXOs selected",
            json!({
                "count": selection.selected_utxos.len(),
                "total_value": selection.total_value.to_sat(),
            }),
        )?;

        let (fee, change_amount) = if selection.change_amount >= self.dust_limit {
            (selection.fee, selection.change_amount)
        } else {
            (selection.fee + selection.change_amount, Amount::ZERO)
        };
        progress(
            "Fee computed",
            json!({
                "fee": fee.to_sat(),
                "fee_rate": request.fee_rate.sat_per_vb(),
                "change": change_amount.to_sat(),
            }),
        )?;

        let input: Vec<TxIn> = selection
            .selected_utxos
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect();

        let mut output = vec![TxOut {
            value: required_commit_amount,
            script_pubkey: request.commitment.script.clone(),
        }];
        if change_amount > Amount::ZERO {
            output.push(TxOut {
                value: change_amount,
                script_pubkey: request.change_address.script_pubkey(),
            });
        }
        progress("Outputs assembled", json!({ "outputs": output.len() }))?;

        let transaction = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output,
        };

        let mut psbt = Psbt::from_unsigned_tx(transaction.clone())
            .map_err(|e| InscriberError::InvalidTransaction(e.to_string()))?;
        for (psbt_input, utxo) in psbt.inputs.iter_mut().zip(&selection.selected_utxos) {
            psbt_input.witness_utxo = utxo.txout();
        }

        let txid = transaction.compute_txid();
        METRICS.commit_transactions_built.inc();
        info!(%txid, fee = fee.to_sat(), "Commit transaction built");
        debug!(required = required_commit_amount.to_sat(), "Commit output amount");

        Ok(UnsignedCommit {
            tracking_id: None,
            plan: CommitPlan {
                selected_utxos: selection.selected_utxos,
                required_commit_amount,
                change_amount,
                fee,
            },
            txid,
            commit_outpoint: OutPoint {
                txid,
                vout: COMMIT_TX_TAPSCRIPT_OUTPUT_INDEX,
            },
            commit_script: request.commitment.script.clone(),
            transaction,
            psbt,
        })
    }
}

pub(crate) fn check_network(address: &Address, network: Network, role: &str) -> Result<()> {
    if !address.as_unchecked().is_valid_for_network(network) {
        return Err(InscriberError::InvalidInput(format!(
            "{role} address {address} is not valid for {network}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bitcoin::{hashes::Hash, Txid};

    use super::*;
    use crate::{
        inscriber::{
            taproot::derive_address,
            test_utils::{test_commitment, test_p2wpkh_address},
            types::COMMIT_TX_CHANGE_OUTPUT_INDEX,
            utxo_selector::SelectionOptions,
        },
        signer::KeyManager,
        tracker::TransactionStatus,
        types::FeeRate,
    };

    fn funding_utxo(seed: u8, value: u64, script: &ScriptBuf) -> Utxo {
        Utxo::new(
            Txid::from_byte_array([seed; 32]),
            1,
            Amount::from_sat(value),
            script.clone(),
        )
    }

    fn request(candidates: Vec<Utxo>, minimum: u64) -> CommitRequest {
        let (_, commitment) = test_commitment(Network::Regtest);
        CommitRequest {
            commitment,
            candidate_utxos: candidates,
            change_address: test_p2wpkh_address(Network::Regtest),
            fee_rate: FeeRate::from_sat_per_vb(10.0).unwrap(),
            network: Network::Regtest,
            minimum_commit_amount: Amount::from_sat(minimum),
            selection: SelectionOptions::default(),
        }
    }

    #[test]
    fn test_commit_pays_commit_address_and_change() {
        let funding = test_p2wpkh_address(Network::Regtest).script_pubkey();
        let req = request(vec![funding_utxo(1, 100_000, &funding)], 1_931);
        let commit = CommitBuilder::default().prepare_commit(&req).unwrap();

        let tx = &commit.transaction;
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].sequence, Sequence::ENABLE_RBF_NO_LOCKTIME);
        assert_eq!(tx.output.len(), 2);

        let commit_out = &tx.output[COMMIT_TX_TAPSCRIPT_OUTPUT_INDEX as usize];
        assert_eq!(commit_out.value, Amount::from_sat(1_931));
        assert_eq!(commit_out.script_pubkey, req.commitment.address.script_pubkey());

        let change_out = &tx.output[COMMIT_TX_CHANGE_OUTPUT_INDEX as usize];
        assert_eq!(change_out.script_pubkey, req.change_address.script_pubkey());
        assert_eq!(
            change_out.value + commit_out.value + commit.plan.fee,
            Amount::from_sat(100_000)
        );

        assert_eq!(commit.txid, tx.compute_txid());
        assert_eq!(commit.commit_outpoint.vout, 0);
        assert_eq!(
            commit.psbt.inputs[0].witness_utxo.as_ref().unwrap().value,
            Amount::from_sat(100_000)
        );
        assert!(!commit.psbt_base64().is_empty());
        assert!(!commit.psbt_hex().is_empty());
        assert!(commit.tracking_id.is_none());
    }

    #[test]
    fn test_commit_amount_is_at_least_dust() {
        let funding = test_p2wpkh_address(Network::Regtest).script_pubkey();
        let req = request(vec![funding_utxo(1, 100_000, &funding)], 10);
        let commit = CommitBuilder::default().prepare_commit(&req).unwrap();

        assert_eq!(commit.plan.required_commit_amount, DUST_LIMIT);
        assert_eq!(commit.transaction.output[0].value, DUST_LIMIT);
    }

    #[test]
    fn test_dust_change_is_not_emitted() {
        let funding = test_p2wpkh_address(Network::Regtest).script_pubkey();
        // 1 input, 2 outputs at 10 sat/vB: 1530 fee; 5_000 + 1_530 + 300 leaves dust
        let req = request(vec![funding_utxo(1, 6_830, &funding)], 5_000);
        let commit = CommitBuilder::default().prepare_commit(&req).unwrap();

        assert_eq!(commit.transaction.output.len(), 1);
        assert_eq!(commit.plan.change_amount, Amount::ZERO);
        assert_eq!(commit.plan.fee, Amount::from_sat(1_830));
    }

    #[test]
    fn test_taproot_change_is_priced_as_taproot() {
        let funding = test_p2wpkh_address(Network::Regtest).script_pubkey();
        let mut req = request(vec![funding_utxo(1, 100_000, &funding)], 1_931);
        req.fee_rate = FeeRate::from_sat_per_vb(1.0).unwrap();
        let change_key = KeyManager::generate_key_pair();
        req.change_address = derive_address(change_key.public_key(), None, Network::Regtest)
            .unwrap()
            .address;

        let commit = CommitBuilder::default().prepare_commit(&req).unwrap();
        // 1 p2wpkh input, 2 p2tr outputs: 10.5 + 68 + 43 + 43 = 164.5 -> 165 vB
        assert_eq!(commit.plan.fee, Amount::from_sat(165));
        assert_eq!(commit.transaction.output.len(), 2);
        assert!(commit.transaction.output[1].script_pubkey.is_p2tr());

        // signed size with a 72 byte signature and 33 byte key
        let mut signed = commit.transaction.clone();
        signed.input[0].witness.push([0u8; 72]);
        signed.input[0].witness.push([0u8; 33]);
        assert!(commit.plan.fee.to_sat() >= signed.vsize() as u64);
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_utxos_without_script_are_skipped() {
        let funding = test_p2wpkh_address(Network::Regtest).script_pubkey();
        let mut unresolved = funding_utxo(2, 500_000, &funding);
        unresolved.script_pubkey = None;

        let req = request(vec![unresolved.clone(), funding_utxo(1, 100_000, &funding)], 2_000);
        let commit = CommitBuilder::default().prepare_commit(&req).unwrap();
        assert_eq!(commit.plan.selected_utxos[0].txid, Txid::from_byte_array([1; 32]));
        assert!(logs_contain("Skipping UTXO without script_pubkey"));

        let req = request(vec![unresolved], 2_000);
        assert_matches!(
            CommitBuilder::default().prepare_commit(&req),
            Err(InscriberError::InvalidUtxo(_))
        );
    }

    #[test]
    fn test_wrong_network_change_address_is_rejected() {
        let funding = test_p2wpkh_address(Network::Regtest).script_pubkey();
        let mut req = request(vec![funding_utxo(1, 100_000, &funding)], 2_000);
        req.change_address = test_p2wpkh_address(Network::Bitcoin);

        assert_matches!(
            CommitBuilder::default().prepare_commit(&req),
            Err(InscriberError::InvalidInput(_))
        );
    }

    #[test]
    fn test_tracked_commit_records_progress() {
        let funding = test_p2wpkh_address(Network::Regtest).script_pubkey();
        let req = request(vec![funding_utxo(1, 100_000, &funding)], 2_000);
        let mut tracker = TransactionTracker::new();

        let commit = CommitBuilder::default()
            .prepare_commit_tracked(&req, &mut tracker)
            .unwrap();
        let id = commit.tracking_id.unwrap();
        let tracked = tracker.get_transaction(&id).unwrap();

        assert_eq!(tracked.status, TransactionStatus::Pending);
        assert_eq!(tracked.txid, Some(commit.txid));
        let messages: Vec<_> = tracked.events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["UTXOs selected", "Fee computed", "Outputs assembled"]);
    }

    #[test]
    fn test_tracked_commit_failure_marks_failed() {
        let funding = test_p2wpkh_address(Network::Regtest).script_pubkey();
        let req = request(vec![funding_utxo(1, 1_000, &funding)], 2_000);
        let mut tracker = TransactionTracker::new();

        let err = CommitBuilder::default()
            .prepare_commit_tracked(&req, &mut tracker)
            .unwrap_err();
        assert_matches!(err, InscriberError::InsufficientFunds { .. });

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, TransactionStatus::Failed);
        assert_eq!(snapshot[0].error.as_ref().unwrap().code.code(), "INSUFFICIENT_FUNDS");
    }
}
