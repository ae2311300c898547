use bitcoin::{
    absolute::LockTime,
    hashes::Hash,
    script::Instruction,
    secp256k1::{Message, XOnlyPublicKey},
    sighash::{Prevouts, SighashCache},
    taproot, transaction::Version,
    Amount, Psbt, ScriptBuf, Sequence, TapLeafHash, TapSighashType, Transaction, TxIn, TxOut,
    Witness,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    inscriber::{
        commit::check_network,
        fee::InscriberFeeCalculator,
        types::{LeafScriptInfo, RevealPlan, RevealRequest, SignedReveal},
    },
    metrics::METRICS,
    signer::SECP,
    traits::HealthCheck,
    types::{InscriberError, Result, DUST_LIMIT},
};

const P2TR_SCRIPT_LEN: usize = 34;

/// Builds, signs and finalizes the transaction spending the commit output
/// through the envelope leaf.
#[derive(Debug, Clone)]
pub struct RevealBuilder {
    dust_limit: Amount,
}

impl Default for RevealBuilder {
    fn default() -> Self {
        Self::new(DUST_LIMIT)
    }
}

impl RevealBuilder {
    pub fn new(dust_limit: Amount) -> Self {
        Self { dust_limit }
    }

    pub async fn create_reveal(
        &self,
        request: &RevealRequest,
        health: &dyn HealthCheck,
    ) -> Result<SignedReveal> {
        if !health.is_healthy().await {
            return Err(InscriberError::InitializationFailed(
                "health check did not pass".to_string(),
            ));
        }
        self.build_reveal(request)
    }

    #[instrument(skip(self, request), target = "ord_inscriber::reveal")]
    pub fn build_reveal(&self, request: &RevealRequest) -> Result<SignedReveal> {
        let leaf = self.validate(request)?;
        let plan = self.plan(request, leaf)?;

        let mut output = vec![TxOut {
            value: plan.postage_amount,
            script_pubkey: request.destination_address.script_pubkey(),
        }];
        if let Some(change_address) = request.change_address.as_ref() {
            if plan.change_amount > Amount::ZERO {
                output.push(TxOut {
                    value: plan.change_amount,
                    script_pubkey: change_address.script_pubkey(),
                });
            }
        }

        let transaction = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: request.commit_utxo.outpoint(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output,
        };

        let mut psbt = self.build_psbt(transaction, request, leaf)?;
        sign_script_path(&mut psbt, request, leaf)?;
        finalize_script_path(&mut psbt, leaf)?;
        let transaction = extract_transaction(psbt)?;

        let txid = transaction.compute_txid();
        let hex = bitcoin::consensus::encode::serialize_hex(&transaction);

        METRICS.reveal_transactions_built.inc();
        METRICS.reveal_fee_sats.observe(plan.fee.to_sat() as f64);
        info!(
            %txid,
            fee = plan.fee.to_sat(),
            postage = plan.postage_amount.to_sat(),
            "Reveal transaction built"
        );

        Ok(SignedReveal {
            tracking_id: None,
            plan,
            transaction,
            txid,
            hex,
        })
    }

    pub(crate) fn validate<'a>(&self, request: &'a RevealRequest) -> Result<&'a LeafScriptInfo> {
        if request.fee_rate.sat_per_kvb() == 0 {
            return Err(InscriberError::InvalidFeeRate(request.fee_rate.to_string()));
        }
        if request.commit_utxo.value == Amount::ZERO {
            return Err(InscriberError::InvalidUtxo(
                "commit UTXO has no value".to_string(),
            ));
        }

        let commitment = &request.commitment;
        let leaf = commitment.leaf.as_ref().ok_or_else(|| {
            InscriberError::InvalidInput("commitment has no envelope leaf".to_string())
        })?;

        if let Some(script_pubkey) = request.commit_utxo.script_pubkey.as_ref() {
            if *script_pubkey != commitment.script {
                return Err(InscriberError::InvalidUtxo(
                    "commit UTXO script does not match the commit address".to_string(),
                ));
            }
        }

        let output_key = taproot_output_key(&commitment.script)?;
        if !leaf
            .control_block
            .verify_taproot_commitment(&*SECP, output_key, &leaf.script)
        {
            return Err(InscriberError::InvalidInput(
                "control block does not commit to the envelope leaf".to_string(),
            ));
        }

        let reveal_public_key = request.reveal_key.public_key().serialize();
        match leaf.script.instructions().next() {
            Some(Ok(Instruction::PushBytes(bytes))) if bytes.as_bytes() == reveal_public_key => {}
            _ => {
                return Err(InscriberError::InvalidKey(
                    "reveal key does not unlock the envelope leaf".to_string(),
                ))
            }
        }

        check_network(&request.destination_address, request.network, "destination")?;
        if let Some(change_address) = request.change_address.as_ref() {
            check_network(change_address, request.network, "change")?;
        }

        Ok(leaf)
    }

    fn plan(&self, request: &RevealRequest, leaf: &LeafScriptInfo) -> Result<RevealPlan> {
        let commit_value = request.commit_utxo.value;
        let single_output_fee =
            InscriberFeeCalculator::estimate_reveal_fee(leaf, request.fee_rate, 1).fee;

        let Some(remainder) = commit_value.checked_sub(single_output_fee) else {
            return Err(InscriberError::InsufficientFunds {
                required: single_output_fee,
                available: commit_value,
            });
        };

        let plan = if remainder < request.postage {
            warn!(
                remainder = remainder.to_sat(),
                postage = request.postage.to_sat(),
                "Commit output does not cover the full postage, inscription output gets the remainder"
            );
            RevealPlan {
                input_utxo: request.commit_utxo.clone(),
                postage_amount: remainder,
                change_amount: Amount::ZERO,
                fee: single_output_fee,
            }
        } else if request.change_address.is_some() && remainder > request.postage {
            let two_output_fee =
                InscriberFeeCalculator::estimate_reveal_fee(leaf, request.fee_rate, 2).fee;
            let change = commit_value
                .checked_sub(request.postage)
                .and_then(|value| value.checked_sub(two_output_fee))
                .unwrap_or(Amount::ZERO);

            if change >= self.dust_limit {
                RevealPlan {
                    input_utxo: request.commit_utxo.clone(),
                    postage_amount: request.postage,
                    change_amount: change,
                    fee: two_output_fee,
                }
            } else {
                debug!(change = change.to_sat(), "Reveal change below dust, adding it to the fee");
                RevealPlan {
                    input_utxo: request.commit_utxo.clone(),
                    postage_amount: request.postage,
                    change_amount: Amount::ZERO,
                    fee: commit_value - request.postage,
                }
            }
        } else {
            RevealPlan {
                input_utxo: request.commit_utxo.clone(),
                postage_amount: remainder,
                change_amount: Amount::ZERO,
                fee: single_output_fee,
            }
        };

        if plan.postage_amount + plan.change_amount + plan.fee != commit_value {
            return Err(InscriberError::InvalidTransaction(
                "reveal outputs and fee do not add up to the commit value".to_string(),
            ));
        }
        Ok(plan)
    }

    fn build_psbt(
        &self,
        transaction: Transaction,
        request: &RevealRequest,
        leaf: &LeafScriptInfo,
    ) -> Result<Psbt> {
        let mut psbt = Psbt::from_unsigned_tx(transaction)
            .map_err(|e| InscriberError::InvalidTransaction(e.to_string()))?;

        let input = &mut psbt.inputs[0];
        input.witness_utxo = Some(TxOut {
            value: request.commit_utxo.value,
            script_pubkey: request.commitment.script.clone(),
        });
        input.tap_internal_key = Some(request.commitment.internal_key);
        input.tap_merkle_root = request.commitment.merkle_root;
        input.tap_scripts.insert(
            leaf.control_block.clone(),
            (leaf.script.clone(), leaf.leaf_version),
        );

        Ok(psbt)
    }
}

/// BIP-341 script path signature with `SIGHASH_DEFAULT`. Signing uses no
/// auxiliary randomness, so the same inputs always yield the same transaction.
fn sign_script_path(psbt: &mut Psbt, request: &RevealRequest, leaf: &LeafScriptInfo) -> Result<()> {
    let prevouts: Vec<TxOut> = psbt
        .inputs
        .iter()
        .map(|input| {
            input.witness_utxo.clone().ok_or_else(|| {
                InscriberError::SigningError("input is missing its witness UTXO".to_string())
            })
        })
        .collect::<Result<_>>()?;

    let leaf_hash = TapLeafHash::from_script(&leaf.script, leaf.leaf_version);
    let sighash = SighashCache::new(&psbt.unsigned_tx)
        .taproot_script_spend_signature_hash(
            0,
            &Prevouts::All(&prevouts),
            leaf_hash,
            TapSighashType::Default,
        )
        .map_err(|e| InscriberError::SigningError(e.to_string()))?;

    let message = Message::from_digest(sighash.to_byte_array());
    let keypair = request.reveal_key.keypair()?;
    let signature = SECP.sign_schnorr_no_aux_rand(&message, &keypair);

    let (public_key, _parity) = keypair.x_only_public_key();
    SECP.verify_schnorr(&signature, &message, &public_key)
        .map_err(|e| InscriberError::SigningError(format!("signature self-check failed: {e}")))?;

    psbt.inputs[0].tap_script_sigs.insert(
        (public_key, leaf_hash),
        taproot::Signature {
            signature,
            sighash_type: TapSighashType::Default,
        },
    );
    debug!(%leaf_hash, "Reveal input signed");
    Ok(())
}

fn finalize_script_path(psbt: &mut Psbt, leaf: &LeafScriptInfo) -> Result<()> {
    let input = &mut psbt.inputs[0];
    let signature = input
        .tap_script_sigs
        .values()
        .next()
        .ok_or_else(|| InscriberError::SigningError("reveal input is not signed".to_string()))?;

    let mut witness = Witness::new();
    witness.push(signature.to_vec());
    witness.push(leaf.script.as_bytes());
    witness.push(leaf.control_block.serialize());

    input.final_script_witness = Some(witness);
    input.tap_script_sigs.clear();
    input.tap_scripts.clear();
    input.tap_key_origins.clear();
    input.tap_internal_key = None;
    input.tap_merkle_root = None;
    Ok(())
}

/// Fails unless every input carries a final witness.
pub fn extract_transaction(psbt: Psbt) -> Result<Transaction> {
    if let Some(index) = psbt
        .inputs
        .iter()
        .position(|input| input.final_script_witness.is_none())
    {
        return Err(InscriberError::InvalidTransaction(format!(
            "input {index} is not finalized"
        )));
    }

    psbt.extract_tx()
        .map_err(|e| InscriberError::InvalidTransaction(e.to_string()))
}

fn taproot_output_key(script: &ScriptBuf) -> Result<XOnlyPublicKey> {
    if !script.is_p2tr() || script.len() != P2TR_SCRIPT_LEN {
        return Err(InscriberError::InvalidInput(
            "commit script is not a taproot output".to_string(),
        ));
    }
    XOnlyPublicKey::from_slice(&script.as_bytes()[2..])
        .map_err(|e| InscriberError::InvalidInput(e.to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bitcoin::{Network, Txid};

    use super::*;
    use crate::{
        inscriber::{
            script_builder::parse_reveal_witness,
            test_utils::{test_commitment, test_p2wpkh_address, StaticHealthCheck},
            types::REVEAL_TX_INSCRIPTION_OUTPUT_INDEX,
        },
        signer::KeyPair,
        types::{FeeRate, Utxo, POSTAGE_VALUE},
    };

    fn request(value: u64, change: bool) -> (KeyPair, RevealRequest) {
        let (key, commitment) = test_commitment(Network::Regtest);
        let commit_utxo = Utxo::new(
            Txid::from_byte_array([3; 32]),
            0,
            Amount::from_sat(value),
            commitment.script.clone(),
        );
        let request = RevealRequest {
            commit_utxo,
            commitment,
            destination_address: test_p2wpkh_address(Network::Regtest),
            fee_rate: FeeRate::from_sat_per_vb(10.0).unwrap(),
            reveal_key: key.clone(),
            change_address: change.then(|| test_p2wpkh_address(Network::Regtest)),
            postage: POSTAGE_VALUE,
            network: Network::Regtest,
        };
        (key, request)
    }

    fn assert_balanced(reveal: &SignedReveal, commit_value: u64) {
        let outputs: Amount = reveal.transaction.output.iter().map(|out| out.value).sum();
        assert_eq!(outputs + reveal.plan.fee, Amount::from_sat(commit_value));
    }

    #[test]
    fn test_exact_funding_pays_postage() {
        // "Hello, Ordinals!" reveal: 138 vB at 10 sat/vB
        let (_, req) = request(1_931, false);
        let reveal = RevealBuilder::default().build_reveal(&req).unwrap();

        assert_eq!(reveal.plan.fee, Amount::from_sat(1_380));
        assert_eq!(reveal.transaction.output.len(), 1);
        assert_eq!(
            reveal.transaction.output[REVEAL_TX_INSCRIPTION_OUTPUT_INDEX as usize].value,
            POSTAGE_VALUE
        );
        assert_balanced(&reveal, 1_931);
    }

    #[test]
    fn test_witness_carries_signature_script_and_control_block() {
        let (_, req) = request(1_931, false);
        let reveal = RevealBuilder::default().build_reveal(&req).unwrap();

        let witness = &reveal.transaction.input[0].witness;
        assert_eq!(witness.len(), 3);
        assert_eq!(witness[0].len(), 64);
        let leaf = req.commitment.leaf.as_ref().unwrap();
        assert_eq!(witness[1], *leaf.script.as_bytes());
        assert_eq!(witness[2], leaf.control_block.serialize());

        let envelope = parse_reveal_witness(witness).unwrap();
        assert_eq!(envelope.body, b"Hello, Ordinals!");
        assert_eq!(envelope.content_type, "text/plain");
        assert_eq!(reveal.txid, reveal.transaction.compute_txid());
        assert_eq!(reveal.inscription_outpoint().vout, 0);
    }

    #[test]
    fn test_signature_verifies_against_sighash() {
        let (key, req) = request(1_931, false);
        let reveal = RevealBuilder::default().build_reveal(&req).unwrap();
        let leaf = req.commitment.leaf.as_ref().unwrap();

        let prevouts = vec![TxOut {
            value: Amount::from_sat(1_931),
            script_pubkey: req.commitment.script.clone(),
        }];
        let sighash = SighashCache::new(&reveal.transaction)
            .taproot_script_spend_signature_hash(
                0,
                &Prevouts::All(&prevouts),
                TapLeafHash::from_script(&leaf.script, leaf.leaf_version),
                TapSighashType::Default,
            )
            .unwrap();
        let message = Message::from_digest(sighash.to_byte_array());
        let signature = taproot::Signature::from_slice(&reveal.transaction.input[0].witness[0])
            .unwrap()
            .signature;

        assert!(SECP
            .verify_schnorr(&signature, &message, &key.public_key())
            .is_ok());
    }

    #[test]
    fn test_reveal_is_deterministic() {
        let (_, req) = request(10_000, false);
        let builder = RevealBuilder::default();
        let first = builder.build_reveal(&req).unwrap();
        let second = builder.build_reveal(&req).unwrap();
        assert_eq!(first.hex, second.hex);
    }

    #[test]
    fn test_change_output_when_above_dust() {
        let (_, req) = request(20_000, true);
        let reveal = RevealBuilder::default().build_reveal(&req).unwrap();

        // two outputs: 138 + 43 = 181 vB
        assert_eq!(reveal.plan.fee, Amount::from_sat(1_810));
        assert_eq!(reveal.transaction.output.len(), 2);
        assert_eq!(reveal.transaction.output[0].value, POSTAGE_VALUE);
        assert_eq!(
            reveal.plan.change_amount,
            Amount::from_sat(20_000 - 551 - 1_810)
        );
        assert_balanced(&reveal, 20_000);
    }

    #[test]
    fn test_small_change_goes_to_fee() {
        // 551 + 1_810 + 300 leaves change below dust
        let (_, req) = request(2_661, true);
        let reveal = RevealBuilder::default().build_reveal(&req).unwrap();

        assert_eq!(reveal.transaction.output.len(), 1);
        assert_eq!(reveal.plan.postage_amount, POSTAGE_VALUE);
        assert_eq!(reveal.plan.fee, Amount::from_sat(2_661 - 551));
        assert_balanced(&reveal, 2_661);
    }

    #[test]
    fn test_remainder_stays_on_inscription_without_change_address() {
        let (_, req) = request(5_000, false);
        let reveal = RevealBuilder::default().build_reveal(&req).unwrap();

        assert_eq!(reveal.transaction.output.len(), 1);
        assert_eq!(reveal.plan.postage_amount, Amount::from_sat(5_000 - 1_380));
        assert_balanced(&reveal, 5_000);
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_underfunded_postage_uses_remainder() {
        let (_, req) = request(1_700, true);
        let reveal = RevealBuilder::default().build_reveal(&req).unwrap();

        assert_eq!(reveal.plan.postage_amount, Amount::from_sat(320));
        assert_eq!(reveal.transaction.output.len(), 1);
        assert!(logs_contain("does not cover the full postage"));
        assert_balanced(&reveal, 1_700);
    }

    #[test]
    fn test_commit_below_fee_is_rejected() {
        let (_, req) = request(1_000, false);
        assert_matches!(
            RevealBuilder::default().build_reveal(&req),
            Err(InscriberError::InsufficientFunds { required, available }) => {
                assert_eq!(required, Amount::from_sat(1_380));
                assert_eq!(available, Amount::from_sat(1_000));
            }
        );
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_commit_equal_to_fee_leaves_empty_inscription_output() {
        let (_, req) = request(1_380, false);
        let reveal = RevealBuilder::default().build_reveal(&req).unwrap();

        assert_eq!(reveal.plan.fee, Amount::from_sat(1_380));
        assert_eq!(reveal.plan.postage_amount, Amount::ZERO);
        assert_eq!(reveal.transaction.output.len(), 1);
        assert_eq!(reveal.transaction.output[0].value, Amount::ZERO);
        assert!(logs_contain("does not cover the full postage"));
        assert_balanced(&reveal, 1_380);
    }

    #[test]
    fn test_commit_one_sat_below_fee_is_rejected() {
        let (_, req) = request(1_379, true);
        assert_matches!(
            RevealBuilder::default().build_reveal(&req),
            Err(InscriberError::InsufficientFunds { required, available }) => {
                assert_eq!(required, Amount::from_sat(1_380));
                assert_eq!(available, Amount::from_sat(1_379));
            }
        );
    }

    #[test]
    fn test_validation_failures() {
        let (_, mut req) = request(1_931, false);
        req.commit_utxo.value = Amount::ZERO;
        assert_matches!(
            RevealBuilder::default().build_reveal(&req),
            Err(InscriberError::InvalidUtxo(_))
        );

        let (_, mut req) = request(1_931, false);
        req.commit_utxo.script_pubkey = Some(test_p2wpkh_address(Network::Regtest).script_pubkey());
        assert_matches!(
            RevealBuilder::default().build_reveal(&req),
            Err(InscriberError::InvalidUtxo(_))
        );

        let (_, mut req) = request(1_931, false);
        req.commitment.leaf = None;
        assert_matches!(
            RevealBuilder::default().build_reveal(&req),
            Err(InscriberError::InvalidInput(_))
        );

        let (_, mut req) = request(1_931, false);
        req.reveal_key = crate::signer::KeyManager::generate_key_pair();
        assert_matches!(
            RevealBuilder::default().build_reveal(&req),
            Err(InscriberError::InvalidKey(_))
        );

        let (_, mut req) = request(1_931, false);
        req.destination_address = test_p2wpkh_address(Network::Bitcoin);
        assert_matches!(
            RevealBuilder::default().build_reveal(&req),
            Err(InscriberError::InvalidInput(_))
        );
    }

    #[test]
    fn test_mismatched_commitment_is_rejected() {
        let (_, mut req) = request(1_931, false);
        let (_, other) = test_commitment(Network::Regtest);
        req.commitment.leaf = other.leaf;
        req.commit_utxo.script_pubkey = None;

        assert_matches!(
            RevealBuilder::default().build_reveal(&req),
            Err(InscriberError::InvalidInput(_))
        );
    }

    #[test]
    fn test_unfinalized_psbt_cannot_be_extracted() {
        let (_, req) = request(1_931, false);
        let builder = RevealBuilder::default();
        let leaf = req.commitment.leaf.as_ref().unwrap();
        let transaction = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: req.commit_utxo.outpoint(),
                ..Default::default()
            }],
            output: vec![TxOut {
                value: POSTAGE_VALUE,
                script_pubkey: req.destination_address.script_pubkey(),
            }],
        };
        let psbt = builder.build_psbt(transaction, &req, leaf).unwrap();

        let err = extract_transaction(psbt).unwrap_err();
        assert_matches!(err, InscriberError::InvalidTransaction(_));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_health_gate_runs_first() {
        let (_, mut req) = request(1_931, false);
        req.commitment.leaf = None;

        let err = RevealBuilder::default()
            .create_reveal(&req, &StaticHealthCheck::new(false))
            .await
            .unwrap_err();
        assert_matches!(err, InscriberError::InitializationFailed(_));

        let (_, req) = request(1_931, false);
        let reveal = RevealBuilder::default()
            .create_reveal(&req, &StaticHealthCheck::new(true))
            .await;
        assert!(reveal.is_ok());
    }
}
