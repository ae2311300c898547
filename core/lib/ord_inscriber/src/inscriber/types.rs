use bitcoin::{
    consensus::encode::serialize_hex,
    key::UntweakedPublicKey,
    taproot::{ControlBlock, LeafVersion},
    Address, Amount, Network, OutPoint, Psbt, ScriptBuf, TapNodeHash, Transaction, Txid,
};

use crate::{
    inscriber::{fee::FeeEstimate, script_builder::InscriptionEnvelope, utxo_selector::SelectionOptions},
    signer::KeyPair,
    types::{FeeRate, InscriptionId, Utxo},
};

pub(crate) const COMMIT_TX_TAPSCRIPT_OUTPUT_INDEX: u32 = 0;
pub(crate) const COMMIT_TX_CHANGE_OUTPUT_INDEX: u32 = 1;
pub(crate) const REVEAL_TX_INSCRIPTION_OUTPUT_INDEX: u32 = 0;

/// Script path data needed to spend the commit output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafScriptInfo {
    pub script: ScriptBuf,
    pub control_block: ControlBlock,
    pub leaf_version: LeafVersion,
}

/// A derived taproot output. `script` is the exact scriptPubKey the commit pays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct P2TRDetails {
    pub address: Address,
    pub script: ScriptBuf,
    pub internal_key: UntweakedPublicKey,
    pub merkle_root: Option<TapNodeHash>,
    pub leaf: Option<LeafScriptInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitPlan {
    pub selected_utxos: Vec<Utxo>,
    pub required_commit_amount: Amount,
    pub change_amount: Amount,
    pub fee: Amount,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevealPlan {
    pub input_utxo: Utxo,
    pub postage_amount: Amount,
    pub change_amount: Amount,
    pub fee: Amount,
}

/// Everything needed to fund an inscription.
#[derive(Clone, Debug)]
pub struct CommitRequest {
    pub commitment: P2TRDetails,
    pub candidate_utxos: Vec<Utxo>,
    pub change_address: Address,
    pub fee_rate: FeeRate,
    pub network: Network,
    /// Usually the estimated reveal fee plus postage.
    pub minimum_commit_amount: Amount,
    pub selection: SelectionOptions,
}

/// Everything needed to spend the commit output through the envelope leaf.
#[derive(Clone, Debug)]
pub struct RevealRequest {
    pub commit_utxo: Utxo,
    /// Must be the details the commit address was derived with.
    pub commitment: P2TRDetails,
    pub destination_address: Address,
    pub fee_rate: FeeRate,
    pub reveal_key: KeyPair,
    pub change_address: Option<Address>,
    pub postage: Amount,
    pub network: Network,
}

/// Unsigned funding transaction, handed to an external signer.
#[derive(Clone, Debug)]
pub struct UnsignedCommit {
    /// Id of the tracked commit transaction, when built with a tracker.
    pub tracking_id: Option<String>,
    pub plan: CommitPlan,
    pub transaction: Transaction,
    pub txid: Txid,
    pub commit_outpoint: OutPoint,
    pub commit_script: ScriptBuf,
    pub psbt: Psbt,
}

impl UnsignedCommit {
    pub fn psbt_base64(&self) -> String {
        self.psbt.to_string()
    }

    pub fn psbt_hex(&self) -> String {
        self.psbt.serialize_hex()
    }

    pub fn unsigned_tx_hex(&self) -> String {
        serialize_hex(&self.transaction)
    }

    pub fn change_outpoint(&self) -> Option<OutPoint> {
        (self.plan.change_amount > Amount::ZERO).then_some(OutPoint {
            txid: self.txid,
            vout: COMMIT_TX_CHANGE_OUTPUT_INDEX,
        })
    }

    /// The commit output as the reveal will see it. Segwit txids do not
    /// change on signing, so this is valid before the commit is broadcast.
    pub fn commit_utxo(&self) -> Utxo {
        Utxo::new(
            self.txid,
            self.commit_outpoint.vout,
            self.plan.required_commit_amount,
            self.commit_script.clone(),
        )
    }
}

/// Signed and finalized reveal transaction.
#[derive(Clone, Debug)]
pub struct SignedReveal {
    /// Id of the tracked reveal transaction, when built with a tracker.
    pub tracking_id: Option<String>,
    pub plan: RevealPlan,
    pub transaction: Transaction,
    pub txid: Txid,
    pub hex: String,
}

impl SignedReveal {
    /// Output holding the inscribed sat.
    pub fn inscription_outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: REVEAL_TX_INSCRIPTION_OUTPUT_INDEX,
        }
    }

    /// Id of the inscription, its envelope being the first one in the reveal input.
    pub fn inscription_id(&self) -> InscriptionId {
        InscriptionId {
            txid: self.txid,
            index: 0,
        }
    }
}

/// Output of the preparation step: the key, the envelope and the address to fund.
#[derive(Clone, Debug)]
pub struct PreparedInscription {
    pub reveal_key: KeyPair,
    pub envelope: InscriptionEnvelope,
    pub commitment: P2TRDetails,
    pub reveal_fee: FeeEstimate,
    /// Rate the reveal fee was estimated with.
    pub fee_rate: FeeRate,
    pub postage: Amount,
    pub required_commit_amount: Amount,
}
