use bitcoin::{secp256k1::constants::SCHNORR_SIGNATURE_SIZE, Amount};

use crate::{inscriber::types::LeafScriptInfo, types::FeeRate};

// Fee Estimation Constants, in vbytes

// version (4) + input count (1) + output count (1) + locktime (4)
// + segwit marker and flag (2 / 4)
const TX_OVERHEAD_VBYTES: f64 = 10.5;

// p2wpkh input
// out point (36) + scriptSig length (1) + sequence (4)
// + witness (signature 72 + public key 33 + item lengths and count 3) / 4
const P2WPKH_INPUT_VBYTES: f64 = 68.0;

// p2wpkh output
// value (8) + scriptPubKey length (1) + scriptPubKey (22)
const P2WPKH_OUTPUT_VBYTES: f64 = 31.0;

// p2tr output
// value (8) + scriptPubKey length (1) + scriptPubKey (34)
const P2TR_OUTPUT_VBYTES: f64 = 43.0;

// p2tr input without its witness
// out point (36) + scriptSig length (1) + sequence (4)
const P2TR_INPUT_BASE_VBYTES: f64 = 41.0;

const WITNESS_SCALE_FACTOR: f64 = 4.0;

// Items of a script path witness: signature, leaf script, control block.
const SCRIPT_PATH_WITNESS_ITEMS: usize = 3;

/// Size and fee of a transaction, both already rounded up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeEstimate {
    pub vbytes: u64,
    pub fee: Amount,
}

/// Linear size model. Results are advisory: builders re-run it every time
/// the input and output counts change.
pub struct InscriberFeeCalculator {}

impl InscriberFeeCalculator {
    /// Size of a transaction spending p2wpkh inputs into p2wpkh outputs.
    pub fn estimate_size(input_count: usize, output_count: usize) -> u64 {
        Self::estimate_size_with_outputs(input_count, output_count, 0)
    }

    pub fn estimate_size_with_outputs(
        p2wpkh_input_count: usize,
        p2wpkh_output_count: usize,
        p2tr_output_count: usize,
    ) -> u64 {
        let vbytes = TX_OVERHEAD_VBYTES
            + P2WPKH_INPUT_VBYTES * p2wpkh_input_count as f64
            + P2WPKH_OUTPUT_VBYTES * p2wpkh_output_count as f64
            + P2TR_OUTPUT_VBYTES * p2tr_output_count as f64;

        vbytes.ceil() as u64
    }

    /// Size of a reveal transaction: one script path input and `output_count` taproot outputs.
    pub fn estimate_reveal_size(
        script_len: usize,
        control_block_len: usize,
        output_count: usize,
    ) -> u64 {
        // signature is pushed without an explicit sighash byte (SIGHASH_DEFAULT)
        let witness_bytes = compact_size_len(SCRIPT_PATH_WITNESS_ITEMS)
            + compact_size_len(SCHNORR_SIGNATURE_SIZE)
            + SCHNORR_SIGNATURE_SIZE
            + compact_size_len(script_len)
            + script_len
            + compact_size_len(control_block_len)
            + control_block_len;

        let vbytes = TX_OVERHEAD_VBYTES
            + P2TR_INPUT_BASE_VBYTES
            + witness_bytes as f64 / WITNESS_SCALE_FACTOR
            + P2TR_OUTPUT_VBYTES * output_count as f64;

        vbytes.ceil() as u64
    }

    /// `ceil(vbytes * fee_rate)` satoshis.
    pub fn calculate_fee(vbytes: u64, fee_rate: FeeRate) -> Amount {
        let millisats = u128::from(vbytes) * u128::from(fee_rate.sat_per_kvb());
        let sats = millisats.div_ceil(1000);
        Amount::from_sat(u64::try_from(sats).unwrap_or(u64::MAX))
    }

    pub fn estimate_fee(input_count: usize, output_count: usize, fee_rate: FeeRate) -> FeeEstimate {
        let vbytes = Self::estimate_size(input_count, output_count);
        FeeEstimate {
            vbytes,
            fee: Self::calculate_fee(vbytes, fee_rate),
        }
    }

    pub fn estimate_reveal_fee(
        leaf: &LeafScriptInfo,
        fee_rate: FeeRate,
        output_count: usize,
    ) -> FeeEstimate {
        let vbytes = Self::estimate_reveal_size(
            leaf.script.len(),
            leaf.control_block.size(),
            output_count,
        );

        FeeEstimate {
            vbytes,
            fee: Self::calculate_fee(vbytes, fee_rate),
        }
    }
}

fn compact_size_len(len: usize) -> usize {
    match len {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}
