use std::{cmp::Reverse, collections::HashSet};

use bitcoin::{Amount, OutPoint};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    inscriber::fee::InscriberFeeCalculator,
    types::{FeeRate, InscriberError, Result, Utxo, DUST_LIMIT},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Largest values first, fewest inputs.
    #[default]
    ValueDesc,
    /// Outputs covering the target on their own first, smallest of them first.
    ClosestToTarget,
    /// Outpoint order, a stable stand-in for age.
    OldestFirst,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectionOptions {
    pub strategy: SelectionStrategy,
    pub allow_resource_utxos: bool,
    pub avoid_utxo_ids: HashSet<OutPoint>,
    /// Output shape of the transaction being funded, used for fee estimation.
    pub p2wpkh_outputs: usize,
    pub p2tr_outputs: usize,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            allow_resource_utxos: false,
            avoid_utxo_ids: HashSet::new(),
            p2wpkh_outputs: 1,
            p2tr_outputs: 1,
        }
    }
}

impl SelectionOptions {
    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn avoiding(mut self, outpoints: impl IntoIterator<Item = OutPoint>) -> Self {
        self.avoid_utxo_ids.extend(outpoints);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectionResult {
    pub selected_utxos: Vec<Utxo>,
    pub total_value: Amount,
    pub fee: Amount,
    /// Zero when the remainder was below dust and went to the fee.
    pub change_amount: Amount,
}

pub struct UtxoSelector {}

impl UtxoSelector {
    #[instrument(skip(candidates, options), target = "ord_inscriber::utxo_selector")]
    pub fn select(
        candidates: &[Utxo],
        required_amount: Amount,
        fee_rate: FeeRate,
        options: &SelectionOptions,
    ) -> Result<SelectionResult> {
        if fee_rate.sat_per_kvb() == 0 {
            return Err(InscriberError::InvalidFeeRate(fee_rate.to_string()));
        }

        let mut excluded_for_resources = 0usize;
        let eligible: Vec<&Utxo> = candidates
            .iter()
            .filter(|utxo| utxo.value > Amount::ZERO)
            .filter(|utxo| !options.avoid_utxo_ids.contains(&utxo.outpoint()))
            .filter(|utxo| {
                let keep = options.allow_resource_utxos || !utxo.has_resource;
                if !keep {
                    excluded_for_resources += 1;
                }
                keep
            })
            .collect();

        if eligible.is_empty() {
            return Err(if excluded_for_resources > 0 {
                InscriberError::AllUtxosContainResources
            } else {
                InscriberError::NoEligibleUtxos
            });
        }

        let fee_for = |input_count: usize| {
            let vbytes = InscriberFeeCalculator::estimate_size_with_outputs(
                input_count,
                options.p2wpkh_outputs,
                options.p2tr_outputs,
            );
            InscriberFeeCalculator::calculate_fee(vbytes, fee_rate)
        };
        let target_for = |input_count: usize| {
            required_amount
                .checked_add(fee_for(input_count))
                .ok_or_else(|| {
                    InscriberError::InvalidInput(format!(
                        "required amount {required_amount} plus fee overflows"
                    ))
                })
        };

        let single_target = target_for(1)?;
        let single = eligible
            .iter()
            .filter(|utxo| utxo.value >= single_target)
            .min_by_key(|utxo| (utxo.value, utxo.txid, utxo.vout));

        if let Some(utxo) = single {
            debug!(outpoint = %utxo.outpoint(), "Single UTXO covers the target");
            return Ok(Self::finish(
                vec![(*utxo).clone()],
                required_amount,
                fee_for(1),
            ));
        }

        let ordered = Self::order(eligible, options.strategy, single_target);

        let mut selected = Vec::new();
        let mut total = Amount::ZERO;
        for utxo in ordered {
            total = total
                .checked_add(utxo.value)
                .ok_or_else(|| InscriberError::InvalidUtxo("UTXO values overflow".to_string()))?;
            selected.push(utxo.clone());

            let fee = fee_for(selected.len());
            if total >= target_for(selected.len())? {
                debug!(inputs = selected.len(), "Accumulated enough UTXOs");
                return Ok(Self::finish(selected, required_amount, fee));
            }
        }

        Err(InscriberError::InsufficientFunds {
            required: target_for(selected.len())?,
            available: total,
        })
    }

    fn order(mut eligible: Vec<&Utxo>, strategy: SelectionStrategy, target: Amount) -> Vec<&Utxo> {
        match strategy {
            SelectionStrategy::ValueDesc => {
                eligible.sort_by_key(|utxo| (Reverse(utxo.value), utxo.txid, utxo.vout));
            }
            SelectionStrategy::ClosestToTarget => {
                eligible.sort_by_key(|utxo| {
                    let covers = utxo.value >= target;
                    let distance = if covers {
                        utxo.value - target
                    } else {
                        target - utxo.value
                    };
                    (!covers, distance, utxo.txid, utxo.vout)
                });
            }
            SelectionStrategy::OldestFirst => {
                eligible.sort_by_key(|utxo| (utxo.txid, utxo.vout));
            }
        }
        eligible
    }

    fn finish(selected_utxos: Vec<Utxo>, required_amount: Amount, fee: Amount) -> SelectionResult {
        let total_value: Amount = selected_utxos.iter().map(|utxo| utxo.value).sum();
        let change = total_value - required_amount - fee;

        let (fee, change_amount) = if change < DUST_LIMIT {
            (fee + change, Amount::ZERO)
        } else {
            (fee, change)
        };

        SelectionResult {
            selected_utxos,
            total_value,
            fee,
            change_amount,
        }
    }
}
