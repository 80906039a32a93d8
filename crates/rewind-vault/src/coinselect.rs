//! Coin selection for the vault funding transaction.

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use thiserror::Error;

use crate::fee_ladder::{estimate_vsize, fee_for, DUST_LIMIT, P2WPKH_SATISFACTION_WEIGHT};
use crate::policy::{PolicyError, SigningKey};

#[derive(Error, Debug)]
pub enum CoinSelectError {
    #[error("No UTXOs available")]
    NoUtxos,

    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Amount, available: Amount },

    #[error("Invalid fee rate: {0}")]
    InvalidFeeRate(f64),
}

/// A P2WPKH output owned by the hot wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletUtxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub key: SigningKey,
    script_pubkey: ScriptBuf,
}

impl WalletUtxo {
    pub fn new(outpoint: OutPoint, value: Amount, key: SigningKey) -> Result<Self, PolicyError> {
        let script_pubkey = key.wpkh_script_pubkey()?;
        Ok(Self {
            outpoint,
            value,
            key,
            script_pubkey,
        })
    }

    pub fn script_pubkey(&self) -> &Script {
        &self.script_pubkey
    }
}

/// Inputs and change chosen to fund a set of outputs.
#[derive(Debug, Clone)]
pub struct CoinSelection {
    pub inputs: Vec<WalletUtxo>,
    pub change: Option<TxOut>,
    pub fee: Amount,
}

impl CoinSelection {
    pub fn input_value(&self) -> Amount {
        self.inputs.iter().map(|u| u.value).sum()
    }
}

/// Picks wallet UTXOs paying for `targets` at `fee_rate` sat/vB.
pub trait CoinSelector {
    fn select(
        &self,
        utxos: &[WalletUtxo],
        targets: &[TxOut],
        change_script: &Script,
        fee_rate: f64,
    ) -> Result<CoinSelection, CoinSelectError>;
}

/// Accumulate the largest UTXOs first until the targets and fee are covered.
///
/// Ties are broken by outpoint so the same wallet always yields the same
/// selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct LargestFirst;

impl CoinSelector for LargestFirst {
    fn select(
        &self,
        utxos: &[WalletUtxo],
        targets: &[TxOut],
        change_script: &Script,
        fee_rate: f64,
    ) -> Result<CoinSelection, CoinSelectError> {
        if !fee_rate.is_finite() || fee_rate <= 0.0 {
            return Err(CoinSelectError::InvalidFeeRate(fee_rate));
        }
        if utxos.is_empty() {
            return Err(CoinSelectError::NoUtxos);
        }

        let mut sorted: Vec<&WalletUtxo> = utxos.iter().collect();
        sorted.sort_by(|a, b| b.value.cmp(&a.value).then(a.outpoint.cmp(&b.outpoint)));

        let target_value: Amount = targets.iter().map(|t| t.value).sum();
        let change_template = TxOut {
            value: Amount::ZERO,
            script_pubkey: change_script.to_owned(),
        };

        let mut selected: Vec<WalletUtxo> = Vec::new();
        let mut total = Amount::ZERO;
        let mut needed = target_value;

        for utxo in sorted {
            selected.push(utxo.clone());
            total += utxo.value;

            let fee_without_change = fee_for(fee_rate, funding_vsize(&selected, targets, None));
            needed = target_value + fee_without_change;
            if total < needed {
                continue;
            }

            let fee_with_change =
                fee_for(fee_rate, funding_vsize(&selected, targets, Some(&change_template)));
            let change = total
                .checked_sub(target_value + fee_with_change)
                .filter(|c| *c >= DUST_LIMIT);

            return Ok(match change {
                Some(value) => CoinSelection {
                    inputs: selected,
                    change: Some(TxOut {
                        value,
                        script_pubkey: change_script.to_owned(),
                    }),
                    fee: fee_with_change,
                },
                // remainder is too small to be worth an output
                None => CoinSelection {
                    inputs: selected,
                    change: None,
                    fee: total - target_value,
                },
            });
        }

        Err(CoinSelectError::InsufficientFunds {
            needed,
            available: total,
        })
    }
}

/// Estimated vsize of a funding transaction spending `inputs`.
pub(crate) fn funding_vsize(inputs: &[WalletUtxo], targets: &[TxOut], change: Option<&TxOut>) -> u64 {
    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|u| TxIn {
                previous_output: u.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: targets.iter().chain(change).cloned().collect(),
    };
    estimate_vsize(&tx, inputs.iter().map(|_| P2WPKH_SATISFACTION_WEIGHT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{change_script, cold_address, wallet_utxos};

    fn target(sats: u64) -> Vec<TxOut> {
        vec![TxOut {
            value: Amount::from_sat(sats),
            script_pubkey: cold_address().script_pubkey(),
        }]
    }

    #[test]
    fn test_largest_first_order() {
        let utxos = wallet_utxos(&[10_000, 80_000, 30_000]);
        let selection = LargestFirst
            .select(&utxos, &target(50_000), &change_script(), 2.0)
            .unwrap();

        assert_eq!(selection.inputs.len(), 1);
        assert_eq!(selection.inputs[0].value, Amount::from_sat(80_000));
        let change = selection.change.as_ref().unwrap();
        assert_eq!(
            selection.input_value(),
            Amount::from_sat(50_000) + change.value + selection.fee
        );
    }

    #[test]
    fn test_accumulates_until_covered() {
        let utxos = wallet_utxos(&[40_000, 40_000, 40_000]);
        let selection = LargestFirst
            .select(&utxos, &target(100_000), &change_script(), 1.0)
            .unwrap();
        assert_eq!(selection.inputs.len(), 3);
        // ties broken by outpoint
        assert_eq!(selection.inputs[0].outpoint, utxos[0].outpoint);
    }

    #[test]
    fn test_dust_change_goes_to_fee() {
        let utxos = wallet_utxos(&[50_500]);
        let selection = LargestFirst
            .select(&utxos, &target(50_000), &change_script(), 1.0)
            .unwrap();
        assert!(selection.change.is_none());
        assert_eq!(selection.fee, Amount::from_sat(500));
    }

    #[test]
    fn test_insufficient_funds() {
        let utxos = wallet_utxos(&[10_000, 5_000]);
        let result = LargestFirst.select(&utxos, &target(50_000), &change_script(), 1.0);
        match result {
            Err(CoinSelectError::InsufficientFunds { needed, available }) => {
                assert_eq!(available, Amount::from_sat(15_000));
                assert!(needed > Amount::from_sat(50_000));
            }
            other => panic!("expected InsufficientFunds, got {:?}", other),
        }
    }

    #[test]
    fn test_no_utxos() {
        let result = LargestFirst.select(&[], &target(1_000), &change_script(), 1.0);
        assert!(matches!(result, Err(CoinSelectError::NoUtxos)));
    }

    #[test]
    fn test_invalid_fee_rate() {
        let utxos = wallet_utxos(&[10_000]);
        let result = LargestFirst.select(&utxos, &target(1_000), &change_script(), f64::NAN);
        assert!(matches!(result, Err(CoinSelectError::InvalidFeeRate(_))));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let utxos = wallet_utxos(&[7_000, 9_000, 9_000, 20_000]);
        let a = LargestFirst
            .select(&utxos, &target(30_000), &change_script(), 3.0)
            .unwrap();
        let b = LargestFirst
            .select(&utxos, &target(30_000), &change_script(), 3.0)
            .unwrap();
        assert_eq!(a.inputs, b.inputs);
        assert_eq!(a.fee, b.fee);
    }
}
