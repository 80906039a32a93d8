//! Pre-signed transaction lattice
//!
//! For every rate on the trigger ladder a trigger transaction is signed, and
//! for every trigger an independent ladder of rescue transactions:
//!
//! ```text
//! vault tx ─┬─ trigger @ 1 sat/vB ─┬─ rescue @ 1
//!           │                      ├─ rescue @ 1.17
//!           │                      └─ ...
//!           ├─ trigger @ 1.17 ───── ...
//!           └─ ...
//! ```
//!
//! All signatures are made with the panic key, so nothing here ever needs
//! to be signed again.

use std::collections::HashMap;

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa, Message};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use rewind_core::{Signer, SignerError};
use thiserror::Error;

use crate::coinselect::CoinSelection;
use crate::fee_ladder::{estimate_vsize, fee_for, FeeLadder, FeeSchedule};
use crate::policy::{PolicyError, VaultScripts};

#[derive(Error, Debug)]
pub enum PresignError {
    #[error("Cancelled by caller")]
    Cancelled,

    #[error("Fee ceiling {ceiling} sat/vB is not affordable from {value}")]
    CeilingUnaffordable { ceiling: f64, value: Amount },

    #[error("Fee {fee} exceeds spendable {value}")]
    Overspend { fee: Amount, value: Amount },

    #[error("Signing failed: {0}")]
    Signer(#[from] SignerError),

    #[error("Sighash computation failed: {0}")]
    Sighash(String),

    #[error("Could not satisfy {0}")]
    Satisfaction(#[from] miniscript::Error),

    #[error("Script error: {0}")]
    Policy(#[from] PolicyError),
}

/// Receives construction progress.
///
/// Returning `false` stops construction; no vault is produced.
pub trait Progress {
    fn report(&mut self, fraction: f64) -> bool;
}

impl<F> Progress for F
where
    F: FnMut(f64) -> bool,
{
    fn report(&mut self, fraction: f64) -> bool {
        self(fraction)
    }
}

/// Counts finished transactions against a known total.
pub(crate) struct Tracker<'a, P: Progress + ?Sized> {
    progress: &'a mut P,
    done: usize,
    total: usize,
}

impl<'a, P: Progress + ?Sized> Tracker<'a, P> {
    pub(crate) fn new(progress: &'a mut P, total: usize) -> Self {
        Self {
            progress,
            done: 0,
            total: total.max(1),
        }
    }

    /// Mark `n` more transactions done and ask whether to go on.
    pub(crate) fn advance(&mut self, n: usize) -> Result<(), PresignError> {
        self.done = (self.done + n).min(self.total);
        let fraction = self.done as f64 / self.total as f64;
        if self.progress.report(fraction) {
            Ok(())
        } else {
            log::info!("Vault construction cancelled at {:.0}%", fraction * 100.0);
            Err(PresignError::Cancelled)
        }
    }
}

/// A signed transaction and the fee it pays.
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub tx: Transaction,
    pub fee: Amount,
}

impl SignedTx {
    /// Fee rate of the signed transaction, in sat/vB.
    pub fn fee_rate(&self) -> f64 {
        self.fee.to_sat() as f64 / self.tx.vsize() as f64
    }

    pub fn to_hex(&self) -> String {
        serialize_hex(&self.tx)
    }
}

/// Rates to sign at, decided before any signing happens.
#[derive(Debug, Clone)]
pub struct LadderPlan {
    pub triggers: Vec<TriggerPlan>,
}

#[derive(Debug, Clone)]
pub struct TriggerPlan {
    pub fee_rate: f64,
    pub rescue_rates: Vec<f64>,
}

impl LadderPlan {
    /// Number of transactions the plan will sign.
    pub fn tx_count(&self) -> usize {
        self.triggers.iter().map(|t| 1 + t.rescue_rates.len()).sum()
    }
}

/// The signed lattice, in signing order.
#[derive(Debug, Clone, Default)]
pub struct Lattice {
    pub triggers: Vec<(SignedTx, Vec<SignedTx>)>,
}

/// Builds and signs triggers and rescues for one set of vault scripts.
pub struct TxFactory<'a, S: Signer> {
    scripts: &'a VaultScripts,
    cold_script: ScriptBuf,
    signer: &'a S,
    trigger_vsize: u64,
    rescue_vsize: u64,
}

impl<'a, S: Signer> TxFactory<'a, S> {
    pub fn new(
        scripts: &'a VaultScripts,
        cold_script: ScriptBuf,
        signer: &'a S,
    ) -> Result<Self, PresignError> {
        let template_outpoint = OutPoint::null();
        let trigger_vsize = estimate_vsize(
            &unsigned_spend(template_outpoint, Amount::ZERO, scripts.trigger_script_pubkey()),
            [scripts.vault_satisfaction_weight()?],
        );
        let rescue_vsize = estimate_vsize(
            &unsigned_spend(template_outpoint, Amount::ZERO, cold_script.clone()),
            [scripts.trigger_satisfaction_weight()?],
        );

        Ok(Self {
            scripts,
            cold_script,
            signer,
            trigger_vsize,
            rescue_vsize,
        })
    }

    /// Upper bound on a trigger's vsize.
    pub fn trigger_vsize(&self) -> u64 {
        self.trigger_vsize
    }

    /// Upper bound on a rescue's vsize.
    pub fn rescue_vsize(&self) -> u64 {
        self.rescue_vsize
    }

    /// Decide every rate up front.
    ///
    /// A trigger rate is kept only if its output can still be rescued at
    /// the same rate, or at the ceiling for rates above it.
    pub fn plan(&self, schedule: &FeeSchedule, vault_value: Amount) -> Result<LadderPlan, PresignError> {
        let ceiling = schedule.fee_rate_ceiling;
        let sampled_ceiling = FeeLadder::ceiling_rate(schedule);
        let triggers = FeeLadder::sample(schedule).affordable(vault_value, |r| {
            fee_for(r, self.trigger_vsize) + fee_for(r.min(sampled_ceiling), self.rescue_vsize)
        });
        if !triggers.covers(ceiling) {
            return Err(PresignError::CeilingUnaffordable {
                ceiling,
                value: vault_value,
            });
        }

        let triggers = triggers
            .rates()
            .iter()
            .map(|&rate| {
                let trigger_value = vault_value
                    .checked_sub(fee_for(rate, self.trigger_vsize))
                    .unwrap_or(Amount::ZERO);
                let rescues = FeeLadder::sample(schedule)
                    .affordable(trigger_value, |r| fee_for(r, self.rescue_vsize));
                log::debug!(
                    "Trigger @ {} sat/vB: {} rescue rates up to {:?}",
                    rate,
                    rescues.len(),
                    rescues.max()
                );
                TriggerPlan {
                    fee_rate: rate,
                    rescue_rates: rescues.rates().to_vec(),
                }
            })
            .collect();

        Ok(LadderPlan { triggers })
    }

    /// Spend the vault output to the trigger script at `fee_rate`.
    pub fn trigger(
        &self,
        vault_outpoint: OutPoint,
        vault_value: Amount,
        fee_rate: f64,
    ) -> Result<SignedTx, PresignError> {
        let fee = fee_for(fee_rate, self.trigger_vsize);
        let mut tx = unsigned_spend(
            vault_outpoint,
            spendable(vault_value, fee)?,
            self.scripts.trigger_script_pubkey(),
        );

        let panic_key = self.scripts.panic_key();
        let sighash = SighashCache::new(&tx)
            .p2wpkh_signature_hash(
                0,
                &self.scripts.vault_script_pubkey(),
                vault_value,
                EcdsaSighashType::All,
            )
            .map_err(|e| PresignError::Sighash(e.to_string()))?;
        let msg = Message::from_digest(sighash.to_byte_array());
        let signature = self.signer.sign_ecdsa(panic_key.expression(), &msg)?;

        tx.input[0].witness = p2wpkh_witness(signature, &panic_key.public_key());
        Ok(SignedTx { tx, fee })
    }

    /// Spend output 0 of `trigger` to the cold address through the panic branch.
    pub fn rescue(&self, trigger: &Transaction, fee_rate: f64) -> Result<SignedTx, PresignError> {
        let trigger_outpoint = OutPoint {
            txid: trigger.compute_txid(),
            vout: 0,
        };
        let trigger_value = trigger.output[0].value;
        let fee = fee_for(fee_rate, self.rescue_vsize);
        let mut tx = unsigned_spend(
            trigger_outpoint,
            spendable(trigger_value, fee)?,
            self.cold_script.clone(),
        );

        let panic_key = self.scripts.panic_key();
        let witness_script = self.scripts.trigger_witness_script()?;
        let sighash = SighashCache::new(&tx)
            .p2wsh_signature_hash(0, &witness_script, trigger_value, EcdsaSighashType::All)
            .map_err(|e| PresignError::Sighash(e.to_string()))?;
        let msg = Message::from_digest(sighash.to_byte_array());
        let signature = self.signer.sign_ecdsa(panic_key.expression(), &msg)?;

        let mut sigs = HashMap::new();
        sigs.insert(panic_key.definite().clone(), sighash_all(signature));
        self.scripts
            .trigger_definite()
            .satisfy(&mut tx.input[0], &sigs)?;
        Ok(SignedTx { tx, fee })
    }

    /// Sign every transaction of `plan`, reporting after each one.
    pub(crate) fn sign_lattice<P: Progress + ?Sized>(
        &self,
        vault_outpoint: OutPoint,
        vault_value: Amount,
        plan: &LadderPlan,
        tracker: &mut Tracker<'_, P>,
    ) -> Result<Lattice, PresignError> {
        let mut lattice = Lattice::default();
        for step in &plan.triggers {
            let trigger = self.trigger(vault_outpoint, vault_value, step.fee_rate)?;
            tracker.advance(1)?;

            let mut rescues = Vec::with_capacity(step.rescue_rates.len());
            for &rate in &step.rescue_rates {
                rescues.push(self.rescue(&trigger.tx, rate)?);
                tracker.advance(1)?;
            }
            lattice.triggers.push((trigger, rescues));
        }
        Ok(lattice)
    }
}

/// Sign the funding transaction's wallet inputs.
pub(crate) fn sign_funding<S: Signer>(
    tx: &mut Transaction,
    selection: &CoinSelection,
    signer: &S,
) -> Result<(), PresignError> {
    let mut witnesses = Vec::with_capacity(selection.inputs.len());
    {
        let mut cache = SighashCache::new(&*tx);
        for (index, utxo) in selection.inputs.iter().enumerate() {
            let sighash = cache
                .p2wpkh_signature_hash(index, utxo.script_pubkey(), utxo.value, EcdsaSighashType::All)
                .map_err(|e| PresignError::Sighash(e.to_string()))?;
            let msg = Message::from_digest(sighash.to_byte_array());
            let signature = signer.sign_ecdsa(utxo.key.expression(), &msg)?;
            witnesses.push(p2wpkh_witness(signature, &utxo.key.public_key()));
        }
    }
    for (input, witness) in tx.input.iter_mut().zip(witnesses) {
        input.witness = witness;
    }
    Ok(())
}

fn spendable(value: Amount, fee: Amount) -> Result<Amount, PresignError> {
    value
        .checked_sub(fee)
        .ok_or(PresignError::Overspend { fee, value })
}

fn sighash_all(signature: ecdsa::Signature) -> bitcoin::ecdsa::Signature {
    bitcoin::ecdsa::Signature {
        signature,
        sighash_type: EcdsaSighashType::All,
    }
}

/// P2WPKH witness: [signature + sighash_type, pubkey]
fn p2wpkh_witness(signature: ecdsa::Signature, public_key: &bitcoin::PublicKey) -> Witness {
    Witness::from_slice(&[sighash_all(signature).to_vec(), public_key.to_bytes()])
}

/// One-input, one-output v2 transaction without witness.
fn unsigned_spend(previous_output: OutPoint, value: Amount, script_pubkey: ScriptBuf) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value,
            script_pubkey,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::LockBlocks;
    use crate::test_utils::{
        cold_address, panic_key, small_schedule, test_master, test_signer, unvault_key,
    };
    use bitcoin::Txid;
    use rewind_core::XprivSigner;

    fn scripts() -> VaultScripts {
        VaultScripts::new(unvault_key(), panic_key(), LockBlocks::from_blocks(10).unwrap()).unwrap()
    }

    fn vault_outpoint() -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([0x11; 32]),
            vout: 0,
        }
    }

    #[test]
    fn test_closure_is_progress() {
        let mut seen = Vec::new();
        let mut progress = |f: f64| {
            seen.push(f);
            true
        };
        let mut tracker = Tracker::new(&mut progress, 4);
        tracker.advance(1).unwrap();
        tracker.advance(3).unwrap();
        assert_eq!(seen, vec![0.25, 1.0]);
    }

    #[test]
    fn test_tracker_stops_on_false() {
        let mut progress = |_: f64| false;
        let mut tracker = Tracker::new(&mut progress, 10);
        assert!(matches!(tracker.advance(1), Err(PresignError::Cancelled)));
    }

    #[test]
    fn test_trigger_pays_at_least_target_rate() {
        let scripts = scripts();
        let signer = test_signer();
        let factory = TxFactory::new(&scripts, cold_address().script_pubkey(), &signer).unwrap();

        for rate in [1.0, 5.5, 100.0] {
            let trigger = factory
                .trigger(vault_outpoint(), Amount::from_sat(100_000), rate)
                .unwrap();
            assert!(trigger.fee_rate() >= rate, "{} < {}", trigger.fee_rate(), rate);
            assert!(trigger.tx.vsize() as u64 <= factory.trigger_vsize());
            assert_eq!(
                trigger.tx.output[0].value + trigger.fee,
                Amount::from_sat(100_000)
            );
            assert_eq!(trigger.tx.output[0].script_pubkey, scripts.trigger_script_pubkey());
        }
    }

    #[test]
    fn test_rescue_spends_trigger_output() {
        let scripts = scripts();
        let signer = test_signer();
        let factory = TxFactory::new(&scripts, cold_address().script_pubkey(), &signer).unwrap();

        let trigger = factory
            .trigger(vault_outpoint(), Amount::from_sat(100_000), 2.0)
            .unwrap();
        let rescue = factory.rescue(&trigger.tx, 3.0).unwrap();

        assert_eq!(rescue.tx.input.len(), 1);
        assert_eq!(rescue.tx.input[0].previous_output.txid, trigger.tx.compute_txid());
        assert_eq!(rescue.tx.input[0].previous_output.vout, 0);
        assert_eq!(rescue.tx.output[0].script_pubkey, cold_address().script_pubkey());
        assert!(rescue.fee_rate() >= 3.0);
        assert!(rescue.tx.vsize() as u64 <= factory.rescue_vsize());
        let witness = &rescue.tx.input[0].witness;
        assert_eq!(
            witness.last(),
            Some(scripts.trigger_witness_script().unwrap().as_bytes())
        );
    }

    #[test]
    fn test_hot_seed_alone_cannot_sign_triggers() {
        let scripts = scripts();
        let hot = XprivSigner::new(test_master());
        let factory = TxFactory::new(&scripts, cold_address().script_pubkey(), &hot).unwrap();

        let result = factory.trigger(vault_outpoint(), Amount::from_sat(100_000), 2.0);
        assert!(matches!(
            result,
            Err(PresignError::Signer(SignerError::UnknownKey(_)))
        ));
    }

    #[test]
    fn test_trigger_overspend_rejected() {
        let scripts = scripts();
        let signer = test_signer();
        let factory = TxFactory::new(&scripts, cold_address().script_pubkey(), &signer).unwrap();

        let result = factory.trigger(vault_outpoint(), Amount::from_sat(100), 10.0);
        assert!(matches!(result, Err(PresignError::Overspend { .. })));
    }

    #[test]
    fn test_signing_is_deterministic() {
        let scripts = scripts();
        let signer = test_signer();
        let factory = TxFactory::new(&scripts, cold_address().script_pubkey(), &signer).unwrap();

        let a = factory.trigger(vault_outpoint(), Amount::from_sat(50_000), 7.0).unwrap();
        let b = factory.trigger(vault_outpoint(), Amount::from_sat(50_000), 7.0).unwrap();
        assert_eq!(a.to_hex(), b.to_hex());
    }

    #[test]
    fn test_plan_covers_ceiling() {
        let scripts = scripts();
        let signer = test_signer();
        let factory = TxFactory::new(&scripts, cold_address().script_pubkey(), &signer).unwrap();

        let plan = factory.plan(&small_schedule(), Amount::from_sat(100_000)).unwrap();
        assert!(plan.triggers.iter().any(|t| t.fee_rate >= 20.0));
        for step in &plan.triggers {
            assert!(!step.rescue_rates.is_empty());
            assert!(step.rescue_rates.windows(2).all(|w| w[0] < w[1]));
        }
        assert_eq!(
            plan.tx_count(),
            plan.triggers.len() + plan.triggers.iter().map(|t| t.rescue_rates.len()).sum::<usize>()
        );
    }

    #[test]
    fn test_plan_fails_below_ceiling() {
        let scripts = scripts();
        let signer = test_signer();
        let factory = TxFactory::new(&scripts, cold_address().script_pubkey(), &signer).unwrap();

        // 20 sat/vB on ~240 vB of trigger plus rescue is ~4800 sats
        let result = factory.plan(&small_schedule(), Amount::from_sat(4_000));
        assert!(matches!(result, Err(PresignError::CeilingUnaffordable { .. })));
    }
}
