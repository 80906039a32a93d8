//! Vault assembly
//!
//! [`VaultBlueprint::new`] checks the caller's contract (keys, lock, fee
//! schedule, addresses) and compiles the scripts. [`VaultBlueprint::create_vault`]
//! then selects coins, signs the funding transaction and the whole
//! trigger/rescue lattice, and returns an immutable [`Vault`].

use std::collections::BTreeMap;
use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::address::NetworkUnchecked;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use miniscript::descriptor::DescriptorPublicKey;
use miniscript::Descriptor;
use rewind_core::Signer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coinselect::{CoinSelectError, CoinSelection, CoinSelector, WalletUtxo};
use crate::fee_ladder::{FeeSchedule, DUST_LIMIT, MIN_FEE_RATE};
use crate::policy::{LockBlocks, PolicyError, SigningKey, VaultScripts};
use crate::presign::{sign_funding, Lattice, PresignError, Progress, SignedTx, Tracker, TxFactory};
use crate::selector::{CandidateSet, TxCandidate};

/// Contract violations. Retrying with the same input cannot succeed.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Invalid fee schedule: {0}")]
    InvalidFeeSchedule(String),

    #[error("Invalid fee rate: {0} sat/vB")]
    InvalidFeeRate(f64),

    #[error("Address {0} is not valid for {1}")]
    WrongNetwork(String, Network),

    #[error("Service fee {0} is below the dust limit")]
    ServiceFeeBelowDust(Amount),

    #[error("Missing entry: {0}")]
    MissingEntry(String),

    #[error("Malformed transaction: {0}")]
    MalformedTransaction(String),

    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("Broken reference: {0}")]
    BrokenReference(String),

    #[error("Overspend: {0}")]
    Overspend(String),

    #[error("Rescues out of fee-rate order under trigger {0}")]
    UnsortedLadder(String),
}

/// Expected outcomes of a construction attempt that did not produce a vault.
#[derive(Error, Debug)]
pub enum VaultFailure {
    #[error("Coin selection failed: {0}")]
    CoinselectError(#[from] CoinSelectError),

    #[error("Not enough funds: {0}")]
    NotEnoughFunds(String),

    #[error("Cancelled")]
    UserCancel,

    #[error("Unknown error")]
    UnknownError,
}

impl VaultFailure {
    /// Stable identifier for callers that branch or localize on failures.
    pub fn code(&self) -> &'static str {
        match self {
            VaultFailure::CoinselectError(_) => "COINSELECT_ERROR",
            VaultFailure::NotEnoughFunds(_) => "NOT_ENOUGH_FUNDS",
            VaultFailure::UserCancel => "USER_CANCEL",
            VaultFailure::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Log `err` and collapse it into [`VaultFailure::UnknownError`].
    pub(crate) fn unknown(context: &str, err: impl std::fmt::Display) -> Self {
        log::error!("{}: {}", context, err);
        VaultFailure::UnknownError
    }
}

impl From<PresignError> for VaultFailure {
    fn from(err: PresignError) -> Self {
        match err {
            PresignError::Cancelled => VaultFailure::UserCancel,
            PresignError::CeilingUnaffordable { .. } | PresignError::Overspend { .. } => {
                VaultFailure::NotEnoughFunds(err.to_string())
            }
            other => VaultFailure::unknown("Pre-signing failed", other),
        }
    }
}

/// Fee and fee rate of one pre-signed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TxInfo {
    /// Satoshis
    pub fee: u64,
    /// sat/vB of the signed transaction
    pub fee_rate: f64,
}

impl From<&SignedTx> for TxInfo {
    fn from(signed: &SignedTx) -> Self {
        Self {
            fee: signed.fee.to_sat(),
            fee_rate: signed.fee_rate(),
        }
    }
}

/// Output paying a third-party service from the funding transaction.
#[derive(Debug, Clone)]
pub struct ServiceFee {
    pub address: Address<NetworkUnchecked>,
    pub amount: Amount,
}

/// Everything a vault is built from.
#[derive(Debug, Clone)]
pub struct VaultParams {
    pub network: Network,
    /// Hot key allowed to spend a trigger output once the lock matures
    pub unvault_key: DescriptorPublicKey,
    /// Pre-signing key; also the sole key of the vault output
    pub panic_key: DescriptorPublicKey,
    pub cold_address: Address<NetworkUnchecked>,
    pub lock_blocks: u32,
    pub vaulted_amount: Amount,
    pub service_fee: Option<ServiceFee>,
    /// Funding transaction fee rate, sat/vB
    pub fee_rate: f64,
    pub fee_schedule: FeeSchedule,
    pub change_script: ScriptBuf,
}

/// Validated parameters with compiled scripts, ready to build a vault.
#[derive(Debug, Clone)]
pub struct VaultBlueprint {
    network: Network,
    scripts: VaultScripts,
    cold_address: Address,
    service: Option<(Address, Amount)>,
    vaulted_amount: Amount,
    fee_rate: f64,
    fee_schedule: FeeSchedule,
    change_script: ScriptBuf,
}

impl VaultBlueprint {
    pub fn new(params: VaultParams) -> Result<Self, VaultError> {
        params.fee_schedule.validate()?;
        if !params.fee_rate.is_finite() || params.fee_rate < MIN_FEE_RATE {
            return Err(VaultError::InvalidFeeRate(params.fee_rate));
        }

        let lock_blocks = LockBlocks::from_blocks(params.lock_blocks)?;
        let scripts = VaultScripts::new(
            SigningKey::new(params.unvault_key)?,
            SigningKey::new(params.panic_key)?,
            lock_blocks,
        )?;

        let cold_address = require_network(params.cold_address, params.network)?;
        let service = match params.service_fee {
            Some(fee) if fee.amount > Amount::ZERO => {
                if fee.amount < DUST_LIMIT {
                    return Err(VaultError::ServiceFeeBelowDust(fee.amount));
                }
                Some((require_network(fee.address, params.network)?, fee.amount))
            }
            _ => None,
        };

        log::debug!(
            "Vault blueprint: lock {}, trigger descriptor {}",
            lock_blocks,
            scripts.trigger_descriptor()
        );

        Ok(Self {
            network: params.network,
            scripts,
            cold_address,
            service,
            vaulted_amount: params.vaulted_amount,
            fee_rate: params.fee_rate,
            fee_schedule: params.fee_schedule,
            change_script: params.change_script,
        })
    }

    pub fn scripts(&self) -> &VaultScripts {
        &self.scripts
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Fund, pre-sign and assemble the vault.
    ///
    /// `progress` is called after the funding transaction and after every
    /// trigger and rescue; returning `false` yields
    /// [`VaultFailure::UserCancel`].
    pub fn create_vault<C, S, P>(
        &self,
        utxos: &[WalletUtxo],
        coin_selector: &C,
        signer: &S,
        progress: &mut P,
    ) -> Result<Vault, VaultFailure>
    where
        C: CoinSelector + ?Sized,
        S: Signer,
        P: Progress + ?Sized,
    {
        let factory = TxFactory::new(&self.scripts, self.cold_address.script_pubkey(), signer)
            .map_err(|e| VaultFailure::unknown("Size estimation failed", e))?;
        let plan = factory.plan(&self.fee_schedule, self.vaulted_amount)?;
        log::info!(
            "Vault ladder: {} triggers, {} transactions to sign",
            plan.triggers.len(),
            plan.tx_count()
        );

        let mut targets = vec![TxOut {
            value: self.vaulted_amount,
            script_pubkey: self.scripts.vault_script_pubkey(),
        }];
        if let Some((address, amount)) = &self.service {
            targets.push(TxOut {
                value: *amount,
                script_pubkey: address.script_pubkey(),
            });
        }
        let selection = coin_selector.select(utxos, &targets, &self.change_script, self.fee_rate)?;

        let mut vault_tx = funding_transaction(&selection, targets);
        sign_funding(&mut vault_tx, &selection, signer)?;

        let mut tracker = Tracker::new(progress, 1 + plan.tx_count());
        tracker.advance(1)?;

        let vault_outpoint = OutPoint {
            txid: vault_tx.compute_txid(),
            vout: 0,
        };
        let lattice =
            factory.sign_lattice(vault_outpoint, self.vaulted_amount, &plan, &mut tracker)?;

        let vault = self.assemble(&vault_tx, &selection, lattice);
        vault
            .validate()
            .map_err(|e| VaultFailure::unknown("Assembled vault is inconsistent", e))?;

        log::info!(
            "Vault {} created: {} transactions, {} triggers",
            vault.vault_id,
            vault.tx_map.len(),
            vault.trigger_map.len()
        );
        Ok(vault)
    }

    fn assemble(&self, vault_tx: &Transaction, selection: &CoinSelection, lattice: Lattice) -> Vault {
        let mut tx_map = BTreeMap::new();
        let mut trigger_map = BTreeMap::new();

        let vault_tx_hex = serialize_hex(vault_tx);
        let spent: Amount = vault_tx.output.iter().map(|o| o.value).sum();
        let vault_fee = selection.input_value().checked_sub(spent).unwrap_or(Amount::ZERO);
        tx_map.insert(
            vault_tx_hex.clone(),
            TxInfo {
                fee: vault_fee.to_sat(),
                fee_rate: vault_fee.to_sat() as f64 / vault_tx.vsize() as f64,
            },
        );

        for (trigger, rescues) in lattice.triggers {
            let trigger_hex = trigger.to_hex();
            if tx_map.contains_key(&trigger_hex) {
                log::debug!("Trigger @ {:.2} sat/vB collides, skipped", trigger.fee_rate());
                continue;
            }
            tx_map.insert(trigger_hex.clone(), TxInfo::from(&trigger));

            let mut ladder: Vec<(f64, String)> = Vec::with_capacity(rescues.len());
            for rescue in &rescues {
                let hex = rescue.to_hex();
                if tx_map.contains_key(&hex) {
                    continue;
                }
                let info = TxInfo::from(rescue);
                tx_map.insert(hex.clone(), info);
                ladder.push((info.fee_rate, hex));
            }
            ladder.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            trigger_map.insert(trigger_hex, ladder.into_iter().map(|(_, hex)| hex).collect());
        }

        Vault {
            vault_id: self.scripts.panic_key().public_key().to_string(),
            network: self.network,
            vaulted_amount: self.vaulted_amount.to_sat(),
            lock_blocks: self.scripts.lock_blocks(),
            unvault_key: self.scripts.unvault_key().to_string(),
            cold_address: self.cold_address.to_string(),
            service_fee: self.service.as_ref().map_or(0, |(_, amount)| amount.to_sat()),
            vault_tx_hex,
            trigger_descriptor: self.scripts.trigger_descriptor().to_string(),
            tx_map,
            trigger_map,
        }
    }
}

/// Validate `params` and build a vault in one go.
///
/// The outer `Result` carries contract violations, the inner one the
/// expected construction outcomes.
pub fn create_vault<C, S, P>(
    params: VaultParams,
    utxos: &[WalletUtxo],
    coin_selector: &C,
    signer: &S,
    progress: &mut P,
) -> Result<Result<Vault, VaultFailure>, VaultError>
where
    C: CoinSelector + ?Sized,
    S: Signer,
    P: Progress + ?Sized,
{
    let blueprint = VaultBlueprint::new(params)?;
    Ok(blueprint.create_vault(utxos, coin_selector, signer, progress))
}

fn require_network(
    address: Address<NetworkUnchecked>,
    network: Network,
) -> Result<Address, VaultError> {
    let shown = address.clone().assume_checked().to_string();
    address
        .require_network(network)
        .map_err(|_| VaultError::WrongNetwork(shown, network))
}

fn funding_transaction(selection: &CoinSelection, mut outputs: Vec<TxOut>) -> Transaction {
    outputs.extend(selection.change.iter().cloned());
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: selection
            .inputs
            .iter()
            .map(|u| TxIn {
                previous_output: u.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    }
}

/// Role of a transaction inside a vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxRole {
    Vault,
    Trigger,
    Rescue { trigger_hex: String },
}

/// A constructed vault. Immutable: changing anything would invalidate the
/// signatures it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vault {
    vault_id: String,
    network: Network,
    vaulted_amount: u64,
    lock_blocks: LockBlocks,
    unvault_key: String,
    cold_address: String,
    service_fee: u64,
    vault_tx_hex: String,
    trigger_descriptor: String,
    tx_map: BTreeMap<String, TxInfo>,
    trigger_map: BTreeMap<String, Vec<String>>,
}

impl Vault {
    /// Hex public key of the panic key.
    pub fn vault_id(&self) -> &str {
        &self.vault_id
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn vaulted_amount(&self) -> Amount {
        Amount::from_sat(self.vaulted_amount)
    }

    pub fn lock_blocks(&self) -> LockBlocks {
        self.lock_blocks
    }

    pub fn unvault_key(&self) -> &str {
        &self.unvault_key
    }

    pub fn cold_address(&self) -> &str {
        &self.cold_address
    }

    pub fn service_fee(&self) -> Amount {
        Amount::from_sat(self.service_fee)
    }

    pub fn vault_tx_hex(&self) -> &str {
        &self.vault_tx_hex
    }

    pub fn trigger_descriptor(&self) -> &str {
        &self.trigger_descriptor
    }

    pub fn tx_map(&self) -> &BTreeMap<String, TxInfo> {
        &self.tx_map
    }

    pub fn trigger_map(&self) -> &BTreeMap<String, Vec<String>> {
        &self.trigger_map
    }

    pub fn tx_info(&self, tx_hex: &str) -> Option<&TxInfo> {
        self.tx_map.get(tx_hex)
    }

    pub fn vault_tx(&self) -> Result<Transaction, VaultError> {
        parse_tx(&self.vault_tx_hex)
    }

    /// Outpoint of the vault output (output 0 of the funding transaction).
    pub fn vault_outpoint(&self) -> Result<OutPoint, VaultError> {
        Ok(OutPoint {
            txid: self.vault_tx()?.compute_txid(),
            vout: 0,
        })
    }

    /// Check every structural invariant, stopping at the first violation.
    pub fn validate(&self) -> Result<(), VaultError> {
        if !self.tx_map.contains_key(&self.vault_tx_hex) {
            return Err(VaultError::MissingEntry("vault transaction".into()));
        }
        let vault_tx = self.vault_tx()?;
        let vault_txid = vault_tx.compute_txid();
        let vault_value = vault_tx
            .output
            .first()
            .map(|o| o.value)
            .ok_or_else(|| VaultError::MalformedTransaction(format!("{} has no outputs", vault_txid)))?;
        if vault_value.to_sat() != self.vaulted_amount {
            return Err(VaultError::BrokenReference(format!(
                "vault output holds {}, expected {} sat",
                vault_value, self.vaulted_amount
            )));
        }

        let trigger_spk = self.trigger_script_pubkey()?;
        for (trigger_hex, rescues) in &self.trigger_map {
            let trigger = parse_tx(trigger_hex)?;
            let trigger_txid = trigger.compute_txid();
            let info = self
                .tx_map
                .get(trigger_hex)
                .ok_or_else(|| VaultError::MissingEntry(format!("trigger {}", trigger_txid)))?;

            expect_single_spend(&trigger, vault_txid)?;
            if trigger.output.first().map(|o| &o.script_pubkey) != Some(&trigger_spk) {
                return Err(VaultError::BrokenReference(format!(
                    "trigger {} does not pay the trigger descriptor",
                    trigger_txid
                )));
            }
            check_fee(&trigger, vault_value, info)?;

            let trigger_value = trigger.output[0].value;
            let mut last_rate = f64::NEG_INFINITY;
            for rescue_hex in rescues {
                let rescue = parse_tx(rescue_hex)?;
                let info = self.tx_map.get(rescue_hex).ok_or_else(|| {
                    VaultError::MissingEntry(format!("rescue {}", rescue.compute_txid()))
                })?;
                expect_single_spend(&rescue, trigger_txid)?;
                check_fee(&rescue, trigger_value, info)?;
                if info.fee_rate < last_rate {
                    return Err(VaultError::UnsortedLadder(trigger_txid.to_string()));
                }
                last_rate = info.fee_rate;
            }
        }
        Ok(())
    }

    /// Triggers sorted by fee rate.
    pub fn trigger_candidates(&self) -> Result<CandidateSet, VaultError> {
        self.candidates(self.trigger_map.keys())
    }

    /// Rescues of one trigger, sorted by fee rate.
    pub fn rescue_candidates(&self, trigger_hex: &str) -> Result<CandidateSet, VaultError> {
        let rescues = self
            .trigger_map
            .get(trigger_hex)
            .ok_or_else(|| VaultError::MissingEntry("trigger not in this vault".into()))?;
        self.candidates(rescues)
    }

    pub fn classify(&self, tx_hex: &str) -> Option<TxRole> {
        if tx_hex == self.vault_tx_hex {
            return Some(TxRole::Vault);
        }
        if self.trigger_map.contains_key(tx_hex) {
            return Some(TxRole::Trigger);
        }
        self.trigger_map
            .iter()
            .find(|(_, rescues)| rescues.iter().any(|r| r == tx_hex))
            .map(|(trigger_hex, _)| TxRole::Rescue {
                trigger_hex: trigger_hex.clone(),
            })
    }

    fn trigger_script_pubkey(&self) -> Result<ScriptBuf, VaultError> {
        let descriptor = Descriptor::<DescriptorPublicKey>::from_str(&self.trigger_descriptor)
            .map_err(|e| VaultError::MalformedDescriptor(e.to_string()))?;
        let definite = descriptor
            .at_derivation_index(0)
            .map_err(|e| VaultError::MalformedDescriptor(e.to_string()))?;
        Ok(definite.script_pubkey())
    }

    fn candidates<'a, I>(&'a self, hexes: I) -> Result<CandidateSet, VaultError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let candidates = hexes
            .into_iter()
            .map(|hex| {
                let info = self
                    .tx_map
                    .get(hex)
                    .ok_or_else(|| VaultError::MissingEntry("transaction not in tx map".into()))?;
                let tx = parse_tx(hex)?;
                Ok(TxCandidate {
                    fee_rate: info.fee_rate,
                    fee: info.fee,
                    vsize: tx.vsize() as u64,
                    tx_hex: hex.clone(),
                })
            })
            .collect::<Result<Vec<_>, VaultError>>()?;
        Ok(CandidateSet::new(candidates))
    }
}

pub(crate) fn parse_tx(tx_hex: &str) -> Result<Transaction, VaultError> {
    let bytes = hex::decode(tx_hex).map_err(|e| VaultError::MalformedTransaction(e.to_string()))?;
    bitcoin::consensus::deserialize(&bytes).map_err(|e| VaultError::MalformedTransaction(e.to_string()))
}

fn expect_single_spend(tx: &Transaction, parent: bitcoin::Txid) -> Result<(), VaultError> {
    let expected = OutPoint {
        txid: parent,
        vout: 0,
    };
    match tx.input.as_slice() {
        [input] if input.previous_output == expected => Ok(()),
        _ => Err(VaultError::BrokenReference(format!(
            "{} does not spend {} alone",
            tx.compute_txid(),
            expected
        ))),
    }
}

fn check_fee(tx: &Transaction, spent: Amount, info: &TxInfo) -> Result<(), VaultError> {
    let out: Amount = tx.output.iter().map(|o| o.value).sum();
    match spent.checked_sub(out) {
        Some(fee) if fee.to_sat() == info.fee => Ok(()),
        _ => Err(VaultError::Overspend(format!(
            "{} pays {} out of {} with recorded fee {} sat",
            tx.compute_txid(),
            out,
            spent,
            info.fee
        ))),
    }
}
