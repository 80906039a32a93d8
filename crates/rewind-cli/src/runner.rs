//! One construction run: derive keys, build the vault, write the backup.

use crate::config::CliConfig;
use anyhow::{Context, Result};
use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Amount, Network, OutPoint, Txid};
use rewind_core::{
    bip84_path, derive_master, derive_seed, generate_mnemonic, key_expression, panic_key_path,
    parse_mnemonic, unvault_key_path, XprivSigner, HOT_ACCOUNT,
};
use rewind_vault::backup::VaultBackup;
use rewind_vault::{
    FeeSchedule, LargestFirst, ServiceFee, SigningKey, Vault, VaultBlueprint, VaultFailure,
    VaultParams, WalletUtxo,
};
use serde::Deserialize;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// One entry of the UTXO file.
#[derive(Debug, Clone, Deserialize)]
pub struct UtxoEntry {
    pub txid: Txid,
    pub vout: u32,
    /// Satoshis
    pub value: u64,
    /// Whether the output sits on the change chain
    #[serde(default)]
    pub change: bool,
    /// Address index on that chain
    pub index: u32,
}

/// Build the vault described by `config` and write its backup.
///
/// The outer `Result` carries setup errors (files, keys, parameters), the
/// inner one the outcomes of construction itself.
pub fn run(config: &CliConfig) -> Result<Result<Vault, VaultFailure>> {
    let network = config.network();

    let words = std::fs::read_to_string(&config.wallet.mnemonic_file).with_context(|| {
        format!(
            "Failed to read mnemonic file: {}",
            config.wallet.mnemonic_file.display()
        )
    })?;
    let mnemonic = parse_mnemonic(words.trim()).context("Invalid mnemonic")?;
    let seed = derive_seed(&mnemonic, "");
    let master = derive_master(&seed, network).context("Failed to derive master key")?;
    let signer = XprivSigner::new(master);
    log::info!("Wallet fingerprint: {}", signer.fingerprint());

    let (presigner, panic_key) = presigning_signer(network)?;
    log::info!("Pre-signing key: {}", panic_key.expression());
    let unvault_key = key_expression(&master, &unvault_key_path(network, config.vault.vault_index)?)?;

    let utxos = load_utxos(&config.wallet.utxos_file, &master, network)?;
    log::info!(
        "Loaded {} UTXOs worth {}",
        utxos.len(),
        utxos.iter().map(|u| u.value).sum::<Amount>()
    );

    let change_key = hot_key(&master, network, true, config.wallet.change_index)?;
    let service_fee = match &config.vault.service_address {
        Some(address) if config.vault.service_fee > 0 => Some(ServiceFee {
            address: parse_address(address).context("Invalid vault.service_address")?,
            amount: Amount::from_sat(config.vault.service_fee),
        }),
        _ => None,
    };

    let params = VaultParams {
        network,
        unvault_key,
        panic_key: panic_key.expression().clone(),
        cold_address: parse_address(&config.vault.cold_address)
            .context("Invalid vault.cold_address")?,
        lock_blocks: config.vault.lock_blocks,
        vaulted_amount: Amount::from_sat(config.vault.amount),
        service_fee,
        fee_rate: config.vault.fee_rate,
        fee_schedule: FeeSchedule {
            fee_rate_ceiling: config.fees.ceiling,
            max_fee_rate_ceiling: config.fees.max_ceiling,
            samples: config.fees.samples,
        },
        change_script: change_key.wpkh_script_pubkey()?,
    };
    let blueprint = VaultBlueprint::new(params).context("Invalid vault parameters")?;

    let mut reported = 0;
    let mut progress = |fraction: f64| {
        let step = (fraction * 10.0).floor() as u32;
        if step > reported {
            reported = step;
            log::info!("Signing… {}%", step * 10);
        }
        true
    };

    let result = blueprint.create_vault(
        &utxos,
        &LargestFirst,
        &(&signer, &presigner),
        &mut progress,
    );
    // Every transaction the panic key will ever sign now exists.
    drop(presigner);

    let vault = match result {
        Ok(vault) => vault,
        Err(failure) => return Ok(Err(failure)),
    };

    write_backup(&vault, &config.output.path)?;
    Ok(Ok(vault))
}

/// Signer over a freshly generated seed, and the panic key it holds.
///
/// The seed is never written anywhere; once the signer is dropped the vault
/// output can only move along the pre-signed transactions.
pub fn presigning_signer(network: Network) -> Result<(XprivSigner, SigningKey)> {
    let mnemonic = generate_mnemonic().context("Failed to generate pre-signing seed")?;
    let seed = derive_seed(&mnemonic, "");
    let master = derive_master(&seed, network).context("Failed to derive pre-signing key")?;
    let panic_key = SigningKey::new(key_expression(&master, &panic_key_path(network)?)?)?;
    Ok((XprivSigner::new(master), panic_key))
}

/// Read the UTXO file and attach each entry's hot wallet key.
pub fn load_utxos(
    path: &Path,
    master: &bitcoin::bip32::Xpriv,
    network: Network,
) -> Result<Vec<WalletUtxo>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read UTXO file: {}", path.display()))?;
    let entries: Vec<UtxoEntry> =
        serde_json::from_str(&contents).with_context(|| "Failed to parse UTXO JSON")?;

    entries
        .into_iter()
        .map(|entry| {
            let key = hot_key(master, network, entry.change, entry.index)?;
            let outpoint = OutPoint {
                txid: entry.txid,
                vout: entry.vout,
            };
            WalletUtxo::new(outpoint, Amount::from_sat(entry.value), key)
                .with_context(|| format!("Unusable UTXO {}", outpoint))
        })
        .collect()
}

fn hot_key(
    master: &bitcoin::bip32::Xpriv,
    network: Network,
    change: bool,
    index: u32,
) -> Result<SigningKey> {
    let path = bip84_path(network, HOT_ACCOUNT, change, index)?;
    Ok(SigningKey::new(key_expression(master, &path)?)?)
}

fn parse_address(address: &str) -> Result<Address<NetworkUnchecked>> {
    address
        .parse::<Address<NetworkUnchecked>>()
        .with_context(|| format!("Not a Bitcoin address: {}", address))
}

fn write_backup(vault: &Vault, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let created_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs());
    let json = VaultBackup::new(vault.clone(), created_at).to_json()?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write backup: {}", path.display()))?;
    log::info!("Backup written to {}", path.display());
    Ok(())
}
