//! Shared test utilities for rewind-vault tests.
//!
//! The hot wallet is the BIP-39 "abandon ... about" mnemonic and the
//! pre-signing seed is "zoo ... wrong", both on regtest, so fixtures are
//! deterministic across runs.

use bitcoin::bip32::Xpriv;
use bitcoin::hashes::Hash;
use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Txid};
use rewind_core::{
    derive_master, derive_seed, key_expression, panic_key_path, parse_mnemonic, unvault_key_path,
    bip84_path, wpkh_address, HOT_ACCOUNT, XprivSigner,
};

use crate::coinselect::WalletUtxo;
use crate::fee_ladder::FeeSchedule;
use crate::policy::SigningKey;
use crate::vault::{ServiceFee, VaultParams};

pub const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

pub const PRESIGNING: &str = "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo wrong";

fn master_of(words: &str) -> Xpriv {
    let mnemonic = parse_mnemonic(words).unwrap();
    let seed = derive_seed(&mnemonic, "");
    derive_master(&seed, Network::Regtest).unwrap()
}

pub fn test_master() -> Xpriv {
    master_of(ABANDON)
}

pub fn presigning_master() -> Xpriv {
    master_of(PRESIGNING)
}

/// Hot wallet signer paired with the pre-signing seed's signer.
pub fn test_signer() -> (XprivSigner, XprivSigner) {
    (
        XprivSigner::new(test_master()),
        XprivSigner::new(presigning_master()),
    )
}

/// Panic key, on the pre-signing seed
pub fn panic_key() -> SigningKey {
    let path = panic_key_path(Network::Regtest).unwrap();
    SigningKey::new(key_expression(&presigning_master(), &path).unwrap()).unwrap()
}

/// Unvault key of vault #0: `[73c5da0a/84'/1'/0'/0/0]`
pub fn unvault_key() -> SigningKey {
    let path = unvault_key_path(Network::Regtest, 0).unwrap();
    SigningKey::new(key_expression(&test_master(), &path).unwrap()).unwrap()
}

/// Hot wallet key at `m/84'/1'/0'/change/index`.
pub fn wallet_key(change: bool, index: u32) -> SigningKey {
    let path = bip84_path(Network::Regtest, HOT_ACCOUNT, change, index).unwrap();
    SigningKey::new(key_expression(&test_master(), &path).unwrap()).unwrap()
}

/// A fixed address outside the test wallet.
pub fn cold_address() -> Address {
    let mnemonic = parse_mnemonic(
        "legal winner thank year wave sausage worth useful legal winner thank yellow",
    )
    .unwrap();
    let seed = derive_seed(&mnemonic, "");
    let master = derive_master(&seed, Network::Regtest).unwrap();
    let path = bip84_path(Network::Regtest, 0, false, 0).unwrap();
    wpkh_address(&master, &path, Network::Regtest).unwrap()
}

pub fn service_address() -> Address {
    let path = bip84_path(Network::Regtest, 7, false, 0).unwrap();
    wpkh_address(&test_master(), &path, Network::Regtest).unwrap()
}

pub fn change_script() -> ScriptBuf {
    wallet_key(true, 0).wpkh_script_pubkey().unwrap()
}

/// Wallet UTXOs with the given values, each on its own receive key.
pub fn wallet_utxos(values: &[u64]) -> Vec<WalletUtxo> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let mut txid = [0u8; 32];
            txid[0] = 0xAA;
            txid[31] = i as u8;
            WalletUtxo::new(
                OutPoint {
                    txid: Txid::from_byte_array(txid),
                    vout: i as u32,
                },
                Amount::from_sat(*value),
                wallet_key(false, i as u32),
            )
            .unwrap()
        })
        .collect()
}

/// Narrow schedule that keeps unit tests fast.
pub fn small_schedule() -> FeeSchedule {
    FeeSchedule {
        fee_rate_ceiling: 20.0,
        max_fee_rate_ceiling: 50.0,
        samples: 6,
    }
}

pub fn test_params(vaulted: u64, schedule: FeeSchedule) -> VaultParams {
    VaultParams {
        network: Network::Regtest,
        unvault_key: unvault_key().expression().clone(),
        panic_key: panic_key().expression().clone(),
        cold_address: cold_address().as_unchecked().clone(),
        lock_blocks: 10,
        vaulted_amount: Amount::from_sat(vaulted),
        service_fee: Some(ServiceFee {
            address: service_address().as_unchecked().clone(),
            amount: Amount::from_sat(1_000),
        }),
        fee_rate: 2.0,
        fee_schedule: schedule,
        change_script: change_script(),
    }
}
