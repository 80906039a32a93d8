//! Key derivation from BIP-39 seed
//!
//! Hot wallet keys follow BIP-84. The panic key that pre-signs a vault's
//! trigger and rescue transactions lives on a separate, single-use seed: it
//! must never be derivable from the hot wallet, or the hot seed alone could
//! spend the vault output.

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, CompressedPublicKey, Network};
use miniscript::descriptor::{DescriptorPublicKey, SinglePub, SinglePubKey};
use thiserror::Error;

/// BIP-84 purpose (native segwit)
pub const BIP84_PURPOSE: u32 = 84;

/// Account holding the hot wallet (receive/change and unvault keys)
pub const HOT_ACCOUNT: u32 = 0;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Derivation failed: {0}")]
    DerivationFailed(#[from] bitcoin::bip32::Error),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// SLIP-44 coin type: 0 on mainnet, 1 on every test network.
pub fn coin_type(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}

/// Derive the BIP-32 master key for `network`.
pub fn derive_master(seed: &[u8; 64], network: Network) -> Result<Xpriv, KeyError> {
    Ok(Xpriv::new_master(network, seed)?)
}

/// `m/84'/coin'/account'/change/index`
pub fn bip84_path(
    network: Network,
    account: u32,
    change: bool,
    index: u32,
) -> Result<DerivationPath, KeyError> {
    let children = vec![
        ChildNumber::from_hardened_idx(BIP84_PURPOSE)?,
        ChildNumber::from_hardened_idx(coin_type(network))?,
        ChildNumber::from_hardened_idx(account)?,
        ChildNumber::from_normal_idx(u32::from(change))?,
        ChildNumber::from_normal_idx(index)?,
    ];
    Ok(DerivationPath::from(children))
}

/// Path of the panic key on a pre-signing seed.
///
/// A pre-signing seed serves exactly one vault, so the path is fixed.
pub fn panic_key_path(network: Network) -> Result<DerivationPath, KeyError> {
    bip84_path(network, 0, false, 0)
}

/// Path of the hot wallet key that may unvault vault number `vault_index`.
pub fn unvault_key_path(network: Network, vault_index: u32) -> Result<DerivationPath, KeyError> {
    bip84_path(network, HOT_ACCOUNT, false, vault_index)
}

/// Build a single-key descriptor expression `[fingerprint/path]pubkey`.
///
/// The origin is what lets a [`crate::Signer`] find the private key later.
pub fn key_expression(master: &Xpriv, path: &DerivationPath) -> Result<DescriptorPublicKey, KeyError> {
    if path.is_master() {
        return Err(KeyError::InvalidPath("refusing to expose the master key".into()));
    }
    let secp = Secp256k1::new();
    let derived = master.derive_priv(&secp, path)?;
    let public_key = Xpub::from_priv(&secp, &derived).public_key;

    Ok(DescriptorPublicKey::Single(SinglePub {
        origin: Some((master.fingerprint(&secp), path.clone())),
        key: SinglePubKey::FullKey(bitcoin::PublicKey::new(public_key)),
    }))
}

/// P2WPKH address of the key at `path`.
pub fn wpkh_address(master: &Xpriv, path: &DerivationPath, network: Network) -> Result<Address, KeyError> {
    let secp = Secp256k1::new();
    let derived = master.derive_priv(&secp, path)?;
    let public_key = Xpub::from_priv(&secp, &derived).public_key;
    Ok(Address::p2wpkh(&CompressedPublicKey(public_key), network))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::{derive_seed, generate_mnemonic, parse_mnemonic};

    fn abandon_master(network: Network) -> Xpriv {
        let mnemonic = parse_mnemonic(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        )
        .unwrap();
        let seed = derive_seed(&mnemonic, "");
        derive_master(&seed, network).unwrap()
    }

    /// BIP-84 test vectors, https://github.com/bitcoin/bips/blob/master/bip-0084.mediawiki
    #[test]
    fn test_bip84_official_vectors() {
        let master = abandon_master(Network::Bitcoin);

        let receive = bip84_path(Network::Bitcoin, 0, false, 0).unwrap();
        assert_eq!(
            wpkh_address(&master, &receive, Network::Bitcoin).unwrap().to_string(),
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
        );

        let change = bip84_path(Network::Bitcoin, 0, true, 0).unwrap();
        assert_eq!(
            wpkh_address(&master, &change, Network::Bitcoin).unwrap().to_string(),
            "bc1q8c6fshw2dlwun7ekn9qwf37cu2rn755upcp6el"
        );
    }

    #[test]
    fn test_coin_type_per_network() {
        assert_eq!(coin_type(Network::Bitcoin), 0);
        assert_eq!(coin_type(Network::Testnet), 1);
        assert_eq!(coin_type(Network::Regtest), 1);
        assert_eq!(coin_type(Network::Signet), 1);
    }

    #[test]
    fn test_key_expression_carries_origin() {
        let master = abandon_master(Network::Regtest);
        let path = unvault_key_path(Network::Regtest, 3).unwrap();
        let key = key_expression(&master, &path).unwrap();

        assert_eq!(key.master_fingerprint().to_string(), "73c5da0a");
        assert_eq!(key.full_derivation_path(), Some(path));
        assert!(!key.has_wildcard());
    }

    #[test]
    fn test_panic_key_lives_outside_hot_seed() {
        let hot = abandon_master(Network::Regtest);
        let seed = derive_seed(&generate_mnemonic().unwrap(), "");
        let presigning = derive_master(&seed, Network::Regtest).unwrap();

        let panic = key_expression(&presigning, &panic_key_path(Network::Regtest).unwrap()).unwrap();
        let unvault =
            key_expression(&hot, &unvault_key_path(Network::Regtest, 0).unwrap()).unwrap();
        assert_ne!(panic.master_fingerprint(), unvault.master_fingerprint());

        // same path on the hot seed is a different key
        let on_hot = key_expression(&hot, &panic_key_path(Network::Regtest).unwrap()).unwrap();
        assert_ne!(
            on_hot.clone().at_derivation_index(0).unwrap(),
            panic.clone().at_derivation_index(0).unwrap()
        );
    }

    #[test]
    fn test_master_key_not_exposed() {
        let master = abandon_master(Network::Regtest);
        let result = key_expression(&master, &DerivationPath::master());
        assert!(matches!(result, Err(KeyError::InvalidPath(_))));
    }
}
