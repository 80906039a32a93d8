//! CLI configuration, parsed from a TOML file plus environment overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Seed and funding UTXOs
    pub wallet: WalletSection,

    /// The vault to build
    pub vault: VaultSection,

    /// Fee ladder bounds
    #[serde(default)]
    pub fees: FeesSection,

    /// Backup file and logging
    #[serde(default)]
    pub output: OutputSection,
}

/// Seed and funding UTXOs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSection {
    /// Bitcoin network: "bitcoin", "testnet", "signet", "regtest"
    #[serde(default = "default_network")]
    pub network: String,

    /// File holding the BIP-39 mnemonic
    pub mnemonic_file: PathBuf,

    /// JSON array of `{txid, vout, value, change, index}` entries
    pub utxos_file: PathBuf,

    /// Change address index (m/84'/coin'/0'/1/index)
    #[serde(default)]
    pub change_index: u32,
}

/// The vault to build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSection {
    /// Amount to vault, in satoshis
    pub amount: u64,

    /// Relative lock of the unvault path, in blocks (default: 1 day)
    #[serde(default = "default_lock_blocks")]
    pub lock_blocks: u32,

    /// Address receiving rescued funds
    pub cold_address: String,

    /// Funding transaction fee rate, sat/vB
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,

    /// Selects the unvault key of this vault (m/84'/coin'/0'/0/index)
    #[serde(default)]
    pub vault_index: u32,

    /// Service fee in satoshis (0 disables it)
    #[serde(default)]
    pub service_fee: u64,

    /// Address receiving the service fee
    pub service_address: Option<String>,
}

/// Fee ladder bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeesSection {
    /// Rate every trigger and rescue ladder must reach, sat/vB
    #[serde(default = "default_ceiling")]
    pub ceiling: f64,

    /// Highest rate sampled when funds allow, sat/vB
    #[serde(default = "default_max_ceiling")]
    pub max_ceiling: f64,

    /// Points on the fee curve
    #[serde(default = "default_samples")]
    pub samples: usize,
}

impl Default for FeesSection {
    fn default() -> Self {
        Self {
            ceiling: default_ceiling(),
            max_ceiling: default_max_ceiling(),
            samples: default_samples(),
        }
    }
}

/// Backup file and logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSection {
    /// Where the vault backup JSON is written
    #[serde(default = "default_output_path")]
    pub path: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            log_level: default_log_level(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_network() -> String {
    "bitcoin".to_string()
}

fn default_lock_blocks() -> u32 {
    144 // ~1 day
}

fn default_fee_rate() -> f64 {
    2.0
}

fn default_ceiling() -> f64 {
    100.0
}

fn default_max_ceiling() -> f64 {
    10_000.0
}

fn default_samples() -> usize {
    60
}

fn default_output_path() -> PathBuf {
    PathBuf::from("vault-backup.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl CliConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CliConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML config")?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `REWIND_NETWORK`
    /// - `REWIND_MNEMONIC_FILE`
    /// - `REWIND_UTXOS_FILE`
    /// - `REWIND_AMOUNT`
    /// - `REWIND_LOCK_BLOCKS`
    /// - `REWIND_COLD_ADDRESS`
    /// - `REWIND_FEE_RATE`
    /// - `REWIND_OUTPUT`
    /// - `REWIND_LOG_LEVEL`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("REWIND_NETWORK") {
            self.wallet.network = v;
        }
        if let Ok(v) = std::env::var("REWIND_MNEMONIC_FILE") {
            self.wallet.mnemonic_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("REWIND_UTXOS_FILE") {
            self.wallet.utxos_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("REWIND_AMOUNT") {
            if let Ok(sats) = v.parse::<u64>() {
                self.vault.amount = sats;
            }
        }
        if let Ok(v) = std::env::var("REWIND_LOCK_BLOCKS") {
            if let Ok(blocks) = v.parse::<u32>() {
                self.vault.lock_blocks = blocks;
            }
        }
        if let Ok(v) = std::env::var("REWIND_COLD_ADDRESS") {
            self.vault.cold_address = v;
        }
        if let Ok(v) = std::env::var("REWIND_FEE_RATE") {
            if let Ok(rate) = v.parse::<f64>() {
                self.vault.fee_rate = rate;
            }
        }
        if let Ok(v) = std::env::var("REWIND_OUTPUT") {
            self.output.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("REWIND_LOG_LEVEL") {
            self.output.log_level = v;
        }
    }

    /// Parse the network string to a `bitcoin::Network`.
    pub fn network(&self) -> bitcoin::Network {
        match self.wallet.network.as_str() {
            "testnet" | "testnet3" => bitcoin::Network::Testnet,
            "signet" => bitcoin::Network::Signet,
            "regtest" => bitcoin::Network::Regtest,
            _ => bitcoin::Network::Bitcoin,
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// Only checks what the file itself can get wrong; keys, addresses and
    /// the fee schedule are checked again when the vault is built.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            matches!(
                self.wallet.network.as_str(),
                "bitcoin" | "testnet" | "testnet3" | "signet" | "regtest"
            ),
            "wallet.network must be one of bitcoin, testnet, signet, regtest"
        );

        anyhow::ensure!(self.vault.amount > 0, "vault.amount must be > 0");

        // Locks are encoded in 16 bits of nSequence
        anyhow::ensure!(
            self.vault.lock_blocks > 0 && self.vault.lock_blocks <= u32::from(u16::MAX),
            "vault.lock_blocks must be between 1 and 65535"
        );

        anyhow::ensure!(
            !self.vault.cold_address.is_empty(),
            "vault.cold_address must not be empty"
        );

        anyhow::ensure!(
            self.vault.fee_rate >= 1.0,
            "vault.fee_rate must be >= 1 sat/vB"
        );

        if self.vault.service_fee > 0 {
            anyhow::ensure!(
                self.vault
                    .service_address
                    .as_deref()
                    .is_some_and(|a| !a.is_empty()),
                "vault.service_address is required when vault.service_fee is set"
            );
        }

        anyhow::ensure!(self.fees.ceiling >= 1.0, "fees.ceiling must be >= 1 sat/vB");
        anyhow::ensure!(
            self.fees.max_ceiling >= self.fees.ceiling,
            "fees.max_ceiling must be >= fees.ceiling"
        );
        anyhow::ensure!(self.fees.samples >= 2, "fees.samples must be >= 2");

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn minimal_toml() -> &'static str {
        r#"
[wallet]
mnemonic_file = "/secrets/mnemonic.txt"
utxos_file = "utxos.json"

[vault]
amount = 100000
cold_address = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
"#
    }

    fn full_toml() -> &'static str {
        r#"
[wallet]
network = "regtest"
mnemonic_file = "/secrets/mnemonic.txt"
utxos_file = "/data/utxos.json"
change_index = 4

[vault]
amount = 250000
lock_blocks = 10
cold_address = "bcrt1q6rz28mcfaxtmd6v789l9rrlrusdprr9pz3cppk"
fee_rate = 3.5
vault_index = 2
service_fee = 1000
service_address = "bcrt1qm34lsc65zpw79lxes69zkqmk6ee3ewf0j77s3h"

[fees]
ceiling = 50.0
max_ceiling = 2000.0
samples = 30

[output]
path = "/backups/vault.json"
log_level = "debug"
"#
    }

    fn load(toml: &str) -> CliConfig {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", toml).unwrap();
        CliConfig::from_file(file.path()).unwrap()
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = load(minimal_toml());
        assert_eq!(config.vault.amount, 100_000);
        assert_eq!(config.vault.lock_blocks, 144); // default
        assert_eq!(config.vault.fee_rate, 2.0); // default
        assert_eq!(config.wallet.network, "bitcoin"); // default
        assert_eq!(config.fees.samples, 60);
        assert_eq!(config.output.path, PathBuf::from("vault-backup.json"));
        assert!(config.vault.service_address.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config = load(full_toml());

        assert_eq!(config.network(), bitcoin::Network::Regtest);
        assert_eq!(config.wallet.change_index, 4);
        assert_eq!(config.vault.lock_blocks, 10);
        assert_eq!(config.vault.vault_index, 2);
        assert_eq!(config.vault.service_fee, 1000);
        assert_eq!(config.fees.ceiling, 50.0);
        assert_eq!(config.fees.max_ceiling, 2000.0);
        assert_eq!(config.output.log_level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_vault_section_fails() {
        let toml = r#"
[wallet]
mnemonic_file = "m.txt"
utxos_file = "u.json"
"#;
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", toml).unwrap();
        assert!(CliConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = load(minimal_toml());

        std::env::set_var("REWIND_NETWORK", "signet");
        std::env::set_var("REWIND_AMOUNT", "42000");
        std::env::set_var("REWIND_LOCK_BLOCKS", "not-a-number");

        config.apply_env_overrides();

        assert_eq!(config.network(), bitcoin::Network::Signet);
        assert_eq!(config.vault.amount, 42_000);
        // unparsable values are ignored
        assert_eq!(config.vault.lock_blocks, 144);

        std::env::remove_var("REWIND_NETWORK");
        std::env::remove_var("REWIND_AMOUNT");
        std::env::remove_var("REWIND_LOCK_BLOCKS");
    }

    #[test]
    fn test_validation_unknown_network() {
        let mut config = load(minimal_toml());
        config.wallet.network = "mainnet".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_lock_out_of_range() {
        let mut config = load(minimal_toml());
        config.vault.lock_blocks = 0;
        assert!(config.validate().is_err());
        config.vault.lock_blocks = 70_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_service_fee_needs_address() {
        let mut config = load(minimal_toml());
        config.vault.service_fee = 1000;
        assert!(config.validate().is_err());
        config.vault.service_address = Some("bc1qm34lsc65zpw79lxes69zkqmk6ee3ewf0j77s3h".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_fee_bounds() {
        let mut config = load(minimal_toml());
        config.fees.max_ceiling = 10.0;
        assert!(config.validate().is_err());

        let mut config = load(minimal_toml());
        config.fees.samples = 1;
        assert!(config.validate().is_err());

        let mut config = load(minimal_toml());
        config.vault.fee_rate = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = load(full_toml());
        let serialized = toml::to_string_pretty(&config).unwrap();

        let reparsed: CliConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(reparsed.vault.amount, config.vault.amount);
        assert_eq!(reparsed.fees.samples, config.fees.samples);
        assert_eq!(reparsed.vault.service_address, config.vault.service_address);
    }
}
