//! Rewind CLI: build a vault and its pre-signed fee ladder from a config file
//!
//! Derives the hot wallet and unvault keys from a BIP-39 mnemonic, funds the
//! vault from the listed wallet UTXOs, pre-signs every trigger and rescue
//! with a panic key from a throwaway seed, and writes a JSON backup holding
//! all of them.
//!
//! # Usage
//!
//! ```bash
//! rewind-cli --config /path/to/rewind.toml
//! rewind-cli --config rewind.toml --validate   # Validate config and exit
//! ```

mod config;
mod runner;

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Exit code when construction ends without a vault (not enough funds,
/// coin selection, cancellation).
const EXIT_NO_VAULT: i32 = 2;

fn main() -> Result<()> {
    // Parse CLI args (no clap)
    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("rewind.toml");
    let mut validate_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = PathBuf::from(&args[i]);
                } else {
                    anyhow::bail!("--config requires a path argument");
                }
            }
            "--validate" => {
                validate_only = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("rewind-cli {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other => {
                anyhow::bail!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    // Load config
    let mut cli_config = config::CliConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Apply env overrides
    cli_config.apply_env_overrides();

    // Validate
    cli_config
        .validate()
        .context("Configuration validation failed")?;

    // Init logger
    std::env::set_var("RUST_LOG", &cli_config.output.log_level);
    env_logger::init();

    if validate_only {
        println!("✅ Configuration is valid.");
        println!("  Network:       {}", cli_config.network());
        println!("  Amount:        {} sat", cli_config.vault.amount);
        println!("  Lock:          {} blocks", cli_config.vault.lock_blocks);
        println!("  Cold address:  {}", cli_config.vault.cold_address);
        println!(
            "  Fee ladder:    {} samples, ceiling {} sat/vB, max {} sat/vB",
            cli_config.fees.samples, cli_config.fees.ceiling, cli_config.fees.max_ceiling
        );
        println!("  Backup:        {}", cli_config.output.path.display());
        return Ok(());
    }

    let vault = match runner::run(&cli_config)? {
        Ok(vault) => vault,
        Err(failure) => {
            log::error!("Vault construction failed: {}", failure);
            eprintln!("{}: {}", failure.code(), failure);
            std::process::exit(EXIT_NO_VAULT);
        }
    };

    let triggers = vault.trigger_candidates()?;
    let lowest = triggers.as_slice().first().map_or(0.0, |c| c.fee_rate);
    let highest = triggers.highest().map_or(0.0, |c| c.fee_rate);

    println!("✅ Vault created.");
    println!("  Vault ID:      {}", vault.vault_id());
    println!("  Vault txid:    {}", vault.vault_tx()?.compute_txid());
    println!("  Amount:        {}", vault.vaulted_amount());
    println!("  Lock:          {}", vault.lock_blocks());
    println!(
        "  Triggers:      {} ({:.2} to {:.2} sat/vB)",
        triggers.len(),
        lowest,
        highest
    );
    println!("  Transactions:  {}", vault.tx_map().len());
    println!("  Backup:        {}", cli_config.output.path.display());
    println!();
    println!("Broadcast the vault transaction:");
    println!("{}", vault.vault_tx_hex());

    Ok(())
}

fn print_help() {
    println!(
        r#"Rewind CLI: vault builder

USAGE:
    rewind-cli [OPTIONS]

OPTIONS:
    -c, --config <PATH>   Config file path (default: rewind.toml)
    --validate            Validate config file and exit
    -h, --help            Show this help message
    -V, --version         Show version

ENVIRONMENT VARIABLES (override config file):
    REWIND_NETWORK         Bitcoin network (bitcoin/testnet/signet/regtest)
    REWIND_MNEMONIC_FILE   File holding the BIP-39 mnemonic
    REWIND_UTXOS_FILE      JSON file listing the funding UTXOs
    REWIND_AMOUNT          Amount to vault, in satoshis
    REWIND_LOCK_BLOCKS     Unvault lock in blocks
    REWIND_COLD_ADDRESS    Address receiving rescued funds
    REWIND_FEE_RATE        Funding fee rate in sat/vB
    REWIND_OUTPUT          Backup file path
    REWIND_LOG_LEVEL       Log level (error/warn/info/debug/trace)

EXIT CODES:
    0   Vault created (or configuration valid)
    1   Setup error (config, files, keys, parameters)
    2   No vault: NOT_ENOUGH_FUNDS, COINSELECT_ERROR, USER_CANCEL or UNKNOWN_ERROR

EXAMPLES:
    # Build a vault
    rewind-cli --config rewind.toml

    # Validate configuration
    rewind-cli --config rewind.toml --validate
"#
    );
}
