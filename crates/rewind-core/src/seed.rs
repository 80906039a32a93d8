//! BIP-39 seed management
//!
//! Mnemonic generation and parsing, and seed derivation. Seed bytes are
//! wiped from memory when dropped.

use bip39::{Language, Mnemonic};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),
}

/// Generate a new BIP-39 mnemonic (24 words)
pub fn generate_mnemonic() -> Result<Mnemonic, SeedError> {
    Mnemonic::generate_in(Language::English, 24)
        .map_err(|e| SeedError::InvalidMnemonic(e.to_string()))
}

/// Parse a mnemonic from words.
///
/// Surrounding whitespace (e.g. a trailing newline from a file) is ignored.
pub fn parse_mnemonic(words: &str) -> Result<Mnemonic, SeedError> {
    Mnemonic::parse_in(Language::English, words.trim())
        .map_err(|e| SeedError::InvalidMnemonic(e.to_string()))
}

/// Derive seed bytes from mnemonic (with optional passphrase)
pub fn derive_seed(mnemonic: &Mnemonic, passphrase: &str) -> Zeroizing<[u8; 64]> {
    Zeroizing::new(mnemonic.to_seed(passphrase))
}
