//! Rewind Core
//!
//! Seed handling, key derivation and signing shared by the Rewind crates.
//!
//! # Key Derivation
//!
//! - Hot wallet keys via BIP-84: m/84'/coin'/0'/change/index, from the
//!   wallet's BIP-39 seed
//! - The vault panic (pre-signing) key: m/84'/coin'/0'/0/0 on a fresh seed
//!   generated for that one vault and discarded once its transactions are
//!   signed
//!
//! Keys leave this crate as descriptor key expressions carrying their
//! origin (`[fingerprint/path]pubkey`), which is what [`signer::Signer`]
//! uses to find the private key again.

pub mod keys;
pub mod seed;
pub mod signer;

pub use keys::*;
pub use seed::*;
pub use signer::{Signer, SignerError, XprivSigner};
