//! Rewind Vault Module
//!
//! Time-locked vaults with a pre-signed fee ladder, adapted from Liana.
//!
//! # Concepts
//!
//! - **Vault output**: `wpkh(PANIC)`, only ever spent by pre-signed transactions
//! - **Trigger**: moves the vault output into the unvault script, starting the clock
//! - **Rescue**: sends a triggered output to the cold address before the clock runs out
//! - **Fee ladder**: the same trigger (or rescue) signed at many fee rates
//!
//! # Trigger Output Policy
//!
//! ```text
//! or(
//!   pk(PANIC),
//!   99@and(pk(UNVAULT), older(LOCK_BLOCKS))
//! )
//! ```
//!
//! which compiles to `andor(pk(UNVAULT),older(LOCK_BLOCKS),pk(PANIC))`.

pub mod backup;
pub mod coinselect;
pub mod fee_ladder;
pub mod history;
pub mod policy;
pub mod presign;
pub mod selector;
pub mod status;
pub mod vault;

#[cfg(test)]
pub mod test_utils;

pub use coinselect::{CoinSelection, CoinSelector, LargestFirst, WalletUtxo};
pub use fee_ladder::{FeeLadder, FeeSchedule};
pub use policy::{LockBlocks, SigningKey, VaultScripts};
pub use presign::Progress;
pub use selector::{CandidateSet, FeeRatePick, FeeRateSelector, TxCandidate};
pub use vault::{create_vault, ServiceFee, TxInfo, Vault, VaultBlueprint, VaultError, VaultFailure, VaultParams};
