//! Transaction history of a vault.

use serde::{Deserialize, Serialize};

use crate::status::VaultStatus;
use crate::vault::{TxRole, Vault};

/// Kind of a transaction shown in a vault's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    Vault,
    /// Trigger seen on chain but not pushed by this wallet
    TriggerExternal,
    /// Trigger pushed by this wallet
    TriggerHotWallet,
    Rescue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub kind: TxKind,
    pub tx_hex: String,
    pub fee: Option<u64>,
    pub fee_rate: Option<f64>,
    pub push_time: Option<u64>,
    pub confirmation_height: Option<u32>,
}

/// Kind of `tx_hex` given what the wallet recorded, if it belongs to `vault`.
pub fn classify(vault: &Vault, status: &VaultStatus, tx_hex: &str) -> Option<TxKind> {
    Some(match vault.classify(tx_hex)? {
        TxRole::Vault => TxKind::Vault,
        TxRole::Trigger if status.trigger_push_time.is_some() => TxKind::TriggerHotWallet,
        TxRole::Trigger => TxKind::TriggerExternal,
        TxRole::Rescue { .. } => TxKind::Rescue,
    })
}

/// Entries for every transaction of `vault` that `status` has recorded,
/// oldest first.
pub fn history(vault: &Vault, status: &VaultStatus) -> Vec<HistoryEntry> {
    let vault_seen = status.vault_push_time.is_some() || status.vault_confirmation_height.is_some();
    let recorded = [
        (
            vault_seen.then_some(vault.vault_tx_hex()),
            status.vault_push_time,
            status.vault_confirmation_height,
        ),
        (
            status.trigger_tx_hex.as_deref(),
            status.trigger_push_time,
            status.trigger_confirmation_height,
        ),
        (
            status.rescue_tx_hex.as_deref(),
            status.rescue_push_time,
            status.rescue_confirmation_height,
        ),
    ];

    recorded
        .into_iter()
        .filter_map(|(tx_hex, push_time, confirmation_height)| {
            let tx_hex = tx_hex?;
            let kind = classify(vault, status, tx_hex)?;
            let info = vault.tx_info(tx_hex);
            Some(HistoryEntry {
                kind,
                tx_hex: tx_hex.to_string(),
                fee: info.map(|i| i.fee),
                fee_rate: info.map(|i| i.fee_rate),
                push_time,
                confirmation_height,
            })
        })
        .collect()
}
