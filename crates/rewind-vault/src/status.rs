//! Runtime status of a vault
//!
//! The record is owned by the caller (it changes as transactions get pushed
//! and confirmed); this module only defines the legal transitions and what
//! can be derived from the record.
//!
//! ```text
//! Untriggered ──trigger──▶ Triggered(Confirming ─▶ Confirmed) ─┬─ matured ─▶ Hot
//!      │                                                       └─ rescue ──▶ Rescued
//!      └──panic──▶ Panicked
//! ```

use bitcoin::{relative, Sequence};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::LockBlocks;

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Cannot {event} a vault that is {from:?}")]
    InvalidTransition { from: Phase, event: &'static str },
}

/// Whether an input with `sequence` may be mined in the next block, given
/// that the output it spends has `confirmations` (1 = in the tip block).
pub fn sequence_lock_satisfied(sequence: Sequence, confirmations: u32) -> bool {
    match sequence.to_relative_lock_time() {
        None => true,
        Some(relative::LockTime::Blocks(height)) => confirmations >= u32::from(height.value()),
        // vault scripts never use time-based locks
        Some(relative::LockTime::Time(_)) => false,
    }
}

/// Coarse phase, independent of the chain tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Untriggered,
    Triggered,
    Rescued,
    Panicked,
}

/// Full state at a given tip height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultState {
    Untriggered,
    Triggered(Confirmation),
    /// Lock matured, the unvault key can spend
    Hot,
    Rescued,
    Panicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confirmation {
    Confirming,
    Confirmed,
}

impl VaultState {
    /// Whether the ladder is done with this vault: nothing pre-signed can
    /// move it further along the unvault path.
    ///
    /// `Hot` counts as terminal, yet the rescue branch carries no timelock,
    /// so a rescue stays valid until the unvault spend confirms and
    /// [`VaultStatus::record_rescue`] still accepts one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, VaultState::Triggered(_) | VaultState::Untriggered)
    }
}

/// Caller-owned runtime record. Times are unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultStatus {
    pub vault_push_time: Option<u64>,
    pub vault_confirmation_height: Option<u32>,
    pub trigger_tx_hex: Option<String>,
    /// Set only when this wallet pushed the trigger
    pub trigger_push_time: Option<u64>,
    pub trigger_confirmation_height: Option<u32>,
    pub rescue_tx_hex: Option<String>,
    pub rescue_push_time: Option<u64>,
    pub rescue_confirmation_height: Option<u32>,
    /// Vault output spent by the panic key outside the ladder
    pub panicked: bool,
}

impl VaultStatus {
    pub fn phase(&self) -> Phase {
        if self.panicked {
            Phase::Panicked
        } else if self.rescue_tx_hex.is_some() {
            Phase::Rescued
        } else if self.trigger_tx_hex.is_some() {
            Phase::Triggered
        } else {
            Phase::Untriggered
        }
    }

    pub fn state(&self, lock_blocks: LockBlocks, tip_height: u32) -> VaultState {
        match self.phase() {
            Phase::Untriggered => VaultState::Untriggered,
            Phase::Rescued => VaultState::Rescued,
            Phase::Panicked => VaultState::Panicked,
            Phase::Triggered => match self.blocks_until_unvault(lock_blocks, tip_height) {
                None => VaultState::Triggered(Confirmation::Confirming),
                Some(0) => VaultState::Hot,
                Some(_) => VaultState::Triggered(Confirmation::Confirmed),
            },
        }
    }

    /// Blocks left before an unvault spend can be mined, once the trigger
    /// has confirmed.
    pub fn blocks_until_unvault(&self, lock_blocks: LockBlocks, tip_height: u32) -> Option<u32> {
        let confirmed_at = self.trigger_confirmation_height?;
        let matures_at = confirmed_at.saturating_add(u32::from(lock_blocks.blocks()));
        Some(matures_at.saturating_sub(tip_height.saturating_add(1)))
    }

    pub fn record_vault_push(&mut self, time: u64) {
        self.vault_push_time = Some(time);
    }

    pub fn record_vault_confirmation(&mut self, height: u32) {
        self.vault_confirmation_height = Some(height);
    }

    /// `push_time` is `None` when the trigger was seen on chain but not
    /// pushed by this wallet.
    pub fn record_trigger(&mut self, tx_hex: String, push_time: Option<u64>) -> Result<(), StatusError> {
        self.require_phase(Phase::Untriggered, "trigger")?;
        self.trigger_tx_hex = Some(tx_hex);
        self.trigger_push_time = push_time;
        Ok(())
    }

    pub fn record_trigger_confirmation(&mut self, height: u32) -> Result<(), StatusError> {
        if self.trigger_tx_hex.is_none() {
            return Err(StatusError::InvalidTransition {
                from: self.phase(),
                event: "confirm the trigger of",
            });
        }
        self.trigger_confirmation_height = Some(height);
        Ok(())
    }

    pub fn record_rescue(&mut self, tx_hex: String, push_time: Option<u64>) -> Result<(), StatusError> {
        self.require_phase(Phase::Triggered, "rescue")?;
        self.rescue_tx_hex = Some(tx_hex);
        self.rescue_push_time = push_time;
        Ok(())
    }

    pub fn record_rescue_confirmation(&mut self, height: u32) -> Result<(), StatusError> {
        self.require_phase(Phase::Rescued, "confirm the rescue of")?;
        self.rescue_confirmation_height = Some(height);
        Ok(())
    }

    pub fn record_panic(&mut self) -> Result<(), StatusError> {
        self.require_phase(Phase::Untriggered, "panic")?;
        self.panicked = true;
        Ok(())
    }

    fn require_phase(&self, phase: Phase, event: &'static str) -> Result<(), StatusError> {
        let from = self.phase();
        if from == phase {
            Ok(())
        } else {
            Err(StatusError::InvalidTransition { from, event })
        }
    }
}
