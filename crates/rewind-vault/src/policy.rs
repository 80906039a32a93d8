//! Vault script construction
//!
//! Build the two output scripts of a vault, adapted from Liana.
//!
//! # Policy Structure
//!
//! The vault output is locked to the panic key alone:
//!
//! ```text
//! wpkh(PANIC)
//! ```
//!
//! A trigger moves it into:
//!
//! ```text
//! or(
//!   pk(PANIC),
//!   99@and(pk(UNVAULT), older(LOCK_BLOCKS))
//! )
//! ```
//!
//! This creates a Bitcoin script where:
//! - The panic key can spend at any time (rescue)
//! - The unvault key can only spend after LOCK_BLOCKS blocks have passed

use bitcoin::{Address, Network, ScriptBuf, Sequence};
use miniscript::descriptor::{DefiniteDescriptorKey, DescriptorPublicKey};
use miniscript::policy::Concrete;
use miniscript::{Descriptor, Miniscript, Segwitv0, ToPublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Odds given to the unvault branch when compiling.
const UNVAULT_BRANCH_WEIGHT: usize = 99;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Lock must be between 1 and 65535 blocks, got {0}")]
    InvalidLockBlocks(u32),

    #[error("Key {0} does not resolve to a single public key")]
    MalformedKey(String),

    #[error("Unvault and panic keys must differ")]
    DuplicateKey,

    #[error("Policy is not sane: {0}")]
    InsanePolicy(String),

    #[error("Miniscript error: {0}")]
    Miniscript(#[from] miniscript::Error),

    #[error("Policy compilation failed: {0}")]
    Compilation(String),
}

/// Relative lock of the unvault path, in blocks (~10 min each)
///
/// BIP-68 stores block-based relative locks in 16 bits, hence the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct LockBlocks(u16);

impl LockBlocks {
    pub fn from_blocks(blocks: u32) -> Result<Self, PolicyError> {
        match u16::try_from(blocks) {
            Ok(b) if b > 0 => Ok(Self(b)),
            _ => Err(PolicyError::InvalidLockBlocks(blocks)),
        }
    }

    /// Custom duration in days
    pub fn days(days: u32) -> Result<Self, PolicyError> {
        Self::from_blocks(days.saturating_mul(144))
    }

    pub fn blocks(&self) -> u16 {
        self.0
    }

    /// Sequence an unvault spend must carry for `older()` to pass.
    pub fn to_sequence(&self) -> Sequence {
        Sequence::from_height(self.0)
    }
}

impl TryFrom<u32> for LockBlocks {
    type Error = PolicyError;

    fn try_from(blocks: u32) -> Result<Self, Self::Error> {
        Self::from_blocks(blocks)
    }
}

impl From<LockBlocks> for u32 {
    fn from(lock: LockBlocks) -> u32 {
        u32::from(lock.0)
    }
}

impl fmt::Display for LockBlocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hours = u32::from(self.0) / 6;
        if hours >= 48 {
            write!(f, "~{} days ({} blocks)", hours / 24, self.0)
        } else if hours >= 1 {
            write!(f, "~{} hours ({} blocks)", hours, self.0)
        } else {
            write!(f, "~{} minutes ({} blocks)", u32::from(self.0) * 10, self.0)
        }
    }
}

/// A key expression that names exactly one public key.
///
/// Wildcard and multipath expressions are rejected: every script in a vault
/// is signed once, at creation, so there is nothing to derive later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKey {
    expression: DescriptorPublicKey,
    definite: DefiniteDescriptorKey,
}

impl SigningKey {
    pub fn new(expression: DescriptorPublicKey) -> Result<Self, PolicyError> {
        if expression.has_wildcard() || expression.is_multipath() {
            return Err(PolicyError::MalformedKey(expression.to_string()));
        }
        let definite = expression
            .clone()
            .at_derivation_index(0)
            .map_err(|_| PolicyError::MalformedKey(expression.to_string()))?;
        Ok(Self {
            expression,
            definite,
        })
    }

    /// The key expression, with its origin, as handed to a signer.
    pub fn expression(&self) -> &DescriptorPublicKey {
        &self.expression
    }

    pub fn definite(&self) -> &DefiniteDescriptorKey {
        &self.definite
    }

    pub fn public_key(&self) -> bitcoin::PublicKey {
        self.definite.to_public_key()
    }

    /// `wpkh(KEY)` output script.
    pub fn wpkh_script_pubkey(&self) -> Result<ScriptBuf, PolicyError> {
        Ok(Descriptor::new_wpkh(self.definite.clone())?.script_pubkey())
    }
}

impl fmt::Display for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

/// The compiled scripts of one vault.
#[derive(Debug, Clone)]
pub struct VaultScripts {
    unvault_key: SigningKey,
    panic_key: SigningKey,
    lock_blocks: LockBlocks,
    vault_descriptor: Descriptor<DefiniteDescriptorKey>,
    trigger_descriptor: Descriptor<DescriptorPublicKey>,
    trigger_definite: Descriptor<DefiniteDescriptorKey>,
}

impl VaultScripts {
    pub fn new(
        unvault_key: SigningKey,
        panic_key: SigningKey,
        lock_blocks: LockBlocks,
    ) -> Result<Self, PolicyError> {
        if unvault_key.public_key() == panic_key.public_key() {
            return Err(PolicyError::DuplicateKey);
        }

        let policy = trigger_policy(&unvault_key, &panic_key, lock_blocks);
        policy
            .is_valid()
            .map_err(|e| PolicyError::InsanePolicy(e.to_string()))?;

        let ms: Miniscript<DescriptorPublicKey, Segwitv0> = policy
            .compile()
            .map_err(|e| PolicyError::Compilation(e.to_string()))?;
        ms.sanity_check()
            .map_err(|e| PolicyError::InsanePolicy(e.to_string()))?;

        let trigger_descriptor = Descriptor::new_wsh(ms)?;
        let trigger_definite = trigger_descriptor
            .at_derivation_index(0)
            .map_err(|_| PolicyError::MalformedKey(trigger_descriptor.to_string()))?;
        let vault_descriptor = Descriptor::new_wpkh(panic_key.definite().clone())?;

        Ok(Self {
            unvault_key,
            panic_key,
            lock_blocks,
            vault_descriptor,
            trigger_descriptor,
            trigger_definite,
        })
    }

    pub fn unvault_key(&self) -> &SigningKey {
        &self.unvault_key
    }

    pub fn panic_key(&self) -> &SigningKey {
        &self.panic_key
    }

    pub fn lock_blocks(&self) -> LockBlocks {
        self.lock_blocks
    }

    /// The uncompiled trigger-output policy.
    pub fn to_concrete_policy(&self) -> Concrete<DescriptorPublicKey> {
        trigger_policy(&self.unvault_key, &self.panic_key, self.lock_blocks)
    }

    /// `wsh(...)` descriptor of trigger outputs, with key origins.
    pub fn trigger_descriptor(&self) -> &Descriptor<DescriptorPublicKey> {
        &self.trigger_descriptor
    }

    pub fn vault_descriptor(&self) -> &Descriptor<DefiniteDescriptorKey> {
        &self.vault_descriptor
    }

    /// Trigger descriptor with every key resolved, for satisfying spends.
    pub fn trigger_definite(&self) -> &Descriptor<DefiniteDescriptorKey> {
        &self.trigger_definite
    }

    pub fn vault_script_pubkey(&self) -> ScriptBuf {
        self.vault_descriptor.script_pubkey()
    }

    pub fn trigger_script_pubkey(&self) -> ScriptBuf {
        self.trigger_definite.script_pubkey()
    }

    /// Script committed to by the trigger output, needed for P2WSH sighashes.
    pub fn trigger_witness_script(&self) -> Result<ScriptBuf, PolicyError> {
        Ok(self.trigger_definite.explicit_script()?)
    }

    pub fn vault_address(&self, network: Network) -> Result<Address, PolicyError> {
        Ok(self.vault_descriptor.address(network)?)
    }

    pub fn trigger_address(&self, network: Network) -> Result<Address, PolicyError> {
        Ok(self.trigger_definite.address(network)?)
    }

    /// Worst-case witness weight of spending the vault output.
    pub fn vault_satisfaction_weight(&self) -> Result<u64, PolicyError> {
        Ok(self.vault_descriptor.max_weight_to_satisfy()?.to_wu())
    }

    /// Worst-case witness weight of spending a trigger output, either branch.
    pub fn trigger_satisfaction_weight(&self) -> Result<u64, PolicyError> {
        Ok(self.trigger_definite.max_weight_to_satisfy()?.to_wu())
    }
}

fn trigger_policy(
    unvault_key: &SigningKey,
    panic_key: &SigningKey,
    lock_blocks: LockBlocks,
) -> Concrete<DescriptorPublicKey> {
    let panic = Arc::new(Concrete::Key(panic_key.expression().clone()));
    let unvault = Arc::new(Concrete::And(vec![
        Arc::new(Concrete::Key(unvault_key.expression().clone())),
        Arc::new(Concrete::Older(miniscript::RelLockTime::from_height(
            lock_blocks.blocks(),
        ))),
    ]));
    Concrete::Or(vec![(1, panic), (UNVAULT_BRANCH_WEIGHT, unvault)])
}
