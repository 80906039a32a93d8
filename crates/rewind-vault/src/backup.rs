//! Serializable export of a constructed vault.
//!
//! Holds every pre-signed transaction, so restoring a backup is enough to
//! trigger or rescue without the seed that created it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vault::{Vault, VaultError};

/// Current backup format.
pub const BACKUP_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported backup version {0}")]
    UnsupportedVersion(u32),

    #[error("Backup holds an invalid vault: {0}")]
    Invalid(#[from] VaultError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultBackup {
    /// Format version (for future compatibility)
    pub version: u32,
    /// Unix timestamp of the export
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    pub vault: Vault,
}

impl VaultBackup {
    pub fn new(vault: Vault, created_at: Option<u64>) -> Self {
        Self {
            version: BACKUP_VERSION,
            created_at,
            vault,
        }
    }

    pub fn to_json(&self) -> Result<String, BackupError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a backup.
    pub fn from_json(json: &str) -> Result<Self, BackupError> {
        let backup: VaultBackup = serde_json::from_str(json)?;
        if backup.version != BACKUP_VERSION {
            return Err(BackupError::UnsupportedVersion(backup.version));
        }
        backup.vault.validate()?;
        Ok(backup)
    }
}
