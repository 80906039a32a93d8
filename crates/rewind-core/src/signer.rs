//! Signing capability.
//!
//! Vault construction never touches private keys directly: it asks a
//! [`Signer`] for an ECDSA signature over a sighash, naming the key by its
//! descriptor expression. [`XprivSigner`] is the in-process implementation
//! backed by a BIP-32 master key; hardware or remote signers implement the
//! same trait.

use bitcoin::bip32::{Fingerprint, Xpriv};
use bitcoin::secp256k1::{ecdsa, All, Message, Secp256k1};
use miniscript::descriptor::DescriptorPublicKey;
use miniscript::ToPublicKey;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("Key {0} does not belong to this signer")]
    UnknownKey(String),

    #[error("Key {0} has no usable derivation path")]
    MissingOrigin(String),

    #[error("Derived key does not match {0}")]
    KeyMismatch(String),

    #[error("Derivation failed: {0}")]
    Derivation(#[from] bitcoin::bip32::Error),
}

/// Produces ECDSA signatures for keys identified by descriptor expressions.
///
/// Implementations must be deterministic (RFC 6979) so that identical inputs
/// yield byte-identical pre-signed transactions.
pub trait Signer {
    fn sign_ecdsa(
        &self,
        key: &DescriptorPublicKey,
        msg: &Message,
    ) -> Result<ecdsa::Signature, SignerError>;
}

impl<T: Signer + ?Sized> Signer for &T {
    fn sign_ecdsa(
        &self,
        key: &DescriptorPublicKey,
        msg: &Message,
    ) -> Result<ecdsa::Signature, SignerError> {
        (**self).sign_ecdsa(key, msg)
    }
}

/// Two signers over disjoint key sets, e.g. the hot wallet and a
/// pre-signing seed. Keys the first does not hold go to the second.
impl<A: Signer, B: Signer> Signer for (A, B) {
    fn sign_ecdsa(
        &self,
        key: &DescriptorPublicKey,
        msg: &Message,
    ) -> Result<ecdsa::Signature, SignerError> {
        match self.0.sign_ecdsa(key, msg) {
            Err(SignerError::UnknownKey(_)) => self.1.sign_ecdsa(key, msg),
            other => other,
        }
    }
}

/// Signer holding a BIP-32 master private key.
pub struct XprivSigner {
    master: Xpriv,
    fingerprint: Fingerprint,
    secp: Secp256k1<All>,
}

impl XprivSigner {
    pub fn new(master: Xpriv) -> Self {
        let secp = Secp256k1::new();
        let fingerprint = master.fingerprint(&secp);
        Self {
            master,
            fingerprint,
            secp,
        }
    }

    /// Master fingerprint, as it appears in key origins.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl Signer for XprivSigner {
    fn sign_ecdsa(
        &self,
        key: &DescriptorPublicKey,
        msg: &Message,
    ) -> Result<ecdsa::Signature, SignerError> {
        if key.master_fingerprint() != self.fingerprint {
            return Err(SignerError::UnknownKey(key.to_string()));
        }
        let path = key
            .full_derivation_path()
            .ok_or_else(|| SignerError::MissingOrigin(key.to_string()))?;

        let derived = self.master.derive_priv(&self.secp, &path)?;

        let expected = key
            .clone()
            .at_derivation_index(0)
            .map_err(|_| SignerError::MissingOrigin(key.to_string()))?
            .to_public_key();
        if expected.inner != derived.private_key.public_key(&self.secp) {
            return Err(SignerError::KeyMismatch(key.to_string()));
        }

        Ok(self.secp.sign_ecdsa(msg, &derived.private_key))
    }
}
