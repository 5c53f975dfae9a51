//! Local key material used to authenticate to relays.
//!
//! An [`Identity`] is an Ed25519 signing key plus the optional shared mesh
//! key that relays require before they will stream peer presence. Secret
//! material is zeroized on drop.

use std::fmt;

use ed25519_dalek::{Signer, Verifier};
use meshtun_core::PeerKey;
use rand_core::OsRng;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::IdentityError;

/// Ed25519 signature length
pub const SIGNATURE_SIZE: usize = 64;

/// Local node identity
#[derive(Clone, ZeroizeOnDrop)]
pub struct Identity {
    signing_key: ed25519_dalek::SigningKey,
    mesh_key: Option<String>,
}

impl Identity {
    /// Fresh random identity
    pub fn generate() -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut OsRng),
            mesh_key: None,
        }
    }

    /// Identity from a 32-byte secret seed
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(bytes),
            mesh_key: None,
        }
    }

    /// Identity from a hex-encoded 32-byte secret seed
    pub fn from_hex(hex_secret: &str) -> Result<Self, IdentityError> {
        let bytes = Zeroizing::new(
            hex::decode(hex_secret.trim()).map_err(|_| IdentityError::InvalidHex)?,
        );
        let seed: &[u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(bytes.len()))?;
        Ok(Self::from_secret_bytes(seed))
    }

    /// Attach the shared mesh key
    #[must_use]
    pub fn with_mesh_key(mut self, mesh_key: impl Into<String>) -> Self {
        self.mesh_key = Some(mesh_key.into());
        self
    }

    /// Shared mesh key, if configured
    pub fn mesh_key(&self) -> Option<&str> {
        self.mesh_key.as_deref()
    }

    /// Public key identifying this node
    pub fn public_key(&self) -> PeerKey {
        PeerKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign `message`
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Hex-encoded secret seed, for writing key files
    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing_key.to_bytes()))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key())
            .field("mesh_key", &self.mesh_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Check `signature` over `message` against `key`
pub fn verify_signature(key: &PeerKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = ed25519_dalek::VerifyingKey::from_bytes(key.as_bytes()) else {
        return false;
    };
    let Ok(signature) = ed25519_dalek::Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let identity = Identity::generate();
        let signature = identity.sign(b"challenge");

        assert!(verify_signature(&identity.public_key(), b"challenge", &signature));
        assert!(!verify_signature(&identity.public_key(), b"other", &signature));
        assert!(!verify_signature(
            &Identity::generate().public_key(),
            b"challenge",
            &signature
        ));
        assert!(!verify_signature(&identity.public_key(), b"challenge", &signature[..10]));
    }

    #[test]
    fn test_hex_roundtrip() {
        let identity = Identity::generate();
        let restored = Identity::from_hex(&identity.secret_hex()).unwrap();
        assert_eq!(restored.public_key(), identity.public_key());
    }

    #[test]
    fn test_hex_errors() {
        assert_eq!(Identity::from_hex("zz").unwrap_err(), IdentityError::InvalidHex);
        assert_eq!(
            Identity::from_hex("abcd").unwrap_err(),
            IdentityError::InvalidLength(2)
        );
    }

    #[test]
    fn test_deterministic_from_seed() {
        let a = Identity::from_secret_bytes(&[7; 32]);
        let b = Identity::from_secret_bytes(&[7; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.sign(b"m"), b.sign(b"m"));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let identity = Identity::from_secret_bytes(&[1; 32]).with_mesh_key("hunter2");
        let debug = format!("{identity:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("redacted"));
        assert_eq!(identity.mesh_key(), Some("hunter2"));
    }
}
