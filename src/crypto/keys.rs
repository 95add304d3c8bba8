//! X25519 key exchange primitives.
//!
//! Provides type-safe wrappers around X25519 operations with automatic
//! zeroization of secret material on drop.

use x25519_dalek::{
    EphemeralSecret as DalekEphemeral, PublicKey as DalekPublic, SharedSecret as DalekShared,
};

use crate::crypto::{SecureRandom, PUBLIC_KEY_SIZE};
use crate::error::{Error, Result};

/// An ephemeral (single-use) X25519 secret key.
///
/// Each handshake generates a fresh one, which gives forward secrecy.
/// It is automatically zeroized when dropped.
pub struct EphemeralSecret(DalekEphemeral);

impl EphemeralSecret {
    /// Generate a new random ephemeral secret.
    pub fn random() -> Self {
        Self(DalekEphemeral::random_from_rng(SecureRandom::rng()))
    }

    /// Perform X25519 Diffie-Hellman key agreement.
    ///
    /// Fails when the peer's key is a low-order point, which would make the
    /// shared secret predictable.
    pub fn diffie_hellman(self, their_public: &PublicKey) -> Result<SharedSecret> {
        let shared = self.0.diffie_hellman(&their_public.0);
        if !shared.was_contributory() {
            return Err(Error::crypto("non-contributory key exchange"));
        }
        Ok(SharedSecret(shared))
    }
}

impl From<&EphemeralSecret> for PublicKey {
    fn from(secret: &EphemeralSecret) -> Self {
        PublicKey(DalekPublic::from(&secret.0))
    }
}

/// An X25519 public key.
///
/// Safe to share publicly. Used for key exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(DalekPublic);

impl PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(DalekPublic::from(bytes))
    }

    /// Create from a slice received off the wire.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
            Error::handshake(format!(
                "public key must be {} bytes, got {}",
                PUBLIC_KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Get the raw bytes of this public key.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.0.as_bytes()
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// The result of an X25519 Diffie-Hellman key exchange.
///
/// Contains the shared secret that both parties computed.
/// Automatically zeroized when dropped.
pub struct SharedSecret(DalekShared);

impl SharedSecret {
    /// Get the raw shared secret bytes.
    ///
    /// # Security
    ///
    /// This should be fed into a KDF (like HKDF) before use as a key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}
