//! Cryptographic primitives for the tunnel.
//!
//! This module provides:
//! - X25519 Elliptic Curve Diffie-Hellman key exchange
//! - HMAC-SHA256 keyed digests for the handshake
//! - HKDF derivation of per-direction stream keys
//! - ChaCha20 stream encryption
//! - Secure random number generation
//!
//! All secret material is zeroized on drop to prevent memory leakage.

mod kdf;
mod keys;
mod random;
mod stream;

pub use kdf::{keyed_digest, verify_digest, Credentials, Hkdf};
pub use keys::{EphemeralSecret, PublicKey, SharedSecret};
pub use random::{random_delay_ms, SecureRandom};
pub use stream::{CipherKeys, StreamCipher};

/// Size of stream cipher keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the stream cipher IV in bytes (96 bits for ChaCha20)
pub const IV_SIZE: usize = 12;

/// Size of X25519 public keys in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of the random nonce each side contributes to the handshake
pub const NONCE_SIZE: usize = 32;

/// Size of the user identifier carried in the handshake
pub const USER_ID_SIZE: usize = 20;

/// Size of the handshake digest
pub const DIGEST_SIZE: usize = 20;

/// Size of the password-derived handshake key
pub const PASSWORD_KEY_SIZE: usize = 16;
