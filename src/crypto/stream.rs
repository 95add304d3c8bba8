//! Per-direction stream encryption.
//!
//! ChaCha20 used as a plain keystream: no padding, no tag and no re-keying.
//! The handshake digest is the only integrity check the tunnel has.

use chacha20::cipher::{KeyIvInit, StreamCipher as _};
use chacha20::ChaCha20;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{Hkdf, SharedSecret, IV_SIZE, KEY_SIZE};
use crate::error::{Error, Result};

const KEY_INFO: &[u8] = b"pipetun stream key";
const IV_INFO: &[u8] = b"pipetun stream iv";

/// Key and IV for one direction of traffic.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CipherKeys {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl CipherKeys {
    /// Derive keys for the direction whose sender contributed `public` and
    /// `nonce` to the handshake.
    ///
    /// The key is bound to the public key and the IV to the nonce, so the
    /// two directions never share material.
    pub fn derive(shared: &SharedSecret, public: &[u8], nonce: &[u8]) -> Result<Self> {
        let key = Hkdf::new(Some(public), shared.as_bytes()).expand_fixed(KEY_INFO)?;
        let iv = Hkdf::new(Some(nonce), shared.as_bytes()).expand_fixed(IV_INFO)?;
        Ok(Self { key, iv })
    }

    /// Create from raw bytes.
    pub fn from_bytes(key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) -> Self {
        Self { key, iv }
    }
}

/// Keystream for one direction.
pub struct StreamCipher {
    inner: ChaCha20,
}

impl StreamCipher {
    /// Start a keystream at position zero.
    pub fn new(keys: &CipherKeys) -> Self {
        Self {
            inner: ChaCha20::new(&keys.key.into(), &keys.iv.into()),
        }
    }

    /// XOR the next `buf.len()` keystream bytes into `buf`.
    ///
    /// Fails once the 256 GiB keystream of a ChaCha20 instance is used up.
    pub fn apply(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner
            .try_apply_keystream(buf)
            .map_err(|_| Error::crypto("keystream exhausted"))
    }
}
