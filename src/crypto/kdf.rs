//! Key derivation and keyed digests.
//!
//! HMAC-SHA256 truncated to the field size authenticates the handshake;
//! HKDF-SHA256 turns the X25519 shared secret into stream keys.

use hkdf::Hkdf as HkdfImpl;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::{PASSWORD_KEY_SIZE, USER_ID_SIZE};
use crate::error::{Error, Result};

/// HKDF key derivation using SHA-256.
pub struct Hkdf {
    prk: HkdfImpl<Sha256>,
}

impl Hkdf {
    /// Create a new HKDF instance from input keying material.
    ///
    /// # Arguments
    ///
    /// * `salt` - Optional salt
    /// * `ikm` - Input keying material (e.g., shared secret from DH)
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        Self {
            prk: HkdfImpl::new(salt, ikm),
        }
    }

    /// Expand to a fixed-size array.
    pub fn expand_fixed<const N: usize>(&self, info: &[u8]) -> Result<[u8; N]> {
        let mut okm = [0u8; N];
        self.prk
            .expand(info, &mut okm)
            .map_err(|_| Error::crypto("HKDF expansion failed"))?;
        Ok(okm)
    }
}

fn mac(key: &[u8], value: &[u8]) -> Hmac<Sha256> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(value);
    mac
}

/// HMAC-SHA256 of `value` under `key`, truncated to `N` bytes.
///
/// `N` must not exceed 32.
pub fn keyed_digest<const N: usize>(key: &[u8], value: &[u8]) -> [u8; N] {
    let result = mac(key, value).finalize().into_bytes();

    let mut digest = [0u8; N];
    digest.copy_from_slice(&result[..N]);
    digest
}

/// Constant-time check of a truncated digest.
pub fn verify_digest(key: &[u8], value: &[u8], expected: &[u8]) -> bool {
    !expected.is_empty() && mac(key, value).verify_truncated_left(expected).is_ok()
}

/// The single shared credential, in the form the handshake needs.
pub struct Credentials {
    user_id: [u8; USER_ID_SIZE],
    password: Zeroizing<Vec<u8>>,
}

impl Credentials {
    /// Derive the user identifier for `username` and keep the password.
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            user_id: keyed_digest(username.as_bytes(), username.as_bytes()),
            password: Zeroizing::new(password.as_bytes().to_vec()),
        }
    }

    /// Identifier sent on the wire in place of the user name.
    pub fn user_id(&self) -> &[u8; USER_ID_SIZE] {
        &self.user_id
    }

    /// Key that authenticates handshake packets claiming `user_id`.
    pub fn password_key(&self, user_id: &[u8]) -> Zeroizing<[u8; PASSWORD_KEY_SIZE]> {
        let inner: Zeroizing<[u8; PASSWORD_KEY_SIZE]> =
            Zeroizing::new(keyed_digest(user_id, &self.password));
        Zeroizing::new(keyed_digest(inner.as_slice(), user_id))
    }
}
