//! Stream cipher stage installed by the handshake.

use bytes::{Bytes, BytesMut};

use crate::crypto::{CipherKeys, StreamCipher};
use crate::error::Result;
use crate::pipeline::{Context, Signal, Stage};

/// Encrypts payloads going down and decrypts payloads coming up.
///
/// Each direction has its own key and IV, and each keystream runs on across
/// payloads, so frames must be processed in order.
pub struct CipherStage {
    encrypt: StreamCipher,
    decrypt: StreamCipher,
}

impl CipherStage {
    /// Create a cipher stage from the two directional key sets.
    pub fn new(encrypt: &CipherKeys, decrypt: &CipherKeys) -> Self {
        Self {
            encrypt: StreamCipher::new(encrypt),
            decrypt: StreamCipher::new(decrypt),
        }
    }
}

fn transform(cipher: &mut StreamCipher, data: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::from(data);
    cipher.apply(&mut buf)?;
    Ok(buf.freeze())
}

impl Stage for CipherStage {
    fn name(&self) -> &'static str {
        "cipher"
    }

    fn fetch_data_from_up(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        match transform(&mut self.encrypt, &data) {
            Ok(ciphertext) => ctx.dispatch_data_down(ciphertext),
            Err(e) => ctx.dispatch_signal_down(Signal::error(e)),
        }
    }

    fn fetch_data_from_down(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        match transform(&mut self.decrypt, &data) {
            Ok(plaintext) => ctx.dispatch_data_up(plaintext),
            Err(e) => ctx.dispatch_signal_down(Signal::error(e)),
        }
    }
}
