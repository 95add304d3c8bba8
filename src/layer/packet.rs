//! Handshake packet codec.
//!
//! ```text
//! version: f64 BE | timestamp: f64 BE (ms) | userLen u8 | pubkeyLen u8 | secureLen u8 | hashLen u8
//! user[userLen] | pubkey[pubkeyLen] | secure[secureLen] | hash[hashLen]
//! ```
//!
//! The hash authenticates every byte in front of it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::{keyed_digest, verify_digest, DIGEST_SIZE, USER_ID_SIZE};
use crate::error::{Error, Result};

/// The only version this implementation speaks.
pub const PACKET_VERSION: f64 = 1.0;

/// Size of the fixed header in front of the variable fields.
pub const HEADER_SIZE: usize = 20;

/// One side's handshake message.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakePacket {
    /// Protocol version
    pub version: f64,
    /// Sender clock, milliseconds since the Unix epoch
    pub timestamp: f64,
    /// Sender's user identifier
    pub user: [u8; USER_ID_SIZE],
    /// Sender's X25519 public key
    pub public_key: Vec<u8>,
    /// Sender's random nonce
    pub nonce: Vec<u8>,
    /// Digest over everything above
    pub digest: [u8; DIGEST_SIZE],
}

impl HandshakePacket {
    /// Build an unsigned packet stamped with the current time.
    pub fn new(user: [u8; USER_ID_SIZE], public_key: &[u8], nonce: &[u8]) -> Self {
        Self {
            version: PACKET_VERSION,
            timestamp: now_millis(),
            user,
            public_key: public_key.to_vec(),
            nonce: nonce.to_vec(),
            digest: [0u8; DIGEST_SIZE],
        }
    }

    /// Length of the encoded packet.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + USER_ID_SIZE + self.public_key.len() + self.nonce.len() + DIGEST_SIZE
    }

    /// Encode, including the current digest field.
    pub fn encode(&self) -> Result<BytesMut> {
        let public_key_len = u8::try_from(self.public_key.len())
            .map_err(|_| Error::handshake("public key longer than 255 bytes"))?;
        let nonce_len = u8::try_from(self.nonce.len())
            .map_err(|_| Error::handshake("nonce longer than 255 bytes"))?;

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_f64(self.version);
        buf.put_f64(self.timestamp);
        buf.put_u8(USER_ID_SIZE as u8);
        buf.put_u8(public_key_len);
        buf.put_u8(nonce_len);
        buf.put_u8(DIGEST_SIZE as u8);
        buf.put_slice(&self.user);
        buf.put_slice(&self.public_key);
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.digest);
        Ok(buf)
    }

    /// Compute the digest under `key` and return the encoded packet.
    pub fn seal(&mut self, key: &[u8]) -> Result<Bytes> {
        let mut buf = self.encode()?;
        let signed = buf.len() - DIGEST_SIZE;
        self.digest = keyed_digest(key, &buf[..signed]);
        buf[signed..].copy_from_slice(&self.digest);
        Ok(buf.freeze())
    }

    /// Parse a packet from the front of `input`.
    ///
    /// Returns the packet and the number of bytes it occupied.
    pub fn decode(input: &[u8]) -> Result<(Self, usize)> {
        if input.len() < HEADER_SIZE {
            return Err(Error::handshake(format!(
                "packet of {} bytes is shorter than its header",
                input.len()
            )));
        }

        let mut header = &input[..HEADER_SIZE];
        let version = header.get_f64();
        let timestamp = header.get_f64();
        let user_len = header.get_u8() as usize;
        let public_key_len = header.get_u8() as usize;
        let nonce_len = header.get_u8() as usize;
        let digest_len = header.get_u8() as usize;

        if version != PACKET_VERSION {
            return Err(Error::handshake(format!("unsupported version {}", version)));
        }
        if user_len != USER_ID_SIZE || digest_len != DIGEST_SIZE {
            return Err(Error::handshake(format!(
                "malformed lengths: user {} digest {}",
                user_len, digest_len
            )));
        }

        let total = HEADER_SIZE + user_len + public_key_len + nonce_len + digest_len;
        if input.len() < total {
            return Err(Error::handshake(format!(
                "packet declares {} bytes, only {} present",
                total,
                input.len()
            )));
        }

        let mut body = &input[HEADER_SIZE..total];
        let mut user = [0u8; USER_ID_SIZE];
        body.copy_to_slice(&mut user);
        let public_key = body[..public_key_len].to_vec();
        body.advance(public_key_len);
        let nonce = body[..nonce_len].to_vec();
        body.advance(nonce_len);
        let mut digest = [0u8; DIGEST_SIZE];
        body.copy_to_slice(&mut digest);

        Ok((
            Self {
                version,
                timestamp,
                user,
                public_key,
                nonce,
                digest,
            },
            total,
        ))
    }

    /// Check the digest against the raw bytes the packet was decoded from.
    pub fn verify(&self, raw: &[u8], key: &[u8]) -> bool {
        let len = self.encoded_len();
        raw.len() >= len && verify_digest(key, &raw[..len - DIGEST_SIZE], &self.digest)
    }

    /// Reject timestamps further than `limit_ms` from our clock.
    pub fn check_clock(&self, limit_ms: i64) -> Result<()> {
        let skew = self.timestamp - now_millis();
        if !skew.is_finite() || skew.abs() > limit_ms as f64 {
            return Err(Error::ClockSkew {
                skew_ms: if skew.is_finite() { skew as i64 } else { i64::MAX },
                limit_ms,
            });
        }
        Ok(())
    }
}

/// Milliseconds since the Unix epoch, as the packet carries them.
pub fn now_millis() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}
