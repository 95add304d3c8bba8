//! Authenticated key exchange that splices a stream cipher into the chain.
//!
//! Both sides send one [`HandshakePacket`]. Each packet carries a fresh
//! X25519 public key and nonce, and a digest keyed by the shared password.
//! Once a side has verified the peer's packet it derives one key pair per
//! direction, attaches a [`CipherStage`] directly above itself, detaches,
//! and announces the secure channel with `InitializeOk`.
//!
//! The client speaks first, as soon as the transport reports
//! `InitializeOk`. The server answers the first valid packet it receives.

use std::sync::Arc;

use bytes::Bytes;

use super::cipher::CipherStage;
use super::packet::HandshakePacket;
use crate::crypto::{CipherKeys, Credentials, EphemeralSecret, PublicKey, SecureRandom, NONCE_SIZE};
use crate::error::{Error, Result};
use crate::pipeline::{ConnectionState, Context, Signal, Stage};

/// Largest accepted clock difference on the server, in milliseconds.
pub const SERVER_MAX_SKEW_MS: i64 = 60_000;

/// Largest accepted clock difference on the client, in milliseconds.
pub const CLIENT_MAX_SKEW_MS: i64 = 15_000;

/// Local half of the exchange.
struct LocalKeys {
    secret: EphemeralSecret,
    public: PublicKey,
    nonce: [u8; NONCE_SIZE],
}

impl LocalKeys {
    fn generate() -> Self {
        let secret = EphemeralSecret::random();
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            nonce: SecureRandom::bytes(),
        }
    }

    /// Signed packet announcing these keys.
    fn packet(&self, credentials: &Credentials, user: [u8; 20]) -> Result<Bytes> {
        let mut packet = HandshakePacket::new(user, self.public.as_bytes(), &self.nonce);
        packet.seal(credentials.password_key(&user).as_slice())
    }

    /// Run the exchange and derive `(encrypt, decrypt)` stage ciphers.
    fn agree(self, peer: &HandshakePacket) -> Result<CipherStage> {
        let peer_public = PublicKey::from_slice(&peer.public_key)?;
        let shared = self.secret.diffie_hellman(&peer_public)?;

        let encrypt = CipherKeys::derive(&shared, self.public.as_bytes(), &self.nonce)?;
        let decrypt = CipherKeys::derive(&shared, peer_public.as_bytes(), &peer.nonce)?;
        Ok(CipherStage::new(&encrypt, &decrypt))
    }
}

/// Parse and authenticate the peer's packet.
///
/// The packet must fill the whole frame.
fn accept_packet(
    data: &[u8],
    credentials: &Credentials,
    expected_user: &[u8],
    max_skew_ms: i64,
) -> Result<HandshakePacket> {
    let (packet, consumed) = HandshakePacket::decode(data)?;
    if consumed != data.len() {
        return Err(Error::handshake(format!(
            "packet spans {} of {} received bytes",
            consumed,
            data.len()
        )));
    }

    packet.check_clock(max_skew_ms)?;

    let key = credentials.password_key(&packet.user);
    if !packet.verify(data, key.as_slice()) || packet.user != expected_user {
        return Err(Error::Authentication);
    }
    Ok(packet)
}

/// Replace `stage` with the cipher and tell the stages above.
fn splice(ctx: &mut Context<'_>, cipher: CipherStage) -> Result<()> {
    ctx.attach_up(Box::new(cipher))?;
    ctx.detach()?;
    ctx.env_mut().state = ConnectionState::Connected;
    ctx.dispatch_signal_up(Signal::InitializeOk)
}

fn reject(ctx: &mut Context<'_>, side: &'static str, cause: Error) -> Result<()> {
    tracing::warn!(side, src = ?ctx.env().src, error = %cause, "handshake rejected");
    ctx.dispatch_signal_down(Signal::error(cause))
}

enum ClientState {
    Idle,
    AwaitingReply(LocalKeys),
    Failed,
    Done,
}

/// Client side of the handshake.
pub struct ClientHandshake {
    credentials: Arc<Credentials>,
    state: ClientState,
}

impl ClientHandshake {
    /// Create a handshake stage for the given credential.
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self {
            credentials,
            state: ClientState::Idle,
        }
    }
}

impl Stage for ClientHandshake {
    fn name(&self) -> &'static str {
        "client-handshake"
    }

    fn fetch_data_from_up(&mut self, _ctx: &mut Context<'_>, _data: Bytes) -> Result<()> {
        Err(Error::Invariant("data sent before the secure channel is up"))
    }

    fn fetch_data_from_down(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        match std::mem::replace(&mut self.state, ClientState::Failed) {
            ClientState::AwaitingReply(local) => {
                let user = *self.credentials.user_id();
                let result = accept_packet(&data, &self.credentials, &user, CLIENT_MAX_SKEW_MS)
                    .and_then(|reply| local.agree(&reply));
                match result {
                    Ok(cipher) => {
                        self.state = ClientState::Done;
                        tracing::debug!(dst = ?ctx.env().dst, "secure channel established");
                        splice(ctx, cipher)
                    }
                    Err(e) => reject(ctx, "client", e),
                }
            }
            ClientState::Done => {
                self.state = ClientState::Done;
                ctx.dispatch_data_up(data)
            }
            ClientState::Idle => reject(ctx, "client", Error::handshake("server spoke first")),
            ClientState::Failed => Ok(()),
        }
    }

    fn fetch_signal_from_down(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        match signal {
            Signal::InitializeOk if matches!(self.state, ClientState::Idle) => {
                let local = LocalKeys::generate();
                let packet = local.packet(&self.credentials, *self.credentials.user_id())?;
                self.state = ClientState::AwaitingReply(local);
                ctx.dispatch_data_down(packet)
            }
            // The secure channel announces itself once it exists.
            Signal::InitializeOk => Ok(()),
            other => ctx.dispatch_signal_up(other),
        }
    }
}

enum ServerState {
    AwaitingHello,
    Failed,
    Done,
}

/// Server side of the handshake.
pub struct ServerHandshake {
    credentials: Arc<Credentials>,
    state: ServerState,
}

impl ServerHandshake {
    /// Create a handshake stage for the given credential.
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self {
            credentials,
            state: ServerState::AwaitingHello,
        }
    }

    fn answer(&self, data: &[u8]) -> Result<(Bytes, CipherStage)> {
        let hello = accept_packet(
            data,
            &self.credentials,
            self.credentials.user_id(),
            SERVER_MAX_SKEW_MS,
        )?;

        let local = LocalKeys::generate();
        let reply = local.packet(&self.credentials, hello.user)?;
        let cipher = local.agree(&hello)?;
        Ok((reply, cipher))
    }
}

impl Stage for ServerHandshake {
    fn name(&self) -> &'static str {
        "server-handshake"
    }

    fn fetch_data_from_up(&mut self, _ctx: &mut Context<'_>, _data: Bytes) -> Result<()> {
        Err(Error::Invariant("data sent before the secure channel is up"))
    }

    fn fetch_data_from_down(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        match self.state {
            ServerState::AwaitingHello => match self.answer(&data) {
                Ok((reply, cipher)) => {
                    self.state = ServerState::Done;
                    tracing::debug!(src = ?ctx.env().src, "secure channel established");
                    ctx.dispatch_data_down(reply)?;
                    splice(ctx, cipher)
                }
                Err(e) => {
                    self.state = ServerState::Failed;
                    reject(ctx, "server", e)
                }
            },
            ServerState::Done => ctx.dispatch_data_up(data),
            ServerState::Failed => Ok(()),
        }
    }

    fn fetch_signal_from_down(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        match signal {
            // The secure channel announces itself once it exists.
            Signal::InitializeOk => Ok(()),
            other => ctx.dispatch_signal_up(other),
        }
    }
}
