//! Multiplexing of logical connections over one physical connection.
//!
//! Every frame on the secure channel starts with a [`StreamKey`]: the IPv4
//! destination and port of the logical connection it belongs to. A frame
//! holding only the key is a half-close.
//!
//! Each logical connection is a sub-chain living in the same pipeline as
//! the tunnel:
//!
//! ```text
//! Low(proxy = tunnel) ─ IndexStage(key) ─ application stage ─ High
//! ```
//!
//! The index stage adds and strips the key, so the application stage only
//! ever sees its own payloads.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::pipeline::{Context, EnvBlock, Event, SessionHandle, Signal, Stage};

/// Size of an encoded [`StreamKey`].
pub const STREAM_KEY_SIZE: usize = 6;

/// Identifier of a logical connection: destination IPv4 address followed by
/// the big-endian port.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey([u8; STREAM_KEY_SIZE]);

impl StreamKey {
    /// Key for an IPv4 address and port.
    pub fn new(ip: [u8; 4], port: u16) -> Self {
        let mut bytes = [0u8; STREAM_KEY_SIZE];
        bytes[..4].copy_from_slice(&ip);
        bytes[4..].copy_from_slice(&port.to_be_bytes());
        Self(bytes)
    }

    /// Key for a destination. Only IPv4 destinations have one.
    pub fn from_socket_addr(addr: SocketAddr) -> Result<Self> {
        match addr.ip() {
            IpAddr::V4(ip) => Ok(Self::new(ip.octets(), addr.port())),
            IpAddr::V6(_) => Err(Error::tunnel(format!("{} is not an IPv4 destination", addr))),
        }
    }

    /// Read the key at the front of a frame.
    pub fn from_slice(frame: &[u8]) -> Result<Self> {
        let bytes = frame
            .get(..STREAM_KEY_SIZE)
            .ok_or_else(|| Error::tunnel(format!("frame of {} bytes has no key", frame.len())))?;
        let mut key = [0u8; STREAM_KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Destination this key names.
    pub fn to_socket_addr(&self) -> SocketAddr {
        let ip = Ipv4Addr::new(self.0[0], self.0[1], self.0[2], self.0[3]);
        let port = u16::from_be_bytes([self.0[4], self.0[5]]);
        SocketAddr::V4(SocketAddrV4::new(ip, port))
    }

    /// Encoded form.
    pub fn as_bytes(&self) -> &[u8; STREAM_KEY_SIZE] {
        &self.0
    }

    /// A frame carrying only this key, announcing a half-close.
    fn close_frame(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_socket_addr().fmt(f)
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamKey({})", hex::encode(self.0))
    }
}

/// Bottom stage of every logical connection's sub-chain.
pub struct IndexStage {
    key: StreamKey,
}

impl IndexStage {
    /// Create an index stage for one logical connection.
    pub fn new(key: StreamKey) -> Self {
        Self { key }
    }
}

impl Stage for IndexStage {
    fn name(&self) -> &'static str {
        "index"
    }

    fn fetch_data_from_up(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        // An empty payload would read as a half-close on the other side.
        if data.is_empty() {
            return Ok(());
        }
        let mut frame = BytesMut::with_capacity(STREAM_KEY_SIZE + data.len());
        frame.put_slice(self.key.as_bytes());
        frame.put_slice(&data);
        ctx.dispatch_data_down(frame.freeze())
    }

    fn fetch_data_from_down(&mut self, ctx: &mut Context<'_>, frame: Bytes) -> Result<()> {
        if frame.len() < STREAM_KEY_SIZE {
            return Err(Error::Invariant("tunnel forwarded a frame without a key"));
        }
        ctx.dispatch_data_up(frame.slice(STREAM_KEY_SIZE..))
    }

    fn fetch_signal_from_up(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        match signal {
            Signal::Close { .. } | Signal::Error { .. } => {
                ctx.dispatch_signal_down(signal.with_key(self.key))
            }
            Signal::InitializeCompleted => Ok(()),
            other => {
                tracing::trace!(key = %self.key, signal = other.name(), "dropped at index");
                Ok(())
            }
        }
    }
}

/// Builds the application stage for a logical connection the peer opened.
pub type StageFactory = Arc<dyn Fn() -> Box<dyn Stage> + Send + Sync>;

/// Which side of the tunnel a [`TunnelStage`] is on.
pub enum Role {
    /// Opens logical connections on `NewConnection` (client).
    Initiator,
    /// Opens logical connections when the peer sends an unknown key (server).
    Acceptor(StageFactory),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    /// We sent our half-close and wait for the peer's.
    LocalClosed,
    /// The peer sent its half-close; ours is still owed.
    RemoteClosed,
}

struct Stream {
    session: SessionHandle,
    state: StreamState,
}

/// Demultiplexes frames into per-key sub-chains and multiplexes their output.
pub struct TunnelStage {
    role: Role,
    streams: HashMap<StreamKey, Stream>,
    ready: bool,
    pending: Vec<(EnvBlock, Box<dyn Stage>)>,
}

impl TunnelStage {
    /// Client side.
    pub fn initiator() -> Self {
        Self::new(Role::Initiator)
    }

    /// Server side, building one stage per new key with `factory`.
    pub fn acceptor(factory: StageFactory) -> Self {
        Self::new(Role::Acceptor(factory))
    }

    fn new(role: Role) -> Self {
        Self {
            role,
            streams: HashMap::new(),
            ready: false,
            pending: Vec::new(),
        }
    }

    fn open(
        &mut self,
        ctx: &mut Context<'_>,
        key: StreamKey,
        env: EnvBlock,
        stage: Box<dyn Stage>,
    ) -> Result<SessionHandle> {
        let proxy = ctx.handle();
        let session = ctx.spawn_session(env, Some(proxy), vec![Box::new(IndexStage::new(key)), stage])?;
        self.streams.insert(
            key,
            Stream {
                session,
                state: StreamState::Open,
            },
        );
        ctx.deliver(session.bottom(), Event::SignalFromDown(Signal::Initialize));
        tracing::debug!(%key, streams = self.streams.len(), "stream opened");
        Ok(session)
    }

    fn request(&mut self, ctx: &mut Context<'_>, env: EnvBlock, stage: Box<dyn Stage>) -> Result<()> {
        if !self.ready {
            self.pending.push((env, stage));
            return Ok(());
        }

        let key = match env.dst {
            Some(dst) => StreamKey::from_socket_addr(dst),
            None => Err(Error::tunnel("connection request without a destination")),
        };
        match key {
            Ok(key) if self.streams.contains_key(&key) => {
                tracing::warn!(%key, "refusing stream, key already open");
                Ok(())
            }
            Ok(key) => self.open(ctx, key, env, stage).map(|_| ()),
            Err(e) => {
                tracing::warn!(error = %e, "refusing stream");
                Ok(())
            }
        }
    }

    fn remove(&mut self, ctx: &mut Context<'_>, key: StreamKey) {
        if let Some(stream) = self.streams.remove(&key) {
            ctx.release_session(stream.session);
            tracing::debug!(%key, streams = self.streams.len(), "stream closed");
        }
    }

    /// The peer half-closed `key`.
    fn close_remote(&mut self, ctx: &mut Context<'_>, key: StreamKey) -> Result<()> {
        let Some(stream) = self.streams.get_mut(&key) else {
            if let Role::Acceptor(_) = self.role {
                return ctx.dispatch_data_down(key.close_frame());
            }
            return Ok(());
        };

        let state = stream.state;
        match state {
            StreamState::Open => {
                stream.state = StreamState::RemoteClosed;
                let bottom = stream.session.bottom();
                ctx.deliver(bottom, Event::SignalFromDown(Signal::End));
            }
            StreamState::LocalClosed => self.remove(ctx, key),
            StreamState::RemoteClosed => {}
        }
        Ok(())
    }

    /// The sub-chain for `key` finished, cleanly or not.
    fn close_local(&mut self, ctx: &mut Context<'_>, key: StreamKey) -> Result<()> {
        let Some(stream) = self.streams.get_mut(&key) else {
            return Ok(());
        };

        let state = stream.state;
        match state {
            StreamState::Open => {
                stream.state = StreamState::LocalClosed;
                ctx.dispatch_data_down(key.close_frame())
            }
            StreamState::RemoteClosed => {
                self.remove(ctx, key);
                ctx.dispatch_data_down(key.close_frame())
            }
            StreamState::LocalClosed => Ok(()),
        }
    }

    fn receive(&mut self, ctx: &mut Context<'_>, frame: Bytes) -> Result<()> {
        if frame.len() < STREAM_KEY_SIZE {
            let cause = Error::tunnel(format!("frame of {} bytes has no key", frame.len()));
            tracing::warn!(src = ?ctx.env().src, error = %cause, "rejecting tunnel frame");
            return ctx.dispatch_signal_down(Signal::error(cause));
        }
        let key = StreamKey::from_slice(&frame)?;
        if frame.len() == STREAM_KEY_SIZE {
            return self.close_remote(ctx, key);
        }

        if let Some(stream) = self.streams.get(&key) {
            if stream.state == StreamState::RemoteClosed {
                tracing::trace!(%key, "dropping data after half-close");
            } else {
                ctx.deliver(stream.session.bottom(), Event::DataFromDown(frame));
            }
            return Ok(());
        }

        let stage = match &self.role {
            Role::Acceptor(factory) => factory(),
            Role::Initiator => {
                tracing::debug!(%key, "dropping data for unknown stream");
                return Ok(());
            }
        };
        let env = ctx.env().fork().with_dst(key.to_socket_addr());
        let session = self.open(ctx, key, env, stage)?;
        ctx.deliver(session.bottom(), Event::DataFromDown(frame));
        Ok(())
    }

    fn destroy_all(&mut self, ctx: &mut Context<'_>) {
        for (_, stream) in self.streams.drain() {
            ctx.deliver(stream.session.bottom(), Event::SignalFromDown(Signal::Destroy));
            ctx.release_session(stream.session);
        }
        self.pending.clear();
    }
}

impl Stage for TunnelStage {
    fn name(&self) -> &'static str {
        "tunnel"
    }

    fn fetch_data_from_down(&mut self, ctx: &mut Context<'_>, frame: Bytes) -> Result<()> {
        self.receive(ctx, frame)
    }

    fn fetch_signal_from_up(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        match signal {
            Signal::NewConnection { env, stage } => {
                if let Role::Acceptor(_) = self.role {
                    return Err(Error::Invariant("connection request on the accepting side"));
                }
                self.request(ctx, env, stage)
            }
            Signal::Close { key: Some(key) } => self.close_local(ctx, key),
            Signal::Error {
                key: Some(key),
                cause,
            } => {
                tracing::debug!(%key, error = %cause, "stream failed");
                self.close_local(ctx, key)
            }
            other => ctx.dispatch_signal_down(other),
        }
    }

    fn fetch_signal_from_down(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        match signal {
            Signal::InitializeOk => {
                self.ready = true;
                for (env, stage) in std::mem::take(&mut self.pending) {
                    self.request(ctx, env, stage)?;
                }
                ctx.dispatch_signal_up(Signal::InitializeOk)
            }
            Signal::Destroy => {
                self.ready = false;
                self.destroy_all(ctx);
                ctx.dispatch_signal_up(Signal::Destroy)
            }
            other => ctx.dispatch_signal_up(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::Config;
    use crate::pipeline::testing::{captured, signals, Record, Records, WireTap};
    use crate::pipeline::{Bounds, Pipeline, StageHandle};

    #[test]
    fn test_key_encoding() {
        let key = StreamKey::from_socket_addr("93.184.216.34:80".parse().unwrap()).unwrap();
        assert_eq!(key.as_bytes(), &[0x5D, 0xB8, 0xD8, 0x22, 0x00, 0x50]);
        assert_eq!(key.to_socket_addr(), "93.184.216.34:80".parse().unwrap());
        assert_eq!(key.to_string(), "93.184.216.34:80");
        assert_eq!(format!("{:?}", key), "StreamKey(5db8d8220050)");

        assert!(StreamKey::from_socket_addr("[::1]:80".parse().unwrap()).is_err());
        assert!(StreamKey::from_slice(&[1, 2, 3]).is_err());
    }

    /// Application stage that remembers where it lives.
    #[derive(Clone, Default)]
    struct Stub {
        handle: Arc<Mutex<Option<StageHandle>>>,
        records: Records,
    }

    impl Stub {
        fn stage(&self) -> Box<dyn Stage> {
            Box::new(App(self.clone()))
        }

        fn handle(&self) -> StageHandle {
            let handle = *self.handle.lock();
            handle.unwrap()
        }

        fn received(&self) -> Vec<Bytes> {
            captured(&self.records)
        }

        fn signals(&self) -> Vec<&'static str> {
            signals(&self.records)
        }
    }

    struct App(Stub);

    impl Stage for App {
        fn name(&self) -> &'static str {
            "app"
        }

        fn fetch_data_from_down(&mut self, _ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
            self.0.records.lock().push(Record::Data(data));
            Ok(())
        }

        fn fetch_signal_from_down(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
            if let Signal::Initialize = signal {
                *self.0.handle.lock() = Some(ctx.handle());
            }
            self.0.records.lock().push(Record::SignalFromDown(signal.name()));
            ctx.dispatch_signal_up(signal)
        }
    }

    /// A client tunnel and a server tunnel sharing one pipeline, with the
    /// test carrying frames between them.
    struct Harness {
        pipeline: Pipeline,
        client: SessionHandle,
        client_wire: Records,
        server: SessionHandle,
        server_wire: Records,
        accepted: Arc<Mutex<Vec<Stub>>>,
    }

    impl Harness {
        fn new() -> Self {
            let mut harness = Self::unready();
            harness
                .client
                .dispatch_signal_up(&mut harness.pipeline, Signal::InitializeOk)
                .unwrap();
            harness
        }

        fn unready() -> Self {
            let (tx, _rx) = mpsc::unbounded_channel();
            let mut pipeline = Pipeline::new(tx);

            let (tap, client_wire) = WireTap::new();
            let client = pipeline
                .build_session(env(), Bounds::default(), vec![Box::new(tap), Box::new(TunnelStage::initiator())])
                .unwrap();

            let accepted: Arc<Mutex<Vec<Stub>>> = Arc::default();
            let factory: StageFactory = {
                let accepted = Arc::clone(&accepted);
                Arc::new(move || {
                    let stub = Stub::default();
                    accepted.lock().push(stub.clone());
                    stub.stage()
                })
            };
            let (tap, server_wire) = WireTap::new();
            let server = pipeline
                .build_session(
                    env(),
                    Bounds::default(),
                    vec![Box::new(tap), Box::new(TunnelStage::acceptor(factory))],
                )
                .unwrap();

            Self {
                pipeline,
                client,
                client_wire,
                server,
                server_wire,
                accepted,
            }
        }

        fn open(&mut self, dst: &str) -> Stub {
            let stub = Stub::default();
            let env = env().with_dst(dst.parse().unwrap());
            self.pipeline.deliver(
                self.client.top(),
                Event::SignalFromUp(Signal::NewConnection {
                    env,
                    stage: stub.stage(),
                }),
            );
            self.pipeline.drive().unwrap();
            stub
        }

        fn send(&mut self, stub: &Stub, data: &'static [u8]) {
            self.pipeline
                .deliver(stub.handle(), Event::DataFromUp(Bytes::from_static(data)));
            self.pipeline.drive().unwrap();
        }

        fn close(&mut self, stub: &Stub) {
            self.pipeline
                .deliver(stub.handle(), Event::SignalFromUp(Signal::close()));
            self.pipeline.drive().unwrap();
        }

        /// Carry frames across until both sides are quiet.
        fn pump(&mut self) {
            loop {
                let upstream = drain(&self.client_wire);
                let downstream = drain(&self.server_wire);
                if upstream.is_empty() && downstream.is_empty() {
                    return;
                }
                for frame in upstream {
                    self.pipeline.deliver(self.server.bottom(), Event::DataFromDown(frame));
                }
                for frame in downstream {
                    self.pipeline.deliver(self.client.bottom(), Event::DataFromDown(frame));
                }
                self.pipeline.drive().unwrap();
            }
        }

        fn accepted(&self, index: usize) -> Stub {
            self.accepted.lock()[index].clone()
        }
    }

    fn env() -> EnvBlock {
        EnvBlock::new(Arc::new(Config::default()))
    }

    fn drain(records: &Records) -> Vec<Bytes> {
        let out = captured(records);
        records.lock().clear();
        out
    }

    // Four nodes per chain: low, wiretap or index, tunnel or app, high.
    const MAIN_NODES: usize = 2 * 4;
    const NODES_PER_STREAM: usize = 4;

    #[test]
    fn test_two_streams_without_cross_talk() {
        let mut h = Harness::new();
        let a = h.open("93.184.216.34:80");
        let b = h.open("10.0.0.2:443");

        h.send(&a, b"to a");
        h.send(&b, b"to b");
        h.pump();

        let (server_a, server_b) = (h.accepted(0), h.accepted(1));
        assert_eq!(server_a.received(), vec![Bytes::from_static(b"to a")]);
        assert_eq!(server_b.received(), vec![Bytes::from_static(b"to b")]);
        assert_eq!(
            h.pipeline.env(server_a.handle()).unwrap().dst,
            Some("93.184.216.34:80".parse().unwrap())
        );

        h.send(&server_b, b"from b");
        h.pump();
        assert_eq!(b.received(), vec![Bytes::from_static(b"from b")]);
        assert!(a.received().is_empty());
        assert_eq!(h.pipeline.len(), MAIN_NODES + 4 * NODES_PER_STREAM);

        // Client closes a; the server side sees End and closes in turn.
        h.close(&a);
        h.pump();
        assert_eq!(server_a.signals(), vec!["initialize", "end"]);
        h.close(&server_a);
        h.pump();
        assert_eq!(h.pipeline.len(), MAIN_NODES + 2 * NODES_PER_STREAM);

        // b is untouched.
        h.send(&b, b"still here");
        h.pump();
        assert_eq!(
            server_b.received(),
            vec![Bytes::from_static(b"to b"), Bytes::from_static(b"still here")]
        );
        assert_eq!(b.signals(), vec!["initialize"]);
    }

    #[test]
    fn test_key_reusable_after_full_close() {
        let mut h = Harness::new();
        let first = h.open("10.0.0.9:22");
        h.send(&first, b"one");
        h.pump();

        let accepted = h.accepted(0);
        h.close(&accepted);
        h.pump();
        assert_eq!(first.signals(), vec!["initialize", "end"]);
        h.close(&first);
        h.pump();
        assert_eq!(h.pipeline.len(), MAIN_NODES);

        let second = h.open("10.0.0.9:22");
        h.send(&second, b"two");
        h.pump();
        assert_eq!(h.accepted(1).received(), vec![Bytes::from_static(b"two")]);
    }

    #[test]
    fn test_destroy_reaches_every_stream_once() {
        let mut h = Harness::new();
        let a = h.open("10.0.0.1:1");
        let b = h.open("10.0.0.1:2");
        h.send(&a, b"x");
        h.send(&b, b"y");
        h.pump();

        h.client
            .dispatch_signal_up(&mut h.pipeline, Signal::Destroy)
            .unwrap();

        for stub in [&a, &b] {
            let destroys = stub.signals().iter().filter(|s| **s == "destroy").count();
            assert_eq!(destroys, 1);
        }
        assert_eq!(h.pipeline.len(), MAIN_NODES + 2 * NODES_PER_STREAM);
        // Server streams stay open; only the client connection went away.
        assert!(h.accepted(0).signals().iter().all(|s| *s != "destroy"));
    }

    #[test]
    fn test_half_close_for_unknown_key() {
        let mut h = Harness::new();
        let key = StreamKey::new([10, 1, 1, 1], 80);

        h.pipeline
            .deliver(h.server.bottom(), Event::DataFromDown(key.close_frame()));
        h.pipeline.drive().unwrap();
        assert_eq!(drain(&h.server_wire), vec![key.close_frame()]);

        h.pipeline
            .deliver(h.client.bottom(), Event::DataFromDown(key.close_frame()));
        h.pipeline.drive().unwrap();
        assert!(drain(&h.client_wire).is_empty());
    }

    #[test]
    fn test_initiator_drops_data_for_unknown_key() {
        let mut h = Harness::new();
        let mut frame = StreamKey::new([10, 1, 1, 1], 80).as_bytes().to_vec();
        frame.extend_from_slice(b"stray");

        h.pipeline
            .deliver(h.client.bottom(), Event::DataFromDown(Bytes::from(frame)));
        h.pipeline.drive().unwrap();
        assert_eq!(h.pipeline.len(), MAIN_NODES);
    }

    #[test]
    fn test_short_frame_is_a_protocol_error() {
        let mut h = Harness::new();
        h.pipeline
            .deliver(h.server.bottom(), Event::DataFromDown(Bytes::from_static(&[1, 2, 3])));
        h.pipeline.drive().unwrap();

        assert_eq!(signals(&h.server_wire), vec!["error"]);
        let env = h.pipeline.env(h.server.bottom()).unwrap();
        assert!(env.state.is_finished());
    }

    #[test]
    fn test_requests_wait_for_secure_channel() {
        let mut h = Harness::unready();
        let stub = h.open("10.0.0.3:8080");
        assert_eq!(h.pipeline.len(), MAIN_NODES);

        h.client
            .dispatch_signal_up(&mut h.pipeline, Signal::InitializeOk)
            .unwrap();
        assert_eq!(h.pipeline.len(), MAIN_NODES + NODES_PER_STREAM);
        assert_eq!(stub.signals(), vec!["initialize"]);
    }

    #[test]
    fn test_refused_requests() {
        let mut h = Harness::new();
        let first = h.open("10.0.0.4:80");
        let duplicate = h.open("10.0.0.4:80");
        let ipv6 = h.open("[2001:db8::1]:80");

        assert!(first.handle.lock().is_some());
        assert!(duplicate.handle.lock().is_none());
        assert!(ipv6.handle.lock().is_none());
        assert_eq!(h.pipeline.len(), MAIN_NODES + NODES_PER_STREAM);
    }

    #[test]
    fn test_empty_payload_is_not_sent() {
        let mut h = Harness::new();
        let stub = h.open("10.0.0.5:80");
        h.send(&stub, b"");
        assert!(drain(&h.client_wire).is_empty());
    }
}
