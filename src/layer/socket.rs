//! TCP sockets as pipeline stages.
//!
//! A socket is driven by two tasks. The reader posts what it reads into the
//! connection's mailbox, addressed to the stage that owns the socket; the
//! writer drains an unbounded channel the stage feeds. Dropping the
//! [`SocketIo`] stops the reader and lets the writer flush and shut down.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::pipeline::{ConnectionState, Context, Event, Inbound, Mailbox, Signal, Stage, StageHandle};

/// Bytes requested from the socket per read.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Bind a listener on `addr` (`host:port`) with the given backlog.
pub async fn listen(addr: &str, backlog: u32) -> Result<TcpListener> {
    let addr = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| Error::config(format!("{} does not resolve", addr)))?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}

/// Where the socket sits relative to the stage that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    /// Under the chain: the physical connection.
    Below,
    /// On top of a chain: a local client or a relay target.
    Above,
}

impl Facing {
    fn data(self, data: Bytes) -> Event {
        match self {
            Facing::Below => Event::DataFromDown(data),
            Facing::Above => Event::DataFromUp(data),
        }
    }

    /// What the owning stage hears when the socket stops.
    fn ended(self, error: Option<io::Error>) -> Event {
        match (self, error) {
            (Facing::Below, _) => Event::SignalFromDown(Signal::Destroy),
            (Facing::Above, None) => Event::SignalFromUp(Signal::close()),
            (Facing::Above, Some(e)) => Event::SignalFromUp(Signal::error(Error::Network(e))),
        }
    }
}

/// Time of the last byte moved in either direction.
#[derive(Clone)]
struct Activity(Arc<Mutex<Instant>>);

impl Activity {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock()
    }
}

/// Reader and writer tasks of one socket.
pub struct SocketIo {
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    reader: JoinHandle<()>,
}

impl SocketIo {
    /// Start moving bytes between `stream` and the stage at `target`.
    ///
    /// With an idle limit, the socket ends once neither direction has moved
    /// any bytes for that long.
    pub fn spawn(
        stream: TcpStream,
        mailbox: Mailbox,
        target: StageHandle,
        facing: Facing,
        idle: Option<Duration>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let activity = Activity::new();

        tokio::spawn(write_loop(
            write_half,
            rx,
            mailbox.clone(),
            target,
            facing,
            activity.clone(),
        ));
        let reader = tokio::spawn(read_loop(read_half, mailbox, target, facing, idle, activity));

        Self {
            writer: Some(tx),
            reader,
        }
    }

    /// Dial `addr` in the background.
    ///
    /// Writes queued before the connection exists are sent once it does. A
    /// failed or timed out dial ends the socket like a read error.
    pub fn connect(
        addr: SocketAddr,
        timeout: Duration,
        mailbox: Mailbox,
        target: StageHandle,
        facing: Facing,
        idle: Option<Duration>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(async move {
            let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    let _ = mailbox.send(Inbound {
                        target,
                        event: facing.ended(Some(e)),
                    });
                    return;
                }
                Err(_) => {
                    let e = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
                    let _ = mailbox.send(Inbound {
                        target,
                        event: facing.ended(Some(e)),
                    });
                    return;
                }
            };
            let _ = stream.set_nodelay(true);

            let (read_half, write_half) = stream.into_split();
            let activity = Activity::new();
            tokio::spawn(write_loop(
                write_half,
                rx,
                mailbox.clone(),
                target,
                facing,
                activity.clone(),
            ));
            read_loop(read_half, mailbox, target, facing, idle, activity).await;
        });

        Self {
            writer: Some(tx),
            reader,
        }
    }

    /// Queue bytes for the socket. Returns `false` once writing has stopped.
    pub fn write(&self, data: Bytes) -> bool {
        self.writer.as_ref().is_some_and(|tx| tx.send(data).is_ok())
    }

    /// Flush what is queued, then shut down the write side.
    pub fn shutdown_write(&mut self) {
        self.writer = None;
    }
}

impl Drop for SocketIo {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Await `read`, or `None` once the socket has been idle for `limit`.
///
/// Writes count as activity too, so the deadline moves with either side.
async fn read_or_idle<F>(
    read: F,
    idle: Option<Duration>,
    activity: &Activity,
) -> Option<io::Result<usize>>
where
    F: Future<Output = io::Result<usize>>,
{
    let Some(limit) = idle else {
        return Some(read.await);
    };
    tokio::pin!(read);
    loop {
        tokio::select! {
            result = &mut read => return Some(result),
            _ = tokio::time::sleep_until(activity.last() + limit) => {
                if activity.last() + limit <= Instant::now() {
                    return None;
                }
            }
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    mailbox: Mailbox,
    target: StageHandle,
    facing: Facing,
    idle: Option<Duration>,
    activity: Activity,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.reserve(READ_BUFFER_SIZE);
        let Some(result) = read_or_idle(reader.read_buf(&mut buf), idle, &activity).await else {
            tracing::debug!(?target, "socket idle");
            let _ = mailbox.send(Inbound {
                target,
                event: facing.ended(None),
            });
            return;
        };

        let event = match result {
            Ok(0) => facing.ended(None),
            Ok(_) => {
                activity.touch();
                facing.data(buf.split().freeze())
            }
            Err(e) => {
                tracing::debug!(?target, error = %e, "socket read failed");
                facing.ended(Some(e))
            }
        };
        let last = !matches!(event, Event::DataFromDown(_) | Event::DataFromUp(_));
        if mailbox.send(Inbound { target, event }).is_err() || last {
            return;
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mailbox: Mailbox,
    target: StageHandle,
    facing: Facing,
    activity: Activity,
) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            tracing::debug!(?target, error = %e, "socket write failed");
            let _ = mailbox.send(Inbound {
                target,
                event: facing.ended(Some(e)),
            });
            return;
        }
        activity.touch();
    }
    let _ = writer.shutdown().await;
}

/// The physical connection at the bottom of a chain.
///
/// Reads start once the chain reports `InitializeCompleted`; the stage then
/// announces `InitializeOk`. End of file, idleness and errors all become
/// `Destroy`.
pub struct SocketStage {
    stream: Option<TcpStream>,
    idle: Option<Duration>,
    io: Option<SocketIo>,
    destroyed: bool,
}

impl SocketStage {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream, idle: Option<Duration>) -> Self {
        Self {
            stream: Some(stream),
            idle,
            io: None,
            destroyed: false,
        }
    }
}

impl Stage for SocketStage {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn fetch_data_from_up(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        let len = data.len() as u64;
        match &self.io {
            Some(io) if io.write(data) => ctx.env_mut().flow.written += len,
            _ => tracing::trace!(len, "dropping write to closed socket"),
        }
        Ok(())
    }

    fn fetch_data_from_down(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        ctx.env_mut().flow.read += data.len() as u64;
        ctx.dispatch_data_up(data)
    }

    fn fetch_signal_from_up(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        match signal {
            Signal::InitializeCompleted => {
                let Some(stream) = self.stream.take() else {
                    return Ok(());
                };
                self.io = Some(SocketIo::spawn(
                    stream,
                    ctx.mailbox(),
                    ctx.handle(),
                    Facing::Below,
                    self.idle,
                ));
                ctx.dispatch_signal_up(Signal::InitializeOk)
            }
            other => ctx.dispatch_signal_down(other),
        }
    }

    fn fetch_signal_from_down(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        match signal {
            Signal::Destroy => {
                if std::mem::replace(&mut self.destroyed, true) {
                    return Ok(());
                }
                self.io = None;
                self.stream = None;
                ctx.env_mut().finish(ConnectionState::Destroyed);
                ctx.dispatch_signal_up(Signal::Destroy)
            }
            other => ctx.dispatch_signal_up(other),
        }
    }
}

/// How an [`EndpointStage`] gets its socket.
pub enum Endpoint {
    /// A connection that was accepted locally.
    Accepted(TcpStream),
    /// Dial the chain's destination, giving up after the timeout.
    Dial(Duration),
}

/// A socket at the top of a logical connection's sub-chain.
///
/// On the client it is the local application's connection, on the server
/// the connection to the destination. Its reads go down the chain and
/// whatever comes up is written to it. End of file becomes `Close` and a
/// socket error becomes `Error`, both scoped to the logical connection.
pub struct EndpointStage {
    name: &'static str,
    endpoint: Option<Endpoint>,
    idle: Option<Duration>,
    io: Option<SocketIo>,
}

impl EndpointStage {
    /// Create an endpoint stage.
    pub fn new(name: &'static str, endpoint: Endpoint, idle: Option<Duration>) -> Self {
        Self {
            name,
            endpoint: Some(endpoint),
            idle,
            io: None,
        }
    }

    fn start(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        let (mailbox, target) = (ctx.mailbox(), ctx.handle());
        match self.endpoint.take() {
            Some(Endpoint::Accepted(stream)) => {
                self.io = Some(SocketIo::spawn(stream, mailbox, target, Facing::Above, self.idle));
            }
            Some(Endpoint::Dial(timeout)) => {
                let Some(dst) = ctx.env().dst else {
                    return ctx.dispatch_signal_down(Signal::error(Error::tunnel(
                        "logical connection without a destination",
                    )));
                };
                tracing::debug!(%dst, "connecting");
                self.io = Some(SocketIo::connect(
                    dst,
                    timeout,
                    mailbox,
                    target,
                    Facing::Above,
                    self.idle,
                ));
            }
            None => {}
        }
        Ok(())
    }
}

impl Stage for EndpointStage {
    fn name(&self) -> &'static str {
        self.name
    }

    fn fetch_data_from_up(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        ctx.env_mut().flow.read += data.len() as u64;
        ctx.dispatch_data_down(data)
    }

    fn fetch_data_from_down(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        let len = data.len() as u64;
        match &self.io {
            Some(io) if io.write(data) => ctx.env_mut().flow.written += len,
            _ => tracing::trace!(len, "dropping write to closed socket"),
        }
        Ok(())
    }

    fn fetch_signal_from_up(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        match signal {
            Signal::InitializeCompleted => {
                self.start(ctx)?;
                ctx.env_mut().state = ConnectionState::Connected;
                ctx.dispatch_signal_down(Signal::InitializeCompleted)
            }
            Signal::Close { .. } => {
                ctx.env_mut().finish(ConnectionState::Closed);
                ctx.dispatch_signal_down(signal)
            }
            Signal::Error { ref cause, .. } => {
                tracing::debug!(dst = ?ctx.env().dst, error = %cause, "endpoint failed");
                ctx.env_mut().finish(ConnectionState::Error);
                ctx.dispatch_signal_down(signal)
            }
            other => ctx.dispatch_signal_down(other),
        }
    }

    fn fetch_signal_from_down(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        match signal {
            Signal::End => {
                if let Some(io) = &mut self.io {
                    io.shutdown_write();
                }
                Ok(())
            }
            Signal::Destroy => {
                self.io = None;
                self.endpoint = None;
                ctx.env_mut().finish(ConnectionState::Destroyed);
                ctx.dispatch_signal_up(Signal::Destroy)
            }
            other => ctx.dispatch_signal_up(other),
        }
    }
}
