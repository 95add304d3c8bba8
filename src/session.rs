//! The task that owns one physical connection.
//!
//! A [`Connection`] holds the pipeline for the connection and every logical
//! connection multiplexed over it. Socket tasks and other parts of the
//! process reach it only through its mailbox.

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::pipeline::{
    Bounds, ConnectionState, EnvBlock, Event, Inbound, Mailbox, Pipeline, SessionHandle, Signal,
    Stage, StageHandle,
};

/// One physical connection and its chain.
pub struct Connection {
    pipeline: Pipeline,
    session: SessionHandle,
    inbox: mpsc::UnboundedReceiver<Inbound>,
}

/// Cloneable way in to a running [`Connection`].
#[derive(Clone)]
pub struct ConnectionHandle {
    mailbox: Mailbox,
    top: StageHandle,
}

impl Connection {
    /// Build the chain for a connection. `stages` are listed bottom first.
    pub fn new(env: EnvBlock, stages: Vec<Box<dyn Stage>>) -> Result<(Self, ConnectionHandle)> {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let mut pipeline = Pipeline::new(mailbox.clone());
        let session = pipeline.build_session(env, Bounds::default(), stages)?;

        let handle = ConnectionHandle {
            mailbox,
            top: session.top(),
        };
        Ok((
            Self {
                pipeline,
                session,
                inbox,
            },
            handle,
        ))
    }

    /// Start the chain and run it until the connection ends.
    ///
    /// Returns the final environment of the connection. Dropping the
    /// pipeline on the way out closes every socket it still owns.
    pub async fn run(mut self) -> EnvBlock {
        let result = self.drive().await;
        let mut env = self
            .pipeline
            .env(self.session.bottom())
            .cloned()
            .unwrap_or_else(|| EnvBlock::new(Default::default()));
        match result {
            Ok(()) => env.finish(ConnectionState::Closed),
            Err(e) => {
                tracing::error!(src = ?env.src, error = %e, "dropping connection");
                env.finish(ConnectionState::Error);
            }
        }
        env
    }

    async fn drive(&mut self) -> Result<()> {
        self.session
            .dispatch_signal_up(&mut self.pipeline, Signal::Initialize)?;

        while !self.is_finished() {
            let Some(Inbound { target, event }) = self.inbox.recv().await else {
                break;
            };
            self.pipeline.deliver(target, event);
            while let Ok(Inbound { target, event }) = self.inbox.try_recv() {
                self.pipeline.deliver(target, event);
            }
            self.pipeline.drive()?;
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.pipeline
            .env(self.session.bottom())
            .map_or(true, |env| env.state.is_finished())
    }
}

impl ConnectionHandle {
    /// Ask the connection to carry a new logical connection.
    ///
    /// `stage` becomes the top of the logical connection's sub-chain and
    /// `env.dst` names its destination.
    pub fn open(&self, env: EnvBlock, stage: Box<dyn Stage>) -> Result<()> {
        self.mailbox
            .send(Inbound {
                target: self.top,
                event: Event::SignalFromUp(Signal::NewConnection { env, stage }),
            })
            .map_err(|_| Error::tunnel("physical connection is gone"))
    }

    /// Whether the connection task has ended.
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

/// Log the outcome of a physical connection.
pub fn log_finished(side: &'static str, env: &EnvBlock) {
    tracing::info!(
        side,
        peer = ?env.src.or(env.dst),
        read = env.flow.read,
        written = env.flow.written,
        duration_ms = env.time.elapsed_ms(),
        state = ?env.state,
        "connection closed"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::config::Config;
    use crate::pipeline::testing::Passthrough;
    use crate::pipeline::Context;

    /// Ends the connection when it hears `Close` from above.
    struct Closer;

    impl Stage for Closer {
        fn name(&self) -> &'static str {
            "closer"
        }

        fn fetch_signal_from_up(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
            if let Signal::Close { .. } = signal {
                ctx.env_mut().finish(ConnectionState::Closed);
                return Ok(());
            }
            ctx.dispatch_signal_down(signal)
        }
    }

    fn env() -> EnvBlock {
        EnvBlock::new(Arc::new(Config::default()))
    }

    #[tokio::test]
    async fn test_runs_until_finished() {
        let (connection, handle) =
            Connection::new(env(), vec![Box::new(Closer), Box::new(Passthrough)]).unwrap();
        let task = tokio::spawn(connection.run());

        handle
            .mailbox
            .send(Inbound {
                target: handle.top,
                event: Event::SignalFromUp(Signal::close()),
            })
            .unwrap();

        let finished = task.await.unwrap();
        assert_eq!(finished.state, ConnectionState::Closed);
        assert!(finished.time.end.is_some());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_invariant_violation_ends_connection() {
        let (connection, handle) = Connection::new(env(), vec![Box::new(Passthrough)]).unwrap();
        let task = tokio::spawn(connection.run());

        // Data falling off the bottom of a chain is a bug.
        handle
            .mailbox
            .send(Inbound {
                target: handle.top,
                event: Event::DataFromUp(Bytes::from_static(b"lost")),
            })
            .unwrap();

        let finished = task.await.unwrap();
        assert_eq!(finished.state, ConnectionState::Error);
        assert!(handle.open(env(), Box::new(Passthrough)).is_err());
    }
}
