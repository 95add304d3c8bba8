//! Low and High adapters that cap every chain.

use bytes::Bytes;

use super::{ConnectionState, Context, Event, Signal, Stage, StageHandle};
use crate::error::{Error, Result};

/// Transport-facing end of a chain.
///
/// With a proxy it hands everything coming from above to that stage; a
/// multiplexed sub-chain uses this to reach the tunnel stage. Without one,
/// an unhandled error becomes a teardown of the whole chain.
pub struct LowBoundary {
    proxy: Option<StageHandle>,
}

impl LowBoundary {
    /// Create a new Low adapter.
    pub fn new(proxy: Option<StageHandle>) -> Self {
        Self { proxy }
    }
}

impl Stage for LowBoundary {
    fn name(&self) -> &'static str {
        "low"
    }

    fn fetch_data_from_up(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        match self.proxy {
            Some(proxy) => {
                ctx.deliver(proxy, Event::DataFromUp(data));
                Ok(())
            }
            None => Err(Error::Invariant("data reached the bottom of the chain")),
        }
    }

    fn fetch_signal_from_up(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        if let Some(proxy) = self.proxy {
            ctx.deliver(proxy, Event::SignalFromUp(signal));
            return Ok(());
        }

        match signal {
            Signal::Error { cause, .. } => {
                tracing::warn!(src = ?ctx.env().src, error = %cause, "tearing down connection");
                ctx.env_mut().finish(ConnectionState::Error);
                ctx.dispatch_signal_up(Signal::Destroy)
            }
            other => {
                tracing::trace!(signal = other.name(), "absorbed at the bottom");
                Ok(())
            }
        }
    }
}

/// Application-facing end of a chain.
pub struct HighBoundary {
    proxy: Option<StageHandle>,
}

impl HighBoundary {
    /// Create a new High adapter.
    pub fn new(proxy: Option<StageHandle>) -> Self {
        Self { proxy }
    }
}

impl Stage for HighBoundary {
    fn name(&self) -> &'static str {
        "high"
    }

    fn fetch_data_from_down(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        match self.proxy {
            Some(proxy) => {
                ctx.deliver(proxy, Event::DataFromDown(data));
                Ok(())
            }
            None => Err(Error::Invariant("data reached the top of the chain")),
        }
    }

    fn fetch_signal_from_down(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        if let Some(proxy) = self.proxy {
            ctx.deliver(proxy, Event::SignalFromDown(signal));
            return Ok(());
        }

        match signal {
            Signal::Initialize => ctx.dispatch_signal_down(Signal::InitializeCompleted),
            other => {
                tracing::trace!(signal = other.name(), "absorbed at the top");
                Ok(())
            }
        }
    }
}
