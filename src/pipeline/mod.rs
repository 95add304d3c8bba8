//! Layered transport pipeline.
//!
//! A connection is a chain of [`Stage`]s between two boundary adapters:
//!
//! ```text
//!   High   ← application side ("up")
//!   stage N
//!   ...
//!   stage 1
//!   Low    ← transport side ("down")
//! ```
//!
//! A stage talks only to its neighbours, through the [`Context`] it is
//! handed on every call. Dispatching up arrives at the neighbour's
//! `fetch_*_from_down`, dispatching down at its `fetch_*_from_up`, so a
//! stage is written once and works at any position. Stages may attach new
//! stages next to themselves and detach themselves while the connection is
//! live; the handshake uses this to swap itself for the stream cipher.

mod boundary;
mod chain;
mod env;
mod signal;

#[cfg(test)]
pub(crate) mod testing;

pub use boundary::{HighBoundary, LowBoundary};
pub use chain::{Bounds, Context, Event, Inbound, Mailbox, Pipeline, SessionHandle, StageHandle};
pub use env::{ConnectionState, EnvBlock, Flow, Timing};
pub use signal::Signal;

use bytes::Bytes;

use crate::error::Result;

/// One unit of processing in a chain.
///
/// Every method forwards unchanged by default; implementors override the
/// directions they care about. Errors returned from these methods are
/// invariant violations and end the physical connection. Protocol problems
/// should be reported with [`Signal::Error`] instead.
pub trait Stage: Send {
    /// Short name, for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Data dispatched down by the stage above.
    fn fetch_data_from_up(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        ctx.dispatch_data_down(data)
    }

    /// Data dispatched up by the stage below.
    fn fetch_data_from_down(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        ctx.dispatch_data_up(data)
    }

    /// Signal dispatched down by the stage above.
    fn fetch_signal_from_up(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        ctx.dispatch_signal_down(signal)
    }

    /// Signal dispatched up by the stage below.
    fn fetch_signal_from_down(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        ctx.dispatch_signal_up(signal)
    }
}
