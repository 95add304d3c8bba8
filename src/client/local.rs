//! The local application's socket as the top of a logical connection.

use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;

use super::pool::Lease;
use crate::error::Result;
use crate::layer::{Endpoint, EndpointStage};
use crate::pipeline::{Context, Signal, Stage};

/// An accepted SOCKS5 connection, holding its key lease for as long as
/// the sub-chain lives.
pub struct LocalStage {
    endpoint: EndpointStage,
    _lease: Lease,
}

impl LocalStage {
    /// Wrap a negotiated local connection.
    pub fn new(stream: TcpStream, idle: Option<Duration>, lease: Lease) -> Self {
        Self {
            endpoint: EndpointStage::new("local", Endpoint::Accepted(stream), idle),
            _lease: lease,
        }
    }
}

impl Stage for LocalStage {
    fn name(&self) -> &'static str {
        self.endpoint.name()
    }

    fn fetch_data_from_up(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        self.endpoint.fetch_data_from_up(ctx, data)
    }

    fn fetch_data_from_down(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        self.endpoint.fetch_data_from_down(ctx, data)
    }

    fn fetch_signal_from_up(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        self.endpoint.fetch_signal_from_up(ctx, signal)
    }

    fn fetch_signal_from_down(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        self.endpoint.fetch_signal_from_down(ctx, signal)
    }
}
