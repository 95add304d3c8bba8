//! # pipetun
//!
//! An encrypted, multiplexed SOCKS5 tunnel.
//!
//! The client accepts SOCKS5 connections locally and carries each one as a
//! logical connection over a small pool of persistent TCP connections to
//! the server, which relays it to its destination.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │   SOCKS5 listener (client)      relay dialer (server)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Tunnel: destination-keyed logical connections          │
//! ├─────────────────────────────────────────────────────────┤
//! │  Handshake (X25519 + HMAC), then ChaCha20 per direction │
//! ├─────────────────────────────────────────────────────────┤
//! │  Framing: u32 length prefix                             │
//! ├─────────────────────────────────────────────────────────┤
//! │  TCP socket                                             │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Every layer is a [`pipeline::Stage`]; a physical connection is one
//! [`pipeline::Pipeline`] owned by one task.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod layer;
pub mod pipeline;
pub mod proxy;
pub mod session;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "server")]
pub mod server;

pub use config::Config;
pub use error::{Error, Result};

/// Default cap on a single frame's declared length (1 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 20;
