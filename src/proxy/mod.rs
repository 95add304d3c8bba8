//! Proxy protocols spoken to local applications.

pub mod socks5;
