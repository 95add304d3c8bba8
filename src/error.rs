//! Error types for the tunnel.

use thiserror::Error;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the tunnel.
#[derive(Error, Debug)]
pub enum Error {
    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Authentication digest or user identifier did not match
    #[error("authentication failed")]
    Authentication,

    /// Handshake protocol error
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Peer clock is too far from ours
    #[error("clock skew of {skew_ms}ms exceeds {limit_ms}ms")]
    ClockSkew {
        /// Peer clock minus ours
        skew_ms: i64,
        /// Largest accepted difference
        limit_ms: i64,
    },

    /// Invalid message format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Declared frame length above the configured cap
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Declared length
        len: usize,
        /// Configured cap
        max: usize,
    },

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// SOCKS5 negotiation failed
    #[error("socks5 error: {0}")]
    Socks5(String),

    /// No usable physical connection, or the connection went away
    #[error("tunnel unavailable: {0}")]
    Tunnel(String),

    /// The pipeline was driven in a way its construction does not allow
    #[error("pipeline invariant violated: {0}")]
    Invariant(&'static str),
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new invalid message error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidMessage(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new SOCKS5 error
    pub fn socks5(msg: impl Into<String>) -> Self {
        Error::Socks5(msg.into())
    }

    /// Create a new tunnel error
    pub fn tunnel(msg: impl Into<String>) -> Self {
        Error::Tunnel(msg.into())
    }

    /// Check if this error came from bytes a peer sent us.
    ///
    /// Protocol errors travel the chain as error signals instead of
    /// aborting the connection task.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::Handshake(_)
                | Error::Authentication
                | Error::ClockSkew { .. }
                | Error::InvalidMessage(_)
                | Error::FrameTooLarge { .. }
                | Error::Crypto(_)
        )
    }

    /// Check if this error indicates authentication failure
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Authentication | Error::ClockSkew { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Authentication;
        assert_eq!(err.to_string(), "authentication failed");

        let err = Error::FrameTooLarge { len: 10, max: 4 };
        assert_eq!(err.to_string(), "frame of 10 bytes exceeds limit of 4 bytes");

        let err = Error::ClockSkew {
            skew_ms: 61_000,
            limit_ms: 60_000,
        };
        assert_eq!(err.to_string(), "clock skew of 61000ms exceeds 60000ms");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::Authentication.is_protocol_error());
        assert!(Error::invalid("short").is_protocol_error());
        assert!(!Error::Invariant("detached twice").is_protocol_error());
        assert!(!Error::tunnel("gone").is_protocol_error());

        assert!(Error::Authentication.is_auth_failure());
        assert!(!Error::handshake("bad version").is_auth_failure());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: Error = io.into();
        assert!(matches!(err, Error::Network(_)));
    }
}
