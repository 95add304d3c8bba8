//! Control signals that travel the chain alongside data.

use std::fmt;

use super::{EnvBlock, Stage};
use crate::error::Error;
use crate::layer::StreamKey;

/// Out-of-band lifecycle event.
///
/// `key` on [`Signal::Close`] and [`Signal::Error`] names the logical
/// connection the signal concerns; `None` means the whole chain.
pub enum Signal {
    /// Something went wrong
    Error {
        /// Logical connection, if any
        key: Option<StreamKey>,
        /// What happened
        cause: Error,
    },
    /// Tear everything down
    Destroy,
    /// The chain has been built; flows up from the bottom
    Initialize,
    /// Bytes can move; flows up once the transport (or secure channel) is ready
    InitializeOk,
    /// Answer to `Initialize` from the top; flows down
    InitializeCompleted,
    /// A new local connection that must be tunneled
    NewConnection {
        /// Environment for the logical connection
        env: EnvBlock,
        /// Application stage that will sit on top of it
        stage: Box<dyn Stage>,
    },
    /// The peer will send no more data
    End,
    /// This side is done
    Close {
        /// Logical connection, if any
        key: Option<StreamKey>,
    },
}

impl Signal {
    /// Error signal concerning the whole chain.
    pub fn error(cause: Error) -> Self {
        Signal::Error { key: None, cause }
    }

    /// Close signal concerning the whole chain.
    pub fn close() -> Self {
        Signal::Close { key: None }
    }

    /// Short name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Error { .. } => "error",
            Signal::Destroy => "destroy",
            Signal::Initialize => "initialize",
            Signal::InitializeOk => "initialize-ok",
            Signal::InitializeCompleted => "initialize-completed",
            Signal::NewConnection { .. } => "new-connection",
            Signal::End => "end",
            Signal::Close { .. } => "close",
        }
    }

    /// Logical connection this signal is tagged with.
    pub fn key(&self) -> Option<StreamKey> {
        match self {
            Signal::Error { key, .. } | Signal::Close { key } => *key,
            _ => None,
        }
    }

    /// Tag a `Close` or `Error` with a logical connection key.
    ///
    /// Other signals are returned unchanged.
    pub fn with_key(self, stream: StreamKey) -> Self {
        match self {
            Signal::Error { cause, .. } => Signal::Error {
                key: Some(stream),
                cause,
            },
            Signal::Close { .. } => Signal::Close { key: Some(stream) },
            other => other,
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Error { key, cause } => f
                .debug_struct("Error")
                .field("key", key)
                .field("cause", cause)
                .finish(),
            Signal::Close { key } => f.debug_struct("Close").field("key", key).finish(),
            Signal::NewConnection { env, stage } => f
                .debug_struct("NewConnection")
                .field("dst", &env.dst)
                .field("stage", &stage.name())
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}
