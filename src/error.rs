//! Error types for the listener and its connections.
//!
//! Only [`BindError`] is surfaced to callers of `Listener::start`. Everything
//! else is scoped to a single connection and reported through the sink.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Failure to bring a listener up.
#[derive(Error, Debug)]
pub enum BindError {
    #[error("failed to resolve '{address}': {source}")]
    Resolve {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("'{address}' did not resolve to any socket address")]
    NoAddress { address: String },

    #[error("failed to bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("listener is already bound to {addr}")]
    AlreadyStarted { addr: SocketAddr },
}

/// A received chunk was not valid UTF-8.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid UTF-8 after {valid_up_to} bytes, dropped {dropped} bytes")]
pub struct DecodeError {
    /// Bytes of the (carry + chunk) input that were valid before the bad sequence.
    pub valid_up_to: usize,
    /// Bytes discarded, including any carried partial character.
    pub dropped: usize,
}

/// Failure while feeding a chunk through the record splitter.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("unterminated record exceeds {limit} bytes")]
    RecordTooLarge { limit: usize },
}

/// Failure that ends a connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Decode(DecodeError),

    #[error("unterminated record exceeds {limit} bytes")]
    RecordTooLarge { limit: usize },
}

impl From<SplitError> for ConnectionError {
    fn from(e: SplitError) -> Self {
        match e {
            SplitError::Decode(e) => ConnectionError::Decode(e),
            SplitError::RecordTooLarge { limit } => ConnectionError::RecordTooLarge { limit },
        }
    }
}
