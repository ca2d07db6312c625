//! Typed protocol and transfer errors
//!
//! Both travel inside `anyhow::Error`; callers that need to tell them apart use
//! `downcast_ref`.

use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Control-channel failures. Any of these closes the session without retry.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed frame: {0:?}")]
    Malformed(String),

    #[error("frame body has no ':' separator: {0:?}")]
    MissingSeparator(String),

    #[error("size field is not a decimal number: {0:?}")]
    InvalidSize(String),

    #[error("unexpected {got} frame in state {state}")]
    Unexpected { state: &'static str, got: &'static str },

    #[error("frame longer than {max} bytes")]
    TooLong { max: usize },

    #[error("invalid data-plane port {0}")]
    InvalidPort(i32),

    #[error("path cannot be carried in a frame: {0:?}")]
    UnencodablePath(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("{what} timed out after {ms} ms")]
    Timeout { what: &'static str, ms: u64 },
}

/// Data-plane failures. These abort one file's transfer, never the session.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("transfer of {} failed: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("size mismatch for {}: declared {declared} bytes, got {received}", path.display())]
    SizeMismatch {
        path: PathBuf,
        declared: u64,
        received: u64,
    },

    #[error("no data-plane connection within {ms} ms")]
    AcceptTimeout { ms: u64 },

    #[error("data-plane connection from {got}, expected {expected}")]
    UnexpectedPeer { expected: IpAddr, got: IpAddr },
}
