//! Error types for the forwarder and the NAT client library.
//!
//! The relay core only ever sees [`FrameError`]: both variants mean "tear the
//! owning session down". Everything an application can observe synchronously
//! is a [`NatError`].

use std::io;

use thiserror::Error;

/// Failure while reading or writing a single frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame header (or a kind-specific content field) could not be parsed.
    #[error("malformed frame header: {0}")]
    Header(String),

    /// The socket failed or was closed, possibly mid-frame.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),
}

impl FrameError {
    pub(crate) fn header(msg: impl Into<String>) -> Self {
        Self::Header(msg.into())
    }
}

/// Failure encoding or decoding a control-plane RPC message.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc message truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("rpc json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced to callers of the NAT client library.
#[derive(Debug, Error)]
pub enum NatError {
    /// The forwarder does not know the requested server.
    #[error("connection refused: no server '{0}' at the forwarder")]
    NoServer(String),

    /// The server has reached its client limit on the forwarder.
    #[error("connection refused: server '{0}' is busy")]
    BusyServer(String),

    /// The forwarder rejected the request with another status.
    #[error("connection refused by forwarder: {0}")]
    Refused(String),

    /// None of the candidate forwarders accepted a TCP connection.
    #[error("could not connect to a forwarder: {0}")]
    Connect(String),

    /// A control-plane call returned `status = false`.
    #[error("forwarder rejected {function}")]
    Rejected { function: &'static str },

    /// `nat_waitforconn` was called twice for the same identity and port.
    #[error("already listening on {id}:{port}")]
    AlreadyListening { id: String, port: u16 },

    /// The shared forwarder link is gone.
    #[error("forwarder link closed")]
    LinkClosed,

    /// The discovery service failed or returned nothing usable.
    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}
