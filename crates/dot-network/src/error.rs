//! Request error types.

use thiserror::Error;

/// Failures observed while performing a block request against a peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No peer is currently connected.
    #[error("no peers connected")]
    NoPeersConnected,

    /// The peer did not answer within the deadline.
    #[error("request timed out")]
    Timeout,

    /// The peer does not support the block-request protocol.
    #[error("protocols not supported")]
    ProtocolNotSupported,

    /// The peer answered with an empty message.
    #[error("received empty message")]
    EmptyMessage,

    /// The underlying connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The transport is shutting down.
    #[error("transport stopped")]
    Stopped,
}
