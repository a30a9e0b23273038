//! Sync error types.

use dot_types::Hash;
use thiserror::Error;

/// Failures surfaced by the block-state and storage collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The requested entry does not exist.
    #[error("entry not found")]
    NotFound,

    /// The backing database failed.
    #[error("database error: {0}")]
    Database(String),
}

impl StateError {
    /// Whether this is a plain missing-entry lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// A block production (BABE) or justification verification failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct VerificationError(pub String);

/// A runtime `execute_block` failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ExecutionError(pub String);

/// A block-import handler failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ImportError(pub String);

/// Sync engine errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The block state is paused; no requests may be submitted.
    #[error("block state is paused")]
    BlockStatePaused,

    /// Shutdown exceeded its hard deadline.
    #[error("shutdown exceeded its deadline")]
    StopTimeout,

    /// The announced block is already tracked by the disjoint set.
    #[error("block #{number} ({hash}) already in disjoint set")]
    AlreadyInDisjointSet {
        /// Block number.
        number: u64,
        /// Block hash.
        hash: Hash,
    },

    /// The parent of a block to import could not be fetched.
    #[error("failed to get parent header: {0}")]
    FailedToGetParent(#[source] StateError),

    /// No peer views are available to compute a sync target.
    #[error("no peers to compute a sync target")]
    NoPeers,

    /// A block reached the ready queue without a known header.
    #[error("block with unknown header is ready: {0}")]
    UnknownHeaderForReadyBlock(Hash),

    /// Block state or storage lookup failure.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Block production verification failed.
    #[error("verifying block: {0}")]
    BabeVerification(#[source] VerificationError),

    /// Justification verification failed.
    #[error("verifying justification for block #{number}: {source}")]
    JustificationVerification {
        /// Block number.
        number: u64,
        /// Underlying verification failure.
        #[source]
        source: VerificationError,
    },

    /// Runtime execution failed.
    #[error("executing block #{number}: {source}")]
    Execution {
        /// Block number.
        number: u64,
        /// Underlying runtime failure.
        #[source]
        source: ExecutionError,
    },

    /// The block-import handler rejected the block.
    #[error("importing block: {0}")]
    Import(#[from] ImportError),
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Response validation failures raised while assembling a chain slice.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseValidationError {
    /// A block data entry was missing entirely.
    #[error("nil block data in response")]
    NilBlockData,

    /// A required header was missing.
    #[error("nil header in response: {0}")]
    NilHeader(Hash),

    /// A required body was missing.
    #[error("nil body in response: {0}")]
    NilBody(Hash),

    /// A required justification was missing.
    #[error("nil justification in response: {0}")]
    NilJustification(Hash),
}
