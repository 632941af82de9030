//! Error taxonomy shared across the storage and repair cores.

use thiserror::Error;

use crate::types::Endpoint;

/// Convenience alias for `Result<T, MerlinError>`.
pub type MerlinResult<T> = Result<T, MerlinError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — bad input or misconfiguration (caller's fault)
/// - `Retryable`   — failed this attempt, the next scheduler tick may succeed
/// - `Transient`   — resource pressure or peer slowness; retry after back-off
/// - `InternalBug` — should never happen; crash the subsystem, never repair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error all subsystem errors convert into.
#[derive(Error, Debug)]
pub enum MerlinError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Repair error: {0}")]
    Repair(#[from] RepairError),

    #[error("Hint error: {0}")]
    Hint(#[from] HintError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MerlinError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MerlinError::Storage(e) => e.kind(),
            MerlinError::Repair(e) => e.kind(),
            MerlinError::Hint(HintError::Corrupt { .. }) => ErrorKind::Retryable,
            MerlinError::Hint(_) => ErrorKind::Transient,
            MerlinError::Internal(_) => ErrorKind::InternalBug,
        }
    }
}

/// Storage-layer errors (manifest, scanners, compaction).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scan failed on sstable {sstable_id}: {detail}")]
    ScanFailed { sstable_id: u64, detail: String },

    #[error("Sstable {0} is not in the manifest")]
    UnknownSstable(u64),

    #[error("Compaction aborted: {0}")]
    CompactionAborted(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Io(_) | StorageError::ScanFailed { .. } => ErrorKind::Retryable,
            StorageError::CompactionAborted(_) => ErrorKind::Retryable,
            StorageError::UnknownSstable(_) => ErrorKind::UserError,
        }
    }
}

/// Repair-session errors.
#[derive(Error, Debug)]
pub enum RepairError {
    /// A session member was convicted by the failure detector.
    #[error("Endpoint {0} died")]
    EndpointDied(Endpoint),

    #[error("Cannot proceed on repair because a neighbor ({0}) is dead: session failed")]
    DeadNeighbor(Endpoint),

    #[error(
        "Requested range {0} intersects a local range but is not fully contained in one; \
         this would lead to imprecise repair"
    )]
    ImpreciseRange(String),

    #[error("Session terminated before completion")]
    Terminated,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Streaming failed: {0}")]
    Stream(String),
}

impl RepairError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepairError::EndpointDied(_) | RepairError::DeadNeighbor(_) => ErrorKind::Transient,
            RepairError::ImpreciseRange(_) => ErrorKind::UserError,
            RepairError::Terminated => ErrorKind::Transient,
            RepairError::Validation(_) | RepairError::Stream(_) => ErrorKind::Retryable,
        }
    }
}

/// Hint dispatch errors.
#[derive(Error, Debug)]
pub enum HintError {
    /// The hint file cannot be parsed. Dispatch quarantines it and moves on.
    #[error("Corrupt hint file {file}: {detail}")]
    Corrupt { file: String, detail: String },

    #[error("Hint delivery to {0} failed: {1}")]
    Delivery(Endpoint, String),
}
