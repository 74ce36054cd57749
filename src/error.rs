use crate::domain::job::{RedemptionJob, SubscriptionId};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),
    #[error("Transaction hash already recorded: {0}")]
    DuplicateTransaction(String),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
}

impl PipelineError {
    /// Whether repeating the same storage call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::IoError(_) | PipelineError::StorageError(_) => true,
            #[cfg(feature = "storage-rocksdb")]
            PipelineError::RocksDbError(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure talking to the Execution Backend.
///
/// The variants answer one question for the state machine: could the request
/// have taken effect on chain?
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The request never reached the backend.
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    /// The backend processed the request and refused it.
    #[error("backend rejected request: {0}")]
    Rejected(String),
    /// The request was sent but no definitive answer came back.
    #[error("backend outcome indeterminate: {0}")]
    Indeterminate(String),
    #[error("malformed backend response: {0}")]
    Protocol(String),
}

impl BackendError {
    /// True when the request provably had no on-chain effect.
    pub fn provably_not_applied(&self) -> bool {
        matches!(self, BackendError::Unreachable(_) | BackendError::Rejected(_))
    }
}

/// Failure of the RPC hop between the dispatcher and the Execution Service.
///
/// Distinct from an application-level `success = false` reply.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("redemption service unreachable: {0}")]
    Connect(String),
    #[error("redemption service rejected credentials")]
    Unauthorized,
    #[error("redemption call timed out after {0:?}")]
    Timeout(Duration),
    #[error("redemption call failed in transit: {0}")]
    Transport(String),
    #[error("malformed redemption reply: {0}")]
    Protocol(String),
}

impl TransportError {
    /// True when the service cannot have started settling the request.
    pub fn request_not_processed(&self) -> bool {
        matches!(self, TransportError::Connect(_) | TransportError::Unauthorized)
    }
}

/// Why the processor refused a job at submission time.
#[derive(Error, Debug)]
pub enum SubmitError {
    /// The queue is at capacity. The job is handed back untouched.
    #[error("processor queue is full")]
    Busy(Box<RedemptionJob>),
    #[error("subscription {0} already has a job in flight")]
    AlreadyInFlight(SubscriptionId),
    #[error("processor is stopped")]
    Stopped,
}
