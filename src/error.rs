//! Error types for the group manager and its collaborators.

use thiserror::Error;

/// Failures of the membership tree backend.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("index {index} is outside a tree of depth {depth}")]
    IndexOutOfRange { index: u64, depth: usize },
    #[error("unsupported tree depth {0} (must be between 1 and 32)")]
    InvalidDepth(usize),
    #[error("tree storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("tree snapshot is corrupt: {0}")]
    Corrupt(String),
    #[error("tree I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the chain.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("rpc request failed: {0}")]
    Rpc(String),
    #[error("registry contract call failed: {0}")]
    ContractCall(String),
    #[error("malformed membership log: {0}")]
    MalformedLog(String),
    #[error("chain connection is closed")]
    Closed,
}

/// Failures reading or writing the credential keystore.
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("keystore I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("keystore is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("keystore belongs to application {found}, expected {expected}")]
    AppMismatch { expected: String, found: String },
    #[error("failed to decrypt keystore credential (wrong password?)")]
    Decryption,
    #[error("failed to encrypt keystore credential")]
    Encryption,
    #[error("keystore key derivation failed: {0}")]
    Kdf(String),
    #[error("malformed keystore entry: {0}")]
    Malformed(String),
}

/// Failures persisting the sync watermark.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata record must be {expected} bytes, got {found}")]
    Malformed { expected: usize, found: usize },
}

/// Errors surfaced by [`crate::group_manager::GroupManager`].
#[derive(Debug, Error)]
pub enum GroupManagerError {
    /// Bad keystore or group index, or no usable credential.
    #[error("configuration error: {0}")]
    Config(String),
    #[error("group manager already started")]
    AlreadyStarted,
    /// Chain dial or registry probe failure.
    #[error("chain connectivity error: {0}")]
    Connectivity(#[from] ChainError),
    /// Tree insert/delete failure; the batch was aborted.
    #[error("reconciliation failed: {0}")]
    Reconciliation(TreeError),
    #[error("failed to flush membership tree: {0}")]
    Flush(TreeError),
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
    #[error("{0} has not been setup")]
    NotInitialized(&'static str),
    #[error("sync worker terminated abnormally: {0}")]
    Worker(String),
}
