//! Error types for the HPCGrid state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// An append-only or write-once key was written twice.
    #[error("record already exists: {0}")]
    AlreadyExists(String),
}

/// Cluster capacity bookkeeping failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapacityError {
    #[error(
        "cluster {cluster} cannot fit {nodes} nodes / {gpus} gpus \
         (available {available_nodes} nodes / {available_gpus} gpus)"
    )]
    Insufficient {
        cluster: String,
        nodes: u32,
        gpus: u32,
        available_nodes: u32,
        available_gpus: u32,
    },

    #[error(
        "cluster {cluster} capacity invariant violated: \
         {available_nodes}/{total_nodes} nodes, {available_gpus}/{total_gpus} gpus"
    )]
    InvariantViolated {
        cluster: String,
        available_nodes: u32,
        total_nodes: u32,
        available_gpus: u32,
        total_gpus: u32,
    },
}
