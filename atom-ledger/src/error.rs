//! Error types for the atom ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB, in-memory backend)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON error (atom import/export)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Atom not found in the store
    #[error("Atom not found: {0}")]
    AtomNotFound(String),

    /// An account system with the same name is already registered
    #[error("Duplicate system name: {0}")]
    DuplicateSystem(String),

    /// No account system registered under the name
    #[error("Account system not found: {0}")]
    SystemNotFound(String),

    /// Registered account system has a different concrete type
    #[error("Account system {0} has an unexpected type")]
    SystemTypeMismatch(String),

    /// Particle content violates an expectation of a reducer
    #[error("Invalid particle: {0}")]
    InvalidParticle(String),

    /// Malformed resource identifier
    #[error("Invalid RRI: {0}")]
    InvalidRri(String),

    /// Node connection failure
    #[error("Network error: {0}")]
    Network(String),

    /// Payload could not be decrypted
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureError(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Other(format!("Metrics error: {}", err))
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
