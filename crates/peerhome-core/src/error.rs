//! Error types for Peerhome

use thiserror::Error;

/// Main error type for Peerhome operations
#[derive(Error, Debug)]
pub enum HomeError {
    /// A component was used before its async initialization completed
    #[error("Not initialized: {0}")]
    Uninitialized(String),

    /// Endpoint string does not contain the expected delimiters
    #[error("Malformed endpoint: {0}")]
    MalformedEndpoint(String),

    /// An object required to set up a relationship is not in the store
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// Invalid invite token format or data
    #[error("Invalid invite: {0}")]
    InvalidInvite(String),

    /// Linkup server URL is not an absolute http(s) URL
    #[error("Invalid linkup server: {0}")]
    InvalidLinkupServer(String),

    /// A replicated element declares an author other than the set owner
    #[error("Author mismatch: {0}")]
    AuthorMismatch(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// The mesh collaborator rejected a request
    #[error("Mesh error: {0}")]
    Mesh(String),

    /// A replica id was requested with a different element type than it holds
    #[error("Replica type mismatch: {0}")]
    ReplicaTypeMismatch(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using HomeError
pub type HomeResult<T> = Result<T, HomeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HomeError::MalformedEndpoint("wss://x/nothing".to_string());
        assert_eq!(format!("{}", err), "Malformed endpoint: wss://x/nothing");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: HomeError = io_err.into();
        assert!(matches!(err, HomeError::Io(_)));
    }
}
