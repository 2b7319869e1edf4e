// Factory error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FactoryError {
    #[error("Unknown run: {0}")]
    UnknownRun(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Path outside project root: {0}")]
    PathOutsideRoot(String),

    #[error("Proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Proposal conflict: {0}")]
    ProposalConflict(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FactoryError>;

/// Failure kinds of version-control operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GitError {
    #[error("{0}")]
    AuthFailed(String),

    #[error("{0}")]
    NoRemote(String),

    #[error("Path outside repository: {0}")]
    PathOutsideRoot(String),

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("git {0} timed out")]
    Timeout(String),

    #[error("git operation cancelled")]
    Cancelled,

    #[error("git could not be launched: {0}")]
    Io(String),
}
