//! Error types for account synchronization.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for syncer operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Failure of a single external command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The program could not be started at all.
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran and exited unsuccessfully.
    #[error("{program} failed (exit {status}): {stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },
}

/// The sub-step of a mutation that an external command was carrying out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    CreateUser { user: String },
    AddMembership { user: String, group: String },
    DeleteUser { user: String },
    ModifyUser { user: String, attribute: &'static str },
    CreateGroup { group: String },
    DeleteGroup { group: String },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::CreateUser { user } => write!(f, "creating user '{user}'"),
            Step::AddMembership { user, group } => {
                write!(f, "adding user '{user}' to group '{group}'")
            }
            Step::DeleteUser { user } => write!(f, "deleting user '{user}'"),
            Step::ModifyUser { user, attribute } => {
                write!(f, "setting {attribute} of user '{user}'")
            }
            Step::CreateGroup { group } => write!(f, "creating group '{group}'"),
            Step::DeleteGroup { group } => write!(f, "deleting group '{group}'"),
        }
    }
}

/// Errors returned by [`crate::Syncer`] operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Create requested for a user name that already resolves.
    #[error("user exists: {0}")]
    UserExists(String),

    /// Create requested for a group name that already resolves.
    #[error("group exists: {0}")]
    GroupExists(String),

    /// Operation requires a user that does not resolve.
    #[error("user does not exist: {0}")]
    UserNotFound(String),

    /// Delete requested for a group that does not resolve.
    #[error("group does not exist: {0}")]
    GroupNotFound(String),

    /// An account tool failed. Earlier steps of the same operation may have applied.
    #[error("{step}: {source}")]
    Command {
        step: Step,
        #[source]
        source: CommandError,
    },

    /// The local account database could not be parsed.
    #[error("corrupt account database {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// Reading the local account database failed.
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing the authorized keys file failed.
    #[error("writing public keys for '{user}': {source}")]
    PubKeys {
        user: String,
        #[source]
        source: std::io::Error,
    },

    /// Input rejected before anything was looked up or executed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The caller cancelled before any mutation started.
    #[error("operation cancelled")]
    Cancelled,

    /// The detached mutation task panicked.
    #[error("mutation task aborted: {0}")]
    Aborted(String),
}

/// Coarse classification of [`SyncError`] for callers deciding how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The entity already exists; usually means already converged.
    Conflict,
    /// The entity a mutation needs does not exist.
    Missing,
    /// A command or filesystem mutation did not apply.
    Execution,
    /// The local account database is malformed. Not retryable.
    Corrupt,
    InvalidInput,
    Cancelled,
    Io,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::UserExists(_) | SyncError::GroupExists(_) => ErrorKind::Conflict,
            SyncError::UserNotFound(_) | SyncError::GroupNotFound(_) => ErrorKind::Missing,
            SyncError::Command { .. } | SyncError::PubKeys { .. } | SyncError::Aborted(_) => {
                ErrorKind::Execution
            }
            SyncError::Corrupt { .. } => ErrorKind::Corrupt,
            SyncError::Read { .. } => ErrorKind::Io,
            SyncError::InvalidInput(_) => ErrorKind::InvalidInput,
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// The failed step, if this error came from an account tool.
    pub fn step(&self) -> Option<&Step> {
        match self {
            SyncError::Command { step, .. } => Some(step),
            _ => None,
        }
    }
}
