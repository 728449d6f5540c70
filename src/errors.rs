use serde::Serialize;
use std::fmt;

/// Wire-facing error taxonomy. Every fallible operation that can produce a
/// client-visible result frame converts its internal `anyhow::Error` into one
/// of these variants at the boundary (session socket dispatch, hook HTTP
/// routes). Internal helpers keep using `anyhow::Result` so call sites can
/// freely use `?` and `.context(...)`.
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", content = "data")]
pub enum HydraError {
    InvalidRepository {
        path: String,
        message: String,
    },
    BranchExists {
        branch: String,
    },
    WorktreePathOccupied {
        path: String,
    },
    NotAGitRepository {
        path: String,
    },
    GitOperationFailed {
        operation: String,
        message: String,
    },
    WorktreeCleanupFailed {
        path: String,
        message: String,
    },
    BranchDeletionFailed {
        branch: String,
        message: String,
    },
    PathEscape {
        path: String,
    },
    RebaseFailed {
        message: String,
        conflicts_resolved: Option<bool>,
    },
    MergeFailed {
        message: String,
        conflicts_resolved: Option<bool>,
    },
    PtySpawnFailed {
        message: String,
    },
    AgentNotFound {
        agent_name: String,
    },
    AuthFailure,
    Timeout {
        operation: String,
    },
    SessionNotFound {
        session_id: String,
    },
}

impl HydraError {
    pub fn git(operation: impl Into<String>, error: impl ToString) -> Self {
        HydraError::GitOperationFailed {
            operation: operation.into(),
            message: error.to_string(),
        }
    }

    pub fn invalid_repository(path: impl Into<String>, message: impl ToString) -> Self {
        HydraError::InvalidRepository {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Render as an `{ error: HydraError }` payload used in server->client
    /// `*Result` frames (see `domains::hub::protocol`).
    pub fn to_frame_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for HydraError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidRepository { path, message } => {
                write!(f, "'{path}' is not a valid git repository: {message}")
            }
            Self::BranchExists { branch } => write!(f, "branch '{branch}' already exists"),
            Self::WorktreePathOccupied { path } => {
                write!(f, "worktree path already occupied: {path}")
            }
            Self::NotAGitRepository { path } => write!(f, "not a git repository: {path}"),
            Self::GitOperationFailed { operation, message } => {
                write!(f, "git operation '{operation}' failed: {message}")
            }
            Self::WorktreeCleanupFailed { path, message } => {
                write!(f, "failed to clean up worktree at '{path}': {message}")
            }
            Self::BranchDeletionFailed { branch, message } => {
                write!(f, "failed to delete branch '{branch}': {message}")
            }
            Self::PathEscape { path } => {
                write!(f, "path '{path}' escapes the worktree boundary")
            }
            Self::RebaseFailed {
                message,
                conflicts_resolved,
            } => write!(
                f,
                "rebase failed (conflicts_resolved={conflicts_resolved:?}): {message}"
            ),
            Self::MergeFailed {
                message,
                conflicts_resolved,
            } => write!(
                f,
                "merge failed (conflicts_resolved={conflicts_resolved:?}): {message}"
            ),
            Self::PtySpawnFailed { message } => write!(f, "failed to spawn agent pty: {message}"),
            Self::AgentNotFound { agent_name } => {
                write!(f, "agent executable '{agent_name}' not found on PATH")
            }
            Self::AuthFailure => write!(f, "hook secret mismatch"),
            Self::Timeout { operation } => write!(f, "operation '{operation}' timed out"),
            Self::SessionNotFound { session_id } => {
                write!(f, "session '{session_id}' not found")
            }
        }
    }
}

impl std::error::Error for HydraError {}

impl From<HydraError> for String {
    fn from(error: HydraError) -> Self {
        error.to_string()
    }
}
