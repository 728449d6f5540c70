use crate::domains::sessions::entity::{CommitRecord, FileDiff, FileRecord, GitStatusSnapshot};
use crate::errors::HydraError;
use serde::{Deserialize, Serialize};

/// Session-socket frames sent by the client. One request type may be
/// outstanding per socket at a time (SPEC_FULL.md §4.5); the server always
/// answers with the matching `ServerFrame` variant.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    Create {
        repo_path: String,
        branch_name: String,
        #[serde(default)]
        adopt_existing: bool,
        base_branch: Option<String>,
    },
    /// Inbound keystrokes/paste bytes. UTF-8 lossy, matching the "JSON text
    /// frames" wire contract (SPEC_FULL.md §6.5) rather than a binary
    /// encoding the corpus has no precedent for.
    Data {
        bytes: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Destroy {
        #[serde(default)]
        preserve_worktree: bool,
    },
    GetGitStatus,
    GetFileDiff {
        file_path: String,
        commit_id: Option<String>,
    },
    SaveFile {
        path: String,
        contents: String,
    },
    DiscardFile {
        path: String,
    },
    CreateFile {
        path: String,
        #[serde(default)]
        is_directory: bool,
    },
    DeleteFile {
        path: String,
    },
    RequestFileList {
        commit_id: Option<String>,
    },
    Commit {
        message: String,
    },
    DiscardChanges,
    ResetToBase,
    Rebase,
    Merge {
        commit_message: Option<String>,
    },
    Restart,
    ExecuteWaituser {
        commandline: String,
    },
    ValidateRepository {
        repo_path: String,
    },
    DiscoverWorktrees {
        repo_path: String,
    },
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl OpResult {
    pub fn ok() -> Self {
        Self { success: true, error: None }
    }

    pub fn from_result<T>(result: &Result<T, HydraError>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self {
                success: false,
                error: Some(e.to_frame_value()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeDescriptor {
    pub branch_name: String,
    pub worktree_path: String,
}

/// Session-socket frames sent by the server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    Created { session_id: String },
    Data { bytes: String },
    State { state: &'static str },
    GitBranchStatus {
        status: GitStatusSnapshot,
        #[serde(skip_serializing_if = "Option::is_none")]
        commit_log: Option<Vec<CommitRecord>>,
    },
    FileList { files: Vec<FileRecord> },
    FileDiff { diff: FileDiff },
    CommitResult { result: OpResult },
    DiscardResult { result: OpResult },
    ResetResult { result: OpResult },
    RebaseResult {
        result: OpResult,
        conflicts_resolved: Option<bool>,
    },
    MergeResult {
        result: OpResult,
        conflicts_resolved: Option<bool>,
    },
    DeleteFileResult { result: OpResult },
    CreateFileResult { result: OpResult },
    Restarted,
    CloseTab,
    Exit { code: Option<i32> },
    Waituser { text: String, commandline: String },
    WaituserError { output: String },
    Error { error: serde_json::Value },
    WorktreesDiscovered { worktrees: Vec<WorktreeDescriptor> },
    RepositoryValidated { valid: bool, error: Option<String> },
}

impl ServerFrame {
    pub fn error(err: &HydraError) -> Self {
        ServerFrame::Error { error: err.to_frame_value() }
    }
}

/// Management-socket frames, addressed by `(repoHash, branchName)` rather
/// than carried over a session-bound connection (SPEC_FULL.md §4.5).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ManagementFrame {
    CloseTab,
    DiscardAndClose,
    KeepBranchAndClose,
    Waituser { text: String, commandline: String },
    Openurl { url: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_create_parses_with_defaults() {
        let raw = r#"{"type":"create","repoPath":"/tmp/repo","branchName":"feat"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::Create { adopt_existing, base_branch, .. } => {
                assert!(!adopt_existing);
                assert!(base_branch.is_none());
            }
            _ => panic!("expected Create"),
        }
    }

    #[test]
    fn client_frame_commit_parses_message() {
        let raw = r#"{"type":"commit","message":"add foo"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::Commit { message } => assert_eq!(message, "add foo"),
            _ => panic!("expected Commit"),
        }
    }

    #[test]
    fn client_frame_merge_parses_optional_commit_message() {
        let raw = r#"{"type":"merge"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(frame, ClientFrame::Merge { commit_message: None }));
    }

    #[test]
    fn server_frame_serializes_tagged_shape() {
        let frame = ServerFrame::Created { session_id: "abc".to_string() };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "created");
        assert_eq!(value["sessionId"], "abc");
    }

    #[test]
    fn op_result_carries_typed_error() {
        let err = HydraError::SessionNotFound { session_id: "missing".to_string() };
        let result: Result<(), HydraError> = Err(err);
        let op = OpResult::from_result(&result);
        assert!(!op.success);
        assert_eq!(op.error.unwrap()["type"], "SessionNotFound");
    }
}
