use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One git repository known to the Registry: the main working copy plus the
/// resolved `baseDir` under which every session's worktree lives.
#[derive(Debug, Clone)]
pub struct Repository {
    /// Normalized absolute path to the main checkout (the Registry's map key
    /// input, see `util::path::normalize_repo_path`).
    pub path: PathBuf,
    /// Default base branch for sessions created without an explicit base.
    pub default_base_branch: String,
    /// `<user-home>/<product-dir>/<basename>-<hash>`.
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileStatus {
    Modified,
    Added,
    Deleted,
    Untracked,
    Unchanged,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: String,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_directory: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    pub hash: String,
    pub display_hash: String,
    pub unix_timestamp: i64,
    pub subject: String,
    pub full_message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GitStatusSnapshot {
    pub has_uncommitted_changes: bool,
    pub has_unmerged_commits: bool,
    pub is_behind_base: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    pub original: String,
    pub modified: String,
}

/// One isolated workspace: a branch, a worktree, a spawned agent, and at
/// most one live client socket (the socket is *not* stored here — it is
/// looked up by `(repo_hash, branch_name)` from the Hub's connection table,
/// per the "many-to-one ownership with cycles avoided" design note).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub repo_hash: String,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    pub base_branch_name: String,
    pub base_branch_commit_id: String,
}

impl Session {
    pub fn addressing_key(&self) -> (String, String) {
        (self.repo_hash.clone(), self.branch_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addressing_key_pairs_repo_hash_and_branch() {
        let session = Session {
            session_id: "s1".into(),
            repo_hash: "abcd1234".into(),
            branch_name: "feat".into(),
            worktree_path: PathBuf::from("/tmp/wt"),
            base_branch_name: "main".into(),
            base_branch_commit_id: "deadbeef".into(),
        };
        assert_eq!(
            session.addressing_key(),
            ("abcd1234".to_string(), "feat".to_string())
        );
    }
}
