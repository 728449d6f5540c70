use super::entity::{CommitRecord, FileDiff, FileRecord, GitStatusSnapshot, Repository, Session};
use super::localfiles;
use crate::domains::git::cli::GitCli;
use crate::domains::git::conflict::ConflictResolverConfig;
use crate::domains::git::{ops, status, worktree};
use crate::errors::HydraError;
use crate::util::path as pathutil;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Per-repository engine: owns one main checkout's worktrees and the
/// branches named after them (the "Ownership" rule in SPEC_FULL.md §3).
/// Built and held by the Registry (C1), one instance per normalized repo
/// path.
pub struct SessionManager {
    pub repository: Repository,
    sessions_by_id: DashMap<String, Session>,
    session_by_branch: DashMap<String, String>,
    main_lock: Mutex<()>,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(repository: Repository) -> Self {
        Self {
            repository,
            sessions_by_id: DashMap::new(),
            session_by_branch: DashMap::new(),
            main_lock: Mutex::new(()),
            session_locks: DashMap::new(),
        }
    }

    fn main_cli(&self) -> GitCli {
        GitCli::new(&self.repository.path)
    }

    fn worktree_cli(&self, session: &Session) -> GitCli {
        GitCli::new(&session.worktree_path)
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn session(&self, session_id: &str) -> Result<Session, HydraError> {
        self.sessions_by_id
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| HydraError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions_by_id.iter().map(|e| e.value().clone()).collect()
    }

    pub fn session_id_by_branch(&self, branch_name: &str) -> Option<String> {
        self.session_by_branch.get(branch_name).map(|v| v.clone())
    }

    /// Session ids whose `baseBranchName` or `branchName` equals
    /// `branch_name`, used by the Hub's broadcast rule when that branch's
    /// tip moves.
    pub fn session_ids_affected_by_branch_move(&self, branch_name: &str) -> Vec<String> {
        self.sessions_by_id
            .iter()
            .filter(|e| e.value().base_branch_name == branch_name || e.value().branch_name == branch_name)
            .map(|e| e.key().clone())
            .collect()
    }

    /// `create(sessionId, branchName, adoptExisting, baseBranchName?)`.
    pub async fn create(
        &self,
        branch_name: &str,
        adopt_existing: bool,
        base_branch: Option<&str>,
    ) -> Result<Session, HydraError> {
        let _guard = self.main_lock.lock().await;
        let main = self.main_cli();
        let worktree_path = self.repository.base_dir.join(branch_name);

        let session = if adopt_existing {
            self.adopt(&main, branch_name, &worktree_path, base_branch)?
        } else {
            self.create_new(&main, branch_name, &worktree_path, base_branch)?
        };

        self.sessions_by_id.insert(session.session_id.clone(), session.clone());
        self.session_by_branch
            .insert(session.branch_name.clone(), session.session_id.clone());
        Ok(session)
    }

    fn create_new(
        &self,
        main: &GitCli,
        branch_name: &str,
        worktree_path: &Path,
        base_branch: Option<&str>,
    ) -> Result<Session, HydraError> {
        if worktree::branch_exists(main, branch_name).unwrap_or(false) {
            return Err(HydraError::BranchExists {
                branch: branch_name.to_string(),
            });
        }
        if worktree_path.exists() {
            return Err(HydraError::WorktreePathOccupied {
                path: worktree_path.display().to_string(),
            });
        }

        let base = match base_branch {
            Some(b) => b.to_string(),
            None => worktree::detect_default_base_branch(main)
                .map_err(|e| HydraError::git("create:detect_base", e))?,
        };

        worktree::add_worktree(main, worktree_path, branch_name, &base)
            .map_err(|e| HydraError::git("create:add_worktree", e))?;

        let worktree_cli = GitCli::new(worktree_path);
        worktree::set_base_branch_config(&worktree_cli, branch_name, &base)
            .map_err(|e| HydraError::git("create:set_base_config", e))?;

        let base_commit = worktree::current_commit(main, &base)
            .map_err(|e| HydraError::git("create:base_commit", e))?;

        if let Err(e) = localfiles::sync_into_worktree(&self.repository.path, worktree_path) {
            log::warn!("local-files sync into new worktree failed: {e}");
        }
        if let Err(e) = localfiles::run_autoinit(worktree_path) {
            log::warn!("autoinit script failed for worktree '{}': {e}", worktree_path.display());
        }

        Ok(Session {
            session_id: Uuid::new_v4().to_string(),
            repo_hash: pathutil::short_hash(&self.repository.path),
            branch_name: branch_name.to_string(),
            worktree_path: worktree_path.to_path_buf(),
            base_branch_name: base,
            base_branch_commit_id: base_commit,
        })
    }

    fn adopt(
        &self,
        main: &GitCli,
        branch_name: &str,
        worktree_path: &Path,
        base_branch: Option<&str>,
    ) -> Result<Session, HydraError> {
        if !worktree::branch_exists(main, branch_name).unwrap_or(false) {
            return Err(HydraError::git(
                "adopt:branch_missing",
                format!("branch '{branch_name}' does not exist"),
            ));
        }
        if !worktree_path.is_dir() {
            return Err(HydraError::git(
                "adopt:worktree_missing",
                format!("worktree path '{}' does not exist", worktree_path.display()),
            ));
        }

        let worktree_cli = GitCli::new(worktree_path);
        let base = match base_branch {
            Some(b) => b.to_string(),
            None => match worktree::get_base_branch_config(&worktree_cli, branch_name) {
                Some(stored) => stored,
                None => {
                    let detected = worktree::detect_default_base_branch(main)
                        .map_err(|e| HydraError::git("adopt:detect_base", e))?;
                    log::info!(
                        "adopting '{branch_name}' with no stored base-branch config; defaulting to '{detected}'"
                    );
                    worktree::set_base_branch_config(&worktree_cli, branch_name, &detected)
                        .map_err(|e| HydraError::git("adopt:set_base_config", e))?;
                    detected
                }
            },
        };

        let base_commit = worktree::current_commit(main, &base)
            .map_err(|e| HydraError::git("adopt:base_commit", e))?;

        Ok(Session {
            session_id: Uuid::new_v4().to_string(),
            repo_hash: pathutil::short_hash(&self.repository.path),
            branch_name: branch_name.to_string(),
            worktree_path: worktree_path.to_path_buf(),
            base_branch_name: base,
            base_branch_commit_id: base_commit,
        })
    }

    /// `destroy(sessionId, preserveWorktree)`. With `preserve_worktree`, the
    /// in-memory Session record is dropped but the worktree directory and
    /// branch are left on disk for a later `create(..., adoptExisting:
    /// true, ...)`.
    pub async fn destroy(&self, session_id: &str, preserve_worktree: bool) -> Result<(), HydraError> {
        let session = self.session(session_id)?;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        if !preserve_worktree {
            let main = self.main_cli();
            worktree::remove_worktree(&main, &session.worktree_path).map_err(|e| {
                HydraError::WorktreeCleanupFailed {
                    path: session.worktree_path.display().to_string(),
                    message: e.to_string(),
                }
            })?;
            worktree::delete_branch(&main, &session.branch_name).map_err(|e| {
                HydraError::BranchDeletionFailed {
                    branch: session.branch_name.clone(),
                    message: e.to_string(),
                }
            })?;
        }

        self.sessions_by_id.remove(session_id);
        self.session_by_branch.remove(&session.branch_name);
        self.session_locks.remove(session_id);
        Ok(())
    }

    pub fn get_git_status(&self, session_id: &str) -> Result<GitStatusSnapshot, HydraError> {
        let session = self.session(session_id)?;
        let worktree = self.worktree_cli(&session);
        status::git_status(&worktree, &session.base_branch_name).map_err(|e| HydraError::git("get_git_status", e))
    }

    pub fn get_commit_log(&self, session_id: &str) -> Result<Vec<CommitRecord>, HydraError> {
        let session = self.session(session_id)?;
        let worktree = self.worktree_cli(&session);
        status::commit_log(&worktree, &session.base_branch_name, &session.branch_name)
            .map_err(|e| HydraError::git("get_commit_log", e))
    }

    pub fn get_file_list(&self, session_id: &str, commit_id: Option<&str>) -> Result<Vec<FileRecord>, HydraError> {
        let session = self.session(session_id)?;
        let worktree = self.worktree_cli(&session);
        match commit_id {
            Some(commit) => status::commit_file_list(&worktree, commit).map_err(|e| HydraError::git("get_file_list", e)),
            None => status::working_tree_file_list(&worktree).map_err(|e| HydraError::git("get_file_list", e)),
        }
    }

    pub fn get_file_diff(
        &self,
        session_id: &str,
        path: &str,
        commit_id: Option<&str>,
    ) -> Result<FileDiff, HydraError> {
        let session = self.session(session_id)?;
        let worktree = self.worktree_cli(&session);
        let (original, modified) = match commit_id {
            Some(commit) => status::commit_diff(&worktree, path, commit).map_err(|e| HydraError::git("get_file_diff", e))?,
            None => status::working_tree_diff(&worktree, path).map_err(|e| HydraError::git("get_file_diff", e))?,
        };
        Ok(FileDiff { original, modified })
    }

    fn guarded_path(&self, session: &Session, path: &str) -> Result<PathBuf, HydraError> {
        pathutil::resolve_within_worktree(&session.worktree_path, Path::new(path))
            .ok_or_else(|| HydraError::PathEscape { path: path.to_string() })
    }

    pub fn save_file(&self, session_id: &str, path: &str, contents: &str) -> Result<(), HydraError> {
        let session = self.session(session_id)?;
        let absolute = self.guarded_path(&session, path)?;
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HydraError::git("save_file:mkdir", e))?;
        }
        std::fs::write(&absolute, contents).map_err(|e| HydraError::git("save_file:write", e))
    }

    pub fn discard_file(&self, session_id: &str, path: &str) -> Result<(), HydraError> {
        let session = self.session(session_id)?;
        self.guarded_path(&session, path)?;
        let worktree = self.worktree_cli(&session);
        ops::discard_file(&worktree, path)
    }

    pub fn create_file_or_directory(&self, session_id: &str, path: &str, is_directory: bool) -> Result<(), HydraError> {
        let session = self.session(session_id)?;
        let absolute = self.guarded_path(&session, path)?;
        if is_directory {
            std::fs::create_dir_all(&absolute).map_err(|e| HydraError::git("create_file_or_directory:mkdir", e))
        } else {
            if let Some(parent) = absolute.parent() {
                std::fs::create_dir_all(parent).map_err(|e| HydraError::git("create_file_or_directory:mkdir_parent", e))?;
            }
            std::fs::write(&absolute, "").map_err(|e| HydraError::git("create_file_or_directory:write", e))
        }
    }

    pub fn delete_file_or_directory(&self, session_id: &str, path: &str) -> Result<(), HydraError> {
        let session = self.session(session_id)?;
        let absolute = self.guarded_path(&session, path)?;
        if absolute.is_dir() {
            std::fs::remove_dir_all(&absolute).map_err(|e| HydraError::git("delete_file_or_directory:rmdir", e))
        } else if absolute.exists() {
            std::fs::remove_file(&absolute).map_err(|e| HydraError::git("delete_file_or_directory:rm", e))
        } else {
            Ok(())
        }
    }

    pub fn discard_changes(&self, session_id: &str) -> Result<(), HydraError> {
        let session = self.session(session_id)?;
        let worktree = self.worktree_cli(&session);
        ops::discard_changes(&worktree)
    }

    pub fn reset_to_base(&self, session_id: &str) -> Result<(), HydraError> {
        let session = self.session(session_id)?;
        let worktree = self.worktree_cli(&session);
        ops::reset_to_base(&worktree, &session.base_branch_name)
    }

    pub fn commit(&self, session_id: &str, message: &str) -> Result<(), HydraError> {
        let session = self.session(session_id)?;
        let worktree = self.worktree_cli(&session);
        ops::commit(&worktree, message)
    }

    /// Re-resolve the tip of a session's base branch; returns `true` (and
    /// updates the stored snapshot) if it moved since the last check.
    pub fn check_and_update_base_branch(&self, session_id: &str) -> Result<bool, HydraError> {
        let main = self.main_cli();
        let mut entry = self
            .sessions_by_id
            .get_mut(session_id)
            .ok_or_else(|| HydraError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let current_tip = worktree::current_commit(&main, &entry.base_branch_name)
            .map_err(|e| HydraError::git("check_and_update_base_branch", e))?;
        let moved = current_tip != entry.base_branch_commit_id;
        if moved {
            entry.base_branch_commit_id = current_tip;
        }
        Ok(moved)
    }

    pub fn list_branches(&self) -> Result<Vec<String>, HydraError> {
        let main = self.main_cli();
        worktree::list_branches(&main).map_err(|e| HydraError::git("list_branches", e))
    }

    pub fn git_fetch(&self) -> Result<(), HydraError> {
        let main = self.main_cli();
        worktree::fetch_all(&main).map_err(|e| HydraError::git("git_fetch", e))
    }

    /// `git worktree add`-created directories under `baseDir` whose branch
    /// has no live in-memory Session — candidates for `discoverWorktrees`.
    pub fn discover_adoptable_worktrees(&self) -> Result<Vec<(String, PathBuf)>, HydraError> {
        let main = self.main_cli();
        let raw = main
            .run(&["worktree", "list", "--porcelain"])
            .map_err(|e| HydraError::git("discover_adoptable_worktrees", e))?;

        let mut found = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        for line in raw.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(p));
            } else if let Some(branch_ref) = line.strip_prefix("branch refs/heads/") {
                if let Some(path) = current_path.take() {
                    if path.starts_with(&self.repository.base_dir)
                        && self.session_id_by_branch(branch_ref).is_none()
                    {
                        found.push((branch_ref.to_string(), path));
                    }
                }
            }
        }
        Ok(found)
    }

    pub async fn rebase(
        &self,
        session_id: &str,
        conflict_config: &ConflictResolverConfig,
    ) -> Result<ops::RebaseOutcome, HydraError> {
        let session = self.session(session_id)?;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        let worktree = self.worktree_cli(&session);
        let outcome = ops::rebase(&worktree, &session.base_branch_name, conflict_config).await?;
        if let Err(e) = localfiles::sync_into_worktree(&self.repository.path, &session.worktree_path) {
            log::warn!("local-files resync after rebase failed: {e}");
        }
        Ok(outcome)
    }

    pub async fn merge(
        &self,
        session_id: &str,
        conflict_config: &ConflictResolverConfig,
        commit_message: Option<&str>,
    ) -> Result<ops::MergeOutcome, HydraError> {
        let session = self.session(session_id)?;
        let session_lock = self.session_lock(session_id);
        let _session_guard = session_lock.lock().await;
        let _main_guard = self.main_lock.lock().await;

        let main = self.main_cli();
        let worktree = self.worktree_cli(&session);
        let request = ops::MergeRequest {
            main: &main,
            worktree: &worktree,
            branch: &session.branch_name,
            base: &session.base_branch_name,
            commit_message,
        };
        ops::merge(request, conflict_config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) -> Repository {
        let cli = GitCli::new(dir);
        cli.run(&["init", "-q", "-b", "main"]).unwrap();
        cli.run(&["config", "user.email", "test@example.com"]).unwrap();
        cli.run(&["config", "user.name", "Test"]).unwrap();
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        cli.run(&["add", "-A"]).unwrap();
        cli.run(&["commit", "-m", "initial"]).unwrap();

        Repository {
            path: dir.to_path_buf(),
            default_base_branch: "main".to_string(),
            base_dir: dir.join(".sessions"),
        }
    }

    #[tokio::test]
    async fn create_then_destroy_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        let manager = SessionManager::new(repo);

        let session = manager.create("feat", false, Some("main")).await.unwrap();
        assert!(session.worktree_path.is_dir());
        assert_eq!(session.base_branch_name, "main");

        manager.destroy(&session.session_id, false).await.unwrap();
        assert!(!session.worktree_path.exists());
        assert!(manager.session(&session.session_id).is_err());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_branch() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        let manager = SessionManager::new(repo);
        manager.create("feat", false, Some("main")).await.unwrap();
        let err = manager.create("feat", false, Some("main")).await.unwrap_err();
        assert!(matches!(err, HydraError::BranchExists { .. }));
    }

    #[tokio::test]
    async fn save_and_read_back_file_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        let manager = SessionManager::new(repo);
        let session = manager.create("feat", false, Some("main")).await.unwrap();

        manager.save_file(&session.session_id, "notes.txt", "hello world").unwrap();
        let diff = manager.get_file_diff(&session.session_id, "notes.txt", None).unwrap();
        assert_eq!(diff.modified, "hello world");
        assert_eq!(diff.original, "");
    }

    #[tokio::test]
    async fn path_escape_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        let manager = SessionManager::new(repo);
        let session = manager.create("feat", false, Some("main")).await.unwrap();

        let err = manager
            .save_file(&session.session_id, "../../etc/passwd", "pwned")
            .unwrap_err();
        assert!(matches!(err, HydraError::PathEscape { .. }));
    }

    #[tokio::test]
    async fn destroy_with_preserve_worktree_keeps_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        let manager = SessionManager::new(repo);
        let session = manager.create("feat", false, Some("main")).await.unwrap();

        manager.destroy(&session.session_id, true).await.unwrap();
        assert!(session.worktree_path.is_dir());
        assert!(manager.session(&session.session_id).is_err());
    }

    #[tokio::test]
    async fn commit_records_subject_and_clears_uncommitted_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        let manager = SessionManager::new(repo);
        let session = manager.create("feat", false, Some("main")).await.unwrap();

        std::fs::write(session.worktree_path.join("foo.txt"), "hi").unwrap();
        manager.commit(&session.session_id, "add foo").unwrap();

        let log = manager.get_commit_log(&session.session_id).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].subject, "add foo");

        let status = manager.get_git_status(&session.session_id).unwrap();
        assert!(!status.has_uncommitted_changes);
    }

    #[tokio::test]
    async fn merge_clears_unmerged_commits_on_base() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        let manager = SessionManager::new(repo);
        let session = manager.create("feat", false, Some("main")).await.unwrap();

        std::fs::write(session.worktree_path.join("feature.txt"), "new\n").unwrap();

        let config = ConflictResolverConfig {
            agent_binary: std::path::PathBuf::from("does-not-matter"),
            one_shot_args: vec![],
        };
        manager
            .merge(&session.session_id, &config, Some("add feature"))
            .await
            .unwrap();

        let status = manager.get_git_status(&session.session_id).unwrap();
        assert!(!status.has_unmerged_commits);
    }
}
