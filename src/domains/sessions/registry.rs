use super::entity::Repository;
use super::manager::SessionManager;
use crate::domains::git::cli::GitCli;
use crate::domains::git::worktree;
use crate::errors::HydraError;
use crate::util::path as pathutil;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;

/// Process-wide map of normalized repo path -> `SessionManager`, plus the
/// secondary indexes needed for `(repoHash, branchName)` addressing used
/// throughout the Hub. One instance lives in `AppState`, built once at
/// startup (SPEC_FULL.md §4.1, §9 "Process-wide singletons").
#[derive(Default)]
pub struct Registry {
    managers: DashMap<String, Arc<SessionManager>>,
    hash_to_key: DashMap<String, String>,
    session_owner: DashMap<String, String>,
    product_dir: String,
}

impl Registry {
    pub fn new(product_dir: impl Into<String>) -> Self {
        Self {
            managers: DashMap::new(),
            hash_to_key: DashMap::new(),
            session_owner: DashMap::new(),
            product_dir: product_dir.into(),
        }
    }

    /// `getOrCreate(repoPath) -> Manager`. Validates the path is a git
    /// checkout (synthesizing an initial commit + `main` branch if the
    /// checkout has none yet, per SPEC_FULL.md §3) before building a new
    /// `SessionManager`.
    pub fn get_or_create(&self, repo_path: &Path) -> Result<Arc<SessionManager>, HydraError> {
        let normalized = pathutil::normalize_repo_path(repo_path);
        let key = pathutil::repo_key(&normalized);

        if let Some(existing) = self.managers.get(&key) {
            return Ok(existing.clone());
        }

        ensure_git_checkout(&normalized)?;

        let main = GitCli::new(&normalized);
        let default_base_branch = worktree::detect_default_base_branch(&main).unwrap_or_else(|_| "main".to_string());
        let base_dir = pathutil::base_dir_for_repo(&normalized, &self.product_dir);
        let repo_hash = pathutil::short_hash(&normalized);

        let repository = Repository {
            path: normalized,
            default_base_branch,
            base_dir,
        };
        let manager = Arc::new(SessionManager::new(repository));

        self.managers.insert(key.clone(), manager.clone());
        self.hash_to_key.insert(repo_hash, key);
        Ok(manager)
    }

    pub fn register_session(&self, session_id: &str, repo_path: &Path) {
        let normalized = pathutil::normalize_repo_path(repo_path);
        let key = pathutil::repo_key(&normalized);
        self.session_owner.insert(session_id.to_string(), key);
    }

    pub fn unregister(&self, session_id: &str) {
        self.session_owner.remove(session_id);
    }

    pub fn manager_by_session_id(&self, session_id: &str) -> Option<Arc<SessionManager>> {
        let key = self.session_owner.get(session_id)?;
        self.managers.get(key.value()).map(|m| m.clone())
    }

    pub fn manager_by_repo_hash(&self, repo_hash: &str) -> Option<Arc<SessionManager>> {
        let key = self.hash_to_key.get(repo_hash)?;
        self.managers.get(key.value()).map(|m| m.clone())
    }

    /// Global search across every repository's Session Manager for a
    /// session owning `branch_name`. Prefer
    /// `session_id_by_repo_hash_and_branch` when the repo is already known.
    pub fn session_id_by_branch(&self, branch_name: &str) -> Option<String> {
        self.managers
            .iter()
            .find_map(|entry| entry.value().session_id_by_branch(branch_name))
    }

    pub fn session_id_by_repo_hash_and_branch(&self, repo_hash: &str, branch_name: &str) -> Option<String> {
        self.manager_by_repo_hash(repo_hash)
            .and_then(|m| m.session_id_by_branch(branch_name))
    }

    /// Cascades `destroy` (with worktree preservation, per the "closing a
    /// repository always preserves" rule) across every live session, then
    /// evicts the repository and its session-ownership entries.
    pub async fn close_repository(&self, repo_path: &Path) -> Result<(), HydraError> {
        let normalized = pathutil::normalize_repo_path(repo_path);
        let key = pathutil::repo_key(&normalized);

        let Some(manager) = self.managers.get(&key).map(|m| m.clone()) else {
            return Ok(());
        };

        for session in manager.sessions() {
            if let Err(e) = manager.destroy(&session.session_id, true).await {
                log::warn!("failed to destroy session '{}' while closing repository: {e}", session.session_id);
            }
            self.session_owner.remove(&session.session_id);
        }

        self.managers.remove(&key);
        self.hash_to_key.retain(|_, v| v != &key);
        Ok(())
    }

    pub async fn close_all(&self) {
        let keys: Vec<String> = self.managers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some(manager) = self.managers.get(&key).map(|m| m.clone()) {
                if let Err(e) = self.close_repository(&manager.repository.path).await {
                    log::warn!("failed to close repository '{key}': {e}");
                }
            }
        }
    }
}

fn ensure_git_checkout(path: &Path) -> Result<(), HydraError> {
    if !path.is_dir() {
        return Err(HydraError::invalid_repository(
            path.display().to_string(),
            "not a directory",
        ));
    }
    if !path.join(".git").exists() {
        return Err(HydraError::NotAGitRepository {
            path: path.display().to_string(),
        });
    }

    let cli = GitCli::new(path);
    if cli.run(&["rev-parse", "HEAD"]).is_ok() {
        return Ok(());
    }

    cli.run(&["checkout", "-B", "main"])
        .map_err(|e| HydraError::git("ensure_git_checkout:checkout", e))?;
    cli.run_with_stdin(&["commit", "--allow-empty", "-F", "-"], b"Initial commit")
        .map_err(|e| HydraError::git("ensure_git_checkout:commit", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_bare_git_dir(dir: &Path) {
        let cli = GitCli::new(dir);
        cli.run(&["init", "-q", "-b", "main"]).unwrap();
        cli.run(&["config", "user.email", "test@example.com"]).unwrap();
        cli.run(&["config", "user.name", "Test"]).unwrap();
    }

    #[test]
    fn get_or_create_rejects_non_git_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Registry::new("hydra-server-test");
        let err = registry.get_or_create(tmp.path()).unwrap_err();
        assert!(matches!(err, HydraError::NotAGitRepository { .. }));
    }

    #[test]
    fn get_or_create_synthesizes_initial_commit_when_missing() {
        let tmp = tempfile::tempdir().unwrap();
        init_bare_git_dir(tmp.path());
        let registry = Registry::new("hydra-server-test");
        let manager = registry.get_or_create(tmp.path()).unwrap();
        let cli = GitCli::new(tmp.path());
        assert!(cli.run(&["rev-parse", "HEAD"]).is_ok());
        assert_eq!(manager.repository.default_base_branch, "main");
    }

    #[test]
    fn get_or_create_returns_same_manager_for_repeated_calls() {
        let tmp = tempfile::tempdir().unwrap();
        init_bare_git_dir(tmp.path());
        std::fs::write(tmp.path().join("a.txt"), "x\n").unwrap();
        let cli = GitCli::new(tmp.path());
        cli.run(&["add", "-A"]).unwrap();
        cli.run(&["commit", "-m", "init"]).unwrap();

        let registry = Registry::new("hydra-server-test");
        let first = registry.get_or_create(tmp.path()).unwrap();
        let second = registry.get_or_create(tmp.path()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn close_repository_evicts_manager_and_session_owner() {
        let tmp = tempfile::tempdir().unwrap();
        init_bare_git_dir(tmp.path());
        std::fs::write(tmp.path().join("a.txt"), "x\n").unwrap();
        let cli = GitCli::new(tmp.path());
        cli.run(&["add", "-A"]).unwrap();
        cli.run(&["commit", "-m", "init"]).unwrap();

        let registry = Registry::new("hydra-server-test");
        let manager = registry.get_or_create(tmp.path()).unwrap();
        let session = manager.create("feat", false, Some("main")).await.unwrap();
        registry.register_session(&session.session_id, tmp.path());

        registry.close_repository(tmp.path()).await.unwrap();
        assert!(registry.manager_by_session_id(&session.session_id).is_none());
    }
}
