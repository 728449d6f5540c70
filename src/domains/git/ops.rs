use super::cli::{run_blocking, GitCli};
use super::conflict::{self, ConflictResolverConfig, ResolveOutcome};
use crate::domains::sessions::localfiles;
use crate::errors::HydraError;
use anyhow::Result;

/// Run a `GitCli` call on a blocking thread from async call sites (rebase,
/// merge) without repeating the clone/collect boilerplate at every call
/// site.
async fn run_async(cli: &GitCli, args: &[&str]) -> Result<String> {
    let cli = cli.clone();
    let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    run_blocking(move || {
        let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
        cli.run(&refs)
    })
    .await?
}

/// `commit`: stage everything and commit with `message` via stdin, never via
/// an argv string (SPEC_FULL.md §9 "Shell escaping").
pub fn commit(worktree: &GitCli, message: &str) -> Result<(), HydraError> {
    worktree
        .run(&["add", "-A"])
        .map_err(|e| HydraError::git("commit:add", e))?;
    worktree
        .run_with_stdin(&["commit", "-F", "-"], message.as_bytes())
        .map_err(|e| HydraError::git("commit", e))?;
    Ok(())
}

/// `discardFile`: restore a tracked file to its `HEAD` content, or delete it
/// outright if it was never tracked.
pub fn discard_file(worktree: &GitCli, path: &str) -> Result<(), HydraError> {
    let is_tracked = worktree
        .run_check(&["ls-files", "--error-unmatch", path])
        .unwrap_or(false);

    if is_tracked {
        worktree
            .run(&["checkout", "HEAD", "--", path])
            .map_err(|e| HydraError::git("discard_file", e))?;
        return Ok(());
    }

    let absolute = worktree.working_dir().join(path);
    if absolute.is_file() {
        std::fs::remove_file(&absolute)
            .map_err(|e| HydraError::git("discard_file:remove_untracked", e))?;
    } else if absolute.is_dir() {
        std::fs::remove_dir_all(&absolute)
            .map_err(|e| HydraError::git("discard_file:remove_untracked_dir", e))?;
    }
    Ok(())
}

/// `discardChanges`: discard every uncommitted change in the worktree,
/// tracked or not.
pub fn discard_changes(worktree: &GitCli) -> Result<(), HydraError> {
    worktree
        .run(&["reset", "--hard", "HEAD"])
        .map_err(|e| HydraError::git("discard_changes:reset", e))?;
    worktree
        .run(&["clean", "-fd"])
        .map_err(|e| HydraError::git("discard_changes:clean", e))?;
    Ok(())
}

/// `resetToBase`: drop every local commit and uncommitted change by hard
/// resetting onto `base`.
pub fn reset_to_base(worktree: &GitCli, base: &str) -> Result<(), HydraError> {
    worktree
        .run(&["reset", "--hard", base])
        .map_err(|e| HydraError::git("reset_to_base", e))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseOutcome {
    Clean,
    ResolvedByAgent,
}

/// `rebase`: `git rebase <base>` in the session worktree. On conflict,
/// delegates to the agent-assisted resolver before giving up and aborting.
/// State machine per SPEC_FULL.md §4.3: `Idle -> Rebasing -> (Clean |
/// Conflicted) -> (ResolvedByAgent | Aborted)`.
pub async fn rebase(
    worktree: &GitCli,
    base: &str,
    conflict_config: &ConflictResolverConfig,
) -> Result<RebaseOutcome, HydraError> {
    match run_async(worktree, &["rebase", base]).await {
        Ok(_) => Ok(RebaseOutcome::Clean),
        Err(rebase_err) => resolve_or_abort(worktree, conflict_config, rebase_err).await,
    }
}

async fn resolve_or_abort(
    worktree: &GitCli,
    conflict_config: &ConflictResolverConfig,
    original_err: anyhow::Error,
) -> Result<RebaseOutcome, HydraError> {
    let in_progress = conflict::rebase_in_progress(worktree).unwrap_or(false);
    if !in_progress {
        return Err(HydraError::RebaseFailed {
            message: original_err.to_string(),
            conflicts_resolved: None,
        });
    }

    match conflict::resolve_conflicts(worktree, conflict_config).await {
        Ok(ResolveOutcome::CompletedByAgent) | Ok(ResolveOutcome::ContinuedRebase) => {
            Ok(RebaseOutcome::ResolvedByAgent)
        }
        Ok(ResolveOutcome::Unresolved) => {
            let _ = worktree.run(&["rebase", "--abort"]);
            Err(HydraError::RebaseFailed {
                message: "conflicts remained after agent-assisted resolution".to_string(),
                conflicts_resolved: Some(false),
            })
        }
        Err(resolver_err) => {
            let _ = worktree.run(&["rebase", "--abort"]);
            Err(HydraError::RebaseFailed {
                message: resolver_err.to_string(),
                conflicts_resolved: Some(false),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Fast-forwarded cleanly, no agent intervention needed.
    Merged,
    /// Fast-forwarded after the agent-assisted resolver cleared a rebase
    /// conflict.
    MergedAfterResolution,
}

/// Parameters for a `merge` call, grouping the two checkouts and the branch
/// identity so the 5-step sequence in `merge` reads top to bottom without a
/// long argument list.
pub struct MergeRequest<'a> {
    pub main: &'a GitCli,
    pub worktree: &'a GitCli,
    pub branch: &'a str,
    pub base: &'a str,
    pub commit_message: Option<&'a str>,
}

/// `merge`: the 5-step process from SPEC_FULL.md §4.3 —
/// 1. optionally commit any uncommitted worktree changes,
/// 2. rebase the session branch onto `base` (agent-assisted on conflict),
/// 3. fast-forward merge the branch into `base` from the main checkout,
/// 4. resync `.localfiles` from the worktree back into the main checkout,
/// 5. leave the session and its worktree alive for further iteration.
pub async fn merge(
    request: MergeRequest<'_>,
    conflict_config: &ConflictResolverConfig,
) -> Result<MergeOutcome, HydraError> {
    if let Some(message) = request.commit_message {
        let has_changes = !request
            .worktree
            .run(&["status", "--porcelain"])
            .map_err(|e| HydraError::git("merge:status", e))?
            .trim()
            .is_empty();
        if has_changes {
            commit(request.worktree, message)?;
        }
    }

    let rebase_outcome = rebase(request.worktree, request.base, conflict_config).await?;

    let original_branch = request
        .main
        .run(&["branch", "--show-current"])
        .map_err(|e| HydraError::git("merge:show-current", e))?;

    request
        .main
        .run(&["checkout", request.base])
        .map_err(|e| HydraError::git("merge:checkout_base", e))?;

    let merge_result = request
        .main
        .run(&["merge", "--ff-only", request.branch])
        .map_err(|e| HydraError::MergeFailed {
            message: e.to_string(),
            conflicts_resolved: Some(rebase_outcome == RebaseOutcome::ResolvedByAgent),
        });

    if merge_result.is_err() {
        if !original_branch.is_empty() {
            let _ = request.main.run(&["checkout", &original_branch]);
        }
        return merge_result.map(|_| unreachable!());
    }

    if !original_branch.is_empty() && original_branch != request.base {
        request
            .main
            .run(&["checkout", &original_branch])
            .map_err(|e| HydraError::git("merge:checkout_original", e))?;
    }

    if let Err(e) = localfiles::sync_into_main(request.worktree.working_dir(), request.main.working_dir()) {
        log::warn!("local-files resync after merge failed: {e}");
    }

    Ok(match rebase_outcome {
        RebaseOutcome::Clean => MergeOutcome::Merged,
        RebaseOutcome::ResolvedByAgent => MergeOutcome::MergedAfterResolution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo_with_commit(dir: &std::path::Path) -> GitCli {
        let cli = GitCli::new(dir);
        cli.run(&["init", "-q", "-b", "main"]).unwrap();
        cli.run(&["config", "user.email", "test@example.com"]).unwrap();
        cli.run(&["config", "user.name", "Test"]).unwrap();
        std::fs::write(dir.join("a.txt"), "one\n").unwrap();
        cli.run(&["add", "-A"]).unwrap();
        cli.run(&["commit", "-m", "initial"]).unwrap();
        cli
    }

    #[test]
    fn commit_stages_and_commits_with_stdin_message() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = init_repo_with_commit(tmp.path());
        std::fs::write(tmp.path().join("a.txt"), "two\n").unwrap();
        commit(&cli, "update a.txt").unwrap();
        let log = cli.run(&["log", "-1", "--format=%s"]).unwrap();
        assert_eq!(log, "update a.txt");
    }

    #[test]
    fn discard_file_restores_tracked_file() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = init_repo_with_commit(tmp.path());
        std::fs::write(tmp.path().join("a.txt"), "mutated\n").unwrap();
        discard_file(&cli, "a.txt").unwrap();
        let contents = std::fs::read_to_string(tmp.path().join("a.txt")).unwrap();
        assert_eq!(contents, "one\n");
    }

    #[test]
    fn discard_file_removes_untracked_file() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = init_repo_with_commit(tmp.path());
        std::fs::write(tmp.path().join("scratch.txt"), "temp\n").unwrap();
        discard_file(&cli, "scratch.txt").unwrap();
        assert!(!tmp.path().join("scratch.txt").exists());
    }

    #[test]
    fn discard_changes_clears_tracked_and_untracked() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = init_repo_with_commit(tmp.path());
        std::fs::write(tmp.path().join("a.txt"), "mutated\n").unwrap();
        std::fs::write(tmp.path().join("new.txt"), "new\n").unwrap();
        discard_changes(&cli).unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("a.txt")).unwrap(),
            "one\n"
        );
        assert!(!tmp.path().join("new.txt").exists());
    }

    #[test]
    fn reset_to_base_drops_local_commits() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = init_repo_with_commit(tmp.path());
        let base_sha = cli.run(&["rev-parse", "HEAD"]).unwrap();
        std::fs::write(tmp.path().join("b.txt"), "extra\n").unwrap();
        cli.run(&["add", "-A"]).unwrap();
        cli.run(&["commit", "-m", "extra commit"]).unwrap();
        reset_to_base(&cli, &base_sha).unwrap();
        let head = cli.run(&["rev-parse", "HEAD"]).unwrap();
        assert_eq!(head, base_sha);
    }

    #[tokio::test]
    async fn rebase_is_clean_when_already_up_to_date() {
        let tmp = tempfile::tempdir().unwrap();
        let main = init_repo_with_commit(tmp.path());
        let wt_path = tmp.path().join("wt");
        super::super::worktree::add_worktree(&main, &wt_path, "feat", "main").unwrap();
        let worktree = GitCli::new(&wt_path);

        let config = ConflictResolverConfig {
            agent_binary: std::path::PathBuf::from("does-not-matter"),
            one_shot_args: vec![],
        };
        let outcome = rebase(&worktree, "main", &config).await.unwrap();
        assert_eq!(outcome, RebaseOutcome::Clean);
    }

    #[tokio::test]
    async fn merge_fast_forwards_a_clean_session_branch() {
        let tmp = tempfile::tempdir().unwrap();
        let main = init_repo_with_commit(tmp.path());
        let wt_path = tmp.path().join("wt");
        super::super::worktree::add_worktree(&main, &wt_path, "feat", "main").unwrap();
        let worktree = GitCli::new(&wt_path);
        std::fs::write(wt_path.join("feature.txt"), "new feature\n").unwrap();
        worktree.run(&["add", "-A"]).unwrap();
        worktree.run(&["commit", "-m", "add feature"]).unwrap();

        let config = ConflictResolverConfig {
            agent_binary: std::path::PathBuf::from("does-not-matter"),
            one_shot_args: vec![],
        };
        let request = MergeRequest {
            main: &main,
            worktree: &worktree,
            branch: "feat",
            base: "main",
            commit_message: None,
        };
        let outcome = merge(request, &config).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);
        assert!(tmp.path().join("feature.txt").exists());
    }
}
