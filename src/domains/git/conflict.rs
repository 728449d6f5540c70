use super::cli::GitCli;
use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Hard kill timer for the agent-assisted conflict resolver, per
/// SPEC_FULL.md §4.3.
pub const RESOLVER_TIMEOUT: Duration = Duration::from_secs(120);

const RESOLVER_PROMPT: &str = "\
A git rebase in this worktree has stopped with merge conflicts. Read the \
commit history and diffs on both sides, resolve every conflicted file \
in place (remove conflict markers, keep the intended combined result), \
stage the resolutions, and either finish the rebase yourself (`git rebase \
--continue`) or simply exit once every file is conflict-free and staged. \
Do not touch any branch, session, or worktree other than this one.";

/// Porcelain status codes that indicate an unresolved merge conflict:
/// `UU` (both modified), `AA` (both added), `DD` (both deleted).
fn is_conflict_code(code: &str) -> bool {
    matches!(code, "UU" | "AA" | "DD")
}

pub fn conflicted_paths(worktree: &GitCli) -> Result<Vec<String>> {
    let porcelain = worktree.run(&["status", "--porcelain"])?;
    Ok(porcelain
        .lines()
        .filter_map(|line| {
            if line.len() < 4 {
                return None;
            }
            let code = &line[..2];
            is_conflict_code(code).then(|| line[3..].trim().to_string())
        })
        .collect())
}

fn resolve_git_dir(worktree: &GitCli) -> Result<PathBuf> {
    let raw = worktree.run(&["rev-parse", "--git-dir"])?;
    let candidate = PathBuf::from(raw.trim());
    if candidate.is_absolute() {
        Ok(candidate)
    } else {
        Ok(worktree.working_dir().join(candidate))
    }
}

/// Whether `.git/rebase-merge` or `.git/rebase-apply` marker directories
/// still exist, i.e. git itself considers a rebase in progress.
pub fn rebase_in_progress(worktree: &GitCli) -> Result<bool> {
    let git_dir = resolve_git_dir(worktree)?;
    Ok(git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists())
}

#[derive(Debug, Clone)]
pub struct ConflictResolverConfig {
    pub agent_binary: PathBuf,
    pub one_shot_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The agent finished the rebase itself (no rebase-in-progress markers
    /// remained); we accept its work directly.
    CompletedByAgent,
    /// The agent staged resolutions but left the rebase machinery running;
    /// we ran `git rebase --continue` on its behalf.
    ContinuedRebase,
    /// Conflicts remain after the agent exited (or it timed out); caller
    /// must abort the rebase.
    Unresolved,
}

/// Spawn the agent CLI in non-interactive one-shot mode inside the worktree,
/// bounded by `RESOLVER_TIMEOUT`, to resolve an in-progress rebase conflict.
/// Implements SPEC_FULL.md §4.3 "Conflict-resolution subroutine".
pub async fn resolve_conflicts(
    worktree: &GitCli,
    config: &ConflictResolverConfig,
) -> Result<ResolveOutcome> {
    if conflicted_paths(worktree)?.is_empty() {
        return Ok(ResolveOutcome::CompletedByAgent);
    }

    let mut command = Command::new(&config.agent_binary);
    command
        .args(&config.one_shot_args)
        .arg(RESOLVER_PROMPT)
        .current_dir(worktree.working_dir())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| anyhow!("failed to spawn conflict resolver agent: {e}"))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    if let Some(stdout) = stdout {
        tokio::spawn(stream_to_log(stdout, "resolver stdout"));
    }
    if let Some(stderr) = stderr {
        tokio::spawn(stream_to_log(stderr, "resolver stderr"));
    }

    let wait_result = tokio::time::timeout(RESOLVER_TIMEOUT, child.wait()).await;
    match wait_result {
        Err(_) => {
            log::warn!("conflict resolver exceeded {RESOLVER_TIMEOUT:?}, killing it");
            let _ = child.kill().await;
            return Ok(ResolveOutcome::Unresolved);
        }
        Ok(Err(e)) => {
            return Err(anyhow!("failed waiting for conflict resolver: {e}"));
        }
        Ok(Ok(status)) => {
            log::info!("conflict resolver exited with {status}");
        }
    }

    if !rebase_in_progress(worktree)? {
        return Ok(ResolveOutcome::CompletedByAgent);
    }

    if conflicted_paths(worktree)?.is_empty() {
        worktree.run(&["rebase", "--continue"])?;
        return Ok(ResolveOutcome::ContinuedRebase);
    }

    Ok(ResolveOutcome::Unresolved)
}

async fn stream_to_log(pipe: impl tokio::io::AsyncRead + Unpin, label: &'static str) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => log::info!("[{label}] {line}"),
            Ok(None) => break,
            Err(e) => {
                log::warn!("[{label}] read error: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &std::path::Path) -> GitCli {
        let cli = GitCli::new(dir);
        cli.run(&["init", "-q", "-b", "main"]).unwrap();
        cli.run(&["config", "user.email", "test@example.com"]).unwrap();
        cli.run(&["config", "user.name", "Test"]).unwrap();
        cli
    }

    #[test]
    fn conflicted_paths_parses_uu_aa_dd_codes() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = init_repo(tmp.path());
        // We can't easily fabricate a real conflict without two branches
        // diverging; just check empty-tree behavior here (no conflicts).
        assert!(conflicted_paths(&cli).unwrap().is_empty());
    }

    #[test]
    fn rebase_in_progress_false_on_clean_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = init_repo(tmp.path());
        std::fs::write(tmp.path().join("a.txt"), "1\n").unwrap();
        cli.run(&["add", "-A"]).unwrap();
        cli.run(&["commit", "-m", "init"]).unwrap();
        assert!(!rebase_in_progress(&cli).unwrap());
    }

    #[tokio::test]
    async fn resolve_conflicts_short_circuits_when_no_conflicts_present() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = init_repo(tmp.path());
        std::fs::write(tmp.path().join("a.txt"), "1\n").unwrap();
        cli.run(&["add", "-A"]).unwrap();
        cli.run(&["commit", "-m", "init"]).unwrap();

        let config = ConflictResolverConfig {
            agent_binary: PathBuf::from("does-not-matter"),
            one_shot_args: vec![],
        };
        let outcome = resolve_conflicts(&cli, &config).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::CompletedByAgent);
    }
}
