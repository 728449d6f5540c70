use super::cli::GitCli;
use anyhow::{anyhow, Result};
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Bounded retry count for worktree removal when file handles are still
/// held (common right after killing a PTY child on Windows). See
/// SPEC_FULL.md §8 "Boundary behaviors".
const WORKTREE_REMOVE_RETRIES: u32 = 5;
const WORKTREE_REMOVE_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Extra settle delay before attempting cleanup at all, so a just-killed
/// PTY child's file handles have a chance to release. Windows needs this
/// more than Unix, but applying it uniformly keeps the code path simple.
const CLEANUP_SETTLE_DELAY: Duration = Duration::from_millis(1000);

pub fn branch_exists(main: &GitCli, branch: &str) -> Result<bool> {
    main.run_check(&[
        "show-ref",
        "--verify",
        "--quiet",
        &format!("refs/heads/{branch}"),
    ])
}

/// Resolve the base branch to derive a new session from, in priority order:
/// explicit argument > `origin/HEAD` > local `main` > local `master` >
/// whatever branch is currently checked out in the main working copy.
pub fn detect_default_base_branch(main: &GitCli) -> Result<String> {
    if let Ok(symref) = main.run(&["symbolic-ref", "refs/remotes/origin/HEAD"]) {
        if let Some(name) = symref.strip_prefix("refs/remotes/origin/") {
            if !name.is_empty() {
                return Ok(name.to_string());
            }
        }
    }
    if branch_exists(main, "main")? {
        return Ok("main".to_string());
    }
    if branch_exists(main, "master")? {
        return Ok("master".to_string());
    }
    let current = main.run(&["branch", "--show-current"])?;
    if current.is_empty() {
        return Err(anyhow!(
            "cannot detect a base branch: no origin/HEAD, no main/master, and HEAD is detached"
        ));
    }
    Ok(current)
}

/// `git worktree add <worktree_path> -b <branch> <base>`.
pub fn add_worktree(main: &GitCli, worktree_path: &Path, branch: &str, base: &str) -> Result<()> {
    main.run(&[
        "worktree",
        "add",
        &worktree_path.to_string_lossy(),
        "-b",
        branch,
        base,
    ])?;
    Ok(())
}

/// Persist `branch.<branch>.base = <base>` inside the worktree's own git
/// config and immediately read it back, matching SPEC_FULL.md invariant 2
/// (base-branch persistence must be verified, not assumed).
pub fn set_base_branch_config(worktree: &GitCli, branch: &str, base: &str) -> Result<()> {
    let key = format!("branch.{branch}.base");
    worktree.run(&["config", &key, base])?;
    let readback = worktree.run(&["config", "--get", &key])?;
    if readback.trim() != base {
        return Err(anyhow!(
            "base-branch config verification failed for '{branch}': wrote '{base}', read back '{readback}'"
        ));
    }
    Ok(())
}

/// Read `branch.<branch>.base` from the worktree's git config, if present.
pub fn get_base_branch_config(worktree: &GitCli, branch: &str) -> Option<String> {
    let key = format!("branch.{branch}.base");
    worktree
        .run(&["config", "--get", &key])
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn current_commit(cli: &GitCli, reference: &str) -> Result<String> {
    cli.run(&["rev-parse", reference])
}

/// Remove a worktree, falling back through progressively more forceful
/// strategies: `git worktree remove --force`, then recursive directory
/// deletion plus `git worktree prune`, retried up to
/// `WORKTREE_REMOVE_RETRIES` times to absorb transient file-handle holds.
/// Returns `Ok(())` only once the directory is actually gone; callers must
/// *not* delete the branch if this fails (invariant 1).
pub fn remove_worktree(main: &GitCli, worktree_path: &Path) -> Result<()> {
    thread::sleep(CLEANUP_SETTLE_DELAY);

    let mut last_err = None;
    for attempt in 0..WORKTREE_REMOVE_RETRIES {
        match main.run(&["worktree", "remove", "--force", &worktree_path.to_string_lossy()]) {
            Ok(_) => return Ok(()),
            Err(e) => last_err = Some(e),
        }

        if !worktree_path.exists() {
            let _ = main.run(&["worktree", "prune"]);
            return Ok(());
        }

        if let Err(e) = std::fs::remove_dir_all(worktree_path) {
            last_err = Some(anyhow!("directory removal failed: {e}"));
        } else {
            let _ = main.run(&["worktree", "prune"]);
            return Ok(());
        }

        if attempt + 1 < WORKTREE_REMOVE_RETRIES {
            thread::sleep(WORKTREE_REMOVE_RETRY_DELAY);
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("worktree removal failed for an unknown reason")))
}

pub fn delete_branch(main: &GitCli, branch: &str) -> Result<()> {
    main.run(&["branch", "-D", branch])?;
    Ok(())
}

/// List local branch names (excluding `HEAD`), then remote branch names
/// (lexicographically sorted, `remotes/` prefix stripped, `HEAD ->`
/// pointer lines filtered).
pub fn list_branches(main: &GitCli) -> Result<Vec<String>> {
    let local_raw = main.run(&["for-each-ref", "--format=%(refname:short)", "refs/heads/"])?;
    let mut locals: Vec<String> = local_raw.lines().map(|s| s.trim().to_string()).collect();
    locals.retain(|b| !b.is_empty());

    let remote_raw = main.run(&[
        "for-each-ref",
        "--format=%(refname:short)",
        "refs/remotes/",
    ])?;
    let mut remotes: Vec<String> = remote_raw
        .lines()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && !s.ends_with("/HEAD"))
        .map(|s| {
            s.strip_prefix("remotes/")
                .map(|s| s.to_string())
                .unwrap_or(s)
        })
        .collect();
    remotes.sort();

    locals.extend(remotes);
    Ok(locals)
}

pub fn fetch_all(main: &GitCli) -> Result<()> {
    main.run(&["fetch", "--all"])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo_with_commit(dir: &Path) -> GitCli {
        let cli = GitCli::new(dir);
        cli.run(&["init", "-q", "-b", "main"]).unwrap();
        cli.run(&["config", "user.email", "test@example.com"]).unwrap();
        cli.run(&["config", "user.name", "Test"]).unwrap();
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        cli.run(&["add", "-A"]).unwrap();
        cli.run(&["commit", "-m", "initial"]).unwrap();
        cli
    }

    #[test]
    fn detect_default_base_branch_prefers_main() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = init_repo_with_commit(tmp.path());
        assert_eq!(detect_default_base_branch(&cli).unwrap(), "main");
    }

    #[test]
    fn add_worktree_then_base_config_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let main = init_repo_with_commit(tmp.path());
        let wt_path = tmp.path().join("wt-feat");
        add_worktree(&main, &wt_path, "feat", "main").unwrap();
        let worktree = GitCli::new(&wt_path);
        set_base_branch_config(&worktree, "feat", "main").unwrap();
        assert_eq!(
            get_base_branch_config(&worktree, "feat"),
            Some("main".to_string())
        );
    }

    #[test]
    fn remove_worktree_deletes_directory_and_prunes() {
        let tmp = tempfile::tempdir().unwrap();
        let main = init_repo_with_commit(tmp.path());
        let wt_path = tmp.path().join("wt-feat");
        add_worktree(&main, &wt_path, "feat", "main").unwrap();
        assert!(wt_path.exists());
        remove_worktree(&main, &wt_path).unwrap();
        assert!(!wt_path.exists());
    }

    #[test]
    fn list_branches_includes_local_branches() {
        let tmp = tempfile::tempdir().unwrap();
        let main = init_repo_with_commit(tmp.path());
        main.run(&["branch", "feat"]).unwrap();
        let branches = list_branches(&main).unwrap();
        assert!(branches.contains(&"main".to_string()));
        assert!(branches.contains(&"feat".to_string()));
    }
}
