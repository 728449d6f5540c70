use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Git invocations of `ls-files` / `ls-tree` / `status --ignored` on large
/// repositories can legitimately exceed a few megabytes; cap stdout capture
/// well above anything realistic instead of the platform's default pipe
/// buffer assumptions. See SPEC_FULL.md §9 "Subprocess message sizes".
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Thin, argv-only wrapper around the `git` executable on PATH. Every
/// Session Manager / Git Operations Engine call goes through this type — no
/// git invocation anywhere in the crate touches a shell, matching
/// SPEC_FULL.md §9 "Shell escaping".
#[derive(Debug, Clone)]
pub struct GitCli {
    working_dir: PathBuf,
}

impl GitCli {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Run `git <args>` and return trimmed stdout. Non-zero exit becomes an
    /// `Err` carrying the stderr tail (truncated to keep log lines sane).
    pub fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to spawn git {args:?}"))?;

        self.finish(args, output)
    }

    /// Like `run`, but pipes `stdin_data` to the child. Used for `git commit
    /// -F -` so commit messages never need shell quoting or argv escaping.
    pub fn run_with_stdin(&self, args: &[&str], stdin_data: &[u8]) -> Result<String> {
        let mut child = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn git {args:?}"))?;

        child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("no stdin handle for git {args:?}"))?
            .write_all(stdin_data)
            .with_context(|| format!("failed to write stdin to git {args:?}"))?;

        let output = child
            .wait_with_output()
            .with_context(|| format!("failed waiting for git {args:?}"))?;

        self.finish(args, output)
    }

    /// Run a command whose result is a boolean exit code (e.g. `merge-base
    /// --is-ancestor`), never a parse-worthy stdout.
    pub fn run_check(&self, args: &[&str]) -> Result<bool> {
        let status = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("failed to spawn git {args:?}"))?;
        Ok(status.success())
    }

    /// Run a command and return raw stdout bytes (for blob extraction where
    /// the content is not necessarily UTF-8 text, e.g. `git show
    /// <rev>:<path>`).
    pub fn run_bytes(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to spawn git {args:?}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {:?} failed: {}", args, tail(&stderr)));
        }
        let mut stdout = output.stdout;
        stdout.truncate(MAX_OUTPUT_BYTES);
        Ok(stdout)
    }

    fn finish(&self, args: &[&str], output: std::process::Output) -> Result<String> {
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {:?} failed: {}", args, tail(&stderr)));
        }
        let mut stdout = output.stdout;
        stdout.truncate(MAX_OUTPUT_BYTES);
        Ok(String::from_utf8_lossy(&stdout).trim_end().to_string())
    }
}

fn tail(stderr: &str) -> String {
    const MAX_STDERR_CHARS: usize = 2000;
    if stderr.len() <= MAX_STDERR_CHARS {
        stderr.trim().to_string()
    } else {
        let start = stderr.len() - MAX_STDERR_CHARS;
        format!("...{}", &stderr[start..])
    }
}

/// Run a `GitCli` invocation on a blocking thread so callers inside the
/// async Hub/Supervisor never stall the tokio worker pool.
pub async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("git task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) {
        let cli = GitCli::new(dir);
        cli.run(&["init", "-q"]).unwrap();
        cli.run(&["config", "user.email", "test@example.com"]).unwrap();
        cli.run(&["config", "user.name", "Test"]).unwrap();
    }

    #[test]
    fn run_captures_stdout_and_trims() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());
        let cli = GitCli::new(tmp.path());
        let branch = cli.run(&["branch", "--show-current"]).unwrap_or_default();
        assert!(branch.is_empty() || !branch.contains('\n'));
    }

    #[test]
    fn run_surfaces_stderr_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());
        let cli = GitCli::new(tmp.path());
        let err = cli.run(&["show", "nonexistent-rev"]).unwrap_err();
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn run_with_stdin_pipes_commit_message() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());
        std::fs::write(tmp.path().join("a.txt"), "hi\n").unwrap();
        let cli = GitCli::new(tmp.path());
        cli.run(&["add", "-A"]).unwrap();
        let message = "subject line\n\nbody with \"quotes\" and $(danger)";
        cli.run_with_stdin(&["commit", "-F", "-"], message.as_bytes())
            .unwrap();
        let log = cli.run(&["log", "-1", "--format=%B"]).unwrap();
        assert!(log.contains("subject line"));
        assert!(log.contains("$(danger)"));
    }
}
