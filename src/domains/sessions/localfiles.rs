use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;
use std::process::Command;
use walkdir::WalkDir;

/// Default patterns that are always copied even if the repo has no
/// `.localfiles` at all, or its contents don't mention them (SPEC_FULL.md
/// §6.3).
const ALWAYS_LOCAL: &[&str] = &["**/CLAUDE.local.md", "**/.claude/commands/**"];

/// Default pattern always appended to `.git/info/exclude`, independent of
/// `.ignorefiles` contents.
pub const ALWAYS_IGNORED: &str = ".claude/";

/// Parse a newline-separated pattern file with `#`-comments (shared shape
/// for both `.localfiles` and `.ignorefiles`).
pub fn read_pattern_file(path: &Path) -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn build_matcher(root: &Path, patterns: &[String]) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in patterns {
        builder
            .add_line(None, pattern)
            .with_context(|| format!("invalid pattern: {pattern}"))?;
    }
    builder.build().context("failed to build pattern matcher")
}

/// Resolve the effective `.localfiles` pattern set for a repository: the
/// always-included defaults plus whatever `<repo>/.localfiles` declares.
pub fn localfiles_patterns(repo_root: &Path) -> Vec<String> {
    let mut patterns: Vec<String> = ALWAYS_LOCAL.iter().map(|s| s.to_string()).collect();
    patterns.extend(read_pattern_file(&repo_root.join(".localfiles")));
    patterns
}

/// Resolve the effective `.ignorefiles` pattern set: always includes
/// `.claude/` plus whatever `<repo>/.ignorefiles` declares.
pub fn ignorefiles_patterns(repo_root: &Path) -> Vec<String> {
    let mut patterns: Vec<String> = vec![ALWAYS_IGNORED.to_string()];
    patterns.extend(read_pattern_file(&repo_root.join(".ignorefiles")));
    patterns
}

fn copy_matching(from_root: &Path, to_root: &Path, patterns: &[String]) -> Result<usize> {
    let matcher = build_matcher(from_root, patterns)?;
    let mut copied = 0;

    for entry in WalkDir::new(from_root)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let matched = matcher.matched(entry.path(), false).is_ignore();
        if !matched {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(from_root)
            .unwrap_or(entry.path());
        let dest = to_root.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        std::fs::copy(entry.path(), &dest)
            .with_context(|| format!("failed to copy {} to {}", entry.path().display(), dest.display()))?;
        copied += 1;
    }
    Ok(copied)
}

/// Copy "local files" from the main checkout into a freshly created
/// worktree (session creation time).
pub fn sync_into_worktree(main_root: &Path, worktree_root: &Path) -> Result<usize> {
    let patterns = localfiles_patterns(main_root);
    copy_matching(main_root, worktree_root, &patterns)
}

/// Copy "local files" back from a worktree into the main checkout (after a
/// successful merge).
pub fn sync_into_main(worktree_root: &Path, main_root: &Path) -> Result<usize> {
    let patterns = localfiles_patterns(main_root);
    copy_matching(worktree_root, main_root, &patterns)
}

/// Append `.ignorefiles` patterns (plus the mandatory `.claude/` entry) to
/// `.git/info/exclude`, idempotently — a pattern already present is not
/// duplicated.
pub fn append_to_git_exclude(git_dir: &Path, repo_root: &Path) -> Result<()> {
    let exclude_path = git_dir.join("info").join("exclude");
    if let Some(parent) = exclude_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let existing = std::fs::read_to_string(&exclude_path).unwrap_or_default();
    let mut existing_lines: std::collections::HashSet<&str> =
        existing.lines().map(str::trim).collect();

    let patterns = ignorefiles_patterns(repo_root);
    let mut to_append = Vec::new();
    for pattern in &patterns {
        if !existing_lines.contains(pattern.as_str()) {
            to_append.push(pattern.clone());
            existing_lines.insert(pattern.as_str());
        }
    }

    if to_append.is_empty() {
        return Ok(());
    }

    let mut new_contents = existing;
    if !new_contents.is_empty() && !new_contents.ends_with('\n') {
        new_contents.push('\n');
    }
    for pattern in to_append {
        new_contents.push_str(&pattern);
        new_contents.push('\n');
    }
    std::fs::write(&exclude_path, new_contents)
        .with_context(|| format!("failed to write {}", exclude_path.display()))?;
    Ok(())
}

/// Run `.autoinit.{sh,cmd,ps1}` from the worktree root right after creation
/// (SPEC_FULL.md §6.3): unix always uses the `.sh` variant via `sh`; windows
/// prefers `.cmd` via `cmd /C`, falling back to `.ps1` via `powershell.exe`.
/// A missing script is not an error. A nonzero exit returns its stderr.
pub fn run_autoinit(worktree_root: &Path) -> Result<(), String> {
    let script = autoinit_script(worktree_root);
    let Some(script) = script else {
        return Ok(());
    };

    let mut command = autoinit_command(&script);
    command.current_dir(worktree_root);
    let output = command.output().map_err(|e| e.to_string())?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).into_owned())
    }
}

#[cfg(unix)]
fn autoinit_script(worktree_root: &Path) -> Option<std::path::PathBuf> {
    let sh = worktree_root.join(".autoinit.sh");
    sh.is_file().then_some(sh)
}

#[cfg(windows)]
fn autoinit_script(worktree_root: &Path) -> Option<std::path::PathBuf> {
    let cmd = worktree_root.join(".autoinit.cmd");
    if cmd.is_file() {
        return Some(cmd);
    }
    let ps1 = worktree_root.join(".autoinit.ps1");
    ps1.is_file().then_some(ps1)
}

#[cfg(unix)]
fn autoinit_command(script: &Path) -> Command {
    let mut command = Command::new("sh");
    command.arg(script);
    command
}

#[cfg(windows)]
fn autoinit_command(script: &Path) -> Command {
    if script.extension().and_then(|e| e.to_str()) == Some("ps1") {
        let mut command = Command::new("powershell.exe");
        command.args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-File"]).arg(script);
        command
    } else {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(script);
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_autoinit_is_a_no_op_when_no_script_present() {
        let worktree = tempfile::tempdir().unwrap();
        assert!(run_autoinit(worktree.path()).is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn run_autoinit_surfaces_stderr_on_nonzero_exit() {
        let worktree = tempfile::tempdir().unwrap();
        std::fs::write(worktree.path().join(".autoinit.sh"), "echo boom 1>&2; exit 1\n").unwrap();
        let err = run_autoinit(worktree.path()).unwrap_err();
        assert!(err.contains("boom"));
    }

    #[test]
    #[cfg(unix)]
    fn run_autoinit_runs_script_in_worktree_root() {
        let worktree = tempfile::tempdir().unwrap();
        std::fs::write(worktree.path().join(".autoinit.sh"), "touch marker.txt\n").unwrap();
        run_autoinit(worktree.path()).unwrap();
        assert!(worktree.path().join("marker.txt").exists());
    }

    #[test]
    fn sync_into_worktree_copies_claude_local_md_by_default() {
        let main = tempfile::tempdir().unwrap();
        let worktree = tempfile::tempdir().unwrap();
        std::fs::write(main.path().join("CLAUDE.local.md"), "notes").unwrap();

        let copied = sync_into_worktree(main.path(), worktree.path()).unwrap();
        assert_eq!(copied, 1);
        assert!(worktree.path().join("CLAUDE.local.md").exists());
    }

    #[test]
    fn sync_respects_custom_localfiles_patterns() {
        let main = tempfile::tempdir().unwrap();
        let worktree = tempfile::tempdir().unwrap();
        std::fs::write(main.path().join(".localfiles"), "secrets/*.env\n").unwrap();
        std::fs::create_dir_all(main.path().join("secrets")).unwrap();
        std::fs::write(main.path().join("secrets/dev.env"), "KEY=1").unwrap();
        std::fs::write(main.path().join("unrelated.txt"), "nope").unwrap();

        sync_into_worktree(main.path(), worktree.path()).unwrap();
        assert!(worktree.path().join("secrets/dev.env").exists());
        assert!(!worktree.path().join("unrelated.txt").exists());
    }

    #[test]
    fn append_to_git_exclude_is_idempotent() {
        let repo = tempfile::tempdir().unwrap();
        let git_dir = repo.path().join(".git");
        std::fs::create_dir_all(&git_dir).unwrap();

        append_to_git_exclude(&git_dir, repo.path()).unwrap();
        let first = std::fs::read_to_string(git_dir.join("info").join("exclude")).unwrap();
        append_to_git_exclude(&git_dir, repo.path()).unwrap();
        let second = std::fs::read_to_string(git_dir.join("info").join("exclude")).unwrap();

        assert_eq!(first, second);
        assert!(first.contains(".claude/"));
    }
}
