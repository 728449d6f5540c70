use super::cli::GitCli;
use crate::domains::sessions::entity::{CommitRecord, FileRecord, FileStatus, GitStatusSnapshot};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::Path;
use walkdir::WalkDir;

const COMMIT_LOG_FORMAT: &str = "%h%x00%at%x00%s%x00%B%x00";
const RECORD_SEP: char = '\x00';

/// `getGitStatus`: porcelain status plus ahead/behind counts relative to
/// `base`, run inside the session's worktree.
pub fn git_status(worktree: &GitCli, base: &str) -> Result<GitStatusSnapshot> {
    let porcelain = worktree.run(&["status", "--porcelain"])?;
    let has_uncommitted_changes = !porcelain.trim().is_empty();

    let ahead = worktree
        .run(&["log", &format!("{base}..HEAD"), "--oneline"])
        .unwrap_or_default();
    let has_unmerged_commits = !ahead.trim().is_empty();

    let behind = worktree
        .run(&["rev-list", "--count", &format!("HEAD..{base}")])
        .unwrap_or_else(|_| "0".to_string());
    let is_behind_base = behind.trim().parse::<u64>().unwrap_or(0) > 0;

    Ok(GitStatusSnapshot {
        has_uncommitted_changes,
        has_unmerged_commits,
        is_behind_base,
    })
}

/// `getCommitLog`: commits in `base..branch`, newest first, parsed from a
/// null-byte-delimited `git log` format so commit subjects/bodies can
/// contain any byte (including embedded newlines) without corrupting the
/// record boundary.
pub fn commit_log(worktree: &GitCli, base: &str, branch: &str) -> Result<Vec<CommitRecord>> {
    let range = format!("{base}..{branch}");
    let raw = match worktree.run(&["log", &range, &format!("--format={COMMIT_LOG_FORMAT}")]) {
        Ok(s) => s,
        Err(_) => return Ok(Vec::new()),
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    let mut fields = raw.split(RECORD_SEP).peekable();
    loop {
        let hash = match fields.next() {
            // git inserts a `\n` between consecutive `--format` records, so
            // every hash but the first arrives as "\n<sha>".
            Some(h) if !h.trim_start_matches('\n').is_empty() => h.trim_start_matches('\n'),
            _ => break,
        };
        let unix_timestamp = fields.next().unwrap_or("0").parse::<i64>().unwrap_or(0);
        let subject = fields.next().unwrap_or("").to_string();
        let full_message = fields.next().unwrap_or("").trim_start_matches('\n').to_string();

        let display_hash = hash.chars().take(4).collect::<String>();
        records.push(CommitRecord {
            hash: hash.to_string(),
            display_hash,
            unix_timestamp,
            subject,
            full_message,
        });

        // format string ends each record with a trailing NUL; the split
        // leaves an empty trailing element after the final record's `%B\0`.
        if fields.peek().is_none() {
            break;
        }
    }
    Ok(records)
}

/// `getFileList` for the working tree: union of tracked files, the
/// porcelain status map, untracked files, ignored files, and a recursive
/// walk to surface otherwise-invisible empty directories.
pub fn working_tree_file_list(worktree: &GitCli) -> Result<Vec<FileRecord>> {
    let mut status_map: HashMap<String, FileStatus> = HashMap::new();

    let tracked = worktree.run(&["ls-files"])?;
    for path in tracked.lines().filter(|l| !l.is_empty()) {
        status_map.entry(path.to_string()).or_insert(FileStatus::Unchanged);
    }

    let porcelain = worktree.run(&["status", "--porcelain"])?;
    for line in porcelain.lines() {
        if line.len() < 4 {
            continue;
        }
        let code = &line[..2];
        let path = line[3..].trim();
        let status = classify_porcelain_code(code);
        status_map.insert(path.to_string(), status);
    }

    let untracked = worktree.run(&["ls-files", "--others", "--exclude-standard"])?;
    for path in untracked.lines().filter(|l| !l.is_empty()) {
        status_map.entry(path.to_string()).or_insert(FileStatus::Untracked);
    }

    let ignored = worktree.run(&["status", "--porcelain", "--ignored"])?;
    for line in ignored.lines() {
        if let Some(path) = line.strip_prefix("!! ") {
            status_map.entry(path.trim().to_string()).or_insert(FileStatus::Ignored);
        }
    }

    let mut records: Vec<FileRecord> = status_map
        .into_iter()
        .map(|(path, status)| FileRecord {
            path,
            status,
            is_directory: None,
        })
        .collect();

    records.extend(empty_directory_records(worktree.working_dir()));
    records.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(records)
}

fn classify_porcelain_code(code: &str) -> FileStatus {
    match code {
        "??" => FileStatus::Untracked,
        "!!" => FileStatus::Ignored,
        c if c.contains('D') => FileStatus::Deleted,
        c if c.contains('A') => FileStatus::Added,
        c if c.contains('M') || c.contains('U') => FileStatus::Modified,
        _ => FileStatus::Modified,
    }
}

fn empty_directory_records(root: &Path) -> Vec<FileRecord> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() || entry.path() == root {
            continue;
        }
        let is_empty = std::fs::read_dir(entry.path())
            .map(|mut rd| rd.next().is_none())
            .unwrap_or(false);
        if is_empty {
            let rel = crate::util::path::to_forward_slash_relative(root, entry.path());
            out.push(FileRecord {
                path: rel,
                status: FileStatus::Unchanged,
                is_directory: Some(true),
            });
        }
    }
    out
}

/// `getFileList` for a specific commit: `git ls-tree -r --name-only` plus
/// deleted-file entries recovered from `git diff-tree --name-status` (since
/// `ls-tree` only reflects the tree at that commit, not what vanished).
pub fn commit_file_list(worktree: &GitCli, commit: &str) -> Result<Vec<FileRecord>> {
    let tree = worktree.run(&["ls-tree", "-r", "--name-only", commit])?;
    let mut records: Vec<FileRecord> = tree
        .lines()
        .filter(|l| !l.is_empty())
        .map(|path| FileRecord {
            path: path.to_string(),
            status: FileStatus::Unchanged,
            is_directory: None,
        })
        .collect();

    let diff = worktree.run(&[
        "diff-tree",
        "--no-commit-id",
        "--name-status",
        "-r",
        commit,
    ])?;
    for line in diff.lines() {
        let mut parts = line.splitn(2, '\t');
        let code = parts.next().unwrap_or("");
        let path = parts.next().unwrap_or("").trim();
        if code.starts_with('D') && !path.is_empty() {
            records.push(FileRecord {
                path: path.to_string(),
                status: FileStatus::Deleted,
                is_directory: None,
            });
        }
    }
    Ok(records)
}

/// `getFileDiff` for the working tree: `original` is the blob at
/// `HEAD:<path>` (empty string if the file is new), `modified` is the file
/// as it sits on disk (empty string if deleted).
pub fn working_tree_diff(worktree: &GitCli, path: &str) -> Result<(String, String)> {
    let original = worktree
        .run(&["show", &format!("HEAD:{path}")])
        .unwrap_or_default();
    let abs = worktree.working_dir().join(path);
    let modified = std::fs::read_to_string(&abs).unwrap_or_default();
    Ok((original, modified))
}

/// `getFileDiff` for a specific commit. The parent SHA is obtained via
/// `rev-list --parents`, never `<commit>^`, so the caret never reaches a
/// shell that might treat it specially on some platforms.
pub fn commit_diff(worktree: &GitCli, path: &str, commit: &str) -> Result<(String, String)> {
    let parents_line = worktree.run(&["rev-list", "--parents", "-n", "1", commit])?;
    let mut parts = parents_line.split_whitespace();
    let _this = parts.next().ok_or_else(|| anyhow!("empty rev-list output for {commit}"))?;
    let parent = parts.next();

    let original = match parent {
        Some(parent) => worktree
            .run(&["show", &format!("{parent}:{path}")])
            .unwrap_or_default(),
        None => String::new(),
    };
    let modified = worktree
        .run(&["show", &format!("{commit}:{path}")])
        .unwrap_or_default();
    Ok((original, modified))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo_with_commit(dir: &Path) -> GitCli {
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
    fn status_reports_clean_tree_initially() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = init_repo_with_commit(tmp.path());
        let snap = git_status(&cli, "main").unwrap();
        assert!(!snap.has_uncommitted_changes);
        assert!(!snap.has_unmerged_commits);
    }

    #[test]
    fn status_detects_uncommitted_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = init_repo_with_commit(tmp.path());
        std::fs::write(tmp.path().join("a.txt"), "two\n").unwrap();
        let snap = git_status(&cli, "main").unwrap();
        assert!(snap.has_uncommitted_changes);
    }

    #[test]
    fn commit_log_parses_multiline_messages() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = init_repo_with_commit(tmp.path());
        cli.run(&["checkout", "-b", "feat"]).unwrap();
        std::fs::write(tmp.path().join("b.txt"), "new\n").unwrap();
        cli.run(&["add", "-A"]).unwrap();
        cli.run_with_stdin(&["commit", "-F", "-"], b"subject line\n\nbody paragraph")
            .unwrap();

        let commits = commit_log(&cli, "main", "feat").unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].subject, "subject line");
        assert!(commits[0].full_message.contains("body paragraph"));
        assert_eq!(commits[0].display_hash.len(), 4);
    }

    #[test]
    fn commit_log_multiple_commits_have_clean_hashes() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = init_repo_with_commit(tmp.path());
        cli.run(&["checkout", "-b", "feat"]).unwrap();
        std::fs::write(tmp.path().join("b.txt"), "new\n").unwrap();
        cli.run(&["add", "-A"]).unwrap();
        cli.run(&["commit", "-m", "second commit"]).unwrap();
        std::fs::write(tmp.path().join("c.txt"), "newer\n").unwrap();
        cli.run(&["add", "-A"]).unwrap();
        cli.run(&["commit", "-m", "third commit"]).unwrap();

        let commits = commit_log(&cli, "main", "feat").unwrap();
        assert_eq!(commits.len(), 2);
        for commit in &commits {
            assert!(
                !commit.hash.starts_with('\n') && !commit.hash.contains('\n'),
                "hash must not carry a leading record separator: {:?}",
                commit.hash
            );
            assert!(!commit.display_hash.starts_with('\n'));
            assert_eq!(commit.display_hash.len(), 4);
        }
        assert_eq!(commits[0].subject, "third commit");
        assert_eq!(commits[1].subject, "second commit");
    }

    #[test]
    fn commit_log_empty_range_is_empty_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = init_repo_with_commit(tmp.path());
        let commits = commit_log(&cli, "main", "main").unwrap();
        assert!(commits.is_empty());
    }

    #[test]
    fn working_tree_diff_handles_new_file() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = init_repo_with_commit(tmp.path());
        std::fs::write(tmp.path().join("new.txt"), "hello\n").unwrap();
        let (original, modified) = working_tree_diff(&cli, "new.txt").unwrap();
        assert_eq!(original, "");
        assert_eq!(modified, "hello\n");
    }
}
