use normalize_path::NormalizePath;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Normalize a repository path for use as a registry key: lexically resolve
/// `.`/`..` components, canonicalize through the filesystem when possible
/// (resolving symlinks), and upper-case on platforms whose filesystem is
/// case-insensitive. `dunce::canonicalize` is used instead of
/// `std::fs::canonicalize` so Windows doesn't hand back `\\?\`-prefixed
/// verbatim paths that external tools (git) choke on.
pub fn normalize_repo_path(path: &Path) -> PathBuf {
    let resolved = dunce::canonicalize(path).unwrap_or_else(|_| path.normalize());
    apply_case_folding(&resolved)
}

#[cfg(any(windows, target_os = "macos"))]
fn apply_case_folding(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().to_uppercase())
}

#[cfg(not(any(windows, target_os = "macos")))]
fn apply_case_folding(path: &Path) -> PathBuf {
    path.to_path_buf()
}

/// Stable key derived from a normalized repo path, used both as the
/// Registry's map key and as the `repoHash` half of `(repoHash, branchName)`
/// addressing throughout the Hub.
pub fn repo_key(normalized: &Path) -> String {
    normalized.to_string_lossy().into_owned()
}

/// First 8 hex characters of a SHA-256 digest of the normalized path, used
/// as the `baseDir` directory-name suffix (`<basename>-<hash>`).
///
/// Uses SHA-256 rather than MD5 for this digest; see DESIGN.md for the
/// rationale.
pub fn short_hash(normalized: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let full = format!("{digest:x}");
    full[..8].to_string()
}

/// Compute `<user-home>/<product-dir>/<basename>-<hash>` for a normalized
/// repository path.
pub fn base_dir_for_repo(normalized: &Path, product_dir: &str) -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let basename = normalized
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".to_string());
    let hash = short_hash(normalized);
    home.join(product_dir).join(format!("{basename}-{hash}"))
}

/// Path-containment guard for file operations scoped to a worktree
/// (`saveFile`, `discardFile`, `createFileOrDirectory`,
/// `deleteFileOrDirectory`). Resolves both sides with `dunce::canonicalize`
/// when possible, falling back to lexical normalization for paths that
/// don't exist yet (e.g. a file about to be created).
pub fn resolve_within_worktree(worktree_path: &Path, candidate: &Path) -> Option<PathBuf> {
    let abs_worktree = dunce::canonicalize(worktree_path).unwrap_or_else(|_| worktree_path.normalize());
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        worktree_path.join(candidate)
    };
    let abs_candidate = dunce::canonicalize(&joined).unwrap_or_else(|| joined.normalize());

    if abs_candidate.starts_with(&abs_worktree) {
        Some(abs_candidate)
    } else {
        None
    }
}

/// Normalize a path to forward-slash, repo-relative form for wire records
/// (`FileRecord::path`, diff/status payloads).
pub fn to_forward_slash_relative(root: &Path, absolute: &Path) -> String {
    let rel = absolute.strip_prefix(root).unwrap_or(absolute);
    rel.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hash_is_deterministic_and_eight_chars() {
        let p = PathBuf::from("/home/user/projects/demo");
        let a = short_hash(&p);
        let b = short_hash(&p);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn short_hash_differs_for_distinct_paths() {
        let a = short_hash(Path::new("/home/user/projects/demo"));
        let b = short_hash(Path::new("/home/user/projects/demo2"));
        assert_ne!(a, b);
    }

    #[test]
    fn resolve_within_worktree_rejects_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let worktree = tmp.path().join("wt");
        std::fs::create_dir_all(&worktree).unwrap();
        let escape = Path::new("../../etc/passwd");
        assert!(resolve_within_worktree(&worktree, escape).is_none());
    }

    #[test]
    fn resolve_within_worktree_accepts_nested_path() {
        let tmp = tempfile::tempdir().unwrap();
        let worktree = tmp.path().join("wt");
        std::fs::create_dir_all(worktree.join("src")).unwrap();
        let nested = Path::new("src/main.rs");
        let resolved = resolve_within_worktree(&worktree, nested);
        assert!(resolved.is_some());
    }

    #[test]
    fn base_dir_includes_basename_and_hash() {
        let p = PathBuf::from("/tmp/my-repo");
        let base = base_dir_for_repo(&p, "hydra-server");
        let name = base.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("my-repo-"));
        assert_eq!(name.len(), "my-repo-".len() + 8);
    }
}
