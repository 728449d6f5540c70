use anyhow::{anyhow, Result};
use std::net::TcpListener;
use std::path::Path;

/// Lower/upper bound for any port this server accepts, matching the range a
/// `CLAUDE-HYDRA-PORT` file or `--port` flag is validated against
/// (SPEC_FULL.md §6.1, §6.2).
pub const MIN_PORT: u32 = 1;
pub const MAX_PORT: u32 = 65533;

const SCAN_START: u16 = 3000;
const SCAN_STEP: u16 = 3;
const SCAN_ATTEMPTS: u16 = 2000;

/// Read the first non-blank line of `<repo_root>/CLAUDE-HYDRA-PORT` and
/// parse it as a port in `[MIN_PORT, MAX_PORT]`, if the file exists and is
/// well-formed.
pub fn read_pinned_port(repo_root: &Path) -> Option<u16> {
    let contents = std::fs::read_to_string(repo_root.join("CLAUDE-HYDRA-PORT")).ok()?;
    let line = contents.lines().map(str::trim).find(|l| !l.is_empty())?;
    let value: u32 = line.parse().ok()?;
    if (MIN_PORT..=MAX_PORT).contains(&value) {
        Some(value as u16)
    } else {
        None
    }
}

fn triple_is_free(base: u16) -> bool {
    (0..3u16).all(|offset| {
        let Some(port) = base.checked_add(offset) else {
            return false;
        };
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    })
}

/// Resolve `P` per SPEC_FULL.md §6.1: an explicit `--port` flag wins, else
/// the `CLAUDE-HYDRA-PORT` file, else scan upward from 3000 in steps of 3
/// for the first triple (`P`, `P+1`, `P+2`) that is entirely free.
pub fn resolve_base_port(explicit: Option<u16>, repo_root: Option<&Path>) -> Result<u16> {
    if let Some(port) = explicit {
        if !triple_is_free(port) {
            return Err(anyhow!("configured port {port} (or {port}+1/{port}+2) is already in use"));
        }
        return Ok(port);
    }

    if let Some(root) = repo_root {
        if let Some(port) = read_pinned_port(root) {
            if !triple_is_free(port) {
                return Err(anyhow!("CLAUDE-HYDRA-PORT pins {port}, but that port triple is in use"));
            }
            return Ok(port);
        }
    }

    for step in 0..SCAN_ATTEMPTS {
        let candidate = SCAN_START + step * SCAN_STEP;
        if triple_is_free(candidate) {
            return Ok(candidate);
        }
    }
    Err(anyhow!("no free port triple found while scanning from {SCAN_START}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_pinned_port_parses_first_nonblank_line() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("CLAUDE-HYDRA-PORT"), "\n  4242  \n\n").unwrap();
        assert_eq!(read_pinned_port(tmp.path()), Some(4242));
    }

    #[test]
    fn read_pinned_port_rejects_out_of_range_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("CLAUDE-HYDRA-PORT"), "99999").unwrap();
        assert_eq!(read_pinned_port(tmp.path()), None);
    }

    #[test]
    fn read_pinned_port_is_none_when_file_missing() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(read_pinned_port(tmp.path()), None);
    }

    #[test]
    fn resolve_base_port_scans_when_nothing_pinned() {
        let port = resolve_base_port(None, None).unwrap();
        assert!(port >= SCAN_START);
    }

    #[test]
    fn resolve_base_port_honors_explicit_flag() {
        // Bind off the triple first so the explicit port is guaranteed free
        // for the duration of the check.
        let port = resolve_base_port(None, None).unwrap();
        let resolved = resolve_base_port(Some(port), None).unwrap();
        assert_eq!(resolved, port);
    }
}
