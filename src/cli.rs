use clap::Parser;
use std::path::PathBuf;

/// `hydra-server`'s command line, matching SPEC_FULL.md §6.2. Positional
/// `repos` are auto-opened on startup; `--dir` is a convenience alias for
/// "run against exactly one repository" used by editor/launcher
/// integrations that don't want to juggle multiple tabs.
#[derive(Parser, Debug)]
#[command(name = "hydra-server")]
#[command(about = "Local multi-tenant server for running isolated AI coding agent sessions against git worktrees")]
#[command(version)]
pub struct Cli {
    /// Repository paths to auto-open on startup.
    pub repos: Vec<PathBuf>,

    /// Explicit HTTP port (session/management ports are derived as P+1/P+2).
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Skip launching a browser tab once the server is ready.
    ///
    /// A `-hl` short form isn't expressible as a single-character clap short
    /// flag; exposed here as the `--hl` long alias instead (see DESIGN.md).
    #[arg(long = "headless", alias = "hl")]
    pub headless: bool,

    /// Development mode: bypass the built-frontend-artifact check.
    #[arg(long = "dev")]
    pub dev: bool,

    /// Explicit working directory (must exist and be a git checkout).
    #[arg(short = 'd', long = "dir")]
    pub dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_flag_variants() {
        let cli = Cli::parse_from(["hydra-server", "--port=4242"]);
        assert_eq!(cli.port, Some(4242));
        let cli = Cli::parse_from(["hydra-server", "-p", "4242"]);
        assert_eq!(cli.port, Some(4242));
    }

    #[test]
    fn parses_headless_long_and_alias() {
        let cli = Cli::parse_from(["hydra-server", "--headless"]);
        assert!(cli.headless);
        let cli = Cli::parse_from(["hydra-server", "--hl"]);
        assert!(cli.headless);
    }

    #[test]
    fn parses_positional_repos() {
        let cli = Cli::parse_from(["hydra-server", "/tmp/a", "/tmp/b"]);
        assert_eq!(cli.repos, vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")]);
    }
}
