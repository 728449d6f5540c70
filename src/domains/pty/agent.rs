use std::path::PathBuf;

/// Resolve the agent executable once per process: probe common user-local
/// install locations first, trying platform-native extensions on Windows
/// (`.cmd`, `.exe`, `.bat`), before falling back to a `PATH` lookup.
pub fn resolve_agent_binary(command: &str) -> Option<PathBuf> {
    if let Some(home) = home_dir() {
        #[cfg(windows)]
        let candidates = [".cargo\\bin", "AppData\\Roaming\\npm", "scoop\\shims"];
        #[cfg(not(windows))]
        let candidates = [".local/bin", ".cargo/bin", "bin"];

        for dir in candidates {
            #[cfg(windows)]
            {
                for ext in [".cmd", ".exe", ".bat", ""] {
                    let candidate = PathBuf::from(&home).join(dir).join(format!("{command}{ext}"));
                    if candidate.is_file() {
                        return Some(candidate);
                    }
                }
            }
            #[cfg(not(windows))]
            {
                let candidate = PathBuf::from(&home).join(dir).join(command);
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
    }

    which::which(command).ok()
}

fn home_dir() -> Option<String> {
    #[cfg(unix)]
    {
        std::env::var("HOME").ok()
    }
    #[cfg(windows)]
    {
        std::env::var("USERPROFILE").ok()
    }
    #[cfg(not(any(unix, windows)))]
    {
        dirs::home_dir().map(|p| p.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_agent_binary_finds_something_on_path_for_common_tools() {
        // `sh` is present on every unix CI/dev box this crate targets.
        if cfg!(unix) {
            assert!(resolve_agent_binary("sh").is_some());
        }
    }

    #[test]
    fn resolve_agent_binary_returns_none_for_nonexistent_command() {
        assert!(resolve_agent_binary("definitely-not-a-real-binary-xyz123").is_none());
    }
}
