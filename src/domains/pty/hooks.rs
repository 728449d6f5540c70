use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::Path;

/// Verbatim template copied into `<worktree>/.claude/hooks/update-state.js`.
/// POSTs to the State Hook Endpoint using the env vars the Supervisor sets
/// on the agent process (`BASEURL`) plus two more this script itself derives
/// from the hook's stdin payload (repo hash / branch are passed as CLI
/// args by the settings.local.json hook entries below).
const UPDATE_STATE_JS: &str = r#"#!/usr/bin/env node
const http = require('http');

const state = process.argv[2];
const repoHash = process.env.HYDRA_REPO_HASH;
const branchName = process.env.HYDRA_BRANCH_NAME;
const secret = process.env.HYDRA_HOOK_SECRET;
const baseUrl = process.env.BASEURL;

if (!state || !repoHash || !branchName || !secret || !baseUrl) {
  process.exit(0);
}

const url = new URL(`/set-state/${encodeURIComponent(branchName)}`, baseUrl);
const body = JSON.stringify({ state, repoHash });

const req = http.request(url, {
  method: 'POST',
  headers: {
    'Content-Type': 'application/json',
    'Content-Length': Buffer.byteLength(body),
    'X-Hydra-Secret': secret,
  },
}, (res) => {
  res.resume();
});
req.on('error', () => {});
req.write(body);
req.end();
"#;

const CH_COMMIT_MD: &str = r#"---
description: Commit the current changes in this session's worktree
---

Stage and commit the outstanding changes in this worktree. Write a concise,
conventional commit message summarizing what changed and why.
"#;

const CH_MERGE_MD: &str = r#"---
description: Merge this session's branch back into its base branch
---

Rebase this branch onto its base branch, resolving any conflicts, then
fast-forward the base branch to this branch's tip.
"#;

const CH_REBASE_MD: &str = r#"---
description: Rebase this session's branch onto its base branch
---

Rebase this branch onto the latest tip of its base branch, resolving any
conflicts that arise.
"#;

const CH_CLOSE_MD: &str = r#"---
description: Close this session's tab
---

Signal that this session's tab should be closed now that the current task is
finished.
"#;

const CH_WAITUSER_MD: &str = r#"---
description: Pause and ask the user a question before continuing
---

Pause the current task and ask the user the following, then wait for their
reply before proceeding: $ARGUMENTS
"#;

struct HookTemplate {
    relative_path: &'static str,
    contents: &'static str,
}

const TEMPLATES: &[HookTemplate] = &[
    HookTemplate { relative_path: "hooks/update-state.js", contents: UPDATE_STATE_JS },
    HookTemplate { relative_path: "commands/ch-commit.md", contents: CH_COMMIT_MD },
    HookTemplate { relative_path: "commands/ch-merge.md", contents: CH_MERGE_MD },
    HookTemplate { relative_path: "commands/ch-rebase.md", contents: CH_REBASE_MD },
    HookTemplate { relative_path: "commands/ch-close.md", contents: CH_CLOSE_MD },
    HookTemplate { relative_path: "commands/ch-waituser.md", contents: CH_WAITUSER_MD },
];

/// Write every hook template verbatim into `<worktree>/.claude/`, then
/// additively merge the `UserPromptSubmit`/`PreToolUse` -> running and
/// `Stop`/`Notification` -> ready wiring into `settings.local.json` (never
/// replacing pre-existing user hooks, per SPEC_FULL.md §9).
pub fn install(worktree_root: &Path) -> Result<()> {
    let claude_dir = worktree_root.join(".claude");
    for template in TEMPLATES {
        let dest = claude_dir.join(template.relative_path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&dest, template.contents)
            .with_context(|| format!("failed to write {}", dest.display()))?;
    }
    merge_settings_local(&claude_dir.join("settings.local.json"))
}

fn hook_entry(matcher: &str, command: &str) -> Value {
    json!({
        "matcher": matcher,
        "hooks": [{ "type": "command", "command": command }]
    })
}

fn merge_settings_local(path: &Path) -> Result<()> {
    let mut settings: Value = if path.is_file() {
        let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).unwrap_or_else(|_| json!({}))
    } else {
        json!({})
    };

    if !settings.is_object() {
        settings = json!({});
    }
    let root = settings.as_object_mut().expect("settings forced to object above");
    let hooks = root.entry("hooks").or_insert_with(|| json!({}));
    if !hooks.is_object() {
        *hooks = json!({});
    }
    let hooks = hooks.as_object_mut().expect("hooks forced to object above");

    let running_script = "node .claude/hooks/update-state.js running";
    let ready_script = "node .claude/hooks/update-state.js ready";

    append_if_absent(hooks, "UserPromptSubmit", hook_entry("*", running_script));
    append_if_absent(hooks, "PreToolUse", hook_entry("*", running_script));
    append_if_absent(hooks, "Stop", hook_entry("*", ready_script));
    append_if_absent(hooks, "Notification", hook_entry("*", ready_script));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let serialized = serde_json::to_string_pretty(&settings)?;
    std::fs::write(path, serialized).with_context(|| format!("failed to write {}", path.display()))
}

/// Appends `entry` to `hooks[event]` unless an entry with the same
/// `command` is already present, preserving anything the user added by
/// hand.
fn append_if_absent(hooks: &mut serde_json::Map<String, Value>, event: &str, entry: Value) {
    let list = hooks.entry(event.to_string()).or_insert_with(|| json!([]));
    if !list.is_array() {
        *list = json!([]);
    }
    let array = list.as_array_mut().expect("list forced to array above");

    let command = entry["hooks"][0]["command"].clone();
    let already_present = array.iter().any(|existing| {
        existing
            .get("hooks")
            .and_then(|h| h.get(0))
            .and_then(|h| h.get("command"))
            .is_some_and(|c| *c == command)
    });
    if !already_present {
        array.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_writes_every_template() {
        let tmp = tempfile::tempdir().unwrap();
        install(tmp.path()).unwrap();
        for template in TEMPLATES {
            assert!(tmp.path().join(".claude").join(template.relative_path).is_file());
        }
    }

    #[test]
    fn install_is_additive_over_existing_user_hooks() {
        let tmp = tempfile::tempdir().unwrap();
        let claude_dir = tmp.path().join(".claude");
        std::fs::create_dir_all(&claude_dir).unwrap();
        std::fs::write(
            claude_dir.join("settings.local.json"),
            r#"{"hooks":{"Stop":[{"matcher":"*","hooks":[{"type":"command","command":"echo user-hook"}]}]},"other":"keepme"}"#,
        )
        .unwrap();

        install(tmp.path()).unwrap();

        let raw = std::fs::read_to_string(claude_dir.join("settings.local.json")).unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["other"], "keepme");
        let stop_hooks = parsed["hooks"]["Stop"].as_array().unwrap();
        assert_eq!(stop_hooks.len(), 2);
    }

    #[test]
    fn install_twice_does_not_duplicate_entries() {
        let tmp = tempfile::tempdir().unwrap();
        install(tmp.path()).unwrap();
        install(tmp.path()).unwrap();

        let raw = std::fs::read_to_string(tmp.path().join(".claude/settings.local.json")).unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        let stop_hooks = parsed["hooks"]["Stop"].as_array().unwrap();
        assert_eq!(stop_hooks.len(), 1);
    }
}
