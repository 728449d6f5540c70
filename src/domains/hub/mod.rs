pub mod connections;
pub mod http;
pub mod management_socket;
pub mod protocol;
pub mod session_socket;

use crate::domains::pty::PtySession;
use crate::domains::sessions::Registry;
use connections::ConnectionTable;
use dashmap::DashMap;
use protocol::{ManagementFrame, ServerFrame};
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a session-socket or management-socket connection handler
/// needs: the Registry, the connection table, the live PTY sessions, and
/// the agent-spawn parameters. One instance lives in `AppState` and is
/// cloned (cheaply, behind `Arc`s) into every accepted connection's task.
pub struct Hub {
    pub registry: Arc<Registry>,
    pub connections: ConnectionTable,
    pub pty_sessions: DashMap<String, Arc<PtySession>>,
    pub hook_secret: String,
    pub agent_binary: PathBuf,
    pub agent_args: Vec<String>,
    pub base_url: String,
    /// Process-wide idempotence guard for in-progress destructive ops,
    /// keyed by `"<session_id>:<op>"` (SPEC_FULL.md §3 "Process-wide
    /// state"). A present entry means a second identical request should be
    /// rejected rather than queued behind the first.
    in_progress_ops: DashMap<String, ()>,
}

impl Hub {
    pub fn new(registry: Arc<Registry>, hook_secret: String, agent_binary: PathBuf, agent_args: Vec<String>, base_url: String) -> Self {
        Self {
            registry,
            connections: ConnectionTable::new(),
            pty_sessions: DashMap::new(),
            hook_secret,
            agent_binary,
            agent_args,
            base_url,
            in_progress_ops: DashMap::new(),
        }
    }

    fn op_key(session_id: &str, op: &str) -> String {
        format!("{session_id}:{op}")
    }

    /// Mark `op` as in-progress for `session_id`. Returns `false` (and does
    /// nothing) if it was already in progress.
    pub fn try_begin_op(&self, session_id: &str, op: &str) -> bool {
        self.in_progress_ops.insert(Self::op_key(session_id, op), ()).is_none()
    }

    pub fn end_op(&self, session_id: &str, op: &str) {
        self.in_progress_ops.remove(&Self::op_key(session_id, op));
    }

    /// Push a fresh `gitBranchStatus` to every session whose `branchName`
    /// or `baseBranchName` equals `branch_name` within the repository owning
    /// `repo_hash` — the broadcast rule in SPEC_FULL.md §4.5 / invariant 6.
    pub fn broadcast_git_status_for_branch(&self, repo_hash: &str, branch_name: &str) {
        let Some(manager) = self.registry.manager_by_repo_hash(repo_hash) else {
            return;
        };
        for session_id in manager.session_ids_affected_by_branch_move(branch_name) {
            let Ok(session) = manager.session(&session_id) else {
                continue;
            };
            let Ok(status) = manager.get_git_status(&session_id) else {
                continue;
            };
            let commit_log = manager.get_commit_log(&session_id).ok();
            self.connections.send_to_session(
                &session.addressing_key(),
                &ServerFrame::GitBranchStatus { status, commit_log },
            );
        }
    }

    /// `sendStateUpdate`: push a bare `state` frame to the one session
    /// addressed by `(repo_hash, branch_name)`, used for the `running`
    /// transition (SPEC_FULL.md §4.6).
    pub fn send_state_update(&self, repo_hash: &str, branch_name: &str, state: &'static str) -> bool {
        let key = (repo_hash.to_string(), branch_name.to_string());
        self.connections.send_to_session(&key, &ServerFrame::State { state })
    }

    /// `sendReadyStateWithGitStatus`: push `state: ready` plus a refreshed
    /// status snapshot and commit log to the addressed session, then run the
    /// cross-tab broadcast rule in case the base moved while this session was
    /// busy (SPEC_FULL.md §4.6).
    pub fn send_ready_state_with_git_status(&self, repo_hash: &str, branch_name: &str) -> bool {
        let key = (repo_hash.to_string(), branch_name.to_string());
        let sent_ready = self.connections.send_to_session(&key, &ServerFrame::State { state: "ready" });

        if let Some(manager) = self.registry.manager_by_repo_hash(repo_hash) {
            if let Some(session_id) = manager.session_id_by_branch(branch_name) {
                if let Ok(status) = manager.get_git_status(&session_id) {
                    let commit_log = manager.get_commit_log(&session_id).ok();
                    self.connections
                        .send_to_session(&key, &ServerFrame::GitBranchStatus { status, commit_log });
                }
                let _ = manager.check_and_update_base_branch(&session_id);
            }
        }
        self.broadcast_git_status_for_branch(repo_hash, branch_name);
        sent_ready
    }

    /// Push a management-socket event addressed by `(repo_hash,
    /// branch_name)` — `closeTab`, `discardAndClose`, `keepBranchAndClose`,
    /// `waituser`, `openurl` (SPEC_FULL.md §4.5).
    pub fn send_management_event(&self, repo_hash: &str, branch_name: &str, frame: ManagementFrame) -> bool {
        let key = (repo_hash.to_string(), branch_name.to_string());
        self.connections.send_to_management(&key, &frame)
    }
}
