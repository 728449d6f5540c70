use super::protocol::{ClientFrame, OpResult, ServerFrame, WorktreeDescriptor};
use super::Hub;
use crate::domains::git::conflict::ConflictResolverConfig;
use crate::domains::pty::{self, PtyEvent, PtySession, PtySpawnConfig};
use crate::domains::sessions::entity::Session;
use crate::errors::HydraError;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Per-connection mutable state: the session this tab is bound to (if any)
/// and its live PTY handle, if one has been spawned.
#[derive(Default)]
struct ConnState {
    session: Option<Session>,
    pty: Option<Arc<PtySession>>,
}

/// Drive one accepted session-socket connection end to end: split the
/// stream, spawn the writer task, then process inbound frames sequentially
/// so per-type response ordering holds (SPEC_FULL.md §5 "Ordering
/// guarantees"). Cleans up the PTY and, per the "tab-level disconnect"
/// resolution in SPEC_FULL.md §9, destroys the session with
/// `preserveWorktree = false` if the socket closes without an explicit
/// `destroy`.
pub async fn handle(stream: tokio::net::TcpStream, hub: Arc<Hub>) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut state = ConnState::default();

    while let Some(message) = read.next().await {
        let message = match message {
            Ok(m) => m,
            Err(_) => break,
        };
        let Message::Text(text) = message else { continue };
        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("ignoring malformed client frame: {e}");
                continue;
            }
        };
        dispatch(&hub, &mut state, frame, &out_tx).await;
    }

    drop(out_tx);
    let _ = writer.await;
    cleanup_on_disconnect(&hub, &state).await;
    Ok(())
}

async fn cleanup_on_disconnect(hub: &Hub, state: &ConnState) {
    if let Some(pty) = &state.pty {
        let _ = pty.kill();
    }
    if let Some(session) = &state.session {
        hub.pty_sessions.remove(&session.session_id);
        hub.connections.unregister_session(&session.addressing_key());
        if let Some(manager) = hub.registry.manager_by_session_id(&session.session_id) {
            if let Err(e) = manager.destroy(&session.session_id, false).await {
                log::warn!("cleanup on disconnect failed to destroy session '{}': {e}", session.session_id);
            }
        }
        hub.registry.unregister(&session.session_id);
    }
}

fn send(out_tx: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) {
    if let Ok(text) = serde_json::to_string(frame) {
        let _ = out_tx.send(Message::Text(text.into()));
    }
}

fn conflict_config(hub: &Hub) -> ConflictResolverConfig {
    ConflictResolverConfig {
        agent_binary: hub.agent_binary.clone(),
        one_shot_args: hub.agent_args.clone(),
    }
}

async fn dispatch(hub: &Arc<Hub>, state: &mut ConnState, frame: ClientFrame, out_tx: &mpsc::UnboundedSender<Message>) {
    match frame {
        ClientFrame::Create { repo_path, branch_name, adopt_existing, base_branch } => {
            handle_create(hub, state, repo_path, branch_name, adopt_existing, base_branch, out_tx).await;
        }
        ClientFrame::Data { bytes } => {
            if let Some(pty) = &state.pty {
                if let Err(e) = pty.write_input(bytes.as_bytes()) {
                    log::warn!("pty write failed: {e}");
                }
            }
        }
        ClientFrame::Resize { cols, rows } => {
            if let Some(pty) = &state.pty {
                let _ = pty.resize(cols, rows);
            }
        }
        ClientFrame::Destroy { preserve_worktree } => {
            handle_destroy(hub, state, preserve_worktree).await;
        }
        ClientFrame::GetGitStatus => {
            with_manager(hub, state, out_tx, |manager, session| {
                let status = manager.get_git_status(&session.session_id)?;
                let commit_log = manager.get_commit_log(&session.session_id).ok();
                Ok(ServerFrame::GitBranchStatus { status, commit_log })
            });
        }
        ClientFrame::GetFileDiff { file_path, commit_id } => {
            with_manager(hub, state, out_tx, |manager, session| {
                let diff = manager.get_file_diff(&session.session_id, &file_path, commit_id.as_deref())?;
                Ok(ServerFrame::FileDiff { diff })
            });
        }
        ClientFrame::SaveFile { path, contents } => {
            with_manager_fire_and_forget(hub, state, out_tx, |manager, session| {
                manager.save_file(&session.session_id, &path, &contents)
            });
        }
        ClientFrame::DiscardFile { path } => {
            with_manager_fire_and_forget(hub, state, out_tx, |manager, session| {
                manager.discard_file(&session.session_id, &path)
            });
        }
        ClientFrame::CreateFile { path, is_directory } => {
            with_manager(hub, state, out_tx, |manager, session| {
                let result = manager.create_file_or_directory(&session.session_id, &path, is_directory);
                Ok(ServerFrame::CreateFileResult { result: OpResult::from_result(&result) })
            });
        }
        ClientFrame::DeleteFile { path } => {
            with_manager(hub, state, out_tx, |manager, session| {
                let result = manager.delete_file_or_directory(&session.session_id, &path);
                Ok(ServerFrame::DeleteFileResult { result: OpResult::from_result(&result) })
            });
        }
        ClientFrame::RequestFileList { commit_id } => {
            with_manager(hub, state, out_tx, |manager, session| {
                let files = manager.get_file_list(&session.session_id, commit_id.as_deref())?;
                Ok(ServerFrame::FileList { files })
            });
        }
        ClientFrame::Commit { message } => {
            with_manager(hub, state, out_tx, |manager, session| {
                let result = manager.commit(&session.session_id, &message);
                Ok(ServerFrame::CommitResult { result: OpResult::from_result(&result) })
            });
        }
        ClientFrame::DiscardChanges => {
            with_manager(hub, state, out_tx, |manager, session| {
                let result = manager.discard_changes(&session.session_id);
                Ok(ServerFrame::DiscardResult { result: OpResult::from_result(&result) })
            });
        }
        ClientFrame::ResetToBase => {
            with_manager(hub, state, out_tx, |manager, session| {
                let result = manager.reset_to_base(&session.session_id);
                Ok(ServerFrame::ResetResult { result: OpResult::from_result(&result) })
            });
        }
        ClientFrame::Rebase => {
            handle_rebase(hub, state, out_tx).await;
        }
        ClientFrame::Merge { commit_message } => {
            handle_merge(hub, state, commit_message, out_tx).await;
        }
        ClientFrame::Restart => {
            handle_restart(hub, state, out_tx).await;
        }
        ClientFrame::ExecuteWaituser { commandline } => {
            handle_execute_waituser(commandline, out_tx).await;
        }
        ClientFrame::ValidateRepository { repo_path } => {
            let result = hub.registry.get_or_create(&PathBuf::from(&repo_path));
            send(out_tx, &ServerFrame::RepositoryValidated {
                valid: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            });
        }
        ClientFrame::DiscoverWorktrees { repo_path } => {
            match hub.registry.get_or_create(&PathBuf::from(&repo_path)) {
                Ok(manager) => match manager.discover_adoptable_worktrees() {
                    Ok(worktrees) => {
                        let worktrees = worktrees
                            .into_iter()
                            .map(|(branch_name, worktree_path)| WorktreeDescriptor {
                                branch_name,
                                worktree_path: worktree_path.display().to_string(),
                            })
                            .collect();
                        send(out_tx, &ServerFrame::WorktreesDiscovered { worktrees });
                    }
                    Err(e) => send(out_tx, &ServerFrame::error(&e)),
                },
                Err(e) => send(out_tx, &ServerFrame::error(&e)),
            }
        }
    }
}

/// Shared plumbing for request types that look up the bound session's
/// Manager, run one operation, and send back exactly one frame.
fn with_manager(
    hub: &Hub,
    state: &ConnState,
    out_tx: &mpsc::UnboundedSender<Message>,
    op: impl FnOnce(&crate::domains::sessions::SessionManager, &Session) -> Result<ServerFrame, HydraError>,
) {
    let Some(session) = &state.session else {
        send(out_tx, &ServerFrame::error(&HydraError::SessionNotFound { session_id: String::new() }));
        return;
    };
    let Some(manager) = hub.registry.manager_by_session_id(&session.session_id) else {
        send(out_tx, &ServerFrame::error(&HydraError::SessionNotFound { session_id: session.session_id.clone() }));
        return;
    };
    match op(&manager, session) {
        Ok(frame) => send(out_tx, &frame),
        Err(e) => send(out_tx, &ServerFrame::error(&e)),
    }
}

/// Same lookup, but for request types with no dedicated success frame
/// (`saveFile`, `discardFile`): silence on success, `error` on failure.
fn with_manager_fire_and_forget(
    hub: &Hub,
    state: &ConnState,
    out_tx: &mpsc::UnboundedSender<Message>,
    op: impl FnOnce(&crate::domains::sessions::SessionManager, &Session) -> Result<(), HydraError>,
) {
    let Some(session) = &state.session else {
        send(out_tx, &ServerFrame::error(&HydraError::SessionNotFound { session_id: String::new() }));
        return;
    };
    let Some(manager) = hub.registry.manager_by_session_id(&session.session_id) else {
        send(out_tx, &ServerFrame::error(&HydraError::SessionNotFound { session_id: session.session_id.clone() }));
        return;
    };
    if let Err(e) = op(&manager, session) {
        send(out_tx, &ServerFrame::error(&e));
    }
}

async fn handle_create(
    hub: &Arc<Hub>,
    state: &mut ConnState,
    repo_path: String,
    branch_name: String,
    adopt_existing: bool,
    base_branch: Option<String>,
    out_tx: &mpsc::UnboundedSender<Message>,
) {
    let repo_path = PathBuf::from(repo_path);
    let manager = match hub.registry.get_or_create(&repo_path) {
        Ok(m) => m,
        Err(e) => return send(out_tx, &ServerFrame::error(&e)),
    };

    let session = match manager.create(&branch_name, adopt_existing, base_branch.as_deref()).await {
        Ok(s) => s,
        Err(e) => return send(out_tx, &ServerFrame::error(&e)),
    };

    hub.registry.register_session(&session.session_id, &repo_path);
    hub.connections.register_session(session.addressing_key(), out_tx.clone());

    if let Err(e) = crate::domains::pty::hooks::install(&session.worktree_path) {
        log::warn!("hook installation failed for session '{}': {e}", session.session_id);
    }
    let git_dir = manager.repository.path.join(".git");
    if let Err(e) = crate::domains::sessions::localfiles::append_to_git_exclude(&git_dir, &manager.repository.path) {
        log::warn!("failed to append .ignorefiles entries: {e}");
    }

    let mut args = hub.agent_args.clone();
    if adopt_existing {
        args.push("--continue".to_string());
    }
    let config = PtySpawnConfig {
        agent_binary: hub.agent_binary.clone(),
        args,
        cwd: session.worktree_path.clone(),
        base_url: hub.base_url.clone(),
        base_branch: session.base_branch_name.clone(),
        cols: DEFAULT_COLS,
        rows: DEFAULT_ROWS,
        extra_env: vec![
            ("HYDRA_REPO_HASH".to_string(), session.repo_hash.clone()),
            ("HYDRA_BRANCH_NAME".to_string(), session.branch_name.clone()),
            ("HYDRA_HOOK_SECRET".to_string(), hub.hook_secret.clone()),
        ],
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    match pty::spawn(config, events_tx) {
        Ok(pty_session) => {
            hub.pty_sessions.insert(session.session_id.clone(), pty_session.clone());
            state.pty = Some(pty_session);
            spawn_pty_event_forwarder(events_rx, out_tx.clone());
        }
        Err(e) => {
            // PTY spawn is fatal to the session (SPEC_FULL.md §4.7): tear down
            // the worktree and registrations just created above instead of
            // leaving an orphaned session with no PTY behind.
            send(out_tx, &ServerFrame::error(&HydraError::PtySpawnFailed { message: e.to_string() }));
            hub.connections.unregister_session(&session.addressing_key());
            if let Err(destroy_err) = manager.destroy(&session.session_id, false).await {
                log::warn!("cleanup after failed PTY spawn failed for session '{}': {destroy_err}", session.session_id);
            }
            hub.registry.unregister(&session.session_id);
            send(out_tx, &ServerFrame::CloseTab);
            return;
        }
    }

    send(out_tx, &ServerFrame::Created { session_id: session.session_id.clone() });
    state.session = Some(session);
}

fn spawn_pty_event_forwarder(mut events_rx: mpsc::UnboundedReceiver<PtyEvent>, out_tx: mpsc::UnboundedSender<Message>) {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let frame = match event {
                PtyEvent::Data(bytes) => ServerFrame::Data { bytes: String::from_utf8_lossy(&bytes).into_owned() },
                PtyEvent::Ready => ServerFrame::State { state: "ready" },
                PtyEvent::Exit(code) => ServerFrame::Exit { code },
            };
            let is_exit = matches!(frame, ServerFrame::Exit { .. });
            send(&out_tx, &frame);
            if is_exit {
                break;
            }
        }
    });
}

async fn handle_destroy(hub: &Hub, state: &mut ConnState, preserve_worktree: bool) {
    if let Some(pty) = state.pty.take() {
        let _ = pty.kill();
    }
    let Some(session) = state.session.take() else { return };
    hub.pty_sessions.remove(&session.session_id);
    hub.connections.unregister_session(&session.addressing_key());
    if let Some(manager) = hub.registry.manager_by_session_id(&session.session_id) {
        if let Err(e) = manager.destroy(&session.session_id, preserve_worktree).await {
            log::warn!("destroy failed for session '{}': {e}", session.session_id);
        }
    }
    hub.registry.unregister(&session.session_id);
}

async fn handle_rebase(hub: &Hub, state: &ConnState, out_tx: &mpsc::UnboundedSender<Message>) {
    let Some(session) = &state.session else {
        return send(out_tx, &ServerFrame::error(&HydraError::SessionNotFound { session_id: String::new() }));
    };
    let Some(manager) = hub.registry.manager_by_session_id(&session.session_id) else {
        return send(out_tx, &ServerFrame::error(&HydraError::SessionNotFound { session_id: session.session_id.clone() }));
    };
    if !hub.try_begin_op(&session.session_id, "rebase") {
        return send(out_tx, &ServerFrame::error(&HydraError::Timeout { operation: "rebase already in progress".to_string() }));
    }
    let config = conflict_config(hub);
    let outcome = manager.rebase(&session.session_id, &config).await;
    hub.end_op(&session.session_id, "rebase");
    let conflicts_resolved = outcome.as_ref().ok().map(|o| matches!(o, crate::domains::git::ops::RebaseOutcome::ResolvedByAgent));
    let result: Result<(), HydraError> = outcome.map(|_| ());
    if result.is_ok() {
        // Rebasing rewrites this session's own branch tip; any sibling
        // session based on it needs a refreshed badge (invariant 6).
        hub.broadcast_git_status_for_branch(&session.repo_hash, &session.branch_name);
    }
    send(out_tx, &ServerFrame::RebaseResult { result: OpResult::from_result(&result), conflicts_resolved });
}

async fn handle_merge(hub: &Hub, state: &ConnState, commit_message: Option<String>, out_tx: &mpsc::UnboundedSender<Message>) {
    let Some(session) = &state.session else {
        return send(out_tx, &ServerFrame::error(&HydraError::SessionNotFound { session_id: String::new() }));
    };
    let Some(manager) = hub.registry.manager_by_session_id(&session.session_id) else {
        return send(out_tx, &ServerFrame::error(&HydraError::SessionNotFound { session_id: session.session_id.clone() }));
    };
    if !hub.try_begin_op(&session.session_id, "merge") {
        return send(out_tx, &ServerFrame::error(&HydraError::Timeout { operation: "merge already in progress".to_string() }));
    }
    let config = conflict_config(hub);
    let outcome = manager.merge(&session.session_id, &config, commit_message.as_deref()).await;
    hub.end_op(&session.session_id, "merge");
    let conflicts_resolved = outcome
        .as_ref()
        .ok()
        .map(|o| matches!(o, crate::domains::git::ops::MergeOutcome::MergedAfterResolution));
    let result: Result<(), HydraError> = outcome.map(|_| ());
    if result.is_ok() {
        // The merge fast-forwarded `base`; every sibling session based on it
        // (or *being* it, if one exists) needs a refreshed badge before this
        // socket sees its own result frame (invariant 6).
        hub.broadcast_git_status_for_branch(&session.repo_hash, &session.base_branch_name);
    }
    send(out_tx, &ServerFrame::MergeResult { result: OpResult::from_result(&result), conflicts_resolved });
}

async fn handle_restart(hub: &Arc<Hub>, state: &mut ConnState, out_tx: &mpsc::UnboundedSender<Message>) {
    let Some(session) = state.session.clone() else { return };
    if let Some(old_pty) = state.pty.take() {
        let _ = old_pty.kill();
    }
    hub.pty_sessions.remove(&session.session_id);

    let mut args = hub.agent_args.clone();
    args.push("--continue".to_string());
    let config = PtySpawnConfig {
        agent_binary: hub.agent_binary.clone(),
        args,
        cwd: session.worktree_path.clone(),
        base_url: hub.base_url.clone(),
        base_branch: session.base_branch_name.clone(),
        cols: DEFAULT_COLS,
        rows: DEFAULT_ROWS,
        extra_env: vec![
            ("HYDRA_REPO_HASH".to_string(), session.repo_hash.clone()),
            ("HYDRA_BRANCH_NAME".to_string(), session.branch_name.clone()),
            ("HYDRA_HOOK_SECRET".to_string(), hub.hook_secret.clone()),
        ],
    };
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    match pty::spawn(config, events_tx) {
        Ok(pty_session) => {
            hub.pty_sessions.insert(session.session_id.clone(), pty_session.clone());
            state.pty = Some(pty_session);
            spawn_pty_event_forwarder(events_rx, out_tx.clone());
            send(out_tx, &ServerFrame::Restarted);
        }
        Err(e) => send(out_tx, &ServerFrame::error(&HydraError::PtySpawnFailed { message: e.to_string() })),
    }
}

async fn handle_execute_waituser(commandline: String, out_tx: &mpsc::UnboundedSender<Message>) {
    #[cfg(windows)]
    let mut command = {
        let mut c = tokio::process::Command::new("cmd");
        c.arg("/C").arg(&commandline);
        c
    };
    #[cfg(not(windows))]
    let mut command = {
        let mut c = tokio::process::Command::new("sh");
        c.arg("-c").arg(&commandline);
        c
    };
    command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    match command.output().await {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            send(out_tx, &ServerFrame::WaituserError { output: combined });
        }
        Err(e) => send(out_tx, &ServerFrame::WaituserError { output: e.to_string() }),
    }
}
