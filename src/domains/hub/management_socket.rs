use super::Hub;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// The one client->server frame the management socket accepts: bind this
/// connection to a `(repoHash, branchName)` key so the server can later push
/// `closeTab` / `discardAndClose` / `keepBranchAndClose` / `waituser` /
/// `openurl` events at it (SPEC_FULL.md §4.5). Everything else on this
/// socket class flows server -> client only.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ManagementClientFrame {
    Register { repo_hash: String, branch_name: String },
}

/// Drive one accepted management-socket connection: register it under
/// whatever `(repoHash, branchName)` key it names, then sit idle forwarding
/// whatever the Hub pushes until the socket closes. Unlike the session
/// socket, there is no per-session cleanup to run here — the management
/// connection doesn't own a PTY or a worktree.
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

    let mut registered_key: Option<(String, String)> = None;

    while let Some(message) = read.next().await {
        let message = match message {
            Ok(m) => m,
            Err(_) => break,
        };
        let Message::Text(text) = message else { continue };
        let frame: ManagementClientFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("ignoring malformed management frame: {e}");
                continue;
            }
        };
        match frame {
            ManagementClientFrame::Register { repo_hash, branch_name } => {
                let key = (repo_hash, branch_name);
                hub.connections.register_management(key.clone(), out_tx.clone());
                registered_key = Some(key);
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
    if let Some(key) = registered_key {
        hub.connections.unregister_management(&key);
    }
    Ok(())
}
