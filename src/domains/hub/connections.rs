use super::protocol::{ManagementFrame, ServerFrame};
use dashmap::DashMap;
use tokio_tungstenite::tungstenite::Message;

type Key = (String, String);

/// `(repoHash, branchName) -> socket` connection table (SPEC_FULL.md §3,
/// §4.5). A `dashmap::DashMap` rather than a mutex-guarded `HashMap`,
/// matching the Registry's own choice of concurrent map for high-traffic
/// lookup-heavy state.
#[derive(Default)]
pub struct ConnectionTable {
    session_sockets: DashMap<Key, tokio::sync::mpsc::UnboundedSender<Message>>,
    management_sockets: DashMap<Key, tokio::sync::mpsc::UnboundedSender<Message>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session socket under `key`, displacing any prior
    /// registration (the "most recent registration wins" invariant in
    /// SPEC_FULL.md §3).
    pub fn register_session(&self, key: Key, sender: tokio::sync::mpsc::UnboundedSender<Message>) {
        self.session_sockets.insert(key, sender);
    }

    pub fn unregister_session(&self, key: &Key) {
        self.session_sockets.remove(key);
    }

    pub fn register_management(&self, key: Key, sender: tokio::sync::mpsc::UnboundedSender<Message>) {
        self.management_sockets.insert(key, sender);
    }

    pub fn unregister_management(&self, key: &Key) {
        self.management_sockets.remove(key);
    }

    pub fn send_to_session(&self, key: &Key, frame: &ServerFrame) -> bool {
        let Some(sender) = self.session_sockets.get(key) else {
            return false;
        };
        let Ok(text) = serde_json::to_string(frame) else {
            return false;
        };
        sender.send(Message::Text(text.into())).is_ok()
    }

    pub fn send_to_management(&self, key: &Key, frame: &ManagementFrame) -> bool {
        let Some(sender) = self.management_sockets.get(key) else {
            return false;
        };
        let Ok(text) = serde_json::to_string(frame) else {
            return false;
        };
        sender.send(Message::Text(text.into())).is_ok()
    }

    /// Push `frame` to every key in `keys`, skipping ones with no live
    /// socket. Used by the broadcast rule (§4.5) when a base branch's tip
    /// moves.
    pub fn broadcast_to_sessions(&self, keys: &[Key], frame: &ServerFrame) {
        for key in keys {
            self.send_to_session(key, frame);
        }
    }

    pub fn has_session(&self, key: &Key) -> bool {
        self.session_sockets.contains_key(key)
    }
}
