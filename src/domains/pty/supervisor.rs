use anyhow::{Context, Result};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc::UnboundedSender;

/// Events the Supervisor pushes outward; the Hub (C5) wires a channel per
/// session and forwards `Data`/`Ready`/`Exit` onto the bound session socket,
/// so this module stays unaware of WebSocket framing entirely.
#[derive(Debug)]
pub enum PtyEvent {
    Data(Vec<u8>),
    Ready,
    Exit(Option<i32>),
}

pub struct PtySpawnConfig {
    pub agent_binary: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub base_url: String,
    pub base_branch: String,
    pub cols: u16,
    pub rows: u16,
    /// Additional env vars beyond `BASEURL`/`BASE_BRANCH` (the hook-script
    /// identity: repo hash, branch name, hook secret).
    pub extra_env: Vec<(String, String)>,
}

/// One spawned agent process, the PTY pair it runs inside, and the small
/// prompt/ESC detection state machine from SPEC_FULL.md §4.4 steps 6-7.
/// Exclusively owned by the Supervisor (`domains::pty`); anyone else holding
/// a reference only looks things up, never mutates (the "weak back
/// reference" ownership rule in SPEC_FULL.md §3).
pub struct PtySession {
    writer: StdMutex<Box<dyn Write + Send>>,
    master: StdMutex<Box<dyn MasterPty + Send>>,
    child: StdMutex<Box<dyn portable_pty::Child + Send + Sync>>,
    events: UnboundedSender<PtyEvent>,
    awaiting_initial_prompt: AtomicBool,
}

impl PtySession {
    /// Forward client-typed bytes into the PTY. A bare `ESC` (exactly one
    /// byte, `0x1b`, not part of a longer CSI sequence) also synthesizes an
    /// eager `ready` transition, since the agent is expected to go idle on
    /// interrupt.
    pub fn write_input(&self, bytes: &[u8]) -> Result<()> {
        if bytes == [0x1b] {
            let _ = self.events.send(PtyEvent::Ready);
        }
        self.writer
            .lock()
            .unwrap()
            .write_all(bytes)
            .context("failed to write to pty")
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .lock()
            .unwrap()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to resize pty")
    }

    pub fn kill(&self) -> Result<()> {
        self.child.lock().unwrap().kill().context("failed to kill pty child")
    }
}

/// Spawn the agent inside a fresh PTY and start the background byte-reader
/// thread that feeds `events`. Env extensions `BASEURL`/`BASE_BRANCH` match
/// SPEC_FULL.md §4.4 step 4.
pub fn spawn(config: PtySpawnConfig, events: UnboundedSender<PtyEvent>) -> Result<Arc<PtySession>> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: config.rows,
            cols: config.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("failed to open pty")?;

    let mut cmd = CommandBuilder::new(&config.agent_binary);
    cmd.args(&config.args);
    cmd.cwd(&config.cwd);
    cmd.env("BASEURL", &config.base_url);
    cmd.env("BASE_BRANCH", &config.base_branch);
    for (key, value) in &config.extra_env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .context("failed to spawn agent inside pty")?;
    drop(pair.slave);

    let reader = pair.master.try_clone_reader().context("failed to clone pty reader")?;
    let writer = pair.master.take_writer().context("failed to take pty writer")?;

    let session = Arc::new(PtySession {
        writer: StdMutex::new(writer),
        master: StdMutex::new(pair.master),
        child: StdMutex::new(child),
        events: events.clone(),
        awaiting_initial_prompt: AtomicBool::new(true),
    });

    let read_session = session.clone();
    std::thread::spawn(move || read_loop(reader, read_session, events));

    Ok(session)
}

/// `>` is the agent's prompt marker (SPEC_FULL.md glossary); the first time
/// it appears in an output burst while we're still waiting for the initial
/// prompt, we synthesize exactly one `Ready` event.
const PROMPT_MARKER: u8 = b'>';

fn read_loop(mut reader: Box<dyn Read + Send>, session: Arc<PtySession>, events: UnboundedSender<PtyEvent>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                if session.awaiting_initial_prompt.load(Ordering::SeqCst) && chunk.contains(&PROMPT_MARKER) {
                    session.awaiting_initial_prompt.store(false, Ordering::SeqCst);
                    let _ = events.send(PtyEvent::Ready);
                }
                if events.send(PtyEvent::Data(chunk.to_vec())).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }

    let exit_code = session
        .child
        .lock()
        .unwrap()
        .wait()
        .ok()
        .map(|status| status.exit_code() as i32);
    let _ = events.send(PtyEvent::Exit(exit_code));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_echoes_output_through_events() {
        if cfg!(not(unix)) {
            return;
        }
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let config = PtySpawnConfig {
            agent_binary: PathBuf::from("/bin/echo"),
            args: vec!["hello-pty".to_string()],
            cwd: std::env::temp_dir(),
            base_url: "http://127.0.0.1:0".to_string(),
            base_branch: "main".to_string(),
            cols: 80,
            rows: 24,
            extra_env: vec![],
        };
        let session = spawn(config, tx).expect("spawn should succeed");
        drop(session);

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut saw_output = false;
        runtime.block_on(async {
            while let Some(event) = rx.recv().await {
                match event {
                    PtyEvent::Data(bytes) => {
                        if String::from_utf8_lossy(&bytes).contains("hello-pty") {
                            saw_output = true;
                        }
                    }
                    PtyEvent::Exit(_) => break,
                    PtyEvent::Ready => {}
                }
                if saw_output {
                    break;
                }
            }
        });
        assert!(saw_output);
    }
}
