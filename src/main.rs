mod cli;

use clap::Parser;
use hydra_server::domains::hub::{http as hook_http, management_socket, session_socket, Hub};
use hydra_server::domains::pty::agent::resolve_agent_binary;
use hydra_server::domains::sessions::Registry;
use hydra_server::ports;
use hydra_server::util::secret::generate_hook_secret;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;

const PRODUCT_DIR: &str = "hydra-server";
const AGENT_COMMAND: &str = "claude";

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// `main.rs` + `cli.rs` together cover Process Bootstrap & Signals: parse
/// the CLI, resolve the agent binary and port triple, build the Hub, bind
/// the three loopback listeners, auto-open positional repos, then block
/// until a shutdown signal closes every session in parallel (SPEC_FULL.md
/// §2 "C8", §5 "Startup/teardown").
fn main() -> ExitCode {
    init_logging();
    let cli = cli::Cli::parse();

    let agent_binary = match resolve_agent_binary(AGENT_COMMAND) {
        Some(path) => path,
        None => {
            log::error!("'{AGENT_COMMAND}' was not found on PATH");
            return ExitCode::FAILURE;
        }
    };

    let mut repos = cli.repos.clone();
    if let Some(dir) = &cli.dir {
        repos.push(dir.clone());
    }
    for repo in &repos {
        if !repo.is_dir() {
            log::error!("'{}' is not a directory", repo.display());
            return ExitCode::FAILURE;
        }
        if !repo.join(".git").exists() {
            log::error!("'{}' is not a git checkout", repo.display());
            return ExitCode::FAILURE;
        }
    }

    let port_probe_root = repos.first().cloned();
    let base_port = match ports::resolve_base_port(cli.port, port_probe_root.as_deref()) {
        Ok(port) => port,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async_main(cli, agent_binary, base_port, repos))
}

async fn async_main(
    cli: cli::Cli,
    agent_binary: std::path::PathBuf,
    base_port: u16,
    repos: Vec<std::path::PathBuf>,
) -> ExitCode {
    let registry = Arc::new(Registry::new(PRODUCT_DIR));
    for repo in &repos {
        if let Err(e) = registry.get_or_create(repo) {
            log::error!("failed to open '{}': {e}", repo.display());
            return ExitCode::FAILURE;
        }
        log::info!("auto-opened repository '{}'", repo.display());
    }

    let hook_secret = generate_hook_secret();
    let base_url = format!("http://127.0.0.1:{}", base_port + 2);
    let hub = Arc::new(Hub::new(registry, hook_secret, agent_binary, Vec::new(), base_url));

    let static_listener = match TcpListener::bind(("127.0.0.1", base_port)).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind static listener on {base_port}: {e}");
            return ExitCode::FAILURE;
        }
    };
    let session_listener = match TcpListener::bind(("127.0.0.1", base_port + 1)).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind session listener on {}: {e}", base_port + 1);
            return ExitCode::FAILURE;
        }
    };
    let management_listener = match TcpListener::bind(("127.0.0.1", base_port + 2)).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind management listener on {}: {e}", base_port + 2);
            return ExitCode::FAILURE;
        }
    };

    log::info!(
        "hydra-server listening: static=http://127.0.0.1:{} session=ws://127.0.0.1:{} management=ws+http://127.0.0.1:{}",
        base_port,
        base_port + 1,
        base_port + 2
    );
    if !cli.headless {
        log::info!("not launching a browser tab: browser launch is handled by the external launcher (out of scope here)");
    }
    if cli.dev {
        log::info!("dev mode: skipping built-frontend-artifact check (static asset serving is out of scope here)");
    }

    tokio::spawn(serve_static_placeholder(static_listener));
    tokio::spawn(serve_session_sockets(session_listener, hub.clone()));
    tokio::spawn(serve_management(management_listener, hub.clone()));

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, closing all sessions");
    hub.registry.close_all().await;
    ExitCode::SUCCESS
}

/// Static asset serving is an explicit out-of-scope external collaborator
/// (SPEC_FULL.md §1); this loop exists only so port `P` answers something
/// sane (`GET /healthz`) instead of refusing connections outright.
async fn serve_static_placeholder(listener: TcpListener) {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;

    async fn respond(req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = if req.uri().path() == "/healthz" {
            Response::new(Full::new(Bytes::from_static(b"ok")))
        } else {
            let mut response = Response::new(Full::new(Bytes::from_static(b"not found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        };
        Ok(response)
    }

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("failed to accept static-listener connection: {e}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new().serve_connection(io, service_fn(respond)).await {
                log::debug!("static-listener connection closed with error: {err:?}");
            }
        });
    }
}

async fn serve_session_sockets(listener: TcpListener, hub: Arc<Hub>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("failed to accept session-socket connection: {e}");
                continue;
            }
        };
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = session_socket::handle(stream, hub).await {
                log::debug!("session-socket connection closed with error: {e}");
            }
        });
    }
}

/// The management listener serves two protocols on the same port: raw TCP
/// connections that start a WebSocket handshake go to the management
/// socket, while HTTP/1 requests (the state-hook and `/ch-*` routes) are
/// dispatched by hyper. Distinguish by peeking the first bytes of the
/// handshake the way a reverse proxy would, since both protocols begin with
/// a plain HTTP/1.1 request line.
async fn serve_management(listener: TcpListener, hub: Arc<Hub>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("failed to accept management-listener connection: {e}");
                continue;
            }
        };
        let hub = hub.clone();
        tokio::spawn(async move {
            route_management_connection(stream, hub).await;
        });
    }
}

async fn route_management_connection(stream: tokio::net::TcpStream, hub: Arc<Hub>) {
    let mut peek_buf = [0u8; 4];
    if stream.peek(&mut peek_buf).await.is_err() {
        return;
    }
    if &peek_buf == b"GET " {
        if let Err(e) = management_socket::handle(stream, hub).await {
            log::debug!("management-socket connection closed with error: {e}");
        }
        return;
    }

    let io = hyper_util::rt::TokioIo::new(stream);
    if let Err(err) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, hyper::service::service_fn(move |req| {
            let hub = hub.clone();
            async move { hook_http::handle_one(req, hub).await }
        }))
        .await
    {
        log::debug!("state-hook connection closed with error: {err:?}");
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    tokio::select! {
        _ = sigint.recv() => log::info!("received SIGINT"),
        _ = sigterm.recv() => log::info!("received SIGTERM"),
        _ = sighup.recv() => log::info!("received SIGHUP"),
    }
}

#[cfg(windows)]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("received Ctrl-C");
}
