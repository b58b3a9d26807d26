// Tether demo: `tether server` prints what clients send, `tether client` sends stdin lines.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tether_net::{config, Client, ConnectionId, ConnectionState, Error, Handler, Listener, Server};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "usage: tether <server|client> [--host HOST] [--port PORT]";

fn main() -> anyhow::Result<()> {
    let mut mode = None;
    let mut host = None;
    let mut port = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("tether {}", VERSION);
                return Ok(());
            }
            "server" | "client" => mode = Some(arg),
            "--host" => host = Some(args.next().context("--host needs a value")?),
            "--port" => {
                let p = args.next().context("--port needs a value")?;
                port = Some(p.parse::<u16>().with_context(|| format!("invalid port {p}"))?);
            }
            other => anyhow::bail!("unknown argument {other}\n{USAGE}"),
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tether=info,tether_net=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut cfg = config::load();
    if let Some(h) = host {
        cfg.host = h;
    }
    if let Some(p) = port {
        cfg.port = p;
    }
    cfg.protocol.validate().context("invalid protocol settings")?;

    let rt = tokio::runtime::Runtime::new()?;
    match mode.as_deref() {
        Some("server") => rt.block_on(run_server(cfg)),
        Some("client") => rt.block_on(run_client(cfg)),
        _ => anyhow::bail!(USAGE),
    }
}

struct PrintHandler;

impl Handler for PrintHandler {
    fn on_data(&self, id: ConnectionId, payload: Bytes) {
        println!("{id} ({} bytes): {}", payload.len(), String::from_utf8_lossy(&payload));
    }

    fn on_connection_closed(&self, id: ConnectionId) {
        println!("{id} closed");
    }

    fn on_connection_opened(&self, id: ConnectionId, peer: SocketAddr) {
        println!("{id} connected from {peer}");
    }
}

/// Listen, print inbound frames, broadcast each stdin line to every client.
async fn run_server(cfg: config::Config) -> anyhow::Result<()> {
    let server = Arc::new(Server::listen(cfg.port, &cfg.protocol, Arc::new(PrintHandler)).await?);
    let input = server.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match input.broadcast(line.as_bytes()) {
                Ok(n) => tracing::info!(clients = n, "broadcast"),
                Err(e) => tracing::warn!(error = %e, "broadcast failed"),
            }
        }
    });
    shutdown_signal().await?;
    Ok(())
}

struct PrintListener;

impl Listener for PrintListener {
    fn on_status_changed(&self, state: ConnectionState) {
        println!("[{state}]");
    }

    fn on_data(&self, payload: Bytes) {
        println!("server ({} bytes): {}", payload.len(), String::from_utf8_lossy(&payload));
    }

    fn on_connect_failed(&self, error: &Error) {
        eprintln!("{error}");
    }
}

/// Connect, send each stdin line as one frame, print what the server sends back.
async fn run_client(cfg: config::Config) -> anyhow::Result<()> {
    let client = Client::new(&cfg.protocol)?;
    client.connect(Arc::new(PrintListener), &cfg.host, cfg.port);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Err(e) = client.send(line.as_bytes()) {
                        tracing::warn!(error = %e, "send failed");
                    }
                }
                None => break,
            },
            res = &mut shutdown => {
                res?;
                break;
            }
        }
    }
    client.disconnect();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
