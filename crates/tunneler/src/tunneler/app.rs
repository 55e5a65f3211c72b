use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args, Subcommand};
use tokio::{net::TcpListener, sync::watch, task::JoinSet};

use crate::tunneler::{
    auth::TokenAuthority,
    config, logging, net, telemetry,
    tunnel::{
        client::{self, ClientOptions, TunnelKind},
        protocol::Protocol,
        server::{self, ServerOptions, ServerState},
    },
};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the tunnel server (WebSocket responder).
    Serve(ServeArgs),
    /// Open one tunnel through a server.
    Connect(ConnectArgs),
    /// Print a signed bearer token for a user.
    Token(TokenArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// HTTP listen address (overrides server.listen_addr).
    #[arg(short, long)]
    pub address: Option<String>,
}

#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Server WebSocket URL (overrides client.server_url).
    #[arg(short, long)]
    pub server: Option<String>,

    /// Local tunnel: listen here, connect from the server.
    #[arg(
        short = 'L',
        value_name = "[BIND_HOST:]BIND_PORT:HOST:PORT",
        conflicts_with = "remote",
        required_unless_present = "remote"
    )]
    pub local: Option<String>,

    /// Remote tunnel: listen on the server, connect from here.
    #[arg(
        short = 'R',
        value_name = "[BIND_HOST:]BIND_PORT:HOST:PORT",
        required_unless_present = "local"
    )]
    pub remote: Option<String>,

    /// Tunnel protocol.
    #[arg(short, long, default_value = "tcp", value_parser = ["tcp", "udp"])]
    pub protocol: String,

    /// Bearer token (overrides client.token).
    #[arg(long, env = "TUNNELER_TOKEN")]
    pub token: Option<String>,
}

#[derive(Debug, Args)]
pub struct TokenArgs {
    /// Subject of the token.
    #[arg(short, long)]
    pub user: String,

    /// Lifetime in days.
    #[arg(short, long, default_value_t = 30)]
    pub days: u64,
}

pub async fn run(
    config_path: Option<PathBuf>,
    verbose: u8,
    command: Command,
) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let cfg = config::load_or_default(&resolved)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging, verbose)?;
    let _logrt_guard = logrt; // keep alive

    tracing::debug!(config = %resolved.path.display(), source = %resolved.source, "config: resolved");

    match command {
        Command::Serve(args) => serve(cfg, args).await,
        Command::Connect(args) => connect(cfg, args).await,
        Command::Token(args) => token(&cfg, &args),
    }
}

async fn serve(mut cfg: config::Config, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(addr) = args.address {
        cfg.server.listen_addr = addr;
    }

    let auth = TokenAuthority::new(cfg.server.secret_key.as_deref());
    if auth.is_random() {
        tracing::warn!("server: no secret_key configured; using a random key (no token will validate)");
    }
    if cfg.server.allow_anonymous {
        tracing::warn!("server: anonymous connections allowed; running without authentication");
    }

    let prom = Arc::new(telemetry::init_prometheus()?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr = net::normalize_bind_addr(&cfg.server.listen_addr).into_owned();
    let ln = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("server: bind {addr}"))?;

    tracing::info!(
        addr = %addr,
        path = %cfg.server.path,
        chunk_size = cfg.mux.chunk_size,
        dial_timeout = %humantime::format_duration(cfg.mux.dial_timeout),
        "tunneler: starting server"
    );

    let state = ServerState {
        opts: Arc::new(ServerOptions {
            path: cfg.server.path.clone(),
            allow_anonymous: cfg.server.allow_anonymous,
            mux: cfg.mux.clone(),
        }),
        auth: Arc::new(auth),
        prometheus: Some(prom),
        shutdown: shutdown_rx,
    };

    let mut tasks = JoinSet::new();
    tasks.spawn(server::serve(ln, state));

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Open tunnels observe the shutdown flag; only cap the wait if something hangs.
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn connect(mut cfg: config::Config, args: ConnectArgs) -> anyhow::Result<()> {
    if let Some(url) = args.server {
        cfg.client.server_url = url.trim().to_string();
    }
    if let Some(t) = args.token {
        cfg.client.token = Some(t);
    }
    cfg.validate()?;

    let protocol: Protocol = args.protocol.parse()?;
    let (kind, raw) = match (args.local, args.remote) {
        (Some(l), None) => (TunnelKind::Local, l),
        (None, Some(r)) => (TunnelKind::Remote, r),
        _ => anyhow::bail!("connect: exactly one of -L or -R is required"),
    };
    let spec = net::TunnelSpec::parse(protocol, &raw)?;

    let opts = ClientOptions {
        server_url: cfg.client.server_url.clone(),
        token: cfg.client.token.clone(),
        connect_timeout: cfg.client.connect_timeout,
        mux: cfg.mux.clone(),
    };

    tracing::info!(server = %opts.server_url, tunnel = %spec, kind = ?kind, "tunneler: starting client");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tunnel = client::run(&opts, kind, &spec, shutdown_rx);
    tokio::pin!(tunnel);

    tokio::select! {
        res = &mut tunnel => res,
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
            tunnel.await
        }
    }
}

fn token(cfg: &config::Config, args: &TokenArgs) -> anyhow::Result<()> {
    let auth = TokenAuthority::new(cfg.server.secret_key.as_deref());
    let token = auth
        .issue(&args.user, args.days)
        .context("token: issue")?;
    println!("{token}");
    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
