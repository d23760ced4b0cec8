// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Parley Relay Node
//!
//! Entry point for the `parley-node` binary. Parses CLI arguments, initializes
//! logging and metrics, and serves the relay RPC surface.
//!
//! The binary supports five subcommands:
//!
//! - `run`    : start a relay node
//! - `health` : ask a node whether it is serving
//! - `send`   : send a payload to another party through a node
//! - `recv`   : fetch a delivered payload from a node
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;
mod tls;

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tower::Service;

use parley_protocol::config::{MAILBOX_PURGE_INTERVAL, PROTOCOL_VERSION};
use parley_protocol::{
    ClientTls, ConnectionPool, HttpChannelFactory, Mailbox, MemoryMailbox, RelayClient,
    RelayService, SledMailbox, Topology,
};

use cli::{ClientArgs, Commands, MailboxKind, ParleyNodeCli};
use logging::LogFormat;
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ParleyNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Health(args) => query_health(args).await,
        Commands::Send(args) => send_message(args).await,
        Commands::Recv(args) => recv_message(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the relay: RPC server, mailbox purge loop and optional metrics
/// endpoint.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        &logging::default_directives(&args.log_level),
        LogFormat::from_str_lossy(&args.log_format),
    );

    tracing::info!(
        party = %args.party,
        port = args.port,
        topology = %args.topology.display(),
        mailbox = ?args.mailbox,
        metrics_port = ?args.metrics_port,
        "starting parley-node"
    );

    // --- Topology ---
    let topology = Arc::new(
        Topology::load(&args.topology, args.party.clone())
            .with_context(|| format!("failed to load topology from {}", args.topology.display()))?,
    );
    tracing::info!(parties = topology.len(), "topology loaded");

    // --- TLS ---
    let tls_material = tls::load_material(&args.pem_path, &args.env)?;
    let acceptor = tls_material
        .as_ref()
        .map(|material| tls::server_config(material).map(|config| TlsAcceptor::from(Arc::new(config))))
        .transpose()?;

    // --- Connection pool ---
    let factory = HttpChannelFactory::new(tls_material.as_ref().map(tls::TlsMaterial::identity))
        .with_timeout(Duration::from_millis(args.call_timeout_ms));
    let pool = Arc::new(
        ConnectionPool::new(Arc::clone(&topology), factory)
            .with_idle_timeout(Duration::from_secs(args.idle_timeout_secs)),
    );

    // --- Mailbox ---
    let mut sled_mailbox = None;
    let mailbox: Arc<dyn Mailbox> = match args.mailbox {
        MailboxKind::Memory => Arc::new(MemoryMailbox::new()),
        MailboxKind::Sled => {
            let path = args.data_dir.join("mailbox");
            std::fs::create_dir_all(&path)
                .with_context(|| format!("failed to create mailbox directory: {}", path.display()))?;
            let sled = Arc::new(
                SledMailbox::open(&path)
                    .with_context(|| format!("failed to open mailbox at {}", path.display()))?,
            );
            tracing::info!(path = %path.display(), entries = sled.len(), "mailbox opened");
            sled_mailbox = Some(Arc::clone(&sled));
            sled
        }
    };

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    // --- Relay service ---
    let service = Arc::new(
        RelayService::new(Arc::clone(&pool), Arc::clone(&mailbox))
            .with_message_ttl(Duration::from_secs(args.message_ttl_secs)),
    );
    let app_state = api::AppState {
        party: args.party.clone(),
        version: format!("{} (protocol {})", env!("CARGO_PKG_VERSION"), PROTOCOL_VERSION),
        service,
        metrics: Arc::clone(&node_metrics),
    };
    let router = api::create_router(app_state, args.max_message_bytes);

    // --- Mailbox purge ---
    let purge_loop = tokio::spawn(purge_expired_loop(
        Arc::clone(&mailbox),
        Arc::clone(&node_metrics),
    ));

    // --- Metrics server ---
    let metrics_server = match args.metrics_port {
        Some(port) => {
            let metrics_router = axum::Router::new()
                .route("/metrics", axum::routing::get(metrics::metrics_handler))
                .with_state(Arc::clone(&node_metrics));
            let metrics_addr = format!("0.0.0.0:{}", port);
            let metrics_listener = TcpListener::bind(&metrics_addr)
                .await
                .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
            tracing::info!("metrics server listening on {}", metrics_addr);
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                    tracing::error!("metrics server error: {}", e);
                }
            }))
        }
        None => None,
    };

    // --- Relay server ---
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", addr))?;

    match acceptor {
        Some(acceptor) => {
            tracing::info!("relay listening on {} (tls)", addr);
            tokio::select! {
                res = serve_tls(listener, acceptor, router) => res?,
                _ = shutdown_signal() => {
                    tracing::info!("shutdown signal received");
                }
            }
        }
        None => {
            tracing::info!("relay listening on {} (plaintext)", addr);
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("relay server error")?;
            tracing::info!("shutdown signal received, connections drained");
        }
    }

    // --- Shutdown ---
    purge_loop.abort();
    if let Some(server) = metrics_server {
        server.abort();
    }
    pool.close_all();
    if let Some(sled) = sled_mailbox {
        if let Err(e) = sled.flush() {
            tracing::error!("failed to flush mailbox: {}", e);
        }
    }
    tracing::info!("parley-node stopped");
    Ok(())
}

/// Accepts TLS connections and serves `router` over HTTP/1.1 on each.
async fn serve_tls(listener: TcpListener, acceptor: TlsAcceptor, router: axum::Router) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let acceptor = acceptor.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(%peer, "tls handshake failed: {}", err);
                    return;
                }
            };
            let io = TokioIo::new(tls_stream);
            let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                router.clone().call(request)
            });
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(%peer, "connection closed with error: {}", err);
            }
        });
    }
}

/// Periodically drops expired mailbox entries.
async fn purge_expired_loop(mailbox: Arc<dyn Mailbox>, metrics: Arc<NodeMetrics>) {
    let mut interval = tokio::time::interval(MAILBOX_PURGE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match mailbox.purge_expired().await {
            Ok(0) => {}
            Ok(removed) => {
                metrics.mailbox_purged_total.inc_by(removed as u64);
                tracing::debug!(removed, backend = mailbox.backend(), "expired messages purged");
            }
            Err(e) => tracing::warn!("mailbox purge failed: {}", e),
        }
    }
}

// ---------------------------------------------------------------------------
// Client Subcommands
// ---------------------------------------------------------------------------

fn read_pem(path: &Option<std::path::PathBuf>) -> Result<Option<Vec<u8>>> {
    path.as_ref()
        .map(|p| std::fs::read(p).with_context(|| format!("failed to read {}", p.display())))
        .transpose()
}

fn build_client(args: &ClientArgs) -> Result<RelayClient> {
    let tls = ClientTls::from_parts(read_pem(&args.ca)?, read_pem(&args.key)?, read_pem(&args.cert)?);
    Ok(RelayClient::new(args.party.clone())
        .with_url(args.url.clone())
        .with_tls(tls)
        .with_timeout(Duration::from_millis(args.timeout_ms)))
}

async fn query_health(args: ClientArgs) -> Result<()> {
    logging::init_logging("warn", LogFormat::Pretty);
    let client = build_client(&args)?;
    let status = client
        .health_check()
        .await
        .with_context(|| format!("health check against {} failed", args.url))?;
    println!("{}", status);
    Ok(())
}

async fn send_message(args: cli::SendArgs) -> Result<()> {
    logging::init_logging("warn", LogFormat::Pretty);
    let client = build_client(&args.client)?;

    let payload = match &args.file {
        Some(path) => std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf).context("failed to read stdin")?;
            buf
        }
    };
    let message_id = args
        .message_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let delivered = client
        .send(&args.receiver, &message_id, &payload)
        .await
        .with_context(|| format!("failed to send {} to {}", message_id, args.receiver))?;
    if !delivered {
        anyhow::bail!("{} rejected message {}", args.receiver, message_id);
    }
    println!("{}", message_id);
    Ok(())
}

async fn recv_message(args: cli::RecvArgs) -> Result<()> {
    logging::init_logging("warn", LogFormat::Pretty);
    let client = build_client(&args.client)?;

    let payload = client
        .recv(&args.message_id)
        .await
        .with_context(|| format!("failed to receive {}", args.message_id))?;
    write_payload(args.out.as_deref(), &payload)
}

fn write_payload(out: Option<&Path>, payload: &[u8]) -> Result<()> {
    match out {
        Some(path) => std::fs::write(path, payload).with_context(|| format!("failed to write {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(payload)?;
            stdout.flush()?;
            Ok(())
        }
    }
}

/// Prints version information to stdout.
fn print_version() {
    println!("parley-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol    {}", PROTOCOL_VERSION);
    println!("rustc       {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed, that signal is simply never observed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
