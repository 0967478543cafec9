//! Peerchat node
//!
//! Runs one chat node: a libp2p transport, the chat session on top of it,
//! and two command injectors feeding the session's outbound queue.
//!
//! ## Usage
//!
//! ```bash
//! # Listen on the default port, HTTP injector on 8080
//! peerchat
//!
//! # Custom ports and a relay to reserve a slot on at startup
//! peerchat -p 4001 -P 9090 -r /ip4/1.2.3.4/tcp/4001/p2p/12D3KooW...
//!
//! # Inject commands over HTTP
//! curl localhost:8080/connect/ip4/10.0.0.2/tcp/16600/p2p/12D3KooW...
//! curl localhost:8080/message/hello
//!
//! # ...or type them on stdin
//! /connect /ip4/10.0.0.2/tcp/16600/p2p/12D3KooW...
//! hello
//! ```

mod http;
mod stdin;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use peerchat_core::{Libp2pTransport, NodeConfig, NodeSession};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Peerchat - peer-to-peer text chat
#[derive(Parser, Debug)]
#[command(name = "peerchat")]
#[command(version = "0.1.0")]
#[command(about = "Peerchat - peer-to-peer text chat node")]
#[command(
    long_about = "A peer-to-peer text chat node. Chat lines and /connect or /relay commands are read from stdin and from a small HTTP injector, and fanned out to every connected peer."
)]
struct Cli {
    /// IPv4 address to listen on
    #[arg(short = 'i', long = "ip", default_value = "0.0.0.0")]
    ip: String,

    /// TCP port for peer connections
    #[arg(short = 'p', long, default_value_t = 16600)]
    port: u16,

    /// Port of the HTTP command injector
    #[arg(short = 'P', long = "http-port", default_value_t = 8080)]
    http_port: u16,

    /// Relay multiaddr to reserve a slot on at startup
    #[arg(short = 'r', long)]
    relay: Option<String>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Do not read commands from stdin
    #[arg(long)]
    no_stdin: bool,
}

impl Cli {
    fn node_config(&self) -> NodeConfig {
        NodeConfig {
            bind_ip: self.ip.clone(),
            port: self.port,
            http_port: self.http_port,
            relay_address: self.relay.clone(),
        }
    }
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = cli.node_config();
    config.validate()?;

    let transport = Libp2pTransport::spawn(&config).await?;
    let session = Arc::new(NodeSession::start(config.clone(), transport.clone()).await?);

    let shutdown = CancellationToken::new();
    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let mut http = tokio::spawn(http::serve(session.clone(), http_addr, shutdown.clone()));

    if !cli.no_stdin {
        tokio::spawn(stdin::forward_lines(
            tokio::io::BufReader::new(tokio::io::stdin()),
            session.queue(),
        ));
    }

    // A failing HTTP server ends the node as well
    let http_result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            None
        }
        result = &mut http => Some(result),
    };

    shutdown.cancel();
    session.shutdown().await;

    let http_result = match http_result {
        Some(result) => result,
        None => http.await,
    };
    transport.shutdown().await;

    http_result??;
    Ok(())
}
