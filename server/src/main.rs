//! Chaos proxy binary
//!
//! This is the main entry point for the chaos proxy server.

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use engine::{ChaosEngine, ConfigPatch};
use server::ProxyServer;

#[derive(Parser, Debug)]
#[command(name = "chaos-proxy")]
#[command(about = "HTTP reverse proxy that injects failure modes into proxied traffic")]
struct Args {
    /// Bind address for the server
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Listen port (falls back to the PORT environment variable, then 3001)
    #[arg(short, long)]
    port: Option<u16>,

    /// Upstream target URL to forward proxied requests to
    #[arg(short, long)]
    target_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let subscriber = if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .finish()
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .finish()
    };
    tracing::subscriber::set_global_default(subscriber)?;

    let port = args
        .port
        .or_else(|| env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(3001);
    let bind_address = SocketAddr::new(
        args.host.parse().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        port,
    );

    let chaos_engine = Arc::new(ChaosEngine::new());
    if let Some(target_url) = args.target_url {
        info!("🎯 Forwarding proxied requests to {target_url}");
        chaos_engine
            .update_config(ConfigPatch {
                target_url: Some(target_url),
                enabled: None,
            })
            .await;
    }

    info!("🚀 Starting chaos proxy on {bind_address}");

    let proxy = ProxyServer::new(chaos_engine, bind_address);
    if let Err(e) = proxy.run().await {
        error!("❌ Server error: {e}");
        return Err(e.into());
    }

    info!("👋 Chaos proxy shut down gracefully");
    Ok(())
}
