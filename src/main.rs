use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use mcp_gateway::{config::GatewayConfig, server::Server, GatewayContext};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mcp-gatewayd", about = "Concurrent MCP gateway server", version)]
struct Args {
    /// WebSocket server port
    #[arg(long, env = "GATEWAY_PORT")]
    port: Option<u16>,

    /// Path to a TOML config file
    #[arg(long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "mcp_gateway=debug,info"
    #[arg(long, env = "GATEWAY_LOG")]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = GatewayConfig::load(args.config, args.port, args.log.clone())
        .context("loading gateway configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(port = config.server.port, "starting gateway");

    let ctx = GatewayContext::new(config);
    let reporter = ctx.start();
    let server = Server::new(ctx.clone());

    let result = server.run().await;

    reporter.abort();
    ctx.stop().await;

    if let Err(e) = &result {
        error!(err = %e, "gateway exited with error");
    }
    result
}
