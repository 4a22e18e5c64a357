//! Example CLI binary wiring [`relay_proxy::ProxyServer::listen`] to a
//! single `target`, using the usual `clap::Parser` +
//! `tracing_subscriber` bootstrap.

use std::net::SocketAddr;

use clap::Parser;
use relay_proxy::{ProxyOptions, ProxyServer};
use tracing::info;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Programmable HTTP/HTTPS/WebSocket reverse proxy")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "RELAY_PROXY_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Upstream target URL, e.g. http://127.0.0.1:3000.
    #[arg(long, env = "RELAY_PROXY_TARGET")]
    target: String,

    /// Rewrite the Host header to the target's.
    #[arg(long, env = "RELAY_PROXY_CHANGE_ORIGIN", default_value_t = false)]
    change_origin: bool,

    /// Append X-Forwarded-* headers.
    #[arg(long, env = "RELAY_PROXY_XFWD", default_value_t = true)]
    xfwd: bool,

    /// Skip upstream TLS certificate verification.
    #[arg(long, env = "RELAY_PROXY_INSECURE", default_value_t = false)]
    insecure: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_proxy=info,hyper=warn".into()),
        )
        .compact()
        .init();

    let mut options = ProxyOptions::new().target(args.target.as_str()).xfwd(args.xfwd);
    options.change_origin = args.change_origin;
    options.secure = !args.insecure;

    let server = std::sync::Arc::new(ProxyServer::new(options));

    let handle = match server.listen(args.listen).await {
        Ok(h) => h,
        Err(e) => {
            eprintln!("failed to bind {}: {e}", args.listen);
            std::process::exit(1);
        }
    };

    info!(addr = %handle.local_addr(), target = %args.target, "relay-proxy listening");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            handle.close();
        }
    }
    handle.wait().await;
}
