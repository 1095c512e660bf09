use anyhow::Context;
use clap::Parser;
use rtsp_fanout_proxy::config::Config;
use rtsp_fanout_proxy::server::Server;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::parse();
    init_logging(&config.log)?;

    let listener = TcpListener::bind((config.bind.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.bind, config.port))?;
    info!(bind = %config.bind, port = config.port, "rtsp proxy listening");

    let server = Server::new();
    server.run(listener).await
}

fn init_logging(destination: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if destination == "-" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(destination)
            .with_context(|| format!("failed to open log file {destination}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Arc::new(file))
            .init();
    }
    Ok(())
}
