use clap::Parser;

/// Multiplexing RTSP proxy: shares one authenticated upstream camera
/// connection between many viewers.
#[derive(Parser, Debug, Clone)]
#[command(name = "rtsp-fanout-proxy", version)]
pub struct Config {
    /// TCP port to listen on for RTSP clients.
    #[arg(short, long, env = "RTSP_PROXY_PORT", default_value_t = 554)]
    pub port: u16,

    /// Address to bind the listener to.
    #[arg(long, env = "RTSP_PROXY_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Log destination: "-" for stderr, anything else a file path opened in
    /// append mode.
    #[arg(short, long, env = "RTSP_PROXY_LOG", default_value = "-")]
    pub log: String,
}
