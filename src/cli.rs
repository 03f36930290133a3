//! Process flags, parsed with `clap`'s derive API.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "duoproxy", about = "Dual-protocol HTTP/SOCKS5 forwarding proxy")]
pub struct Args {
    /// Client-facing dual-protocol listening port.
    #[arg(long, default_value_t = 1080)]
    pub listen_port: u16,

    /// Monitoring HTTP/WS port.
    #[arg(long, default_value_t = 8090)]
    pub monitor_port: u16,

    /// Path to the IP allow-list TOML file.
    #[arg(long, default_value = "/etc/duoproxy/allowed_ips.toml")]
    pub allow_list: PathBuf,

    /// Optional static dashboard directory, served at `/` and `/static/*path`.
    #[arg(long)]
    pub dashboard_dir: Option<PathBuf>,

    /// Raise the log level to debug and log per-connection errors verbosely.
    #[arg(long)]
    pub debug: bool,
}
