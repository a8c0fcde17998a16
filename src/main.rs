mod app;
mod config;
mod logging;
mod relay;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "relaykit", version, about = "Managed TCP/UDP port-forwarder")]
struct Cli {
    /// Path to the relaykit config file (.toml/.yaml/.yml). If omitted, uses
    /// RELAYD_CONFIG; then auto-detects relaykit.toml > relaykit.yaml >
    /// relaykit.yml from CWD; then falls back to the OS default config dir.
    #[arg(long, env = "RELAYD_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Bind address for the Prometheus metrics exporter (e.g. "127.0.0.1:9090").
    /// Overrides the config file's `metrics_addr` when set.
    #[arg(long, env = "RELAYD_METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    app::run(cli.config, cli.metrics_addr).await
}
