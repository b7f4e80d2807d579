use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use truenas_client::Client;

#[derive(Parser, Debug)]
#[command(name = "csi-controller")]
#[command(about = "TrueNAS CSI volume provisioner")]
struct Args {
    /// Appliance WebSocket URL, e.g. wss://nas.example.com/api/current
    #[arg(long, env = "TRUENAS_URL")]
    url: String,

    /// Appliance API key
    #[arg(long, env = "TRUENAS_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Skip TLS certificate verification (self-signed appliances)
    #[arg(long, default_value_t = false)]
    tls_skip_verify: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    info!(url = %args.url, "Connecting to appliance");
    let client = Client::connect(&args.url, &args.api_key, args.tls_skip_verify)
        .await
        .inspect_err(|e| error!(error = %e, "Failed to connect to appliance"))?;

    info!("Controller ready");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    client.close().await;
    Ok(())
}
