use tandem::config::Config;
use tandem::signaling::SignalingClient;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::parse()?;
    let client = SignalingClient::connect(&config.signaling_host, config.signaling_port).await?;
    let peer_id = client.wait_for_peer_id().await?;
    info!(%peer_id, "ready; press ctrl-c to quit");

    tokio::signal::ctrl_c().await?;
    Ok(())
}
