use anyhow::Context;
use fanout_relay::{server, Broker, RelayConfig};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config)?;

    let broker = Broker::new(config.broker_config());
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        shards = broker.shard_count(),
        max_frame_bytes = config.max_frame_bytes,
        "starting fanout relay"
    );

    server::serve(listener, broker, config.max_frame_bytes, server::shutdown_signal())
        .await
        .context("relay server exited unexpectedly")?;

    info!("relay stopped");
    Ok(())
}

fn init_tracing(config: &RelayConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .with_context(|| format!("invalid log filter `{}`", config.log_filter))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
    .map_err(|error| anyhow::anyhow!(error))
    .context("failed to install tracing subscriber")
}
