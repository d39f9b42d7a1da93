use clap::Parser;
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

use vigil::probe::{AgentConfig, ProbeAgent};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Override the hub URL from the environment
    #[arg(long)]
    hub_url: Option<String>,

    /// Region label stamped onto results from this probe
    #[arg(long)]
    region: Option<String>,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("vigil", LevelFilter::DEBUG),
        ("vigil_probe", LevelFilter::DEBUG),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let mut config = AgentConfig::from_env()?;
    if let Some(hub_url) = args.hub_url {
        config.hub_url = hub_url;
    }
    if let Some(region) = args.region {
        config.region = region;
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let agent = ProbeAgent::new(config);
    let agent_task = tokio::spawn(agent.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, draining");
    let _ = shutdown_tx.send(true);
    agent_task.await??;
    Ok(())
}
