use clap::Parser;
use elevator_coordination::{config::Cli, node};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    // the order handler / elevator FSM collaborator is out of this core's
    // scope (§1); a standalone binary has nothing to drive the channel
    // surface with, so it just holds the handles open (the unbounded
    // outbound channels need no reader to keep running) until interrupted.
    let _handles = node::spawn(config).await?;
    tokio::signal::ctrl_c().await?;
    Ok(())
}
