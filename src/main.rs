use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use duel::config::Config;
use duel::state::ServerState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    let state = ServerState::new(config.arena());

    duel::server::run(&config.listen_addr(), state).await
}
