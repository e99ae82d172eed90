use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::state::ServerState;

pub async fn run(listen_addr: &str, state: ServerState) -> Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;

    info!("listening on {}", listener.local_addr()?);

    serve(listener, state).await
}

/// Accept loop over an already bound listener. Also starts the search worker.
pub async fn serve(listener: TcpListener, state: ServerState) -> Result<()> {
    tokio::spawn(crate::search::run(state.clone()));

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        let state = state.clone();

        tokio::spawn(async move {
            if let Err(err) = crate::conn::handle(state, socket, peer).await {
                warn!(%peer, "connection error: {err:#}");
            }
        });
    }
}
