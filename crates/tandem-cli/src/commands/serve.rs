//! Serve command handler

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use tandem_core::hub::{serve, CollabHub, HubServer, Pipeline};
use tandem_core::Config;

use super::open_stores;
use crate::output::Output;

/// Run the hub until interrupted
pub async fn run(config: &Config, listen: Option<String>, output: &Output) -> Result<()> {
    let addr = listen.unwrap_or_else(|| config.listen_addr.clone());
    let (changes, _) = open_stores(config)?;

    let hub = Arc::new(CollabHub::new(changes));
    let pipeline = Arc::new(Pipeline::new(HubServer::new(
        hub,
        config.auth_token.clone(),
    )));

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    output.message(&format!(
        "Hub listening on ws://{} (data in {})",
        listener.local_addr()?,
        config.data_dir.display()
    ));
    if config.auth_token.is_some() {
        output.message("Clients must present the configured auth token.");
    }

    tokio::select! {
        result = serve(listener, pipeline) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down hub");
            output.success("Hub stopped");
            Ok(())
        }
    }
}
