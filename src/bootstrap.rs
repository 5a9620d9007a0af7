//! Bootstrap Sequencer
//!
//! Deterministic startup ordering: seed the session from a shared snapshot
//! or local persistence, fetch the backend configuration and the
//! knowledge-graph catalog, and only then open the live channel. A failure
//! at any step never leaves a half-open connection.

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::api::{http_client, ApiClient, ApiError};
use crate::endpoint::Endpoint;
use crate::protocol::Task;
use crate::session::SessionController;
use crate::share::{ShareClient, ShareError};
use crate::store::Store;
use crate::transport::{ConnectionState, Transport, TransportError, TransportEvent};

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("failed to fetch backend config: {0}")]
    Config(ApiError),
    #[error("failed to fetch knowledge graph catalog: {0}")]
    Catalog(ApiError),
    #[error("failed to open live connection: {0}")]
    Connect(TransportError),
}

pub struct BootstrapOptions {
    pub endpoint: Endpoint,
    /// Shared conversation to load instead of local persistence.
    pub share_id: Option<String>,
    /// Task override from the command line.
    pub task: Option<Task>,
}

/// Everything the dispatch loop needs once startup is done.
pub struct Ready {
    pub controller: SessionController,
    pub transport: Transport,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    /// Backend configuration, opaque and display-only.
    pub config: Value,
    pub share: ShareClient,
}

pub async fn bootstrap(opts: BootstrapOptions, store: Store) -> Result<Ready, BootstrapError> {
    let http = http_client();
    let api = ApiClient::new(http.clone(), opts.endpoint.clone());
    let share = ShareClient::new(http, opts.endpoint.clone(), store.share_token());

    let mut controller = SessionController::new(store);
    match &opts.share_id {
        Some(id) => match share.load(id).await {
            Ok(snapshot) => controller.seed_from_snapshot(snapshot),
            // a pinned status: reloading the same link would only fail again
            Err(ShareError::NotFound) => {
                warn!(id = %id, "Shared snapshot not found");
                controller.set_status(
                    format!("Shared conversation '{id}' was not found. The link may have expired."),
                    true,
                );
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Failed to load shared snapshot");
                controller.set_status(format!("Failed to load shared conversation: {e}"), true);
            }
        },
        None => controller.restore_from_store(),
    }

    if let Some(task) = opts.task {
        // nothing is in flight yet, cannot fail
        let _ = controller.set_task(task);
    }

    controller.set_connection_state(ConnectionState::Connecting);
    let (config, catalog) = tokio::join!(api.fetch_config(), api.fetch_knowledge_graphs());
    let config = config.map_err(BootstrapError::Config)?;
    let catalog = catalog.map_err(BootstrapError::Catalog)?;
    controller.apply_catalog(catalog);

    let (transport, events) = Transport::connect(&opts.endpoint.live_url())
        .await
        .map_err(BootstrapError::Connect)?;
    controller.set_connection_state(ConnectionState::Connected);
    info!(kgs = controller.knowledge_graphs().len(), "Bootstrap complete");

    Ok(Ready {
        controller,
        transport,
        events,
        config,
        share,
    })
}
