use std::sync::Arc;

use crate::AppState;
use crate::config::{HubConfig, ServerConfig, ServerFileConfig};
use crate::db::Database;
use crate::hub::queue::OfflineMessageQueue;
use crate::hub::state::HubContext;
use crate::hub::transport::TransportSockets;
use crate::metrics::HubMetrics;
use crate::repository::test_helpers::test_repository;

/// Hub collaborators backed by an in-memory SQLite database, with no
/// auto-reply and no idle expiry configured on the transport.
pub async fn test_hub_context() -> HubContext {
    let config = HubConfig::default();
    HubContext {
        queue: OfflineMessageQueue::new(
            test_repository().await,
            config.queue_capacity,
            config.default_ttl_secs,
        ),
        transport: Arc::new(TransportSockets::new(None, None)),
        metrics: Arc::new(HubMetrics::new()),
    }
}

/// Build a fully-wired `AppState` (running hub actor included) backed by an
/// in-memory SQLite database.
pub async fn test_app_state() -> AppState {
    test_app_state_with(HubConfig::default()).await
}

pub async fn test_app_state_with(hub_config: HubConfig) -> AppState {
    let repository = test_repository().await;
    let db = Arc::new(Database {
        pool: repository.pool.clone(),
    });
    crate::build_app_state(
        db,
        &hub_config,
        ServerConfig::from_file(&ServerFileConfig::default()),
    )
}
