pub mod admin;
pub mod health;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use admin::{
    broadcast_handler, presence_handler, send_handler, stats_handler, storage_stats_handler,
};
pub use health::{health_handler, health_live_handler, health_ready_handler, metrics_handler};
pub use websocket::hub_websocket_handler;
