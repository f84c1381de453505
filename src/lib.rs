pub mod config;
pub mod error;
pub mod message;
pub mod relay;
pub mod websocket;

use std::sync::Arc;
use actix_web::{web, HttpResponse};
use tracing::info;
use uuid::Uuid;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use message::{ClientId, Message, BROADCAST_ID, SERVICE_ID};
pub use relay::{Broker, MemoryBroker, RedisBroker, SharedRelay};
pub use websocket::{ConnectionRegistry, Session, WebSocketServer};

/// Health check endpoint handler
/// Returns a JSON response with server status, timestamp and local load
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "instance_id": state.instance_id,
        "local_clients": state.registry.connection_count().await,
    }))
}

/// Registers the HTTP routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/last_messages", web::get().to(relay::handlers::last_messages));
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub instance_id: Uuid,
    pub registry: Arc<ConnectionRegistry>,
    pub relay: Arc<SharedRelay>,
}

impl AppState {
    pub async fn new(config: Settings) -> Result<Self> {
        let broker = relay::connect_broker(&config.broker).await?;
        Ok(Self::with_broker(config, broker))
    }

    pub fn with_broker(config: Settings, broker: Arc<dyn Broker>) -> Self {
        let relay = SharedRelay::new(broker, config.relay.clone());
        Self {
            config: Arc::new(config),
            instance_id: Uuid::new_v4(),
            registry: Arc::new(ConnectionRegistry::new()),
            relay: Arc::new(relay),
        }
    }

    /// Asks every local socket to close; their sessions tear themselves down.
    pub async fn shutdown(&self) -> Result<()> {
        let ids = self.registry.connected_ids().await;
        info!("Closing {} local connections", ids.len());
        for id in ids {
            self.registry.close(id).await;
        }
        Ok(())
    }
}
