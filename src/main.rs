use actix_web::{web, App, HttpServer};
use actix_cors::Cors;
use chat_relay::config::{BroadcastMode, CorsConfig};
use chat_relay::{AppError, AppState, Settings, WebSocketServer};
use dotenv::dotenv;
use std::net::TcpListener;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn cors(config: &CorsConfig) -> Cors {
    if !config.enabled {
        // CORS disabled - use most restrictive settings
        return Cors::default();
    }

    let cors = if config.allow_any_origin {
        Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
    } else {
        Cors::default()
            .allowed_origin("http://localhost:8080")
            .allowed_origin("http://127.0.0.1:8080")
            .allowed_methods(vec!["GET"])
    };

    cors.max_age(config.max_age as usize)
}

#[actix_web::main]
async fn main() -> chat_relay::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Load configuration
    let config = Settings::new()?;

    // Initialize logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();

    info!("Configuration loaded for environment {}", config.environment);

    // Initialize application state
    let state = AppState::new(config.clone()).await?;
    info!("Instance {} connected to {:?} broker", state.instance_id, config.broker.kind);

    let broadcast_listener = match config.relay.broadcast_mode {
        BroadcastMode::Shared => Some(
            state
                .relay
                .start_broadcast_listener(state.registry.clone())
                .await?,
        ),
        BroadcastMode::Local => None,
    };

    // Duplex endpoint
    let ws_listener =
        tokio::net::TcpListener::bind((config.websocket.host.as_str(), config.websocket.port)).await?;
    info!(
        "WebSocket server ready at ws://{}/ws/{{client_id}}",
        ws_listener.local_addr()?
    );
    let ws_server = Arc::new(WebSocketServer::new(state.registry.clone(), state.relay.clone()));
    let ws_task = tokio::spawn(ws_server.serve(ws_listener));

    // HTTP endpoints
    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))?;
    info!("Starting HTTP server at {}", listener.local_addr()?);

    let data = web::Data::new(state.clone());
    let cors_config = config.cors.clone();
    let served = HttpServer::new(move || {
        App::new()
            .wrap(cors(&cors_config))
            .app_data(data.clone())
            .configure(chat_relay::configure)
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .run()
    .await
    .map_err(|e| AppError::InternalError(e.to_string()));

    info!("Shutting down");
    ws_task.abort();
    if let Some(listener) = broadcast_listener {
        listener.abort();
    }
    if let Err(e) = state.shutdown().await {
        error!("Shutdown failed: {}", e);
    }

    served
}
