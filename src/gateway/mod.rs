//! HTTP and WebSocket gateway
//!
//! ```text
//!   client ──ws──► /ws ──► Dispatcher ──► SessionRegistry ──► actors
//!      ▲                       │                                 │
//!      └──── direct replies ◄──┘                                 │
//!      └──── broadcast events ◄──── EventBroadcaster ◄───────────┘
//! ```

pub mod handler;
pub mod ws;

use crate::config::GatewayConfig;
use crate::protocol::Dispatcher;
use crate::session::SessionRegistry;
use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state handed to every route
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Dispatcher,
}

impl GatewayState {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            dispatcher: Dispatcher::new(Arc::clone(&registry)),
            registry,
        }
    }
}

/// Build the gateway router
pub fn router(state: GatewayState, config: &GatewayConfig) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .route("/health", get(handler::health_check))
        .route("/api/sessions", get(handler::list_sessions))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&config.cors_origins)),
        )
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Bind and serve until Ctrl+C, then stop every session
pub async fn serve(config: &GatewayConfig, registry: Arc<SessionRegistry>) -> crate::Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    tracing::info!(
        "agentdeck gateway listening on {}",
        listener.local_addr()?
    );

    serve_with_shutdown(listener, config, registry, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
    })
    .await
}

/// Serve on an existing listener until `shutdown` resolves
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    config: &GatewayConfig,
    registry: Arc<SessionRegistry>,
    shutdown: F,
) -> crate::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(GatewayState::new(Arc::clone(&registry)), config);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("Shutting down sessions...");
    let outcome = registry.shutdown().await;
    tracing::info!(
        stopped = outcome.succeeded,
        failed = outcome.failed,
        "Gateway stopped"
    );
    Ok(())
}
