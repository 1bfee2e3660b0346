//! Realtime presence and fan-out for the Flitch messenger.
//!
//! The chat service embeds this crate: it builds an [`AppState`] with its own
//! [`directory::ChatDirectory`], hands it to [`serve`], and keeps a clone of
//! `state.notifier` to announce committed mutations. The bundled binary runs with an
//! empty in-memory directory and no publisher, which is only useful for local testing
//! of the socket layer.

use std::sync::Arc;

use axum::{routing::get, Router};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod config;
pub mod directory;
pub mod events;
pub mod fanout;
pub mod handlers;
pub mod ids;
pub mod metrics;
pub mod notifier;
pub mod presence;
pub mod rooms;
pub mod ws_registry;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::directory::ChatDirectory;
use crate::fanout::EventFanout;
use crate::metrics::Metrics;
use crate::notifier::MessengerNotifier;
use crate::presence::PresenceTracker;
use crate::rooms::RoomMembership;
use crate::ws_registry::ConnectionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub fanout: EventFanout,
    pub notifier: MessengerNotifier,
    pub directory: Arc<dyn ChatDirectory>,
    pub verifier: Arc<TokenVerifier>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: &Config, directory: Arc<dyn ChatDirectory>) -> Result<Self, prometheus::Error> {
        let metrics = Metrics::new()?;
        let presence = Arc::new(PresenceTracker::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(RoomMembership::new()),
            metrics.clone(),
            config.connection_buffer,
        ));
        let fanout = EventFanout::new(presence, metrics.clone(), config.delivery_timeout);
        Ok(Self {
            notifier: MessengerNotifier::new(fanout.clone()),
            fanout,
            directory,
            verifier: Arc::new(TokenVerifier::new(config.jwt_secret.as_bytes())),
            metrics,
        })
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        self.fanout.presence()
    }
}

/// Start the idle-connection pruner and serve the router until ctrl-c.
pub async fn serve(config: &Config, state: AppState) -> std::io::Result<()> {
    presence::spawn_stale_pruner(
        state.presence().clone(),
        config.prune_interval,
        config.ping_timeout_secs,
    );

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "realtime server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("listen for shutdown signal: {:?}", e);
    }
    tracing::info!("shutting down");
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(handlers::ws::ws_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryChatDirectory;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> AppState {
        let config = Config::from_lookup(|key| (key == "JWT_SECRET").then(|| "secret".to_string())).unwrap();
        AppState::new(&config, Arc::new(InMemoryChatDirectory::new())).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = build_router(state())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_are_exposed() {
        let state = state();
        let (_conn, _rx) = state.presence().connect(crate::ids::UserId::new());

        let response = build_router(state)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("flitch_realtime_online_users 1"));
    }
}
