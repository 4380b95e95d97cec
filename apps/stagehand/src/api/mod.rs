//! # Stagehand HTTP API Module
//!
//! This module implements the HTTP REST API server using axum.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /screens/roster` - Open a roster screen
//! - `POST /screens/assignment` - Open an assignment screen
//! - `POST /screens/profile` - Open a profile screen
//! - `GET /screens/{id}` - Every stage's status, key, version, value and error
//! - `PUT /screens/{id}/root` - Set the root key (`null` clears)
//! - `PUT /screens/{id}/selection` - Pin the selected class (`null` unpins)
//! - `POST /screens/{id}/refresh` - Re-fetch the root; stages below reload (fresh cache entries are reused)
//! - `DELETE /screens/{id}` - Dispose the screen
//! - `POST /invalidate` - Drop a registry entry
//! - `GET /registry` - Registry counters
//!
//! ## Configuration (Environment Variables)
//!
//! - `STAGEHAND_CORS_ORIGINS`: Comma-separated list of allowed origins, or "*" for all (default: localhost only)

mod handlers;
mod types;

// Re-export handlers and types for integration tests (via `stagehand::api::*`)
pub use handlers::{
    close_screen_handler, get_screen_handler, health_handler, invalidate_handler,
    open_assignment_handler, open_profile_handler, open_roster_handler, refresh_handler,
    registry_handler, set_root_handler, set_selection_handler,
};
pub use types::{
    HealthResponse, InvalidateRequest, InvalidateResponse, KeyRequest, OpenAssignmentRequest,
    OpenProfileRequest, OpenRosterRequest, OpenScreenResponse, RegistryResponse,
};

use crate::config::Config;
use crate::error::AppError;
use crate::screens::{Screen, ScreenContext};
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    routing::{get, post, put},
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state: the screen context and every open screen.
#[derive(Clone)]
pub struct AppState {
    context: ScreenContext,
    screens: Arc<RwLock<BTreeMap<u64, Arc<Screen>>>>,
    next_id: Arc<AtomicU64>,
}

impl AppState {
    /// Create new app state around a screen context.
    #[must_use]
    pub fn new(context: ScreenContext) -> Self {
        Self {
            context,
            screens: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(ScreenContext::from_config(config))
    }

    #[must_use]
    pub fn context(&self) -> &ScreenContext {
        &self.context
    }

    async fn insert(&self, screen: Screen) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.screens.write().await.insert(id, Arc::new(screen));
        id
    }

    async fn screen(&self, id: u64) -> Result<Arc<Screen>, AppError> {
        self.screens
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(AppError::ScreenNotFound(id))
    }

    async fn remove(&self, id: u64) -> Result<Arc<Screen>, AppError> {
        self.screens
            .write()
            .await
            .remove(&id)
            .ok_or(AppError::ScreenNotFound(id))
    }

    async fn screen_count(&self) -> usize {
        self.screens.read().await.len()
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Build CORS layer from environment configuration.
///
/// Reads `STAGEHAND_CORS_ORIGINS`:
/// - If "*": allows all origins
/// - If not set: localhost only
/// - Otherwise: comma-separated list of allowed origins
fn build_cors_layer() -> CorsLayer {
    let origins_env = std::env::var("STAGEHAND_CORS_ORIGINS").ok();

    match origins_env.as_deref() {
        Some("*") => {
            tracing::warn!("CORS: Allowing ALL origins (STAGEHAND_CORS_ORIGINS=*)");
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed_origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| {
                    let trimmed = s.trim();
                    match trimmed.parse::<HeaderValue>() {
                        Ok(hv) => {
                            tracing::info!("CORS: Allowing origin: {}", trimmed);
                            Some(hv)
                        }
                        Err(e) => {
                            tracing::warn!("CORS: Invalid origin '{}': {}", trimmed, e);
                            None
                        }
                    }
                })
                .collect();

            if allowed_origins.is_empty() {
                tracing::warn!(
                    "CORS: No valid origins in STAGEHAND_CORS_ORIGINS, defaulting to localhost only"
                );
                build_localhost_cors()
            } else {
                cors_for(allowed_origins)
            }
        }
        None => build_localhost_cors(),
    }
}

fn build_localhost_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .into_iter()
    .filter_map(|origin| origin.parse::<HeaderValue>().ok())
    .collect();
    cors_for(origins)
}

fn cors_for(origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
///
/// Middleware stack (outer to inner): tracing, CORS, body limit.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/screens/roster", post(handlers::open_roster_handler))
        .route("/screens/assignment", post(handlers::open_assignment_handler))
        .route("/screens/profile", post(handlers::open_profile_handler))
        .route(
            "/screens/{id}",
            get(handlers::get_screen_handler).delete(handlers::close_screen_handler),
        )
        .route("/screens/{id}/root", put(handlers::set_root_handler))
        .route("/screens/{id}/selection", put(handlers::set_selection_handler))
        .route("/screens/{id}/refresh", post(handlers::refresh_handler))
        .route("/invalidate", post(handlers::invalidate_handler))
        .route("/registry", get(handlers::registry_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(build_cors_layer())
                .layer(axum::extract::DefaultBodyLimit::max(64 * 1024)),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Start the HTTP server; returns on Ctrl-C.
pub async fn run_server(addr: &str, state: AppState) -> Result<(), AppError> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Stagehand HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
