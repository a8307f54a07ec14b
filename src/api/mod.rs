pub mod auth;
pub mod error;
mod handlers;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    http::{HeaderName, HeaderValue},
    routing::get,
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::auth::Authenticator;
use crate::bridge::Bridge;
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

/// Default ceiling on concurrent authenticated WebSocket connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Default WebSocket message cap; large enough for a base64-encoded photo
/// at the default upload limit.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub bridge: Bridge,
    pub authenticator: Arc<dyn Authenticator>,
    pub shutdown: ShutdownCoordinator,
    /// Counter for open WebSocket connections.
    pub ws_count: Arc<AtomicUsize>,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub started: Instant,
}

impl AppState {
    pub fn new(
        bridge: Bridge,
        authenticator: Arc<dyn Authenticator>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            bridge,
            authenticator,
            shutdown,
            ws_count: Arc::new(AtomicUsize::new(0)),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            started: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Per-IP throttle on upgrade attempts, in requests per second.
    pub upgrade_rate_per_sec: Option<u32>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let ws_routes = Router::new()
        .route("/ws", get(ws))
        .with_state(state.clone());

    // Requires the server to be run with connect info for the peer address.
    let ws_routes = if let Some(rps) = config.upgrade_rate_per_sec {
        use tower_governor::{governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorLayer};
        let rps = rps.max(1);
        match GovernorConfigBuilder::default()
            .per_second(u64::from(rps))
            .burst_size(rps)
            .key_extractor(PeerIpKeyExtractor)
            .finish()
        {
            Some(governor_conf) => ws_routes.layer(GovernorLayer::new(Arc::new(governor_conf))),
            None => {
                tracing::warn!(rps, "invalid upgrade rate limit, throttle disabled");
                ws_routes
            }
        }
    } else {
        ws_routes
    };

    Router::new()
        .route("/health", get(health))
        .with_state(state)
        .merge(ws_routes)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
}
