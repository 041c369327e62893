//! Connection limit middleware for media-stream WebSocket connections
//!
//! Each media stream carries one call, so the session cap of the registry is
//! the connection cap. Upgrades beyond it are refused before the handshake.
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use call_bridge::middleware::connection_limit_middleware;
//!
//! let app = Router::new()
//!     .route("/realtime-stream", get(media_stream_handler))
//!     .layer(axum::middleware::from_fn_with_state(
//!         state.clone(),
//!         connection_limit_middleware,
//!     ));
//! ```

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::errors::AppError;
use crate::state::AppState;

/// Whether the request asks for a WebSocket upgrade
pub fn is_websocket_upgrade(request: &Request<Body>) -> bool {
    request
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Middleware that rejects WebSocket upgrades while the registry is full.
///
/// Returns 503 Service Unavailable at capacity. Non-WebSocket requests pass
/// through without limit checks. The registry still enforces the cap when
/// the session is created, so a race past this check ends in an apology.
pub async fn connection_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !is_websocket_upgrade(&request) {
        return next.run(request).await;
    }

    if state.registry.is_at_capacity() {
        tracing::warn!(
            active_sessions = state.active_sessions(),
            "Rejecting media stream: session capacity reached"
        );
        return AppError::ServiceUnavailable(
            "Server at capacity. Please try again later.".to_string(),
        )
        .into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_websocket_upgrade() {
        let request = Request::builder()
            .uri("/realtime-stream")
            .header("upgrade", "WebSocket")
            .body(Body::empty())
            .unwrap();
        assert!(is_websocket_upgrade(&request));

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        assert!(!is_websocket_upgrade(&request));
    }
}
