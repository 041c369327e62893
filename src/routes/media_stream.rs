//! Media-stream WebSocket route configuration

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::media_stream::media_stream_handler;
use crate::handlers::twiml::MEDIA_STREAM_PATH;
use crate::state::AppState;
use std::sync::Arc;

/// Create the media-stream WebSocket router
///
/// # Endpoint
///
/// `GET /realtime-stream?type=<profile>` - WebSocket upgrade for one phone call
///
/// # Protocol
///
/// The carrier sends JSON text frames: an optional `connected`, then `start`
/// (call and stream identifiers), a sequence of `media` frames with base64
/// G.711 µ-law audio, and finally `stop`. The server answers with `media`
/// frames carrying the agent's audio for the same stream.
///
/// # Example
///
/// ```json
/// // Carrier sends
/// {"event": "start", "start": {"streamSid": "MZ...", "callSid": "CA..."}}
/// {"event": "media", "media": {"payload": "/////w=="}, "streamSid": "MZ..."}
///
/// // Server responds
/// {"event": "media", "streamSid": "MZ...", "media": {"payload": "/////w=="}}
/// ```
pub fn create_media_stream_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(MEDIA_STREAM_PATH, get(media_stream_handler))
        .layer(TraceLayer::new_for_http())
}
