use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::{api, twiml};
use crate::state::AppState;
use std::sync::Arc;

/// Create the HTTP router: health, banner and the carrier's voice webhooks
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(api::root))
        .route("/health", get(api::health_check))
        .route("/twilio/realtime", post(twiml::realtime_call))
        .route("/twilio/salon", post(twiml::salon_call))
        .route("/twilio/restaurant", post(twiml::restaurant_call))
        .route("/twilio/voice-menu", post(twiml::voice_menu))
        .route("/twilio/select-business", post(twiml::select_business))
        .layer(TraceLayer::new_for_http())
}
