//! TwiML voice webhooks
//!
//! The carrier calls these when a phone call arrives. The answer tells it to
//! say a short connecting message and open a media stream back to this server.
//! A spoken/keypad menu lets a single number pick the business profile.

use axum::{
    Form,
    extract::State,
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::call_control::xml_escape;
use crate::core::session::BusinessProfile;
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

/// Path of the media-stream WebSocket
pub const MEDIA_STREAM_PATH: &str = "/realtime-stream";

const CONNECTED_MESSAGE: &str = "You're now connected. Please start speaking.";

const VOICE_MENU_PATH: &str = "/twilio/voice-menu";
const SELECT_BUSINESS_PATH: &str = "/twilio/select-business";
const MENU_GATHER_TIMEOUT_SECS: u32 = 5;

/// Strip scheme and trailing slashes from a configured URL or Host header
pub fn public_host(url: &str) -> &str {
    let url = url.trim();
    let host = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    host.trim_end_matches('/')
}

/// `wss://` URL of the media stream for `profile`
pub fn stream_url(host: &str, profile: BusinessProfile) -> String {
    match profile {
        BusinessProfile::Default => format!("wss://{host}{MEDIA_STREAM_PATH}"),
        other => format!("wss://{host}{MEDIA_STREAM_PATH}?type={}", other.as_str()),
    }
}

/// TwiML that connects the call to the media stream
pub fn connect_twiml(host: &str, profile: BusinessProfile) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
<Response>\
<Say voice=\"alice\">{}</Say>\
<Pause length=\"1\"/>\
<Connect><Stream url=\"{}\"/></Connect>\
<Say voice=\"alice\">{}</Say>\
</Response>",
        xml_escape(profile.connecting_message()),
        xml_escape(&stream_url(host, profile)),
        CONNECTED_MESSAGE
    )
}

fn resolve_host(state: &AppState, headers: &HeaderMap) -> AppResult<String> {
    let configured = state
        .config
        .public_url
        .as_deref()
        .map(public_host)
        .filter(|h| !h.is_empty());

    let host = match configured {
        Some(host) => host.to_string(),
        None => headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(public_host)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                AppError::BadRequest("PUBLIC_URL is not set and the request has no Host header".to_string())
            })?,
    };
    Ok(host)
}

fn answer_call(
    state: &AppState,
    headers: &HeaderMap,
    profile: BusinessProfile,
) -> AppResult<Response> {
    let host = resolve_host(state, headers)?;
    let twiml = connect_twiml(&host, profile);
    info!(profile = %profile, host = %host, "Answering call with media stream");

    Ok(xml_response(twiml))
}

/// `POST /twilio/realtime`
pub async fn realtime_call(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Response> {
    answer_call(&state, &headers, BusinessProfile::Default)
}

/// `POST /twilio/salon`
pub async fn salon_call(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Response> {
    answer_call(&state, &headers, BusinessProfile::Salon)
}

/// `POST /twilio/restaurant`
pub async fn restaurant_call(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Response> {
    answer_call(&state, &headers, BusinessProfile::Restaurant)
}

/// TwiML for the business selection menu. Without input it loops back to itself.
pub fn voice_menu_twiml() -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
<Response>\
<Say voice=\"alice\">Thank you for calling. Please say 'restaurant' for restaurant reservations \
or 'salon' for salon appointments.</Say>\
<Gather input=\"speech dtmf\" timeout=\"{MENU_GATHER_TIMEOUT_SECS}\" action=\"{SELECT_BUSINESS_PATH}\" \
method=\"POST\" language=\"en-US\">\
<Say voice=\"alice\">Say 'restaurant' or press 1 for restaurant reservations. \
Say 'salon' or press 2 for salon appointments.</Say>\
</Gather>\
<Redirect method=\"POST\">{VOICE_MENU_PATH}</Redirect>\
</Response>"
    )
}

/// Menu answer posted back by the carrier's `<Gather>`
#[derive(Debug, Default, Deserialize)]
pub struct BusinessSelection {
    #[serde(rename = "SpeechResult", default)]
    pub speech_result: Option<String>,
    #[serde(rename = "Digits", default)]
    pub digits: Option<String>,
    #[serde(rename = "CallSid", default)]
    pub call_sid: Option<String>,
}

impl BusinessSelection {
    /// Profile picked by the caller, if the answer names one
    pub fn profile(&self) -> Option<BusinessProfile> {
        let speech = self
            .speech_result
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();
        let digits = self.digits.as_deref().map(str::trim);

        if speech.contains("restaurant") || digits == Some("1") {
            Some(BusinessProfile::Restaurant)
        } else if speech.contains("salon") || speech.contains("hair") || digits == Some("2") {
            Some(BusinessProfile::Salon)
        } else {
            None
        }
    }
}

/// TwiML answering a menu selection: hand off to the profile's webhook, or
/// repeat the menu
pub fn selection_twiml(profile: Option<BusinessProfile>) -> String {
    let body = match profile {
        Some(profile) => format!(
            "<Say voice=\"alice\">Thank you for choosing our {} service. Connecting you now.</Say>\
<Pause length=\"1\"/>\
<Redirect method=\"POST\">/twilio/{}</Redirect>",
            profile.as_str(),
            profile.as_str()
        ),
        None => format!(
            "<Say voice=\"alice\">I'm sorry, I didn't understand your selection. Let's try again.</Say>\
<Redirect method=\"POST\">{VOICE_MENU_PATH}</Redirect>"
        ),
    };
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response>{body}</Response>")
}

fn xml_response(twiml: String) -> Response {
    ([(header::CONTENT_TYPE, "application/xml")], twiml).into_response()
}

/// `POST /twilio/voice-menu`
pub async fn voice_menu() -> Response {
    info!("Answering call with business menu");
    xml_response(voice_menu_twiml())
}

/// `POST /twilio/select-business`
pub async fn select_business(Form(selection): Form<BusinessSelection>) -> Response {
    let call_sid = selection.call_sid.as_deref().unwrap_or("unknown");
    let profile = selection.profile();
    match profile {
        Some(profile) => info!(call_sid = %call_sid, profile = %profile, "Business selected"),
        None => warn!(
            call_sid = %call_sid,
            speech = ?selection.speech_result,
            digits = ?selection.digits,
            "Unrecognized business selection"
        ),
    }
    xml_response(selection_twiml(profile))
}
