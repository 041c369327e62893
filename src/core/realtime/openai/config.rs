//! OpenAI Realtime API configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::codec::AudioEncoding;
use crate::core::realtime::base::{ErrorPolicy, RealtimeError, RealtimeResult, ReconnectionConfig};

/// OpenAI Realtime API WebSocket endpoint.
pub const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Default realtime model.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";

/// Default connect timeout per attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Voices
// =============================================================================

/// Available voices for OpenAI Realtime API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenAIRealtimeVoice {
    #[default]
    Alloy,
    Ash,
    Ballad,
    Coral,
    Echo,
    Sage,
    Shimmer,
    Verse,
}

impl OpenAIRealtimeVoice {
    /// Convert to the API parameter value.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alloy => "alloy",
            Self::Ash => "ash",
            Self::Ballad => "ballad",
            Self::Coral => "coral",
            Self::Echo => "echo",
            Self::Sage => "sage",
            Self::Shimmer => "shimmer",
            Self::Verse => "verse",
        }
    }

    /// Parse from string, with fallback to default.
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "ash" => Self::Ash,
            "ballad" => Self::Ballad,
            "coral" => Self::Coral,
            "echo" => Self::Echo,
            "sage" => Self::Sage,
            "shimmer" => Self::Shimmer,
            "verse" => Self::Verse,
            _ => Self::Alloy,
        }
    }
}

impl std::fmt::Display for OpenAIRealtimeVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Everything an [`OpenAIRealtime`](super::OpenAIRealtime) session needs.
#[derive(Debug, Clone)]
pub struct OpenAIRealtimeConfig {
    pub api_key: String,
    /// Endpoint without query string; the model is appended as `?model=`.
    pub url: String,
    pub model: String,
    pub voice: OpenAIRealtimeVoice,
    pub temperature: f32,
    /// Encoding used for both directions of backend audio.
    pub audio_format: AudioEncoding,
    /// Enables caller transcription when set.
    pub transcription_model: Option<String>,
    /// Ask the agent to speak first after configuration.
    pub send_greeting: bool,
    pub connect_timeout: Duration,
    pub reconnection: ReconnectionConfig,
    pub error_policy: ErrorPolicy,
}

impl Default for OpenAIRealtimeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: OPENAI_REALTIME_URL.to_string(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
            voice: OpenAIRealtimeVoice::default(),
            temperature: 0.7,
            audio_format: AudioEncoding::G711Ulaw,
            transcription_model: None,
            send_greeting: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnection: ReconnectionConfig::default(),
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl OpenAIRealtimeConfig {
    /// Check the values a connection cannot work without.
    pub fn validate(&self) -> RealtimeResult<()> {
        if self.api_key.is_empty() {
            return Err(RealtimeError::AuthenticationFailed(
                "API key is required".to_string(),
            ));
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(RealtimeError::InvalidConfiguration(format!(
                "Realtime URL must use ws:// or wss://, got '{}'",
                self.url
            )));
        }
        if self.model.trim().is_empty() {
            return Err(RealtimeError::InvalidConfiguration(
                "Realtime model must not be empty".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(RealtimeError::InvalidConfiguration(format!(
                "Temperature must be between 0.0 and 2.0, got {}",
                self.temperature
            )));
        }
        Ok(())
    }

    /// WebSocket URL with the model parameter.
    pub fn ws_url(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}model={}",
            self.url.trim_end_matches('/'),
            separator,
            self.model
        )
    }
}
