//! Telephony media-stream message types
//!
//! Frames are JSON text messages discriminated by their `event` field. The
//! inbound set is closed: an event type not listed here fails to decode and
//! the frame is logged and skipped.

use serde::{Deserialize, Serialize};

// =============================================================================
// Incoming Messages (Carrier -> Bridge)
// =============================================================================

/// Incoming media-stream frame
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum MediaStreamEvent {
    /// Socket acknowledged; carries no payload the bridge needs
    Connected {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },

    /// Stream metadata; yields the call and stream identifiers
    Start {
        start: StreamStart,
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },

    /// One base64 audio frame
    Media {
        media: MediaPayload,
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },

    /// Playback of a previously sent mark finished
    Mark {
        #[serde(default)]
        mark: Option<MarkPayload>,
    },

    /// Caller pressed a key
    Dtmf {
        #[serde(default)]
        dtmf: Option<DtmfPayload>,
    },

    /// The stream ended
    Stop {
        #[serde(default)]
        stop: Option<StreamStop>,
    },
}

impl MediaStreamEvent {
    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The `event` discriminator, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            MediaStreamEvent::Connected { .. } => "connected",
            MediaStreamEvent::Start { .. } => "start",
            MediaStreamEvent::Media { .. } => "media",
            MediaStreamEvent::Mark { .. } => "mark",
            MediaStreamEvent::Dtmf { .. } => "dtmf",
            MediaStreamEvent::Stop { .. } => "stop",
        }
    }
}

/// Payload of the `start` event
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StreamStart {
    #[serde(rename = "streamSid", default)]
    pub stream_sid: Option<String>,

    #[serde(rename = "callSid", default)]
    pub call_sid: Option<String>,

    #[serde(rename = "accountSid", default, skip_serializing_if = "Option::is_none")]
    pub account_sid: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tracks: Vec<String>,

    #[serde(rename = "mediaFormat", default, skip_serializing_if = "Option::is_none")]
    pub media_format: Option<MediaFormat>,
}

/// Audio format announced in the `start` event
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MediaFormat {
    #[serde(default)]
    pub encoding: String,

    #[serde(rename = "sampleRate", default)]
    pub sample_rate: u32,

    #[serde(default)]
    pub channels: u16,
}

/// Payload of a `media` event
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MediaPayload {
    pub payload: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DtmfPayload {
    pub digit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StreamStop {
    #[serde(rename = "callSid", default)]
    pub call_sid: Option<String>,
}

// =============================================================================
// Outgoing Messages (Bridge -> Carrier)
// =============================================================================

/// Agent audio frame for the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMedia {
    /// Always `"media"`
    pub event: String,
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
    pub media: OutboundPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub payload: String,
}

impl OutboundMedia {
    pub fn new(stream_sid: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            event: "media".to_string(),
            stream_sid: stream_sid.into(),
            media: OutboundPayload {
                payload: payload.into(),
            },
        }
    }
}

/// Work item for the telephony writer task
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Send a media frame
    Media(OutboundMedia),
    /// Send a close frame and stop writing
    Close,
}
