//! OpenAI Realtime API backend.
//!
//! # Features
//!
//! - Bidirectional audio streaming in G.711 or PCM16
//! - Caller and agent transcripts
//! - Server-side voice activity detection
//! - Agent-first greeting
//!
//! # Supported Voices
//!
//! alloy, ash, ballad, coral, echo, sage, shimmer, verse

mod client;
mod config;
mod messages;

pub use client::{OpenAIRealtime, OpenAIRealtimeFactory};
pub use config::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_REALTIME_MODEL, OPENAI_REALTIME_URL, OpenAIRealtimeConfig,
    OpenAIRealtimeVoice,
};
pub use messages::{ClientEvent, ConversationItem, ServerEvent, SessionConfig, TurnDetection};
