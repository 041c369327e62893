//! Realtime conversational backend module.
//!
//! A backend session accepts streamed caller audio and emits streamed agent
//! audio plus incremental transcripts as a typed event stream.
//!
//! # Architecture
//!
//! - [`BackendSession`] trait for backend abstraction
//! - [`RealtimeFactory`] for creating one session per call
//! - Events delivered through a single-consumption channel
//!
//! # Example
//!
//! ```rust,ignore
//! use call_bridge::core::realtime::{OpenAIRealtimeConfig, OpenAIRealtimeFactory, RealtimeFactory};
//!
//! let factory = OpenAIRealtimeFactory::new(OpenAIRealtimeConfig {
//!     api_key: "sk-...".to_string(),
//!     ..Default::default()
//! })?;
//! let backend = factory.create_session()?;
//! ```

mod base;
pub mod openai;

pub use base::{
    BackendEvent, BackendEventStream, BackendSession, ConnectionState,
    DEFAULT_RECOVERABLE_ERROR_CODES, ErrorPolicy, RealtimeError, RealtimeFactory, RealtimeResult,
    ReconnectionConfig, SessionSetup, SharedBackend, TranscriptRole,
};
pub use openai::{
    OPENAI_REALTIME_URL, OpenAIRealtime, OpenAIRealtimeConfig, OpenAIRealtimeFactory,
    OpenAIRealtimeVoice,
};
