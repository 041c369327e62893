//! Base traits and types for realtime conversational backends.
//!
//! A backend session carries exactly one phone call. Telephony audio is
//! forwarded as opaque base64 frames and the backend answers with a stream
//! of [`BackendEvent`]s: synthesized audio, transcript fragments, turn-taking
//! markers and errors.
//!
//! # Supported Backends
//!
//! - OpenAI Realtime API (gpt-4o-realtime-preview)

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during realtime operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Connection to the backend failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Session error
    #[error("Session error: {0}")]
    SessionError(String),
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

// =============================================================================
// Configuration Types
// =============================================================================

/// Retry behaviour for establishing a backend connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectionConfig {
    /// Enable retries after a failed attempt.
    /// Default: true
    pub enabled: bool,

    /// Maximum number of connection attempts before giving up.
    /// Set to 0 for unlimited attempts.
    /// Default: 3
    pub max_attempts: u32,

    /// Initial delay between attempts (milliseconds).
    /// Default: 250ms
    pub initial_delay_ms: u64,

    /// Maximum delay between attempts (milliseconds).
    /// Default: 2000ms
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    /// Default: 2.0
    pub backoff_multiplier: f32,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_delay_ms: 250,
            max_delay_ms: 2000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectionConfig {
    /// Calculate the delay for a given attempt number using exponential backoff.
    /// Returns the delay in milliseconds.
    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        let base_delay = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier as f64;

        // Exponential backoff: base_delay * multiplier^(attempt-1)
        let delay = base_delay * multiplier.powi(attempt.saturating_sub(1) as i32);
        delay.min(self.max_delay_ms as f64) as u64
    }

    /// Check if another attempt is allowed after `attempt` attempts were made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt < self.max_attempts)
    }
}

/// Error codes treated as recoverable when none are configured.
pub const DEFAULT_RECOVERABLE_ERROR_CODES: &[&str] =
    &["server_error", "rate_limit_exceeded", "rate_limit_error"];

/// Classifies backend error codes into recoverable and fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPolicy {
    recoverable: HashSet<String>,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RECOVERABLE_ERROR_CODES.iter().copied())
    }
}

impl ErrorPolicy {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            recoverable: codes
                .into_iter()
                .map(|c| c.as_ref().trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }

    /// Returns true when any of the given identifiers names a recoverable error.
    ///
    /// Backends report both a specific `code` and a broader `type`; a match on
    /// either is enough.
    pub fn is_recoverable(&self, code: Option<&str>, kind: Option<&str>) -> bool {
        [code, kind]
            .into_iter()
            .flatten()
            .any(|c| self.recoverable.contains(&c.to_ascii_lowercase()))
    }
}

/// Per-call backend configuration rendered from the call's business profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSetup {
    /// System instructions for the agent
    pub instructions: String,
    /// Prompt that makes the agent speak first, if any
    pub greeting: Option<String>,
}

impl SessionSetup {
    /// Setup for re-initializing a call already in progress: the caller has
    /// been greeted once.
    pub fn resumed(&self) -> Self {
        Self {
            instructions: self.instructions.clone(),
            greeting: None,
        }
    }
}

// =============================================================================
// Event Types
// =============================================================================

/// Connection state of a backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Closed => write!(f, "Closed"),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}

/// Speaker of a transcript fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    /// The caller
    User,
    /// The AI agent
    Agent,
}

impl fmt::Display for TranscriptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptRole::User => write!(f, "user"),
            TranscriptRole::Agent => write!(f, "agent"),
        }
    }
}

/// Typed notification emitted by a backend session.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Synthesized audio for the caller, base64 in the backend's output encoding.
    AudioDelta {
        payload: String,
        turn_id: Option<String>,
    },
    /// A transcript fragment for one turn.
    TranscriptDelta {
        turn_id: String,
        role: TranscriptRole,
        text: String,
        is_final: bool,
    },
    /// The caller started speaking.
    SpeechStarted { turn_id: Option<String> },
    /// The caller stopped speaking.
    SpeechStopped { turn_id: Option<String> },
    /// A segment of caller audio was committed as a user turn.
    BufferCommitted { turn_id: String },
    /// Backend-reported error, classified by the session's [`ErrorPolicy`].
    Error {
        code: String,
        message: String,
        fatal: bool,
    },
    /// A response finished.
    Done,
}

/// Single-consumption stream of backend events.
///
/// The stream ends (yields `None`) when the backend connection is gone.
pub type BackendEventStream = mpsc::UnboundedReceiver<BackendEvent>;

// =============================================================================
// Backend Trait
// =============================================================================

/// One connection to a realtime conversational backend.
///
/// All methods take `&self` so a session can be shared between the
/// telephony-read task and the backend-event task.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Open and configure the backend connection.
    ///
    /// Retries with bounded backoff and returns `false` once attempts are
    /// exhausted. Calling it again after the event stream ended starts a
    /// fresh connection with a fresh event stream.
    async fn initialize(&self, call_id: &str, setup: &SessionSetup) -> bool;

    /// Forward one base64 audio frame.
    ///
    /// A closed connection is a logged no-op, not an error.
    async fn send_audio(&self, payload: &str) -> RealtimeResult<()>;

    /// Take the event stream of the current connection.
    ///
    /// Can be taken once per successful `initialize`.
    fn events(&self) -> RealtimeResult<BackendEventStream>;

    /// Close the connection. Idempotent and safe from concurrent callers.
    async fn close(&self);

    /// Whether the connection is currently open.
    fn is_ready(&self) -> bool;
}

// =============================================================================
// Factory
// =============================================================================

/// Shared trait object for backend sessions.
pub type SharedBackend = Arc<dyn BackendSession>;

/// Creates a fresh backend session per call.
pub trait RealtimeFactory: Send + Sync {
    fn create_session(&self) -> RealtimeResult<SharedBackend>;
}
