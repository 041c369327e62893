//! Per-call session state.
//!
//! A [`CallSession`] is created once the telephony handshake has produced a
//! call and stream identifier. It carries the lifecycle state machine, the
//! transcript and the audio captured in both directions.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::core::realtime::{SessionSetup, SharedBackend};
use crate::core::transcript::{TranscriptReconciler, TranscriptTurn};

// =============================================================================
// State machine
// =============================================================================

/// Lifecycle of a call session.
///
/// ```text
/// INIT -> HANDSHAKING -> ACTIVE -> DRAINING -> CLOSED
///              \______________________________/  (backend never came up)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    #[default]
    Init,
    Handshaking,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Init, Handshaking)
                | (Handshaking, Active)
                | (Handshaking, Closed)
                | (Active, Draining)
                | (Draining, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Init => "INIT",
            SessionState::Handshaking => "HANDSHAKING",
            SessionState::Active => "ACTIVE",
            SessionState::Draining => "DRAINING",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Illegal session transition {from} -> {to}")]
    IllegalTransition { from: SessionState, to: SessionState },
}

// =============================================================================
// Business profiles
// =============================================================================

/// Selects the agent's instructions for a call. Fixed at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusinessProfile {
    /// General call-center intake
    #[default]
    Default,
    /// Elegant Styles salon booking
    Salon,
    /// Gourmet Delights restaurant reservations
    Restaurant,
}

const DEFAULT_INSTRUCTIONS: &str = "You are a friendly call center agent. Speak naturally and keep every answer short.\n\
Collect the following, one question at a time, waiting for the caller's answer before moving on:\n\
1. Greet the caller and ask for their name.\n\
2. Ask for a phone number where they can be reached.\n\
3. Ask for the reason for their call.\n\
4. Summarize what you collected and ask the caller to confirm it.\n\
Never ask more than one question in a single turn.";

const SALON_INSTRUCTIONS: &str = "You are the booking assistant for Elegant Styles, a hair and beauty salon. Speak naturally and keep answers short.\n\
Help the caller book an appointment, one question at a time:\n\
1. Greet the caller and ask for their name.\n\
2. Ask which service they would like (haircut, coloring, styling, manicure or pedicure).\n\
3. Ask for their preferred date and time.\n\
4. Ask for a phone number to confirm the booking.\n\
5. Read the booking back and ask the caller to confirm it.";

const RESTAURANT_INSTRUCTIONS: &str = "You are the reservation assistant for Gourmet Delights restaurant. Speak naturally and keep answers short.\n\
Help the caller reserve a table, one question at a time:\n\
1. Greet the caller and ask for their name.\n\
2. Ask for the number of guests.\n\
3. Ask for the preferred date and time.\n\
4. Ask about dietary requirements or special occasions.\n\
5. Ask for a phone number, then read the reservation back and ask the caller to confirm it.";

impl BusinessProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessProfile::Default => "default",
            BusinessProfile::Salon => "salon",
            BusinessProfile::Restaurant => "restaurant",
        }
    }

    /// Parse the `type` query parameter of a media-stream URL.
    ///
    /// Unknown or missing values select [`BusinessProfile::Default`].
    pub fn from_query(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("salon") => BusinessProfile::Salon,
            Some("restaurant") => BusinessProfile::Restaurant,
            _ => BusinessProfile::Default,
        }
    }

    /// System instructions for the agent.
    pub fn instructions(&self) -> &'static str {
        match self {
            BusinessProfile::Default => DEFAULT_INSTRUCTIONS,
            BusinessProfile::Salon => SALON_INSTRUCTIONS,
            BusinessProfile::Restaurant => RESTAURANT_INSTRUCTIONS,
        }
    }

    /// Prompt that makes the agent open the conversation.
    pub fn greeting_prompt(&self) -> &'static str {
        match self {
            BusinessProfile::Default => "Please greet the user and ask for their name.",
            BusinessProfile::Salon => {
                "Please greet the caller on behalf of Elegant Styles and ask for their name."
            }
            BusinessProfile::Restaurant => {
                "Please greet the caller on behalf of Gourmet Delights and ask for their name."
            }
        }
    }

    /// Spoken while the media stream is being connected.
    pub fn connecting_message(&self) -> &'static str {
        match self {
            BusinessProfile::Default => "Please wait while we connect you to our voice assistant.",
            BusinessProfile::Salon => {
                "Please wait while we connect you to Elegant Styles salon booking assistant."
            }
            BusinessProfile::Restaurant => {
                "Please wait while we connect you to Gourmet Delights reservation assistant."
            }
        }
    }

    /// Backend configuration for this profile.
    pub fn setup(&self) -> SessionSetup {
        SessionSetup {
            instructions: self.instructions().to_string(),
            greeting: Some(self.greeting_prompt().to_string()),
        }
    }
}

impl fmt::Display for BusinessProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Audio buffers
// =============================================================================

/// Ordered, capped buffer of base64 audio frames for one direction.
#[derive(Debug, Clone, Default)]
pub struct AudioBuffer {
    frames: Vec<String>,
    max_frames: usize,
    dropped: u64,
}

impl AudioBuffer {
    pub fn new(max_frames: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_frames,
            dropped: 0,
        }
    }

    /// Append a frame. Returns `false` once the cap is reached.
    pub fn push(&mut self, frame: &str) -> bool {
        if self.frames.len() >= self.max_frames {
            self.dropped += 1;
            return false;
        }
        self.frames.push(frame.to_string());
        true
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames refused because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.frames)
    }
}

/// Frames captured in both directions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioBuffers {
    /// Caller audio, in arrival order
    pub inbound: Vec<String>,
    /// Agent audio, in arrival order
    pub outbound: Vec<String>,
}

// =============================================================================
// Call session
// =============================================================================

/// Everything the bridge tracks for one phone call.
///
/// Shared between the telephony-read task and the backend-event task. The
/// inbound buffer is written only by the read task; the transcript and the
/// outbound buffer only by the event task.
pub struct CallSession {
    call_id: String,
    stream_id: String,
    profile: BusinessProfile,
    started_at: OffsetDateTime,
    state: Mutex<SessionState>,
    transcript: Mutex<TranscriptReconciler>,
    inbound: Mutex<AudioBuffer>,
    outbound: Mutex<AudioBuffer>,
    backend: Mutex<Option<SharedBackend>>,
    torn_down: AtomicBool,
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.call_id)
            .field("stream_id", &self.stream_id)
            .field("profile", &self.profile)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CallSession {
    pub fn new(
        call_id: impl Into<String>,
        stream_id: impl Into<String>,
        profile: BusinessProfile,
        max_buffered_frames: usize,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            stream_id: stream_id.into(),
            profile,
            started_at: OffsetDateTime::now_utc(),
            state: Mutex::new(SessionState::Init),
            transcript: Mutex::new(TranscriptReconciler::new()),
            inbound: Mutex::new(AudioBuffer::new(max_buffered_frames)),
            outbound: Mutex::new(AudioBuffer::new(max_buffered_frames)),
            backend: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn profile(&self) -> BusinessProfile {
        self.profile
    }

    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to `next`.
    ///
    /// Returns `Ok(false)` when already in `next` (re-entry of DRAINING or
    /// CLOSED is a no-op) and an error for transitions the machine forbids.
    pub fn transition(&self, next: SessionState) -> Result<bool, SessionError> {
        let mut state = self.state.lock();
        let current = *state;

        if current == next {
            return Ok(false);
        }
        if !current.can_transition_to(next) {
            return Err(SessionError::IllegalTransition {
                from: current,
                to: next,
            });
        }

        *state = next;
        drop(state);

        tracing::info!(
            call_id = %self.call_id,
            stream_id = %self.stream_id,
            "Session state {} -> {}",
            current,
            next
        );
        Ok(true)
    }

    /// Enter DRAINING from ACTIVE. Any other state is left untouched.
    pub fn begin_draining(&self) -> bool {
        let mut state = self.state.lock();
        if *state != SessionState::Active {
            return false;
        }
        *state = SessionState::Draining;
        drop(state);

        tracing::info!(call_id = %self.call_id, "Session state ACTIVE -> DRAINING");
        true
    }

    // -------------------------------------------------------------------------
    // Transcript
    // -------------------------------------------------------------------------

    /// Run `f` with exclusive access to the transcript.
    pub fn with_transcript<R>(&self, f: impl FnOnce(&mut TranscriptReconciler) -> R) -> R {
        f(&mut self.transcript.lock())
    }

    /// Snapshot of the transcript turns.
    pub fn transcript(&self) -> Vec<TranscriptTurn> {
        self.transcript.lock().turns().to_vec()
    }

    // -------------------------------------------------------------------------
    // Audio
    // -------------------------------------------------------------------------

    /// Record a caller frame. Returns `false` if the buffer is full.
    pub fn push_inbound(&self, frame: &str) -> bool {
        let mut buffer = self.inbound.lock();
        let accepted = buffer.push(frame);
        if !accepted && buffer.dropped() == 1 {
            tracing::warn!(call_id = %self.call_id, "Inbound audio buffer full, dropping frames");
        }
        accepted
    }

    /// Record an agent frame. Returns `false` if the buffer is full.
    pub fn push_outbound(&self, frame: &str) -> bool {
        let mut buffer = self.outbound.lock();
        let accepted = buffer.push(frame);
        if !accepted && buffer.dropped() == 1 {
            tracing::warn!(call_id = %self.call_id, "Outbound audio buffer full, dropping frames");
        }
        accepted
    }

    pub fn inbound_frames(&self) -> Vec<String> {
        self.inbound.lock().frames().to_vec()
    }

    pub fn outbound_frames(&self) -> Vec<String> {
        self.outbound.lock().frames().to_vec()
    }

    /// Finalize the transcript and move the captured audio out.
    pub fn take_artifacts(&self) -> (Vec<TranscriptTurn>, AudioBuffers) {
        let transcript = {
            let mut reconciler = self.transcript.lock();
            reconciler.finalize_all();
            reconciler.turns().to_vec()
        };
        let buffers = AudioBuffers {
            inbound: self.inbound.lock().take(),
            outbound: self.outbound.lock().take(),
        };
        (transcript, buffers)
    }

    // -------------------------------------------------------------------------
    // Backend
    // -------------------------------------------------------------------------

    pub fn attach_backend(&self, backend: SharedBackend) {
        *self.backend.lock() = Some(backend);
    }

    pub fn take_backend(&self) -> Option<SharedBackend> {
        self.backend.lock().take()
    }

    /// Claim the one-time teardown. Only the first caller gets `true`.
    pub fn claim_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }
}
