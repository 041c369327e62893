//! Call Session Bridge
//!
//! Orchestrates one phone call end to end: the telephony handshake, the
//! backend session, audio relay in both directions, transcript reconciliation
//! and the one-time teardown that hands everything to persistence.
//!
//! The bridge does not touch sockets directly. Inbound telephony frames arrive
//! as a [`Stream`] of [`TelephonyRead`]s and outbound frames are offered to a
//! bounded channel drained by a dedicated writer task, so the whole lifecycle
//! can be driven from tests.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::call_control::{DEFAULT_APOLOGY_MESSAGE, SharedCallControl};
use crate::core::codec::AudioCodecAdapter;
use crate::core::realtime::{
    BackendEvent, BackendEventStream, RealtimeFactory, SessionSetup, SharedBackend,
};
use crate::core::registry::{RegistryError, SessionRegistry};
use crate::core::session::{BusinessProfile, CallSession, SessionError, SessionState};
use crate::storage::{ConversationRecord, SharedConversationStore};

use super::messages::{MediaStreamEvent, OutboundFrame, OutboundMedia};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(1);
pub const DEFAULT_PLACEHOLDER_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_PERSIST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_BUFFERED_FRAMES: usize = 90_000;
pub const DEFAULT_OUTBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Extra time the backend-event task gets to observe cancellation before it
/// is aborted.
const EVENT_TASK_JOIN_SLACK: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Telephony handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Telephony handshake failed: {reason}")]
    HandshakeFailed {
        reason: String,
        /// Known when a `start` event arrived but was incomplete
        call_id: Option<String>,
    },

    #[error("Could not establish the realtime backend for call {0}")]
    BackendConnectFailure(String),

    #[error("Realtime backend reported fatal error {code}: {message}")]
    BackendFatalError { code: String, message: String },

    #[error("Failed to relay frame: {0}")]
    FrameRelayFailure(String),

    #[error("Failed to persist conversation: {0}")]
    PersistenceFailure(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// One read from the telephony socket, stripped of transport details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelephonyRead {
    /// A JSON text frame
    Text(String),
    /// A frame the bridge has no use for (binary, ping, pong)
    Ignored,
    /// The peer sent a close frame
    Closed,
    /// The socket failed
    Failed(String),
}

/// Identifiers learned from the `start` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub call_id: String,
    pub stream_id: String,
}

/// Timeouts and limits for every bridged call.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Bound on reading `connected`/`start`
    pub handshake_timeout: Duration,
    /// How long in-flight agent audio keeps flowing after a fatal backend error
    pub drain_grace: Duration,
    /// Wait for a caller transcript before inserting a placeholder
    pub placeholder_timeout: Duration,
    pub persist_timeout: Duration,
    /// Re-initializations allowed when the backend drops mid-call
    pub max_backend_restarts: u32,
    /// Per direction
    pub max_buffered_frames: usize,
    pub outbound_channel_capacity: usize,
    pub apology_message: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            drain_grace: DEFAULT_DRAIN_GRACE,
            placeholder_timeout: DEFAULT_PLACEHOLDER_TIMEOUT,
            persist_timeout: DEFAULT_PERSIST_TIMEOUT,
            max_backend_restarts: 1,
            max_buffered_frames: DEFAULT_MAX_BUFFERED_FRAMES,
            outbound_channel_capacity: DEFAULT_OUTBOUND_CHANNEL_CAPACITY,
            apology_message: DEFAULT_APOLOGY_MESSAGE.to_string(),
        }
    }
}

/// Bridges telephony media streams to realtime backend sessions.
///
/// Shared by all calls; per-call state lives in [`CallSession`].
pub struct CallBridge {
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn RealtimeFactory>,
    store: SharedConversationStore,
    call_control: SharedCallControl,
    codec: AudioCodecAdapter,
    settings: Arc<BridgeSettings>,
}

impl CallBridge {
    pub fn new(
        registry: Arc<SessionRegistry>,
        factory: Arc<dyn RealtimeFactory>,
        store: SharedConversationStore,
        call_control: SharedCallControl,
        codec: AudioCodecAdapter,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            registry,
            factory,
            store,
            call_control,
            codec,
            settings: Arc::new(settings),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Run a whole call: handshake, relay, teardown.
    ///
    /// Returns once both sides are closed and the conversation was handed to
    /// persistence.
    pub async fn serve<S>(
        &self,
        mut inbound: S,
        outbound: mpsc::Sender<OutboundFrame>,
        profile: BusinessProfile,
    ) -> Result<(), BridgeError>
    where
        S: Stream<Item = TelephonyRead> + Unpin + Send,
    {
        let handshake = match self.accept(&mut inbound).await {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("Rejecting media stream: {}", e);
                if let BridgeError::HandshakeFailed {
                    call_id: Some(call_id),
                    ..
                } = &e
                {
                    self.apologize(call_id).await;
                }
                return Err(e);
            }
        };

        let call_id = handshake.call_id.clone();
        let session = match self.open(handshake, profile) {
            Ok(session) => session,
            Err(e) => {
                error!(call_id = %call_id, "Cannot start call session: {}", e);
                if matches!(e, BridgeError::Registry(RegistryError::CapacityReached(_))) {
                    self.apologize(&call_id).await;
                }
                return Err(e);
            }
        };

        let result = self.run(&session, inbound, outbound).await;
        self.teardown(&session).await;
        result
    }

    /// Read the handshake from the telephony side.
    ///
    /// An optional `connected` event may precede the mandatory `start`
    /// event. Anything else, or nothing within the handshake timeout, fails.
    pub async fn accept<S>(&self, inbound: &mut S) -> Result<Handshake, BridgeError>
    where
        S: Stream<Item = TelephonyRead> + Unpin,
    {
        match timeout(self.settings.handshake_timeout, read_handshake(inbound)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::HandshakeTimeout(self.settings.handshake_timeout)),
        }
    }

    /// Create the call session and register it.
    pub fn open(
        &self,
        handshake: Handshake,
        profile: BusinessProfile,
    ) -> Result<Arc<CallSession>, BridgeError> {
        let session = Arc::new(CallSession::new(
            handshake.call_id,
            handshake.stream_id,
            profile,
            self.settings.max_buffered_frames,
        ));
        session.transition(SessionState::Handshaking)?;
        self.registry.insert(&session)?;

        info!(
            call_id = %session.call_id(),
            stream_id = %session.stream_id(),
            profile = %profile,
            active_sessions = self.registry.len(),
            "Call session opened"
        );
        Ok(session)
    }

    /// Relay audio until the call ends.
    ///
    /// Brings the backend up (falling back to an apology when it cannot),
    /// then runs the telephony-read loop here and the backend-event loop on
    /// its own task. Either side ending cancels the other. The session is
    /// left in DRAINING (or HANDSHAKING when the backend never came up) for
    /// [`CallBridge::teardown`].
    pub async fn run<S>(
        &self,
        session: &Arc<CallSession>,
        mut inbound: S,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Result<(), BridgeError>
    where
        S: Stream<Item = TelephonyRead> + Unpin + Send,
    {
        let call_id = session.call_id().to_string();
        let setup = session.profile().setup();

        let Some((backend, events)) = self.connect_backend(session, &setup).await else {
            apologize(&self.call_control, &call_id, &self.settings.apology_message).await;
            return Err(BridgeError::BackendConnectFailure(call_id));
        };
        session.transition(SessionState::Active)?;

        let cancel = CancellationToken::new();
        let event_loop = BackendEventLoop {
            session: session.clone(),
            backend: backend.clone(),
            setup: setup.resumed(),
            outbound,
            cancel: cancel.clone(),
            codec: self.codec,
            settings: self.settings.clone(),
            call_control: self.call_control.clone(),
            timers: JoinSet::new(),
            drain_deadline: None,
            fatal: None,
            dropped_frames: 0,
        };
        let mut event_task = tokio::spawn(event_loop.run(events));

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(call_id = %call_id, "Backend side ended the call");
                    break;
                }
                read = inbound.next() => read,
            };

            match read {
                Some(TelephonyRead::Text(text)) => {
                    if !self.handle_inbound(session, &backend, &text).await {
                        break;
                    }
                }
                Some(TelephonyRead::Ignored) => {}
                Some(TelephonyRead::Closed) | None => {
                    info!(call_id = %call_id, "Telephony connection closed");
                    break;
                }
                Some(TelephonyRead::Failed(e)) => {
                    warn!(call_id = %call_id, "Telephony connection failed: {}", e);
                    break;
                }
            }
        }

        session.begin_draining();
        cancel.cancel();

        let join_bound = self.settings.drain_grace + EVENT_TASK_JOIN_SLACK;
        let exit = match timeout(join_bound, &mut event_task).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => {
                error!(call_id = %call_id, "Backend event task failed: {}", e);
                EventLoopExit::Cancelled
            }
            Err(_) => {
                warn!(call_id = %call_id, "Backend event task did not stop in time, aborting");
                event_task.abort();
                EventLoopExit::Cancelled
            }
        };

        match exit {
            EventLoopExit::Cancelled => Ok(()),
            EventLoopExit::Fatal { code, message } => {
                Err(BridgeError::BackendFatalError { code, message })
            }
            EventLoopExit::BackendLost => Err(BridgeError::BackendConnectFailure(call_id)),
        }
    }

    /// Release everything the call holds, exactly once.
    ///
    /// Closes the backend, freezes the transcript, hands the conversation to
    /// persistence, erases the registry entry and moves the session to
    /// CLOSED. Returns `false` when teardown had already run.
    pub async fn teardown(&self, session: &Arc<CallSession>) -> bool {
        if !session.claim_teardown() {
            debug!(call_id = %session.call_id(), "Teardown already performed");
            return false;
        }

        if let Some(backend) = session.take_backend() {
            backend.close().await;
        }
        session.begin_draining();

        let (transcript, audio) = session.take_artifacts();
        let record = ConversationRecord {
            call_id: session.call_id().to_string(),
            stream_id: session.stream_id().to_string(),
            profile: session.profile(),
            transcript,
            audio,
            audio_encoding: self.codec.telephony_encoding(),
            started_at: session.started_at(),
            ended_at: OffsetDateTime::now_utc(),
        };

        let persisted = match timeout(
            self.settings.persist_timeout,
            self.store.store_conversation(&record),
        )
        .await
        {
            Ok(Ok(stored)) => {
                debug!(call_id = %record.call_id, metadata = %stored.metadata_path, "Artifacts handed off");
                Ok(())
            }
            Ok(Err(e)) => Err(BridgeError::PersistenceFailure(e.to_string())),
            Err(_) => Err(BridgeError::PersistenceFailure(format!(
                "timed out after {:?}",
                self.settings.persist_timeout
            ))),
        };
        if let Err(e) = persisted {
            error!(call_id = %record.call_id, "{}", e);
        }

        self.registry.remove(session);
        if let Err(e) = session.transition(SessionState::Closed) {
            warn!(call_id = %session.call_id(), "{}", e);
        }

        info!(
            call_id = %record.call_id,
            turns = record.transcript.len(),
            inbound_frames = record.audio.inbound.len(),
            outbound_frames = record.audio.outbound.len(),
            active_sessions = self.registry.len(),
            "Call session closed"
        );
        true
    }

    async fn connect_backend(
        &self,
        session: &Arc<CallSession>,
        setup: &SessionSetup,
    ) -> Option<(SharedBackend, BackendEventStream)> {
        let call_id = session.call_id();

        let backend = match self.factory.create_session() {
            Ok(backend) => backend,
            Err(e) => {
                error!(call_id = %call_id, "Failed to create backend session: {}", e);
                return None;
            }
        };
        session.attach_backend(backend.clone());

        if !backend.initialize(call_id, setup).await {
            error!(call_id = %call_id, "Backend session could not be initialized");
            return None;
        }

        match backend.events() {
            Ok(events) => Some((backend, events)),
            Err(e) => {
                error!(call_id = %call_id, "Backend event stream unavailable: {}", e);
                None
            }
        }
    }

    /// Handle one telephony text frame. Returns `false` on `stop`.
    async fn handle_inbound(
        &self,
        session: &CallSession,
        backend: &SharedBackend,
        text: &str,
    ) -> bool {
        let event = match MediaStreamEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                let err = BridgeError::FrameRelayFailure(format!("undecodable telephony frame: {e}"));
                warn!(call_id = %session.call_id(), "{}", err);
                return true;
            }
        };

        match event {
            MediaStreamEvent::Media { media, .. } => {
                session.push_inbound(&media.payload);
                if let Err(e) = self.forward_audio(backend, &media.payload).await {
                    warn!(call_id = %session.call_id(), "{}", e);
                }
                true
            }
            MediaStreamEvent::Stop { .. } => {
                info!(call_id = %session.call_id(), "Telephony stream stopped");
                false
            }
            MediaStreamEvent::Dtmf { dtmf } => {
                info!(
                    call_id = %session.call_id(),
                    digit = ?dtmf.map(|d| d.digit),
                    "DTMF received"
                );
                true
            }
            MediaStreamEvent::Mark { mark } => {
                debug!(call_id = %session.call_id(), mark = ?mark.map(|m| m.name), "Mark received");
                true
            }
            other @ (MediaStreamEvent::Connected { .. } | MediaStreamEvent::Start { .. }) => {
                debug!(call_id = %session.call_id(), "Ignoring repeated '{}' event", other.name());
                true
            }
        }
    }

    async fn forward_audio(&self, backend: &SharedBackend, payload: &str) -> Result<(), BridgeError> {
        let converted = self
            .codec
            .to_backend(payload)
            .map_err(|e| BridgeError::FrameRelayFailure(e.to_string()))?;
        backend
            .send_audio(&converted)
            .await
            .map_err(|e| BridgeError::FrameRelayFailure(e.to_string()))
    }

    async fn apologize(&self, call_id: &str) {
        apologize(&self.call_control, call_id, &self.settings.apology_message).await;
    }
}

async fn apologize(call_control: &SharedCallControl, call_id: &str, message: &str) {
    match call_control.apologize_and_hangup(call_id, message).await {
        Ok(()) => info!(call_id = %call_id, "Caller notified of connection failure"),
        Err(e) => error!(call_id = %call_id, "Failed to play apology: {}", e),
    }
}

async fn read_handshake<S>(inbound: &mut S) -> Result<Handshake, BridgeError>
where
    S: Stream<Item = TelephonyRead> + Unpin,
{
    let failed = |reason: String| BridgeError::HandshakeFailed {
        reason,
        call_id: None,
    };
    let mut connected = false;

    while let Some(read) = inbound.next().await {
        let text = match read {
            TelephonyRead::Text(text) => text,
            TelephonyRead::Ignored => continue,
            TelephonyRead::Closed => break,
            TelephonyRead::Failed(e) => return Err(failed(format!("socket error: {e}"))),
        };

        match MediaStreamEvent::parse(&text) {
            Ok(MediaStreamEvent::Connected { .. }) if !connected => {
                debug!("Media stream connected, waiting for 'start'");
                connected = true;
            }
            Ok(MediaStreamEvent::Start { start, stream_sid }) => {
                let call_id = start.call_sid.filter(|s| !s.is_empty());
                let stream_id = start.stream_sid.or(stream_sid).filter(|s| !s.is_empty());

                return match (call_id, stream_id) {
                    (Some(call_id), Some(stream_id)) => {
                        info!(call_id = %call_id, stream_id = %stream_id, "Media stream started");
                        Ok(Handshake { call_id, stream_id })
                    }
                    (call_id, _) => Err(BridgeError::HandshakeFailed {
                        reason: "'start' event without callSid or streamSid".to_string(),
                        call_id,
                    }),
                };
            }
            Ok(other) => {
                return Err(failed(format!(
                    "expected 'start' event, received '{}'",
                    other.name()
                )));
            }
            Err(e) => return Err(failed(format!("undecodable frame: {e}"))),
        }
    }

    Err(failed("connection closed before 'start' event".to_string()))
}

// =============================================================================
// Backend event loop
// =============================================================================

/// Why the backend-event task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EventLoopExit {
    /// The telephony side ended the call
    Cancelled,
    /// A fatal backend error, after the drain grace
    Fatal { code: String, message: String },
    /// The backend went away and could not be restarted
    BackendLost,
}

enum Step {
    Cancelled,
    DrainElapsed,
    Timer(Result<String, tokio::task::JoinError>),
    Event(Option<BackendEvent>),
}

/// Consumes backend events for one call.
///
/// Sole writer of the transcript and the outbound audio buffer. Owns the
/// placeholder timers, which are aborted when the loop returns.
struct BackendEventLoop {
    session: Arc<CallSession>,
    backend: SharedBackend,
    /// Used for mid-call re-initialization, so it carries no greeting
    setup: SessionSetup,
    outbound: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
    codec: AudioCodecAdapter,
    settings: Arc<BridgeSettings>,
    call_control: SharedCallControl,
    timers: JoinSet<String>,
    drain_deadline: Option<Instant>,
    fatal: Option<(String, String)>,
    dropped_frames: u64,
}

impl BackendEventLoop {
    async fn run(mut self, mut events: BackendEventStream) -> EventLoopExit {
        let mut restarts = 0u32;

        loop {
            let deadline = self.drain_deadline;
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Cancelled,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    Step::DrainElapsed
                }
                Some(joined) = self.timers.join_next(), if !self.timers.is_empty() => {
                    Step::Timer(joined)
                }
                event = events.recv() => Step::Event(event),
            };

            match step {
                Step::Cancelled => return self.exit(EventLoopExit::Cancelled),
                Step::DrainElapsed => {
                    info!(call_id = %self.session.call_id(), "Drain grace elapsed, ending call");
                    self.cancel.cancel();
                    return self.fatal_exit();
                }
                Step::Timer(Ok(turn_id)) => self.on_placeholder_timeout(&turn_id),
                Step::Timer(Err(e)) => {
                    debug!(call_id = %self.session.call_id(), "Placeholder timer ended: {}", e);
                }
                Step::Event(Some(event)) => self.handle_event(event),
                Step::Event(None) => {
                    if self.fatal.is_some() {
                        self.cancel.cancel();
                        return self.fatal_exit();
                    }
                    if self.session.state() != SessionState::Active {
                        return self.exit(EventLoopExit::Cancelled);
                    }

                    match self.restart_backend(&mut restarts).await {
                        Some(Ok(next)) => events = next,
                        Some(Err(exit)) => return exit,
                        None => return self.exit(EventLoopExit::Cancelled),
                    }
                }
            }
        }
    }

    fn exit(&self, exit: EventLoopExit) -> EventLoopExit {
        debug!(
            call_id = %self.session.call_id(),
            pending_placeholders = self.timers.len(),
            "Backend event loop stopped: {:?}",
            exit
        );
        exit
    }

    fn fatal_exit(&self) -> EventLoopExit {
        let (code, message) = self.fatal.clone().unwrap_or_default();
        self.exit(EventLoopExit::Fatal { code, message })
    }

    /// Bring the backend back after its event stream ended mid-call.
    ///
    /// `Some(Ok)` carries the new event stream, `Some(Err)` the exit after
    /// giving up, and `None` means the call was cancelled meanwhile.
    async fn restart_backend(
        &mut self,
        restarts: &mut u32,
    ) -> Option<Result<BackendEventStream, EventLoopExit>> {
        let call_id = self.session.call_id().to_string();

        while *restarts < self.settings.max_backend_restarts {
            *restarts += 1;
            warn!(
                call_id = %call_id,
                attempt = *restarts,
                "Backend connection lost mid-call, re-initializing"
            );

            let initialized = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                ok = self.backend.initialize(&call_id, &self.setup) => ok,
            };
            if !initialized {
                continue;
            }
            match self.backend.events() {
                Ok(events) => {
                    info!(call_id = %call_id, "Backend session restored");
                    return Some(Ok(events));
                }
                Err(e) => warn!(call_id = %call_id, "Restored backend has no event stream: {}", e),
            }
        }

        error!(call_id = %call_id, "Backend connection lost, ending call");
        apologize(&self.call_control, &call_id, &self.settings.apology_message).await;
        self.session.begin_draining();
        self.cancel.cancel();
        Some(Err(self.exit(EventLoopExit::BackendLost)))
    }

    fn handle_event(&mut self, event: BackendEvent) {
        let call_id = self.session.call_id();

        match event {
            BackendEvent::AudioDelta { payload, .. } => self.relay_audio(&payload),
            BackendEvent::TranscriptDelta {
                turn_id,
                role,
                text,
                is_final,
            } => {
                let outcome = self
                    .session
                    .with_transcript(|t| t.apply_delta(&turn_id, role, &text, is_final));
                debug!(
                    call_id = %call_id,
                    turn_id = %turn_id,
                    role = %role,
                    is_final,
                    "Transcript delta {:?}",
                    outcome
                );
            }
            BackendEvent::SpeechStarted { turn_id } => {
                debug!(call_id = %call_id, turn_id = ?turn_id, "Caller started speaking");
            }
            BackendEvent::SpeechStopped { turn_id } => {
                debug!(call_id = %call_id, turn_id = ?turn_id, "Caller stopped speaking");
            }
            BackendEvent::BufferCommitted { turn_id } => self.schedule_placeholder(turn_id),
            BackendEvent::Error {
                code,
                message,
                fatal: false,
            } => {
                warn!(call_id = %call_id, code = %code, "Recoverable backend error: {}", message);
            }
            BackendEvent::Error {
                code,
                message,
                fatal: true,
            } => {
                error!(call_id = %call_id, code = %code, "Fatal backend error: {}", message);
                if self.fatal.is_none() {
                    self.fatal = Some((code, message));
                    self.session.begin_draining();
                    self.drain_deadline = Some(Instant::now() + self.settings.drain_grace);
                }
            }
            BackendEvent::Done => debug!(call_id = %call_id, "Response done"),
        }
    }

    /// Offer one agent frame to the telephony writer without waiting.
    fn relay_audio(&mut self, payload: &str) {
        let call_id = self.session.call_id();

        let payload = match self.codec.to_telephony(payload) {
            Ok(converted) => converted.into_owned(),
            Err(e) => {
                warn!(call_id = %call_id, "{}", BridgeError::FrameRelayFailure(e.to_string()));
                return;
            }
        };
        self.session.push_outbound(&payload);

        let frame = OutboundFrame::Media(OutboundMedia::new(self.session.stream_id(), payload));
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped_frames += 1;
                if self.dropped_frames == 1 || self.dropped_frames % 100 == 0 {
                    warn!(
                        call_id = %call_id,
                        dropped = self.dropped_frames,
                        "Telephony writer backlogged, dropping agent audio"
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {
                warn!(call_id = %call_id, "Telephony writer gone, draining session");
                self.session.begin_draining();
                self.cancel.cancel();
            }
        }
    }

    fn schedule_placeholder(&mut self, turn_id: String) {
        if self.session.with_transcript(|t| t.contains(&turn_id)) {
            return;
        }
        debug!(call_id = %self.session.call_id(), turn_id = %turn_id, "Caller turn committed");

        let wait = self.settings.placeholder_timeout;
        self.timers.spawn(async move {
            tokio::time::sleep(wait).await;
            turn_id
        });
    }

    fn on_placeholder_timeout(&self, turn_id: &str) {
        if self.session.with_transcript(|t| t.insert_placeholder(turn_id)) {
            warn!(
                call_id = %self.session.call_id(),
                turn_id = %turn_id,
                "No transcript after {:?}, inserted placeholder",
                self.settings.placeholder_timeout
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_control::{CallControl, CallControlError};
    use crate::core::realtime::{BackendSession, RealtimeResult, TranscriptRole};
    use crate::storage::{ConversationStore, StorageError, StoredConversation};
    use async_trait::async_trait;
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // -------------------------------------------------------------------------
    // Test doubles
    // -------------------------------------------------------------------------

    #[derive(Default)]
    struct ScriptedBackend {
        fail_init: bool,
        sender: Mutex<Option<mpsc::UnboundedSender<BackendEvent>>>,
        events: Mutex<Option<BackendEventStream>>,
        sent: Mutex<Vec<String>>,
        setups: Mutex<Vec<SessionSetup>>,
        inits: AtomicUsize,
        closes: AtomicUsize,
    }

    impl ScriptedBackend {
        fn emit(&self, event: BackendEvent) {
            if let Some(tx) = self.sender.lock().as_ref() {
                let _ = tx.send(event);
            }
        }

        fn drop_connection(&self) {
            self.sender.lock().take();
        }

        fn is_connected(&self) -> bool {
            self.sender.lock().is_some()
        }
    }

    #[async_trait]
    impl BackendSession for ScriptedBackend {
        async fn initialize(&self, _call_id: &str, setup: &SessionSetup) -> bool {
            self.inits.fetch_add(1, Ordering::SeqCst);
            self.setups.lock().push(setup.clone());
            if self.fail_init {
                return false;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *self.sender.lock() = Some(tx);
            *self.events.lock() = Some(rx);
            true
        }

        async fn send_audio(&self, payload: &str) -> RealtimeResult<()> {
            self.sent.lock().push(payload.to_string());
            Ok(())
        }

        fn events(&self) -> RealtimeResult<BackendEventStream> {
            self.events.lock().take().ok_or_else(|| {
                crate::core::realtime::RealtimeError::SessionError("taken".to_string())
            })
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.sender.lock().take();
        }

        fn is_ready(&self) -> bool {
            self.is_connected()
        }
    }

    struct ScriptedFactory(Arc<ScriptedBackend>);

    impl RealtimeFactory for ScriptedFactory {
        fn create_session(&self) -> RealtimeResult<SharedBackend> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        records: Mutex<Vec<ConversationRecord>>,
    }

    #[async_trait]
    impl ConversationStore for RecordingStore {
        async fn store_conversation(
            &self,
            record: &ConversationRecord,
        ) -> Result<StoredConversation, StorageError> {
            self.records.lock().push(record.clone());
            Ok(StoredConversation::default())
        }
    }

    #[derive(Default)]
    struct RecordingCallControl {
        apologies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CallControl for RecordingCallControl {
        async fn apologize_and_hangup(
            &self,
            call_id: &str,
            _message: &str,
        ) -> Result<(), CallControlError> {
            self.apologies.lock().push(call_id.to_string());
            Ok(())
        }
    }

    struct Harness {
        bridge: Arc<CallBridge>,
        backend: Arc<ScriptedBackend>,
        store: Arc<RecordingStore>,
        control: Arc<RecordingCallControl>,
    }

    fn harness_with(backend: ScriptedBackend, settings: BridgeSettings) -> Harness {
        let backend = Arc::new(backend);
        let store = Arc::new(RecordingStore::default());
        let control = Arc::new(RecordingCallControl::default());
        let bridge = Arc::new(CallBridge::new(
            Arc::new(SessionRegistry::default()),
            Arc::new(ScriptedFactory(backend.clone())),
            store.clone(),
            control.clone(),
            AudioCodecAdapter::default(),
            settings,
        ));
        Harness {
            bridge,
            backend,
            store,
            control,
        }
    }

    fn harness() -> Harness {
        harness_with(ScriptedBackend::default(), BridgeSettings::default())
    }

    fn text(json: &str) -> TelephonyRead {
        TelephonyRead::Text(json.to_string())
    }

    fn connected() -> TelephonyRead {
        text(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#)
    }

    fn start(call_sid: &str, stream_sid: &str) -> TelephonyRead {
        text(&format!(
            r#"{{"event":"start","start":{{"streamSid":"{stream_sid}","callSid":"{call_sid}"}}}}"#
        ))
    }

    fn media(payload: &str) -> TelephonyRead {
        text(&format!(r#"{{"event":"media","media":{{"payload":"{payload}"}}}}"#))
    }

    fn stop() -> TelephonyRead {
        text(r#"{"event":"stop"}"#)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    // -------------------------------------------------------------------------
    // Handshake
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_handshake_with_connected_event() {
        let h = harness();
        let mut inbound = futures::stream::iter(vec![connected(), start("CA1", "MZ1")]);

        let handshake = h.bridge.accept(&mut inbound).await.unwrap();
        assert_eq!(
            handshake,
            Handshake {
                call_id: "CA1".to_string(),
                stream_id: "MZ1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_handshake_without_connected_event() {
        let h = harness();
        let mut inbound =
            futures::stream::iter(vec![TelephonyRead::Ignored, start("CA9", "MZ9")]);

        let handshake = h.bridge.accept(&mut inbound).await.unwrap();
        assert_eq!(handshake.call_id, "CA9");
        assert_eq!(handshake.stream_id, "MZ9");
    }

    #[tokio::test]
    async fn test_handshake_rejects_unexpected_event() {
        let h = harness();
        let mut inbound = futures::stream::iter(vec![connected(), media("AAAA")]);

        let err = h.bridge.accept(&mut inbound).await.unwrap_err();
        assert!(matches!(err, BridgeError::HandshakeFailed { call_id: None, .. }));
    }

    #[tokio::test]
    async fn test_handshake_fails_when_stream_closes() {
        let h = harness();
        let mut inbound = futures::stream::iter(vec![connected()]);

        let err = h.bridge.accept(&mut inbound).await.unwrap_err();
        assert!(matches!(err, BridgeError::HandshakeFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_times_out() {
        let h = harness();
        let mut inbound = futures::stream::pending::<TelephonyRead>();

        let err = h.bridge.accept(&mut inbound).await.unwrap_err();
        assert!(matches!(err, BridgeError::HandshakeTimeout(_)));
    }

    #[tokio::test]
    async fn test_incomplete_start_apologizes() {
        let h = harness();
        let (tx, _rx) = mpsc::channel(8);
        let inbound = futures::stream::iter(vec![text(
            r#"{"event":"start","start":{"callSid":"CA1"}}"#,
        )]);

        let err = h
            .bridge
            .serve(inbound, tx, BusinessProfile::Default)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::HandshakeFailed { .. }));
        assert_eq!(*h.control.apologies.lock(), vec!["CA1".to_string()]);
        assert!(h.store.records.lock().is_empty());
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_end_to_end_call() {
        let h = harness();
        let (tx, _rx) = mpsc::channel(8);
        let inbound = futures::stream::iter(vec![
            connected(),
            start("CA1", "MZ1"),
            media("AAAA"),
            media("BBBB"),
            stop(),
        ]);

        h.bridge
            .serve(inbound, tx, BusinessProfile::Salon)
            .await
            .unwrap();

        let records = h.store.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].call_id, "CA1");
        assert_eq!(records[0].stream_id, "MZ1");
        assert_eq!(records[0].profile, BusinessProfile::Salon);
        assert_eq!(records[0].audio.inbound, vec!["AAAA", "BBBB"]);

        assert_eq!(*h.backend.sent.lock(), vec!["AAAA", "BBBB"]);
        assert_eq!(h.backend.closes.load(Ordering::SeqCst), 1);
        assert!(h.bridge.registry().is_empty());
    }

    #[tokio::test]
    async fn test_inbound_frames_kept_in_arrival_order() {
        for n in [0usize, 1, 200] {
            let h = harness();
            let (tx, _rx) = mpsc::channel(8);
            let payloads: Vec<String> = (0..n)
                .map(|i| BASE64_STANDARD.encode((i as u32).to_be_bytes()))
                .collect();

            let mut frames = vec![start("CA1", "MZ1")];
            frames.extend(payloads.iter().map(|p| media(p)));
            frames.push(stop());

            h.bridge
                .serve(futures::stream::iter(frames), tx, BusinessProfile::Default)
                .await
                .unwrap();

            let records = h.store.records.lock();
            assert_eq!(records.len(), 1, "n = {n}");
            assert_eq!(records[0].audio.inbound, payloads, "n = {n}");
            assert_eq!(*h.backend.sent.lock(), payloads, "n = {n}");
        }
    }

    #[tokio::test]
    async fn test_bad_frame_does_not_end_call() {
        let h = harness();
        let (tx, _rx) = mpsc::channel(8);
        let inbound = futures::stream::iter(vec![
            start("CA1", "MZ1"),
            media("AAAA"),
            text("{not json"),
            text(r#"{"event":"clear"}"#),
            media("BBBB"),
            stop(),
        ]);

        h.bridge
            .serve(inbound, tx, BusinessProfile::Default)
            .await
            .unwrap();
        assert_eq!(h.store.records.lock()[0].audio.inbound, vec!["AAAA", "BBBB"]);
    }

    #[tokio::test]
    async fn test_backend_init_failure_apologizes_and_closes() {
        let h = harness_with(
            ScriptedBackend {
                fail_init: true,
                ..Default::default()
            },
            BridgeSettings::default(),
        );
        let (tx, _rx) = mpsc::channel(8);
        let inbound = futures::stream::iter(vec![connected(), start("CA1", "MZ1"), stop()]);

        let err = h
            .bridge
            .serve(inbound, tx, BusinessProfile::Default)
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::BackendConnectFailure(_)));
        assert_eq!(*h.control.apologies.lock(), vec!["CA1".to_string()]);
        let records = h.store.records.lock();
        assert_eq!(records.len(), 1);
        assert!(records[0].transcript.is_empty());
        assert!(records[0].audio.inbound.is_empty());
        assert!(h.bridge.registry().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let h = harness();
        let session = h
            .bridge
            .open(
                Handshake {
                    call_id: "CA1".to_string(),
                    stream_id: "MZ1".to_string(),
                },
                BusinessProfile::Default,
            )
            .unwrap();
        assert!(h.bridge.registry().contains("CA1"));

        let (first, second) =
            tokio::join!(h.bridge.teardown(&session), h.bridge.teardown(&session));
        assert!(first ^ second);
        assert!(!h.bridge.teardown(&session).await);

        assert_eq!(h.store.records.lock().len(), 1);
        assert!(!h.bridge.registry().contains("CA1"));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_capacity_reached_apologizes() {
        let backend = Arc::new(ScriptedBackend::default());
        let store = Arc::new(RecordingStore::default());
        let control = Arc::new(RecordingCallControl::default());
        let bridge = CallBridge::new(
            Arc::new(SessionRegistry::new(Some(0))),
            Arc::new(ScriptedFactory(backend.clone())),
            store.clone(),
            control.clone(),
            AudioCodecAdapter::default(),
            BridgeSettings::default(),
        );
        let (tx, _rx) = mpsc::channel(8);
        let inbound = futures::stream::iter(vec![start("CA7", "MZ7"), stop()]);

        let err = bridge
            .serve(inbound, tx, BusinessProfile::Default)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Registry(RegistryError::CapacityReached(0))
        ));
        assert_eq!(*control.apologies.lock(), vec!["CA7".to_string()]);
        assert_eq!(backend.inits.load(Ordering::SeqCst), 0);
        assert!(store.records.lock().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_call_rejected() {
        let h = harness();
        let handshake = Handshake {
            call_id: "CA1".to_string(),
            stream_id: "MZ1".to_string(),
        };
        let _first = h.bridge.open(handshake.clone(), BusinessProfile::Default).unwrap();

        let err = h.bridge.open(handshake, BusinessProfile::Default).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Registry(RegistryError::Duplicate(_))
        ));
    }

    // -------------------------------------------------------------------------
    // Backend events
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_agent_audio_relayed_and_transcript_reconciled() {
        let h = harness();
        let (tx, mut rx) = mpsc::channel(8);
        let (in_tx, in_rx) = futures::channel::mpsc::unbounded();
        in_tx.unbounded_send(start("CA1", "MZ1")).unwrap();

        let bridge = h.bridge.clone();
        let call = tokio::spawn(async move {
            bridge.serve(in_rx, tx, BusinessProfile::Default).await
        });

        let backend = h.backend.clone();
        wait_until(|| backend.is_connected()).await;

        h.backend.emit(BackendEvent::AudioDelta {
            payload: "//8=".to_string(),
            turn_id: None,
        });
        for (delta, is_final) in [("Hel", false), ("lo", false), ("Hello!", true)] {
            h.backend.emit(BackendEvent::TranscriptDelta {
                turn_id: "a1".to_string(),
                role: TranscriptRole::Agent,
                text: delta.to_string(),
                is_final,
            });
        }

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame, OutboundFrame::Media(OutboundMedia::new("MZ1", "//8=")));

        let registry = h.bridge.registry().clone();
        wait_until(|| {
            registry
                .get("CA1")
                .is_some_and(|s| s.transcript().first().is_some_and(|t| t.finalized))
        })
        .await;

        in_tx.unbounded_send(stop()).unwrap();
        call.await.unwrap().unwrap();

        let records = h.store.records.lock();
        assert_eq!(records[0].transcript.len(), 1);
        assert_eq!(records[0].transcript[0].text, "Hello!");
        assert_eq!(records[0].audio.outbound, vec!["//8="]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_placeholder_inserted_then_overwritten() {
        let h = harness();
        let (tx, _rx) = mpsc::channel(8);
        let (in_tx, in_rx) = futures::channel::mpsc::unbounded();
        in_tx.unbounded_send(start("CA1", "MZ1")).unwrap();

        let bridge = h.bridge.clone();
        let call = tokio::spawn(async move {
            bridge.serve(in_rx, tx, BusinessProfile::Default).await
        });
        let backend = h.backend.clone();
        wait_until(|| backend.is_connected()).await;
        let session = h.bridge.registry().get("CA1").unwrap();

        h.backend.emit(BackendEvent::TranscriptDelta {
            turn_id: "a1".to_string(),
            role: TranscriptRole::Agent,
            text: "May I have your name please?".to_string(),
            is_final: true,
        });
        h.backend.emit(BackendEvent::BufferCommitted {
            turn_id: "u1".to_string(),
        });
        h.backend.emit(BackendEvent::BufferCommitted {
            turn_id: "u1".to_string(),
        });

        tokio::time::sleep(Duration::from_millis(2100)).await;
        let turns = session.transcript();
        assert_eq!(turns.len(), 2);
        assert!(turns[1].placeholder);
        assert_eq!(
            turns[1].text,
            "[unrecognized user input, responding to: May I have your name please?]"
        );

        h.backend.emit(BackendEvent::TranscriptDelta {
            turn_id: "u1".to_string(),
            role: TranscriptRole::User,
            text: "Dana".to_string(),
            is_final: true,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let turns = session.transcript();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].text, "Dana");
        assert!(!turns[1].placeholder);

        in_tx.unbounded_send(stop()).unwrap();
        call.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcript_before_timeout_suppresses_placeholder() {
        let h = harness();
        let (tx, _rx) = mpsc::channel(8);
        let (in_tx, in_rx) = futures::channel::mpsc::unbounded();
        in_tx.unbounded_send(start("CA1", "MZ1")).unwrap();

        let bridge = h.bridge.clone();
        let call = tokio::spawn(async move {
            bridge.serve(in_rx, tx, BusinessProfile::Default).await
        });
        let backend = h.backend.clone();
        wait_until(|| backend.is_connected()).await;
        let session = h.bridge.registry().get("CA1").unwrap();

        h.backend.emit(BackendEvent::BufferCommitted {
            turn_id: "u1".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        h.backend.emit(BackendEvent::TranscriptDelta {
            turn_id: "u1".to_string(),
            role: TranscriptRole::User,
            text: "Eve".to_string(),
            is_final: false,
        });
        tokio::time::sleep(Duration::from_secs(3)).await;

        let turns = session.transcript();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].text, "Eve");
        assert!(!turns[0].placeholder);

        in_tx.unbounded_send(stop()).unwrap();
        call.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_drains_and_ends_call() {
        let h = harness();
        let (tx, mut rx) = mpsc::channel(8);
        let (in_tx, in_rx) = futures::channel::mpsc::unbounded();
        in_tx.unbounded_send(start("CA1", "MZ1")).unwrap();

        let bridge = h.bridge.clone();
        let call = tokio::spawn(async move {
            bridge.serve(in_rx, tx, BusinessProfile::Default).await
        });
        let backend = h.backend.clone();
        wait_until(|| backend.is_connected()).await;

        h.backend.emit(BackendEvent::Error {
            code: "invalid_request_error".to_string(),
            message: "bad".to_string(),
            fatal: true,
        });
        // In-flight audio still reaches the caller during the drain grace
        h.backend.emit(BackendEvent::AudioDelta {
            payload: "AAAA".to_string(),
            turn_id: None,
        });

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::BackendFatalError { ref code, .. } if code == "invalid_request_error"));
        assert!(matches!(rx.recv().await, Some(OutboundFrame::Media(_))));
        assert_eq!(h.store.records.lock().len(), 1);
        assert!(h.bridge.registry().is_empty());
        drop(in_tx);
    }

    #[tokio::test]
    async fn test_recoverable_error_keeps_call_alive() {
        let h = harness();
        let (tx, _rx) = mpsc::channel(8);
        let (in_tx, in_rx) = futures::channel::mpsc::unbounded();
        in_tx.unbounded_send(start("CA1", "MZ1")).unwrap();

        let bridge = h.bridge.clone();
        let call = tokio::spawn(async move {
            bridge.serve(in_rx, tx, BusinessProfile::Default).await
        });
        let backend = h.backend.clone();
        wait_until(|| backend.is_connected()).await;

        h.backend.emit(BackendEvent::Error {
            code: "rate_limit_exceeded".to_string(),
            message: "slow down".to_string(),
            fatal: false,
        });
        in_tx.unbounded_send(media("AAAA")).unwrap();

        let backend = h.backend.clone();
        wait_until(|| backend.sent.lock().len() == 1).await;
        assert_eq!(
            h.bridge.registry().get("CA1").unwrap().state(),
            SessionState::Active
        );

        in_tx.unbounded_send(stop()).unwrap();
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_backend_loss_restarts_then_gives_up() {
        let h = harness();
        let (tx, _rx) = mpsc::channel(8);
        let (in_tx, in_rx) = futures::channel::mpsc::unbounded();
        in_tx.unbounded_send(start("CA1", "MZ1")).unwrap();

        let bridge = h.bridge.clone();
        let call = tokio::spawn(async move {
            bridge.serve(in_rx, tx, BusinessProfile::Default).await
        });
        let backend = h.backend.clone();
        wait_until(|| backend.is_connected()).await;

        h.backend.drop_connection();
        let backend = h.backend.clone();
        wait_until(|| backend.inits.load(Ordering::SeqCst) == 2 && backend.is_connected()).await;

        h.backend.drop_connection();
        let err = call.await.unwrap().unwrap_err();

        assert!(matches!(err, BridgeError::BackendConnectFailure(_)));
        assert_eq!(*h.control.apologies.lock(), vec!["CA1".to_string()]);
        assert_eq!(h.store.records.lock().len(), 1);
        drop(in_tx);
    }

    #[tokio::test]
    async fn test_restart_does_not_greet_again() {
        let h = harness();
        let (tx, _rx) = mpsc::channel(8);
        let (in_tx, in_rx) = futures::channel::mpsc::unbounded();
        in_tx.unbounded_send(start("CA1", "MZ1")).unwrap();

        let bridge = h.bridge.clone();
        let call = tokio::spawn(async move {
            bridge.serve(in_rx, tx, BusinessProfile::Restaurant).await
        });
        let backend = h.backend.clone();
        wait_until(|| backend.is_connected()).await;

        h.backend.drop_connection();
        let backend = h.backend.clone();
        wait_until(|| backend.inits.load(Ordering::SeqCst) == 2 && backend.is_connected()).await;

        in_tx.unbounded_send(stop()).unwrap();
        call.await.unwrap().unwrap();

        let setups = h.backend.setups.lock();
        assert_eq!(setups.len(), 2);
        assert_eq!(
            setups[0].greeting.as_deref(),
            Some(BusinessProfile::Restaurant.greeting_prompt())
        );
        assert!(setups[1].greeting.is_none());
        assert_eq!(setups[1].instructions, setups[0].instructions);
    }

    #[tokio::test]
    async fn test_full_writer_drops_frames_but_buffers_them() {
        let h = harness();
        let (tx, mut rx) = mpsc::channel(1);
        let (in_tx, in_rx) = futures::channel::mpsc::unbounded();
        in_tx.unbounded_send(start("CA1", "MZ1")).unwrap();

        let bridge = h.bridge.clone();
        let call = tokio::spawn(async move {
            bridge.serve(in_rx, tx, BusinessProfile::Default).await
        });
        let backend = h.backend.clone();
        wait_until(|| backend.is_connected()).await;

        for payload in ["AAAA", "BBBB", "CCCC"] {
            h.backend.emit(BackendEvent::AudioDelta {
                payload: payload.to_string(),
                turn_id: None,
            });
        }
        let registry = h.bridge.registry().clone();
        wait_until(|| {
            registry
                .get("CA1")
                .is_some_and(|s| s.outbound_frames().len() == 3)
        })
        .await;

        in_tx.unbounded_send(stop()).unwrap();
        call.await.unwrap().unwrap();

        assert_eq!(
            rx.recv().await,
            Some(OutboundFrame::Media(OutboundMedia::new("MZ1", "AAAA")))
        );
        assert_eq!(rx.recv().await, None);
        assert_eq!(
            h.store.records.lock()[0].audio.outbound,
            vec!["AAAA", "BBBB", "CCCC"]
        );
    }
}
