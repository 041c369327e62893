//! OpenAI Realtime API client implementation.
//!
//! Implements [`BackendSession`] on top of OpenAI's WebSocket-based Realtime API.
//!
//! # API Reference
//!
//! - Endpoint: `wss://api.openai.com/v1/realtime?model=<model>`
//! - Protocol: WebSocket with JSON events
//! - Audio: base64 frames in the negotiated format (G.711 u-law for phone calls)
//!
//! # Example
//!
//! ```rust,ignore
//! use call_bridge::core::realtime::{BackendSession, OpenAIRealtime, OpenAIRealtimeConfig, SessionSetup};
//!
//! let backend = OpenAIRealtime::new(OpenAIRealtimeConfig {
//!     api_key: "sk-...".to_string(),
//!     ..Default::default()
//! })?;
//!
//! if backend.initialize("CA123", &SessionSetup::default()).await {
//!     let mut events = backend.events()?;
//!     backend.send_audio("//7+/Q==").await?;
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use http::header::AUTHORIZATION;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};

use super::config::OpenAIRealtimeConfig;
use super::messages::{
    ClientEvent, ConversationItem, InputAudioTranscription, ServerEvent, SessionConfig,
    TurnDetection,
};
use crate::core::realtime::base::{
    BackendEvent, BackendEventStream, BackendSession, ConnectionState, ErrorPolicy,
    RealtimeError, RealtimeFactory, RealtimeResult, SessionSetup, SharedBackend, TranscriptRole,
};

/// Channel capacity for WebSocket message sending.
const WS_CHANNEL_CAPACITY: usize = 256;

/// How long `close` waits for the connection task to send its close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// OpenAI Realtime Client
// =============================================================================

/// OpenAI Realtime API client for one phone call.
///
/// The WebSocket is owned by a spawned connection task. Outgoing events reach
/// it through a bounded channel; incoming events are decoded once, mapped to
/// [`BackendEvent`]s and pushed into an unbounded channel that the bridge
/// consumes through [`BackendSession::events`].
pub struct OpenAIRealtime {
    config: OpenAIRealtimeConfig,
    /// Connected flag shared with the connection task
    connected: Arc<AtomicBool>,
    /// Set once by `close`; no further connections are made afterwards
    closed: AtomicBool,
    state: Arc<Mutex<ConnectionState>>,
    ws_sender: Mutex<Option<mpsc::Sender<ClientEvent>>>,
    events: Mutex<Option<BackendEventStream>>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
    /// Audio frames dropped because the connection was gone
    dropped_audio: AtomicU64,
}

impl OpenAIRealtime {
    pub fn new(config: OpenAIRealtimeConfig) -> RealtimeResult<Self> {
        config.validate()?;

        Ok(Self {
            config,
            connected: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            ws_sender: Mutex::new(None),
            events: Mutex::new(None),
            connection_handle: Mutex::new(None),
            dropped_audio: AtomicU64::new(0),
        })
    }

    /// Build the `session.update` payload for a call.
    fn build_session_config(&self, setup: &SessionSetup) -> SessionConfig {
        SessionConfig {
            turn_detection: TurnDetection::ServerVad,
            input_audio_format: self.config.audio_format.as_str().to_string(),
            output_audio_format: self.config.audio_format.as_str().to_string(),
            voice: self.config.voice.as_str().to_string(),
            instructions: setup.instructions.clone(),
            modalities: vec!["text".to_string(), "audio".to_string()],
            temperature: self.config.temperature,
            input_audio_transcription: self
                .config
                .transcription_model
                .as_ref()
                .map(|model| InputAudioTranscription {
                    model: model.clone(),
                }),
        }
    }

    /// Messages sent right after the socket opens.
    fn setup_messages(&self, setup: &SessionSetup) -> Vec<ClientEvent> {
        let mut messages = vec![ClientEvent::SessionUpdate {
            session: self.build_session_config(setup),
        }];

        if self.config.send_greeting
            && let Some(greeting) = setup.greeting.as_ref()
        {
            messages.push(ClientEvent::ConversationItemCreate {
                item: ConversationItem::user_text(greeting.clone()),
            });
            messages.push(ClientEvent::ResponseCreate);
        }

        messages
    }

    /// Map a decoded server event to the backend-neutral event, if it carries one.
    fn map_server_event(
        event: ServerEvent,
        policy: &ErrorPolicy,
        call_id: &str,
    ) -> Option<BackendEvent> {
        match event {
            ServerEvent::AudioDelta { delta, item_id } => Some(BackendEvent::AudioDelta {
                payload: delta,
                turn_id: item_id,
            }),

            ServerEvent::AudioTranscriptDelta { item_id, delta } => {
                Some(BackendEvent::TranscriptDelta {
                    turn_id: item_id,
                    role: TranscriptRole::Agent,
                    text: delta,
                    is_final: false,
                })
            }

            ServerEvent::AudioTranscriptDone {
                item_id,
                transcript,
            } => Some(BackendEvent::TranscriptDelta {
                turn_id: item_id,
                role: TranscriptRole::Agent,
                text: transcript,
                is_final: true,
            }),

            ServerEvent::TranscriptionDelta { item_id, delta } => {
                Some(BackendEvent::TranscriptDelta {
                    turn_id: item_id,
                    role: TranscriptRole::User,
                    text: delta,
                    is_final: false,
                })
            }

            ServerEvent::TranscriptionCompleted {
                item_id,
                transcript,
            } => {
                tracing::debug!(call_id = %call_id, "User transcript: {}", transcript);
                Some(BackendEvent::TranscriptDelta {
                    turn_id: item_id,
                    role: TranscriptRole::User,
                    text: transcript,
                    is_final: true,
                })
            }

            ServerEvent::TranscriptionFailed { item_id, error } => {
                tracing::warn!(
                    call_id = %call_id,
                    turn_id = %item_id,
                    "Input transcription failed: {}",
                    error.map(|e| e.message).unwrap_or_default()
                );
                None
            }

            ServerEvent::SpeechStarted { item_id, .. } => {
                Some(BackendEvent::SpeechStarted { turn_id: item_id })
            }

            ServerEvent::SpeechStopped { item_id, .. } => {
                Some(BackendEvent::SpeechStopped { turn_id: item_id })
            }

            ServerEvent::InputAudioBufferCommitted { item_id, .. } => {
                Some(BackendEvent::BufferCommitted { turn_id: item_id })
            }

            ServerEvent::Error { error } => {
                let fatal =
                    !policy.is_recoverable(error.code.as_deref(), error.error_type.as_deref());
                Some(BackendEvent::Error {
                    code: error.identifier().to_string(),
                    message: error.message,
                    fatal,
                })
            }

            ServerEvent::ResponseDone { response } => {
                tracing::debug!(
                    call_id = %call_id,
                    "Response done: {}",
                    response.map(|r| r.id).unwrap_or_default()
                );
                Some(BackendEvent::Done)
            }

            ServerEvent::SessionCreated { session } => {
                tracing::info!(
                    call_id = %call_id,
                    "OpenAI Realtime session created: {}",
                    session.map(|s| s.id).unwrap_or_default()
                );
                None
            }

            ServerEvent::SessionUpdated { .. } => {
                tracing::debug!(call_id = %call_id, "OpenAI Realtime session updated");
                None
            }

            ServerEvent::InputAudioBufferCleared
            | ServerEvent::ConversationItemCreated { .. }
            | ServerEvent::ResponseCreated { .. }
            | ServerEvent::OutputItemAdded
            | ServerEvent::OutputItemDone
            | ServerEvent::ContentPartAdded
            | ServerEvent::ContentPartDone
            | ServerEvent::TextDelta
            | ServerEvent::TextDone
            | ServerEvent::AudioDone
            | ServerEvent::RateLimitsUpdated => {
                tracing::trace!(call_id = %call_id, "Lifecycle event without bridge effect");
                None
            }
        }
    }

    /// Open the socket, send the setup messages and spawn the connection task.
    async fn connect_once(&self, call_id: &str, setup: &SessionSetup) -> RealtimeResult<()> {
        let url = self.config.ws_url();

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::InvalidConfiguration(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
                .map_err(|e| RealtimeError::InvalidConfiguration(e.to_string()))?,
        );
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let connect = tokio_tungstenite::connect_async(request);
        let (ws_stream, _response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| {
                RealtimeError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    self.config.url, self.config.connect_timeout
                ))
            })?
            .map_err(|e| {
                if let tungstenite::Error::Http(response) = &e
                    && response.status() == http::StatusCode::UNAUTHORIZED
                {
                    RealtimeError::AuthenticationFailed(e.to_string())
                } else {
                    RealtimeError::ConnectionFailed(e.to_string())
                }
            })?;

        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        for event in self.setup_messages(setup) {
            let json = serde_json::to_string(&event)
                .map_err(|e| RealtimeError::SerializationError(e.to_string()))?;
            ws_sink
                .send(Message::Text(json.into()))
                .await
                .map_err(|e| RealtimeError::WebSocketError(e.to_string()))?;
        }

        tracing::info!(call_id = %call_id, "Connected to OpenAI Realtime API");

        let (tx, mut rx) = mpsc::channel::<ClientEvent>(WS_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel::<BackendEvent>();

        let connected = self.connected.clone();
        let state = self.state.clone();
        let policy = self.config.error_policy.clone();
        let task_call_id = call_id.to_string();

        connected.store(true, Ordering::SeqCst);
        *state.lock() = ConnectionState::Connected;

        let handle = tokio::spawn(async move {
            let call_id = task_call_id;
            loop {
                tokio::select! {
                    outgoing = rx.recv() => match outgoing {
                        Some(event) => {
                            let json = match serde_json::to_string(&event) {
                                Ok(j) => j,
                                Err(e) => {
                                    tracing::error!(call_id = %call_id, "Failed to serialize event: {}", e);
                                    continue;
                                }
                            };

                            if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                                tracing::error!(call_id = %call_id, "Failed to send WebSocket message: {}", e);
                                break;
                            }
                        }
                        None => {
                            // All senders dropped: graceful close requested
                            if let Err(e) = ws_sink.send(Message::Close(None)).await {
                                tracing::debug!(call_id = %call_id, "Failed to send close frame: {}", e);
                            }
                            break;
                        }
                    },

                    incoming = ws_stream.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerEvent>(&text) {
                                Ok(event) => {
                                    if let Some(mapped) = Self::map_server_event(event, &policy, &call_id)
                                        && event_tx.send(mapped).is_err()
                                    {
                                        tracing::trace!(call_id = %call_id, "Backend event consumer gone");
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(call_id = %call_id, "Failed to parse server event: {} - {}", e, text);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                tracing::error!(call_id = %call_id, "Failed to send pong: {}", e);
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(call_id = %call_id, "WebSocket closed by server: {:?}", frame);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::error!(call_id = %call_id, "WebSocket error: {}", e);
                            break;
                        }
                        None => break,
                    },
                }
            }

            connected.store(false, Ordering::SeqCst);
            {
                let mut state = state.lock();
                if *state == ConnectionState::Connected {
                    *state = ConnectionState::Disconnected;
                }
            }
            tracing::info!(call_id = %call_id, "OpenAI Realtime connection task ended");
        });

        *self.ws_sender.lock() = Some(tx);
        *self.events.lock() = Some(event_rx);
        *self.connection_handle.lock() = Some(handle);

        Ok(())
    }

    /// Stop the current connection task, if any, letting it send a close frame.
    async fn shutdown_connection(&self) {
        self.ws_sender.lock().take();

        let handle = self.connection_handle.lock().take();
        if let Some(mut handle) = handle
            && tokio::time::timeout(CLOSE_TIMEOUT, &mut handle).await.is_err()
        {
            tracing::warn!("OpenAI Realtime connection task did not stop in time, aborting");
            handle.abort();
        }

        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendSession for OpenAIRealtime {
    async fn initialize(&self, call_id: &str, setup: &SessionSetup) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            tracing::warn!(call_id = %call_id, "Backend session already closed, not initializing");
            return false;
        }

        // A previous connection may still be winding down after a restart
        self.shutdown_connection().await;
        self.events.lock().take();

        let reconnection = &self.config.reconnection;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            *self.state.lock() = ConnectionState::Connecting;

            match self.connect_once(call_id, setup).await {
                Ok(()) => return true,
                Err(RealtimeError::AuthenticationFailed(e)) => {
                    tracing::error!(call_id = %call_id, "OpenAI Realtime rejected credentials: {}", e);
                    *self.state.lock() = ConnectionState::Failed;
                    return false;
                }
                Err(e) => {
                    tracing::warn!(
                        call_id = %call_id,
                        attempt,
                        "OpenAI Realtime connection attempt failed: {}",
                        e
                    );
                }
            }

            if !reconnection.should_retry(attempt) || self.closed.load(Ordering::SeqCst) {
                tracing::error!(
                    call_id = %call_id,
                    "Giving up on OpenAI Realtime after {} attempt(s)",
                    attempt
                );
                *self.state.lock() = ConnectionState::Failed;
                return false;
            }

            let delay_ms = reconnection.calculate_delay(attempt);
            tracing::info!(call_id = %call_id, "Retrying OpenAI Realtime connection in {}ms", delay_ms);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    async fn send_audio(&self, payload: &str) -> RealtimeResult<()> {
        let sender = if self.connected.load(Ordering::SeqCst) {
            self.ws_sender.lock().clone()
        } else {
            None
        };

        let delivered = match sender {
            Some(tx) => tx.send(ClientEvent::audio_append(payload)).await.is_ok(),
            None => false,
        };

        if !delivered && self.dropped_audio.fetch_add(1, Ordering::Relaxed) == 0 {
            tracing::warn!("OpenAI Realtime connection closed, dropping caller audio");
        }

        Ok(())
    }

    fn events(&self) -> RealtimeResult<BackendEventStream> {
        self.events.lock().take().ok_or_else(|| {
            RealtimeError::SessionError(
                "event stream already taken or session not initialized".to_string(),
            )
        })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown_connection().await;
        *self.state.lock() = ConnectionState::Closed;

        let dropped = self.dropped_audio.load(Ordering::Relaxed);
        if dropped > 0 {
            tracing::info!("OpenAI Realtime closed; {} caller frame(s) were dropped", dropped);
        } else {
            tracing::info!("Disconnected from OpenAI Realtime API");
        }
    }

    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for OpenAIRealtime {
    fn drop(&mut self) {
        if let Some(handle) = self.connection_handle.get_mut().take() {
            handle.abort();
        }
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Creates one [`OpenAIRealtime`] client per call from shared settings.
#[derive(Debug, Clone)]
pub struct OpenAIRealtimeFactory {
    config: OpenAIRealtimeConfig,
}

impl OpenAIRealtimeFactory {
    pub fn new(config: OpenAIRealtimeConfig) -> RealtimeResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl RealtimeFactory for OpenAIRealtimeFactory {
    fn create_session(&self) -> RealtimeResult<SharedBackend> {
        Ok(Arc::new(OpenAIRealtime::new(self.config.clone())?))
    }
}

// =============================================================================
// Tests
// =============================================================================
