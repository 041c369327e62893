//! Media-stream WebSocket handler
//!
//! Upgrades the carrier's media-stream request and hands the socket to the
//! [`CallBridge`](super::bridge::CallBridge). Outgoing frames are written by a
//! dedicated task fed through a bounded channel.

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::session::BusinessProfile;
use crate::state::AppState;

use super::bridge::TelephonyRead;
use super::messages::OutboundFrame;

/// Maximum WebSocket frame size (10 MB)
const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum WebSocket message size (10 MB)
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Query parameters of the media-stream URL
#[derive(Debug, Default, Deserialize)]
pub struct MediaStreamQuery {
    /// Business profile name (`salon`, `restaurant`); anything else is the default
    #[serde(rename = "type")]
    pub profile: Option<String>,
}

/// Media-stream WebSocket handler
///
/// Each upgraded connection carries exactly one phone call.
pub async fn media_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<MediaStreamQuery>,
) -> Response {
    let profile = BusinessProfile::from_query(query.profile.as_deref());
    info!(profile = %profile, "Media stream connection upgrade requested");

    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_media_stream_socket(socket, state, profile))
}

fn telephony_read(message: Result<Message, axum::Error>) -> TelephonyRead {
    match message {
        Ok(Message::Text(text)) => TelephonyRead::Text(text.to_string()),
        Ok(Message::Close(_)) => TelephonyRead::Closed,
        Ok(_) => TelephonyRead::Ignored,
        Err(e) => TelephonyRead::Failed(e.to_string()),
    }
}

async fn handle_media_stream_socket(
    socket: WebSocket,
    app_state: Arc<AppState>,
    profile: BusinessProfile,
) {
    let (mut sender, receiver) = socket.split();
    let capacity = app_state.bridge.settings().outbound_channel_capacity;
    let (frame_tx, mut frame_rx) = mpsc::channel::<OutboundFrame>(capacity.max(1));

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let result = match frame {
                OutboundFrame::Media(media) => match serde_json::to_string(&media) {
                    Ok(json_str) => sender.send(Message::Text(json_str.into())).await,
                    Err(e) => {
                        error!("Failed to serialize outgoing media frame: {}", e);
                        continue;
                    }
                },
                OutboundFrame::Close => {
                    debug!("Closing media stream WebSocket connection");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };

            if let Err(e) = result {
                warn!("Failed to send media frame, stopping writer: {}", e);
                break;
            }
        }
    });

    let inbound = receiver.map(telephony_read);
    if let Err(e) = app_state
        .bridge
        .serve(inbound, frame_tx.clone(), profile)
        .await
    {
        warn!("Media stream ended with error: {}", e);
    }

    // The writer may already be gone if the carrier hung up first
    let _ = frame_tx.send(OutboundFrame::Close).await;
    drop(frame_tx);

    if let Err(e) = sender_task.await {
        error!("Media stream writer task failed: {}", e);
    }
    info!("Media stream WebSocket connection terminated");
}
