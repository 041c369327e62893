//! Telephony media-stream handling
//!
//! The carrier opens one WebSocket per phone call. Frames are decoded in
//! [`messages`], the call is orchestrated by [`bridge`] and [`handler`] ties
//! both to axum.

pub mod bridge;
pub mod handler;
pub mod messages;

pub use bridge::{BridgeError, BridgeSettings, CallBridge, Handshake, TelephonyRead};
pub use handler::{MediaStreamQuery, media_stream_handler};
pub use messages::{MediaStreamEvent, OutboundFrame, OutboundMedia};
