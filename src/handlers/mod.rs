//! HTTP and WebSocket request handlers
//!
//! This module organizes all handlers into logical groups:
//! - `api` - Health check and service banner
//! - `media_stream` - Telephony media-stream WebSocket bridged to the realtime backend
//! - `twiml` - Voice webhooks answering incoming calls

pub mod api;
pub mod media_stream;
pub mod twiml;

// Re-export commonly used handlers for convenient access
pub use media_stream::media_stream_handler;
