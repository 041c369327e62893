//! Out-of-band control of a live phone call.
//!
//! When a call cannot be bridged the caller should hear an apology instead of
//! silence. The media stream cannot play speech on its own, so the live call
//! is redirected through the carrier's REST API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ServerConfig;

pub const DEFAULT_APOLOGY_MESSAGE: &str =
    "We're sorry, but there was an error connecting to our voice assistant.";

pub const DEFAULT_TWILIO_API_BASE_URL: &str = "https://api.twilio.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum CallControlError {
    #[error("Call control request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Call control API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid call id: {0:?}")]
    InvalidCallId(String),
}

#[async_trait]
pub trait CallControl: Send + Sync {
    /// Speak `message` on the live call and hang up.
    async fn apologize_and_hangup(&self, call_id: &str, message: &str)
    -> Result<(), CallControlError>;
}

pub type SharedCallControl = Arc<dyn CallControl>;

/// Escape text for inclusion in TwiML.
pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// TwiML that says `message` and ends the call.
pub fn apology_twiml(message: &str) -> String {
    format!(
        "<Response><Say voice=\"alice\">{}</Say><Hangup/></Response>",
        xml_escape(message)
    )
}

/// Updates live calls through the Twilio REST API.
pub struct TwilioCallControl {
    account_sid: String,
    auth_token: String,
    base_url: String,
    client: reqwest::Client,
}

impl TwilioCallControl {
    pub fn new(
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn call_url(&self, call_id: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls/{}.json",
            self.base_url, self.account_sid, call_id
        )
    }
}

impl Drop for TwilioCallControl {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.auth_token.zeroize();
    }
}

#[async_trait]
impl CallControl for TwilioCallControl {
    async fn apologize_and_hangup(
        &self,
        call_id: &str,
        message: &str,
    ) -> Result<(), CallControlError> {
        if call_id.is_empty() || !call_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CallControlError::InvalidCallId(call_id.to_string()));
        }

        let response = self
            .client
            .post(self.call_url(call_id))
            .timeout(REQUEST_TIMEOUT)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Twiml", apology_twiml(message))])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallControlError::Api {
                status: status.as_u16(),
                body,
            });
        }

        info!(call_id = %call_id, "Apology played, call ended");
        Ok(())
    }
}

/// Used when no carrier credentials are configured; only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallControl;

#[async_trait]
impl CallControl for NoopCallControl {
    async fn apologize_and_hangup(
        &self,
        call_id: &str,
        message: &str,
    ) -> Result<(), CallControlError> {
        warn!(
            call_id = %call_id,
            "Call control not configured, cannot play apology: {}",
            message
        );
        Ok(())
    }
}

/// Twilio when both credentials are present, otherwise the logging no-op.
pub fn create_call_control(config: &ServerConfig) -> SharedCallControl {
    match (&config.twilio_account_sid, &config.twilio_auth_token) {
        (Some(sid), Some(token)) => Arc::new(TwilioCallControl::new(
            sid.clone(),
            token.clone(),
            config.twilio_api_base_url.clone(),
        )),
        _ => {
            info!("Twilio credentials not configured, call-control fallback disabled");
            Arc::new(NoopCallControl)
        }
    }
}
