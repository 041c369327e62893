//! Configuration module for the call bridge server
//!
//! This module handles server configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//! The configuration is split into logical submodules for maintainability.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//! - `utils`: Utility functions for configuration parsing
//!
//! # Example
//! ```rust,no_run
//! use call_bridge::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

mod env;
mod merge;
mod utils;
mod validation;
mod yaml;

use crate::call_control::{DEFAULT_APOLOGY_MESSAGE, DEFAULT_TWILIO_API_BASE_URL};
use crate::core::codec::{AudioCodecAdapter, AudioEncoding};
use crate::core::realtime::openai::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_REALTIME_MODEL};
use crate::core::realtime::{
    DEFAULT_RECOVERABLE_ERROR_CODES, ErrorPolicy, OPENAI_REALTIME_URL, OpenAIRealtimeConfig,
    OpenAIRealtimeVoice, ReconnectionConfig,
};
use crate::handlers::media_stream::BridgeSettings;
use crate::handlers::media_stream::bridge::{
    DEFAULT_DRAIN_GRACE, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_BUFFERED_FRAMES,
    DEFAULT_OUTBOUND_CHANNEL_CAPACITY, DEFAULT_PERSIST_TIMEOUT, DEFAULT_PLACEHOLDER_TIMEOUT,
};

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// Server configuration
///
/// Contains all configuration needed to run the call bridge, including:
/// - Server settings (host, port, TLS, public URL)
/// - Realtime backend settings
/// - Bridge timeouts and limits
/// - Conversation storage (local directory or S3)
/// - Carrier call control (Twilio)
/// - Security settings (CORS)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    /// Public host used in TwiML stream URLs; the request `Host` header
    /// is used when unset
    pub public_url: Option<String>,

    // Realtime backend
    /// Required to serve calls
    pub openai_api_key: Option<String>,
    pub realtime_url: String,
    pub realtime_model: String,
    pub realtime_voice: String,
    pub realtime_temperature: f32,
    /// Encoding exchanged with the backend; telephony is always G.711 µ-law
    pub backend_audio_format: AudioEncoding,
    /// Enables caller transcription when set
    pub transcription_model: Option<String>,
    pub send_greeting: bool,
    pub backend_connect_attempts: u32,
    pub backend_retry_delay_ms: u64,
    pub backend_connect_timeout_ms: u64,
    /// Backend error codes that do not end the call
    pub recoverable_error_codes: Vec<String>,

    // Bridge tuning
    pub handshake_timeout_ms: u64,
    pub drain_grace_ms: u64,
    pub placeholder_timeout_ms: u64,
    pub max_backend_restarts: u32,
    /// Per direction
    pub max_buffered_frames: usize,
    pub outbound_channel_capacity: usize,
    pub persist_timeout_ms: u64,
    /// Maximum concurrent calls
    /// Default: None (unlimited)
    pub max_sessions: Option<usize>,

    // Conversation storage
    /// Used when no S3 bucket is configured
    pub storage_local_path: Option<PathBuf>,
    pub recording_s3_bucket: Option<String>,
    pub recording_s3_region: Option<String>,
    pub recording_s3_endpoint: Option<String>,
    pub recording_s3_access_key: Option<String>,
    pub recording_s3_secret_key: Option<String>,
    /// Optional key prefix: `{prefix}/transcripts/{call_id}/...`
    pub recording_s3_prefix: Option<String>,

    // Call control
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_api_base_url: String,
    /// Spoken to the caller when the call cannot be bridged
    pub apology_message: String,

    // Security configuration
    /// CORS allowed origins (comma-separated list or "*" for all)
    /// Default: None (CORS disabled, same-origin only)
    pub cors_allowed_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            tls: None,
            public_url: None,
            openai_api_key: None,
            realtime_url: OPENAI_REALTIME_URL.to_string(),
            realtime_model: DEFAULT_REALTIME_MODEL.to_string(),
            realtime_voice: OpenAIRealtimeVoice::default().to_string(),
            realtime_temperature: 0.7,
            backend_audio_format: AudioEncoding::G711Ulaw,
            transcription_model: None,
            send_greeting: true,
            backend_connect_attempts: 3,
            backend_retry_delay_ms: 250,
            backend_connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            recoverable_error_codes: DEFAULT_RECOVERABLE_ERROR_CODES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
            drain_grace_ms: DEFAULT_DRAIN_GRACE.as_millis() as u64,
            placeholder_timeout_ms: DEFAULT_PLACEHOLDER_TIMEOUT.as_millis() as u64,
            max_backend_restarts: 1,
            max_buffered_frames: DEFAULT_MAX_BUFFERED_FRAMES,
            outbound_channel_capacity: DEFAULT_OUTBOUND_CHANNEL_CAPACITY,
            persist_timeout_ms: DEFAULT_PERSIST_TIMEOUT.as_millis() as u64,
            max_sessions: None,
            storage_local_path: None,
            recording_s3_bucket: None,
            recording_s3_region: None,
            recording_s3_endpoint: None,
            recording_s3_access_key: None,
            recording_s3_secret_key: None,
            recording_s3_prefix: None,
            twilio_account_sid: None,
            twilio_auth_token: None,
            twilio_api_base_url: DEFAULT_TWILIO_API_BASE_URL.to_string(),
            apology_message: DEFAULT_APOLOGY_MESSAGE.to_string(),
            cors_allowed_origins: None,
        }
    }
}

/// Implement Drop to zeroize all secret fields when ServerConfig is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.openai_api_key {
            key.zeroize();
        }
        if let Some(ref mut key) = self.recording_s3_access_key {
            key.zeroize();
        }
        if let Some(ref mut secret) = self.recording_s3_secret_key {
            secret.zeroize();
        }
        if let Some(ref mut token) = self.twilio_auth_token {
            token.zeroize();
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file with environment variable base
    ///
    /// Merges environment variables (with defaults) and applies YAML overrides.
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// After loading and merging, performs validation on the final configuration.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        // .env is loaded in main.rs at startup; YAML overrides all environment variables
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints of a merged configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        validation::validate_max_sessions(self.max_sessions)?;
        validation::validate_s3_storage(
            &self.recording_s3_bucket,
            &self.recording_s3_region,
            &self.recording_s3_endpoint,
        )?;
        validation::validate_non_zero(
            "OUTBOUND_CHANNEL_CAPACITY",
            self.outbound_channel_capacity as u64,
        )?;
        validation::validate_non_zero("HANDSHAKE_TIMEOUT_MS", self.handshake_timeout_ms)?;
        validation::validate_non_zero("PERSIST_TIMEOUT_MS", self.persist_timeout_ms)?;
        Ok(())
    }

    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Backend client configuration derived from these settings
    pub fn realtime_config(&self) -> OpenAIRealtimeConfig {
        let attempts = self.backend_connect_attempts.max(1);
        OpenAIRealtimeConfig {
            api_key: self.openai_api_key.clone().unwrap_or_default(),
            url: self.realtime_url.clone(),
            model: self.realtime_model.clone(),
            voice: OpenAIRealtimeVoice::from_str_or_default(&self.realtime_voice),
            temperature: self.realtime_temperature,
            audio_format: self.backend_audio_format,
            transcription_model: self.transcription_model.clone(),
            send_greeting: self.send_greeting,
            connect_timeout: Duration::from_millis(self.backend_connect_timeout_ms),
            reconnection: ReconnectionConfig {
                enabled: attempts > 1,
                max_attempts: attempts,
                initial_delay_ms: self.backend_retry_delay_ms,
                ..Default::default()
            },
            error_policy: ErrorPolicy::new(&self.recoverable_error_codes),
        }
    }

    /// Timeouts and limits for the call bridge
    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            drain_grace: Duration::from_millis(self.drain_grace_ms),
            placeholder_timeout: Duration::from_millis(self.placeholder_timeout_ms),
            persist_timeout: Duration::from_millis(self.persist_timeout_ms),
            max_backend_restarts: self.max_backend_restarts,
            max_buffered_frames: self.max_buffered_frames,
            outbound_channel_capacity: self.outbound_channel_capacity,
            apology_message: self.apology_message.clone(),
        }
    }

    /// Audio conversion between the carrier and the backend
    pub fn codec(&self) -> AudioCodecAdapter {
        AudioCodecAdapter::new(AudioEncoding::G711Ulaw, self.backend_audio_format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env as std_env;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_address_and_tls() {
        let mut config = ServerConfig::default();
        config.host = "127.0.0.1".to_string();
        config.port = 8443;
        assert_eq!(config.address(), "127.0.0.1:8443");
        assert!(!config.is_tls_enabled());

        config.tls = Some(TlsConfig {
            cert_path: PathBuf::from("/tmp/cert.pem"),
            key_path: PathBuf::from("/tmp/key.pem"),
        });
        assert!(config.is_tls_enabled());
    }

    #[test]
    fn test_realtime_config_mapping() {
        let mut config = ServerConfig::default();
        config.openai_api_key = Some("sk-test".to_string());
        config.realtime_voice = "shimmer".to_string();
        config.backend_audio_format = AudioEncoding::Pcm16;
        config.backend_connect_attempts = 1;
        config.recoverable_error_codes = vec!["session_expired".to_string()];

        let realtime = config.realtime_config();
        assert_eq!(realtime.api_key, "sk-test");
        assert_eq!(realtime.voice, OpenAIRealtimeVoice::Shimmer);
        assert_eq!(realtime.audio_format, AudioEncoding::Pcm16);
        assert!(!realtime.reconnection.enabled);
        assert!(realtime.error_policy.is_recoverable(Some("session_expired"), None));
        assert!(!realtime.error_policy.is_recoverable(Some("server_error"), None));
        assert!(realtime.validate().is_ok());
    }

    #[test]
    fn test_bridge_settings_and_codec() {
        let mut config = ServerConfig::default();
        config.drain_grace_ms = 250;
        config.apology_message = "Sorry".to_string();

        let settings = config.bridge_settings();
        assert_eq!(settings.drain_grace, Duration::from_millis(250));
        assert_eq!(settings.handshake_timeout, Duration::from_secs(10));
        assert_eq!(settings.apology_message, "Sorry");
        assert!(config.codec().is_passthrough());

        config.backend_audio_format = AudioEncoding::Pcm16;
        assert!(!config.codec().is_passthrough());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_ok());
        config.outbound_channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_file() {
        unsafe {
            std_env::remove_var("PORT");
            std_env::remove_var("OPENAI_API_KEY");
        }
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        fs::write(
            &path,
            "server:\n  port: 9100\nopenai:\n  api_key: \"sk-file\"\nbridge:\n  max_sessions: 4\n",
        )
        .unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-file"));
        assert_eq!(config.max_sessions, Some(4));
    }

    #[test]
    #[serial]
    fn test_from_file_validates() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        fs::write(&path, "storage:\n  s3_bucket: \"calls\"\n").unwrap();

        unsafe {
            std_env::remove_var("RECORDING_S3_REGION");
            std_env::remove_var("RECORDING_S3_ENDPOINT");
        }
        assert!(ServerConfig::from_file(&path).is_err());
    }
}
