use serde::Deserialize;
use std::path::PathBuf;

/// Complete YAML configuration structure
///
/// This structure represents the full configuration that can be loaded from a YAML file.
/// All fields are optional to allow partial configuration. Values present here
/// override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 3001
///   public_url: "https://calls.example.com"
///   tls:
///     cert_path: "/etc/tls/cert.pem"
///     key_path: "/etc/tls/key.pem"
///
/// openai:
///   api_key: "sk-..."
///   url: "wss://api.openai.com/v1/realtime"
///   model: "gpt-4o-realtime-preview"
///   voice: "alloy"
///   temperature: 0.7
///   audio_format: "g711_ulaw"
///   transcription_model: "whisper-1"
///   send_greeting: true
///   connect_attempts: 3
///   retry_delay_ms: 250
///   connect_timeout_ms: 10000
///   recoverable_error_codes: ["server_error", "rate_limit_exceeded"]
///
/// bridge:
///   handshake_timeout_ms: 10000
///   drain_grace_ms: 1000
///   placeholder_timeout_ms: 2000
///   max_backend_restarts: 1
///   max_buffered_frames: 90000
///   outbound_channel_capacity: 1024
///   persist_timeout_ms: 30000
///   max_sessions: 200
///
/// storage:
///   local_path: "/var/lib/call-bridge"
///   s3_bucket: "call-recordings"
///   s3_region: "us-east-1"
///   s3_prefix: "production"
///   s3_endpoint: "http://localhost:9000"
///   s3_access_key: "access-key"
///   s3_secret_key: "secret-key"
///
/// twilio:
///   account_sid: "AC..."
///   auth_token: "..."
///   api_base_url: "https://api.twilio.com"
///   apology_message: "Sorry, please call again later."
///
/// security:
///   cors_allowed_origins: "https://dashboard.example.com"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub openai: Option<OpenAIYaml>,
    pub bridge: Option<BridgeYaml>,
    pub storage: Option<StorageYaml>,
    pub twilio: Option<TwilioYaml>,
    pub security: Option<SecurityYaml>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Public host used in TwiML stream URLs
    pub public_url: Option<String>,
    pub tls: Option<TlsYaml>,
}

/// TLS configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsYaml {
    pub enabled: Option<bool>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Realtime backend configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OpenAIYaml {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub temperature: Option<f32>,
    /// `g711_ulaw`, `g711_alaw` or `pcm16`
    pub audio_format: Option<String>,
    pub transcription_model: Option<String>,
    pub send_greeting: Option<bool>,
    pub connect_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub recoverable_error_codes: Option<Vec<String>>,
}

/// Call bridge tuning from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BridgeYaml {
    pub handshake_timeout_ms: Option<u64>,
    pub drain_grace_ms: Option<u64>,
    pub placeholder_timeout_ms: Option<u64>,
    pub max_backend_restarts: Option<u32>,
    pub max_buffered_frames: Option<usize>,
    pub outbound_channel_capacity: Option<usize>,
    pub persist_timeout_ms: Option<u64>,
    pub max_sessions: Option<usize>,
}

/// Conversation storage from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageYaml {
    pub local_path: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_prefix: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
}

/// Carrier call-control configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TwilioYaml {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub api_base_url: Option<String>,
    pub apology_message: Option<String>,
}

/// Security configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    /// CORS allowed origins (comma-separated or "*")
    pub cors_allowed_origins: Option<String>,
}

impl YamlConfig {
    /// Load YAML configuration from a file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Result<Self, Box<dyn std::error::Error>>` - The parsed configuration or an error
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}
