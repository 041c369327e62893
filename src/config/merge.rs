use std::path::PathBuf;

use super::ServerConfig;
use super::env::{env_bool, env_parse, env_var};
use super::utils::parse_list;
use super::validation::validate_tls;
use super::yaml::YamlConfig;
use crate::core::codec::AudioEncoding;

/// Merge YAML configuration with environment variables
///
/// Priority order (highest to lowest):
/// 1. YAML configuration values
/// 2. Environment variables
/// 3. Default values
///
/// This allows environment variables to provide base configuration while YAML
/// can override specific values for different deployment environments.
///
/// # Arguments
/// * `yaml_config` - Optional YAML configuration to use as overrides
///
/// # Returns
/// * `Result<ServerConfig, Box<dyn std::error::Error>>` - The merged configuration or an error
pub fn merge_config(
    yaml_config: Option<YamlConfig>,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let yaml = yaml_config.unwrap_or_default();
    let defaults = ServerConfig::default();

    // Helper macro to get value with priority: YAML > ENV > Default
    macro_rules! get_value {
        ($env_var:expr, $yaml_value:expr, $default:expr) => {
            $yaml_value
                .or_else(|| env_var($env_var))
                .unwrap_or_else(|| $default.to_string())
        };
    }

    // Helper macro for optional values: YAML > ENV
    macro_rules! get_optional {
        ($env_var:expr, $yaml_value:expr) => {
            $yaml_value.or_else(|| env_var($env_var))
        };
    }

    // Helper macro for parsed values: YAML > ENV (parsed) > Default
    macro_rules! get_parsed {
        ($env_var:expr, $yaml_value:expr, $default:expr) => {
            match $yaml_value {
                Some(value) => value,
                None => env_parse($env_var)?.unwrap_or($default),
            }
        };
    }

    let server = yaml.server.as_ref();
    let openai = yaml.openai.as_ref();
    let bridge = yaml.bridge.as_ref();
    let storage = yaml.storage.as_ref();
    let twilio = yaml.twilio.as_ref();

    // Server configuration
    let host = get_value!("HOST", server.and_then(|s| s.host.clone()), defaults.host);
    let port: u16 = get_parsed!("PORT", server.and_then(|s| s.port), defaults.port);
    let public_url = get_optional!("PUBLIC_URL", server.and_then(|s| s.public_url.clone()));

    // TLS: YAML can switch it off explicitly
    let tls_yaml = server.and_then(|s| s.tls.as_ref());
    let tls = if tls_yaml.and_then(|t| t.enabled) == Some(false) {
        None
    } else {
        let cert_path = get_optional!(
            "TLS_CERT_PATH",
            tls_yaml.and_then(|t| t.cert_path.clone())
        )
        .map(PathBuf::from);
        let key_path = get_optional!("TLS_KEY_PATH", tls_yaml.and_then(|t| t.key_path.clone()))
            .map(PathBuf::from);
        validate_tls(cert_path, key_path)?
    };

    // Realtime backend
    let openai_api_key = get_optional!("OPENAI_API_KEY", openai.and_then(|o| o.api_key.clone()));
    let realtime_url = get_value!(
        "OPENAI_REALTIME_URL",
        openai.and_then(|o| o.url.clone()),
        defaults.realtime_url
    );
    let realtime_model = get_value!(
        "OPENAI_REALTIME_MODEL",
        openai.and_then(|o| o.model.clone()),
        defaults.realtime_model
    );
    let realtime_voice = get_value!(
        "OPENAI_REALTIME_VOICE",
        openai.and_then(|o| o.voice.clone()),
        defaults.realtime_voice
    );
    let realtime_temperature: f32 = get_parsed!(
        "OPENAI_REALTIME_TEMPERATURE",
        openai.and_then(|o| o.temperature),
        defaults.realtime_temperature
    );
    let backend_audio_format = match get_optional!(
        "BACKEND_AUDIO_FORMAT",
        openai.and_then(|o| o.audio_format.clone())
    ) {
        Some(format) => AudioEncoding::parse(&format).ok_or_else(|| {
            format!(
                "Invalid BACKEND_AUDIO_FORMAT {format:?}: expected g711_ulaw, g711_alaw or pcm16"
            )
        })?,
        None => defaults.backend_audio_format,
    };
    let transcription_model = get_optional!(
        "OPENAI_TRANSCRIPTION_MODEL",
        openai.and_then(|o| o.transcription_model.clone())
    );
    let send_greeting = match openai.and_then(|o| o.send_greeting) {
        Some(value) => value,
        None => env_bool("SEND_GREETING")?.unwrap_or(defaults.send_greeting),
    };
    let backend_connect_attempts: u32 = get_parsed!(
        "BACKEND_CONNECT_ATTEMPTS",
        openai.and_then(|o| o.connect_attempts),
        defaults.backend_connect_attempts
    );
    let backend_retry_delay_ms: u64 = get_parsed!(
        "BACKEND_RETRY_DELAY_MS",
        openai.and_then(|o| o.retry_delay_ms),
        defaults.backend_retry_delay_ms
    );
    let backend_connect_timeout_ms: u64 = get_parsed!(
        "BACKEND_CONNECT_TIMEOUT_MS",
        openai.and_then(|o| o.connect_timeout_ms),
        defaults.backend_connect_timeout_ms
    );
    let recoverable_error_codes = openai
        .and_then(|o| o.recoverable_error_codes.clone())
        .or_else(|| env_var("RECOVERABLE_ERROR_CODES").map(|v| parse_list(&v)))
        .unwrap_or_else(|| defaults.recoverable_error_codes.clone());

    // Bridge tuning
    let handshake_timeout_ms: u64 = get_parsed!(
        "HANDSHAKE_TIMEOUT_MS",
        bridge.and_then(|b| b.handshake_timeout_ms),
        defaults.handshake_timeout_ms
    );
    let drain_grace_ms: u64 = get_parsed!(
        "DRAIN_GRACE_MS",
        bridge.and_then(|b| b.drain_grace_ms),
        defaults.drain_grace_ms
    );
    let placeholder_timeout_ms: u64 = get_parsed!(
        "PLACEHOLDER_TIMEOUT_MS",
        bridge.and_then(|b| b.placeholder_timeout_ms),
        defaults.placeholder_timeout_ms
    );
    let max_backend_restarts: u32 = get_parsed!(
        "MAX_BACKEND_RESTARTS",
        bridge.and_then(|b| b.max_backend_restarts),
        defaults.max_backend_restarts
    );
    let max_buffered_frames: usize = get_parsed!(
        "MAX_BUFFERED_FRAMES",
        bridge.and_then(|b| b.max_buffered_frames),
        defaults.max_buffered_frames
    );
    let outbound_channel_capacity: usize = get_parsed!(
        "OUTBOUND_CHANNEL_CAPACITY",
        bridge.and_then(|b| b.outbound_channel_capacity),
        defaults.outbound_channel_capacity
    );
    let persist_timeout_ms: u64 = get_parsed!(
        "PERSIST_TIMEOUT_MS",
        bridge.and_then(|b| b.persist_timeout_ms),
        defaults.persist_timeout_ms
    );
    let max_sessions: Option<usize> = match bridge.and_then(|b| b.max_sessions) {
        Some(value) => Some(value),
        None => env_parse("MAX_SESSIONS")?,
    };

    // Conversation storage
    let storage_local_path = get_optional!(
        "STORAGE_LOCAL_PATH",
        storage.and_then(|s| s.local_path.clone())
    )
    .map(PathBuf::from);
    let recording_s3_bucket = get_optional!(
        "RECORDING_S3_BUCKET",
        storage.and_then(|s| s.s3_bucket.clone())
    );
    let recording_s3_region = get_optional!(
        "RECORDING_S3_REGION",
        storage.and_then(|s| s.s3_region.clone())
    );
    let recording_s3_endpoint = get_optional!(
        "RECORDING_S3_ENDPOINT",
        storage.and_then(|s| s.s3_endpoint.clone())
    );
    let recording_s3_access_key = get_optional!(
        "RECORDING_S3_ACCESS_KEY",
        storage.and_then(|s| s.s3_access_key.clone())
    );
    let recording_s3_secret_key = get_optional!(
        "RECORDING_S3_SECRET_KEY",
        storage.and_then(|s| s.s3_secret_key.clone())
    );
    let recording_s3_prefix = get_optional!(
        "RECORDING_S3_PREFIX",
        storage.and_then(|s| s.s3_prefix.clone())
    );

    // Call control
    let twilio_account_sid = get_optional!(
        "TWILIO_ACCOUNT_SID",
        twilio.and_then(|t| t.account_sid.clone())
    );
    let twilio_auth_token = get_optional!(
        "TWILIO_AUTH_TOKEN",
        twilio.and_then(|t| t.auth_token.clone())
    );
    let twilio_api_base_url = get_value!(
        "TWILIO_API_BASE_URL",
        twilio.and_then(|t| t.api_base_url.clone()),
        defaults.twilio_api_base_url
    );
    let apology_message = get_value!(
        "APOLOGY_MESSAGE",
        twilio.and_then(|t| t.apology_message.clone()),
        defaults.apology_message
    );

    // Security
    let cors_allowed_origins = get_optional!(
        "CORS_ALLOWED_ORIGINS",
        yaml.security
            .as_ref()
            .and_then(|s| s.cors_allowed_origins.clone())
    );

    Ok(ServerConfig {
        host,
        port,
        tls,
        public_url,
        openai_api_key,
        realtime_url,
        realtime_model,
        realtime_voice,
        realtime_temperature,
        backend_audio_format,
        transcription_model,
        send_greeting,
        backend_connect_attempts,
        backend_retry_delay_ms,
        backend_connect_timeout_ms,
        recoverable_error_codes,
        handshake_timeout_ms,
        drain_grace_ms,
        placeholder_timeout_ms,
        max_backend_restarts,
        max_buffered_frames,
        outbound_channel_capacity,
        persist_timeout_ms,
        max_sessions,
        storage_local_path,
        recording_s3_bucket,
        recording_s3_region,
        recording_s3_endpoint,
        recording_s3_access_key,
        recording_s3_secret_key,
        recording_s3_prefix,
        twilio_account_sid,
        twilio_auth_token,
        twilio_api_base_url,
        apology_message,
        cors_allowed_origins,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::yaml::{BridgeYaml, OpenAIYaml, ServerYaml, StorageYaml, TlsYaml};
    use serial_test::serial;
    use std::env;

    fn cleanup_env_vars() {
        unsafe {
            env::remove_var("HOST");
            env::remove_var("PORT");
            env::remove_var("OPENAI_API_KEY");
            env::remove_var("OPENAI_REALTIME_MODEL");
            env::remove_var("DRAIN_GRACE_MS");
            env::remove_var("MAX_SESSIONS");
            env::remove_var("TLS_CERT_PATH");
            env::remove_var("TLS_KEY_PATH");
            env::remove_var("STORAGE_LOCAL_PATH");
        }
    }

    #[test]
    #[serial]
    fn test_merge_defaults_only() {
        cleanup_env_vars();

        let config = merge_config(None).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3001);
        assert_eq!(config.realtime_model, "gpt-4o-realtime-preview");
        assert_eq!(config.drain_grace_ms, 1000);
        assert_eq!(
            config.recoverable_error_codes,
            vec!["server_error", "rate_limit_exceeded", "rate_limit_error"]
        );
    }

    #[test]
    #[serial]
    fn test_yaml_overrides_env() {
        cleanup_env_vars();
        unsafe {
            env::set_var("HOST", "10.0.0.1");
            env::set_var("PORT", "4000");
            env::set_var("OPENAI_API_KEY", "sk-env");
            env::set_var("OPENAI_REALTIME_MODEL", "env-model");
            env::set_var("DRAIN_GRACE_MS", "500");
            env::set_var("MAX_SESSIONS", "10");
        }

        let yaml = YamlConfig {
            server: Some(ServerYaml {
                port: Some(5000),
                ..Default::default()
            }),
            openai: Some(OpenAIYaml {
                api_key: Some("sk-yaml".to_string()),
                ..Default::default()
            }),
            bridge: Some(BridgeYaml {
                max_sessions: Some(3),
                ..Default::default()
            }),
            storage: Some(StorageYaml {
                local_path: Some("/var/lib/calls".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = merge_config(Some(yaml)).unwrap();
        // YAML wins where present
        assert_eq!(config.port, 5000);
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-yaml"));
        assert_eq!(config.max_sessions, Some(3));
        assert_eq!(
            config.storage_local_path,
            Some(PathBuf::from("/var/lib/calls"))
        );
        // ENV fills the rest
        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.realtime_model, "env-model");
        assert_eq!(config.drain_grace_ms, 500);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_yaml_can_disable_tls() {
        cleanup_env_vars();
        unsafe {
            env::set_var("TLS_CERT_PATH", "/missing/cert.pem");
            env::set_var("TLS_KEY_PATH", "/missing/key.pem");
        }

        let yaml = YamlConfig {
            server: Some(ServerYaml {
                tls: Some(TlsYaml {
                    enabled: Some(false),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = merge_config(Some(yaml)).unwrap();
        assert!(config.tls.is_none());

        // Without the override the missing files are reported
        assert!(merge_config(None).is_err());

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_invalid_numeric_env_rejected() {
        cleanup_env_vars();
        unsafe {
            env::set_var("DRAIN_GRACE_MS", "soon");
        }

        let err = merge_config(None).unwrap_err();
        assert!(err.to_string().contains("DRAIN_GRACE_MS"));

        cleanup_env_vars();
    }
}
