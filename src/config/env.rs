use std::env;
use std::fmt::Display;
use std::str::FromStr;

use super::ServerConfig;
use super::merge::merge_config;
use super::utils::parse_bool;

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// Reads configuration from environment variables, with defaults for
    /// everything except credentials. The .env file is loaded in main.rs at
    /// application startup, so its values arrive here as environment variables.
    ///
    /// # Returns
    /// * `Result<Self, Box<dyn std::error::Error>>` - The loaded configuration or an error
    ///
    /// # Errors
    /// Returns an error if:
    /// - Numeric or boolean environment variables are malformed
    /// - TLS, storage or session-limit settings are inconsistent
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = merge_config(None)?;
        config.validate()?;
        Ok(config)
    }
}

/// Read an environment variable, treating an empty value as unset
pub(super) fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Read and parse an environment variable
pub(super) fn env_parse<T>(name: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: Display,
{
    env_var(name)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| format!("Invalid {name} environment variable: {e}"))
        })
        .transpose()
}

/// Read a boolean environment variable (`true/false/1/0/yes/no`)
pub(super) fn env_bool(name: &str) -> Result<Option<bool>, String> {
    env_var(name)
        .map(|v| {
            parse_bool(&v).ok_or_else(|| format!("Invalid {name} environment variable: {v:?}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::AudioEncoding;
    use serial_test::serial;
    use std::time::Duration;

    const VARS: &[&str] = &[
        "HOST",
        "PORT",
        "OPENAI_API_KEY",
        "OPENAI_REALTIME_VOICE",
        "BACKEND_AUDIO_FORMAT",
        "SEND_GREETING",
        "PLACEHOLDER_TIMEOUT_MS",
        "MAX_SESSIONS",
        "RECOVERABLE_ERROR_CODES",
        "RECORDING_S3_BUCKET",
        "RECORDING_S3_REGION",
        "TLS_CERT_PATH",
        "TLS_KEY_PATH",
        "TWILIO_ACCOUNT_SID",
        "PUBLIC_URL",
    ];

    // Helper to clean up environment variables after tests
    fn cleanup_env_vars() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        cleanup_env_vars();

        let config = ServerConfig::from_env().expect("Should load config");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3001);
        assert!(config.openai_api_key.is_none());
        assert_eq!(config.backend_audio_format, AudioEncoding::G711Ulaw);
        assert!(config.send_greeting);
        assert_eq!(config.placeholder_timeout_ms, 2000);
        assert!(config.max_sessions.is_none());
        assert!(!config.is_tls_enabled());

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_values() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "8080");
            env::set_var("OPENAI_API_KEY", "sk-env");
            env::set_var("OPENAI_REALTIME_VOICE", "verse");
            env::set_var("BACKEND_AUDIO_FORMAT", "pcm16");
            env::set_var("SEND_GREETING", "no");
            env::set_var("PLACEHOLDER_TIMEOUT_MS", "1500");
            env::set_var("MAX_SESSIONS", "25");
            env::set_var("RECOVERABLE_ERROR_CODES", "server_error, session_expired");
            env::set_var("PUBLIC_URL", "https://calls.example.com/");
        }

        let config = ServerConfig::from_env().expect("Should load config");
        assert_eq!(config.port, 8080);
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-env"));
        assert_eq!(config.realtime_voice, "verse");
        assert_eq!(config.backend_audio_format, AudioEncoding::Pcm16);
        assert!(!config.send_greeting);
        assert_eq!(config.max_sessions, Some(25));
        assert_eq!(
            config.recoverable_error_codes,
            vec!["server_error", "session_expired"]
        );
        assert_eq!(
            config.bridge_settings().placeholder_timeout,
            Duration::from_millis(1500)
        );

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_port() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "not-a-port");
        }

        let err = ServerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("PORT"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_audio_format() {
        cleanup_env_vars();
        unsafe {
            env::set_var("BACKEND_AUDIO_FORMAT", "opus");
        }

        let err = ServerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("BACKEND_AUDIO_FORMAT"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_zero_max_sessions() {
        cleanup_env_vars();
        unsafe {
            env::set_var("MAX_SESSIONS", "0");
        }

        assert!(ServerConfig::from_env().is_err());

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_s3_requires_region() {
        cleanup_env_vars();
        unsafe {
            env::set_var("RECORDING_S3_BUCKET", "calls");
        }
        assert!(ServerConfig::from_env().is_err());

        unsafe {
            env::set_var("RECORDING_S3_REGION", "us-east-1");
        }
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.recording_s3_bucket.as_deref(), Some("calls"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_partial_tls_rejected() {
        cleanup_env_vars();
        unsafe {
            env::set_var("TLS_CERT_PATH", "/tmp/cert.pem");
        }

        let err = ServerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("TLS_KEY_PATH"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_env_helpers() {
        cleanup_env_vars();
        unsafe {
            env::set_var("HOST", "  ");
            env::set_var("SEND_GREETING", "maybe");
        }

        assert_eq!(env_var("HOST"), None);
        assert_eq!(env_parse::<u16>("PORT"), Ok(None));
        assert!(env_bool("SEND_GREETING").is_err());

        cleanup_env_vars();
    }
}
