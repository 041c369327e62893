use std::path::PathBuf;

use super::TlsConfig;

/// Validate TLS configuration
///
/// Certificate and key must be given together and both files must exist.
/// Returns `None` when neither is set.
pub fn validate_tls(
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
) -> Result<Option<TlsConfig>, Box<dyn std::error::Error>> {
    match (cert_path, key_path) {
        (None, None) => Ok(None),
        (Some(_), None) => Err("TLS_KEY_PATH is required when TLS_CERT_PATH is set".into()),
        (None, Some(_)) => Err("TLS_CERT_PATH is required when TLS_KEY_PATH is set".into()),
        (Some(cert_path), Some(key_path)) => {
            if !cert_path.exists() {
                return Err(format!(
                    "TLS certificate file does not exist: {}",
                    cert_path.display()
                )
                .into());
            }
            if !key_path.exists() {
                return Err(
                    format!("TLS key file does not exist: {}", key_path.display()).into(),
                );
            }
            Ok(Some(TlsConfig {
                cert_path,
                key_path,
            }))
        }
    }
}

/// Validate the session cap
pub fn validate_max_sessions(max_sessions: Option<usize>) -> Result<(), Box<dyn std::error::Error>> {
    if max_sessions == Some(0) {
        return Err("MAX_SESSIONS must be greater than 0 when set".into());
    }
    Ok(())
}

/// Validate S3 storage configuration
///
/// A bucket alone is not enough to reach S3: a region or a custom endpoint
/// is required as well.
pub fn validate_s3_storage(
    bucket: &Option<String>,
    region: &Option<String>,
    endpoint: &Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if bucket.is_some() && region.is_none() && endpoint.is_none() {
        return Err(
            "RECORDING_S3_REGION or RECORDING_S3_ENDPOINT is required when RECORDING_S3_BUCKET is set"
                .into(),
        );
    }
    Ok(())
}

/// Validate that a tuning value is non-zero
pub fn validate_non_zero(name: &str, value: u64) -> Result<(), Box<dyn std::error::Error>> {
    if value == 0 {
        return Err(format!("{name} must be greater than 0").into());
    }
    Ok(())
}
