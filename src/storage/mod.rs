//! Post-call persistence of transcripts and captured audio.
//!
//! The bridge hands every finished call to a [`ConversationStore`] exactly
//! once. The default implementation writes plain objects through
//! `object_store`, so the same code serves S3, a local directory or memory.

mod object;

use std::fs;
use std::sync::Arc;

use async_trait::async_trait;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::core::codec::AudioEncoding;
use crate::core::session::{AudioBuffers, BusinessProfile};
use crate::core::transcript::TranscriptTurn;

pub use object::ObjectConversationStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Invalid object path: {0}")]
    Path(#[from] object_store::path::Error),

    #[error("Failed to serialize metadata: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to format timestamp: {0}")]
    Timestamp(#[from] time::error::Format),

    #[error("Invalid call id for storage key: {0:?}")]
    InvalidKey(String),

    #[error("Storage configuration error: {0}")]
    Configuration(String),
}

/// Everything captured for one call, handed over at teardown.
#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub call_id: String,
    pub stream_id: String,
    pub profile: BusinessProfile,
    /// Fully reconciled, finalized turns
    pub transcript: Vec<TranscriptTurn>,
    pub audio: AudioBuffers,
    /// Encoding of the buffered frames (the telephony encoding)
    pub audio_encoding: AudioEncoding,
    pub started_at: OffsetDateTime,
    pub ended_at: OffsetDateTime,
}

/// Object keys written for a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredConversation {
    pub transcript_path: Option<String>,
    pub audio_path: Option<String>,
    pub agent_audio_path: Option<String>,
    pub metadata_path: String,
    pub objects_written: usize,
}

/// Sink for finished conversations.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn store_conversation(
        &self,
        record: &ConversationRecord,
    ) -> Result<StoredConversation, StorageError>;
}

pub type SharedConversationStore = Arc<dyn ConversationStore>;

/// Pick an object store backend from configuration.
///
/// S3 wins when a bucket is configured, then a local directory. Without
/// either, conversations are kept in memory and lost on restart.
pub fn build_object_store(config: &ServerConfig) -> Result<Arc<dyn ObjectStore>, StorageError> {
    if let Some(bucket) = &config.recording_s3_bucket {
        let mut builder = AmazonS3Builder::new().with_bucket_name(bucket);

        if let Some(region) = &config.recording_s3_region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &config.recording_s3_endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if let Some(access_key) = &config.recording_s3_access_key {
            builder = builder.with_access_key_id(access_key);
        }
        if let Some(secret_key) = &config.recording_s3_secret_key {
            builder = builder.with_secret_access_key(secret_key);
        }

        info!(bucket = %bucket, "Persisting conversations to S3");
        return Ok(Arc::new(builder.build()?));
    }

    if let Some(path) = &config.storage_local_path {
        fs::create_dir_all(path).map_err(|e| {
            StorageError::Configuration(format!(
                "cannot create storage directory {}: {}",
                path.display(),
                e
            ))
        })?;
        info!(path = %path.display(), "Persisting conversations to local filesystem");
        return Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?));
    }

    warn!(
        "No conversation storage configured (RECORDING_S3_BUCKET or STORAGE_LOCAL_PATH); \
         transcripts are kept in memory only"
    );
    Ok(Arc::new(InMemory::new()))
}

/// Build the conversation store described by `config`.
pub fn create_conversation_store(
    config: &ServerConfig,
) -> Result<SharedConversationStore, StorageError> {
    let store = build_object_store(config)?;
    Ok(Arc::new(ObjectConversationStore::new(
        store,
        config.recording_s3_prefix.as_deref(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_store_creates_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("conversations");

        let mut config = ServerConfig::default();
        config.storage_local_path = Some(path.clone());

        build_object_store(&config).unwrap();
        assert!(path.is_dir());
    }

    #[test]
    fn test_fallback_to_memory_store() {
        let config = ServerConfig::default();
        let store = build_object_store(&config).unwrap();
        assert!(store.to_string().contains("InMemory"));
    }

    #[test]
    fn test_s3_store_from_config() {
        let mut config = ServerConfig::default();
        config.recording_s3_bucket = Some("calls".to_string());
        config.recording_s3_region = Some("us-east-1".to_string());
        config.recording_s3_endpoint = Some("http://localhost:9000".to_string());
        config.recording_s3_access_key = Some("minio".to_string());
        config.recording_s3_secret_key = Some("minio123".to_string());

        let store = build_object_store(&config).unwrap();
        assert!(store.to_string().contains("calls"));
    }
}
