use std::sync::Arc;

use async_trait::async_trait;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use tracing::{debug, info, warn};

use super::{ConversationRecord, ConversationStore, StorageError, StoredConversation};
use crate::core::codec::{AudioEncoding, frames_to_raw, raw_to_wav};
use crate::core::realtime::TranscriptRole;
use crate::core::transcript::TranscriptTurn;

const TIMESTAMP_FORMAT: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]-[hour][minute][second]");

const TURN_TIME_FORMAT: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[hour]:[minute]:[second]");

fn is_valid_call_id(call_id: &str) -> bool {
    !call_id.is_empty() && !call_id.contains("..") && !call_id.contains('/')
}

/// Extension of the headerless raw audio dump.
fn raw_extension(encoding: AudioEncoding) -> &'static str {
    match encoding {
        AudioEncoding::G711Ulaw => "ul",
        AudioEncoding::G711Alaw => "al",
        AudioEncoding::Pcm16 => "pcm",
    }
}

/// Render turns as `[HH:MM:SS] AI:` / `[HH:MM:SS] User:` blocks.
pub(crate) fn render_transcript(turns: &[TranscriptTurn]) -> String {
    turns
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                TranscriptRole::Agent => "AI",
                TranscriptRole::User => "User",
            };
            let at = turn
                .created_at
                .format(TURN_TIME_FORMAT)
                .unwrap_or_else(|_| "--:--:--".to_string());
            format!("[{}] {}:\n{}", at, speaker, turn.text)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Debug, Serialize)]
struct ConversationMetadata<'a> {
    call_id: &'a str,
    stream_id: &'a str,
    profile: &'a str,
    timestamp: String,
    started_at: String,
    transcript_path: Option<&'a str>,
    audio_path: Option<&'a str>,
    agent_audio_path: Option<&'a str>,
    conversation_length: usize,
    inbound_frames: usize,
    outbound_frames: usize,
}

/// [`ConversationStore`] writing one object per artifact.
///
/// Layout, relative to the optional prefix:
///
/// ```text
/// transcripts/{call_id}/{ts}.txt
/// audio/{call_id}/{ts}_raw.ul        audio/{call_id}/{ts}.wav
/// audio/{call_id}/{ts}_agent_raw.ul  audio/{call_id}/{ts}_agent.wav
/// metadata/{call_id}/{ts}.json
/// ```
#[derive(Debug, Clone)]
pub struct ObjectConversationStore {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl ObjectConversationStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Option<&str>) -> Self {
        let prefix = prefix
            .map(|p| p.trim().trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        Self { store, prefix }
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn key(&self, relative: String) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, relative),
            None => relative,
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = ObjectPath::parse(key)?;
        let size = bytes.len();
        self.store.put(&path, PutPayload::from(bytes)).await?;
        debug!(key = %key, size, "Stored conversation object");
        Ok(())
    }

    /// Write the raw dump and its WAV rendering for one direction.
    ///
    /// Returns the key of the playable file, or of the raw dump when the WAV
    /// conversion failed, plus the number of objects written.
    async fn put_audio(
        &self,
        call_id: &str,
        stem: &str,
        frames: &[String],
        encoding: AudioEncoding,
    ) -> Result<(Option<String>, usize), StorageError> {
        if frames.is_empty() {
            return Ok((None, 0));
        }

        let raw = frames_to_raw(frames);
        let raw_key = self.key(format!(
            "audio/{}/{}_raw.{}",
            call_id,
            stem,
            raw_extension(encoding)
        ));
        let wav = raw_to_wav(&raw, encoding);
        self.put(&raw_key, raw).await?;

        match wav {
            Ok(wav) => {
                let wav_key = self.key(format!("audio/{}/{}.wav", call_id, stem));
                self.put(&wav_key, wav).await?;
                Ok((Some(wav_key), 2))
            }
            Err(e) => {
                warn!(call_id = %call_id, "WAV conversion failed, keeping raw audio only: {}", e);
                Ok((Some(raw_key), 1))
            }
        }
    }
}

#[async_trait]
impl ConversationStore for ObjectConversationStore {
    async fn store_conversation(
        &self,
        record: &ConversationRecord,
    ) -> Result<StoredConversation, StorageError> {
        let call_id = record.call_id.as_str();
        if !is_valid_call_id(call_id) {
            return Err(StorageError::InvalidKey(call_id.to_string()));
        }

        let ts = record.ended_at.format(TIMESTAMP_FORMAT)?;
        let mut stored = StoredConversation::default();

        if !record.transcript.is_empty() {
            let key = self.key(format!("transcripts/{}/{}.txt", call_id, ts));
            self.put(&key, render_transcript(&record.transcript).into_bytes())
                .await?;
            stored.transcript_path = Some(key);
            stored.objects_written += 1;
        }

        let (audio_path, written) = self
            .put_audio(call_id, &ts, &record.audio.inbound, record.audio_encoding)
            .await?;
        stored.audio_path = audio_path;
        stored.objects_written += written;

        let (agent_path, written) = self
            .put_audio(
                call_id,
                &format!("{}_agent", ts),
                &record.audio.outbound,
                record.audio_encoding,
            )
            .await?;
        stored.agent_audio_path = agent_path;
        stored.objects_written += written;

        let metadata = ConversationMetadata {
            call_id,
            stream_id: &record.stream_id,
            profile: record.profile.as_str(),
            timestamp: record.ended_at.format(&Rfc3339)?,
            started_at: record.started_at.format(&Rfc3339)?,
            transcript_path: stored.transcript_path.as_deref(),
            audio_path: stored.audio_path.as_deref(),
            agent_audio_path: stored.agent_audio_path.as_deref(),
            conversation_length: record.transcript.len(),
            inbound_frames: record.audio.inbound.len(),
            outbound_frames: record.audio.outbound.len(),
        };
        let metadata_key = self.key(format!("metadata/{}/{}.json", call_id, ts));
        self.put(&metadata_key, serde_json::to_vec_pretty(&metadata)?)
            .await?;
        stored.metadata_path = metadata_key;
        stored.objects_written += 1;

        info!(
            call_id = %call_id,
            objects = stored.objects_written,
            turns = record.transcript.len(),
            "Conversation stored"
        );
        Ok(stored)
    }
}
