//! Turn-by-turn transcript reconstruction from streaming deltas.
//!
//! Backend transcripts arrive as fragments keyed by a turn identifier. The
//! reconciler merges fragments of the same turn, orders turns by the arrival
//! of their first fragment and fills the gap with a placeholder when a
//! committed caller turn never gets transcribed.

use std::collections::HashMap;

use serde::Serialize;
use time::OffsetDateTime;

use crate::core::realtime::TranscriptRole;

/// Number of characters of the last agent turn quoted in a placeholder.
pub const PLACEHOLDER_PREFIX_CHARS: usize = 30;

/// One utterance by either party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptTurn {
    pub role: TranscriptRole,
    pub text: String,
    pub turn_id: String,
    pub finalized: bool,
    /// Synthesized because no transcription arrived in time
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub placeholder: bool,
    /// Arrival time of the first fragment
    #[serde(skip)]
    pub created_at: OffsetDateTime,
}

/// Result of applying a delta, mostly useful for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// A new turn was appended
    Appended,
    /// Text was added to a streaming turn
    Merged,
    /// The turn's text was replaced
    Replaced,
}

/// Ordered, role-tagged conversation log built from transcript deltas.
#[derive(Debug, Default, Clone)]
pub struct TranscriptReconciler {
    turns: Vec<TranscriptTurn>,
    index: HashMap<String, usize>,
}

impl TranscriptReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one transcript fragment.
    ///
    /// - unknown `turn_id`: a new turn is appended
    /// - known, streaming turn: text is appended
    /// - known, streaming turn with `is_final`: the full text replaces the
    ///   accumulated fragments (an empty final keeps them)
    /// - finalized turn or placeholder: text is replaced
    pub fn apply_delta(
        &mut self,
        turn_id: &str,
        role: TranscriptRole,
        text: &str,
        is_final: bool,
    ) -> DeltaOutcome {
        let Some(&idx) = self.index.get(turn_id) else {
            self.index.insert(turn_id.to_string(), self.turns.len());
            self.turns.push(TranscriptTurn {
                role,
                text: text.to_string(),
                turn_id: turn_id.to_string(),
                finalized: is_final,
                placeholder: false,
                created_at: OffsetDateTime::now_utc(),
            });
            return DeltaOutcome::Appended;
        };

        let turn = &mut self.turns[idx];

        if turn.finalized || turn.placeholder {
            turn.text = text.to_string();
            turn.role = role;
            turn.placeholder = false;
            turn.finalized = turn.finalized || is_final;
            return DeltaOutcome::Replaced;
        }

        if is_final {
            turn.finalized = true;
            if !text.is_empty() {
                turn.text = text.to_string();
                return DeltaOutcome::Replaced;
            }
            return DeltaOutcome::Merged;
        }

        turn.text.push_str(text);
        DeltaOutcome::Merged
    }

    /// Insert a placeholder for a caller turn that was never transcribed.
    ///
    /// Returns `false` when the turn already exists, in which case nothing
    /// changes.
    pub fn insert_placeholder(&mut self, turn_id: &str) -> bool {
        if self.index.contains_key(turn_id) {
            return false;
        }

        let prefix: String = self
            .last_agent_text()
            .unwrap_or_default()
            .chars()
            .take(PLACEHOLDER_PREFIX_CHARS)
            .collect();

        self.index.insert(turn_id.to_string(), self.turns.len());
        self.turns.push(TranscriptTurn {
            role: TranscriptRole::User,
            text: placeholder_text(&prefix),
            turn_id: turn_id.to_string(),
            finalized: false,
            placeholder: true,
            created_at: OffsetDateTime::now_utc(),
        });
        true
    }

    /// Whether any fragment (or placeholder) exists for the turn.
    pub fn contains(&self, turn_id: &str) -> bool {
        self.index.contains_key(turn_id)
    }

    /// Text of the most recent agent turn.
    pub fn last_agent_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == TranscriptRole::Agent && !t.text.is_empty())
            .map(|t| t.text.as_str())
    }

    /// Mark every turn finalized with its accumulated text.
    pub fn finalize_all(&mut self) {
        for turn in &mut self.turns {
            turn.finalized = true;
        }
    }

    pub fn turns(&self) -> &[TranscriptTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Placeholder text for an untranscribed caller turn.
pub fn placeholder_text(agent_prefix: &str) -> String {
    format!("[unrecognized user input, responding to: {}]", agent_prefix)
}
