//! Unified `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::poem::model::{Contribution, TeamPoem};
use crate::quiz::state::ConversationState;

/// A registered participant.
#[derive(Debug, Clone)]
pub struct Participant {
    /// Registration order.
    pub seq: i64,
    pub identity: String,
    pub chat_id: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub team: Option<String>,
    /// Lowest block not yet completed.
    pub current_block: usize,
    /// Mid-block or mid-poem right now.
    pub is_active: bool,
    pub state: ConversationState,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Participant {
    /// Display name, falling back to the username or identity.
    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .or_else(|| self.username.clone())
            .unwrap_or_else(|| self.identity.clone())
    }
}

/// Fields for first contact (`/start`).
#[derive(Debug, Clone)]
pub struct NewParticipant {
    pub identity: String,
    pub chat_id: String,
    pub username: Option<String>,
}

/// Partial update. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ParticipantPatch {
    pub display_name: Option<String>,
    pub team: Option<String>,
    pub state: Option<ConversationState>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
}

/// Filter for `list_participants`. Results are always in registration order.
#[derive(Debug, Clone, Default)]
pub struct ParticipantFilter {
    pub team: Option<String>,
    /// Only participants who pressed "start".
    pub confirmed_only: bool,
    /// Only participants not currently mid-block.
    pub inactive_only: bool,
}

impl ParticipantFilter {
    pub fn team(team: impl Into<String>) -> Self {
        Self {
            team: Some(team.into()),
            ..Default::default()
        }
    }

    /// Confirmed participants that are idle: the sweep's candidates.
    pub fn idle_confirmed() -> Self {
        Self {
            confirmed_only: true,
            inactive_only: true,
            ..Default::default()
        }
    }
}

/// The atomic write that closes a block.
#[derive(Debug, Clone)]
pub struct BlockCompletion<'a> {
    pub identity: &'a str,
    pub block: usize,
    /// 0-based column index of the block's first prompt.
    pub first_column: usize,
    /// One encoded cell per prompt of the block (`""` where unanswered).
    pub cells: &'a [String],
    pub next_state: &'a ConversationState,
}

/// One participant's answer row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AnswerRow {
    pub identity: String,
    pub display_name: Option<String>,
    pub team: Option<String>,
    /// `answer_1 ..= answer_N`; `None` for blocks not yet completed.
    pub answers: Vec<Option<String>>,
}

/// Backend-agnostic database trait covering participants, answers and poems.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Make sure `answer_1 ..= answer_{count}` exist. Idempotent.
    async fn ensure_answer_columns(&self, count: usize) -> Result<(), DatabaseError>;

    // ── Participants ────────────────────────────────────────────────

    /// Insert a participant, or refresh chat id/username if known.
    /// Returns `true` if the row was created.
    async fn upsert_participant(&self, new: &NewParticipant) -> Result<bool, DatabaseError>;

    async fn get_participant(&self, identity: &str) -> Result<Option<Participant>, DatabaseError>;

    async fn list_participants(
        &self,
        filter: &ParticipantFilter,
    ) -> Result<Vec<Participant>, DatabaseError>;

    async fn update_participant(
        &self,
        identity: &str,
        patch: &ParticipantPatch,
    ) -> Result<(), DatabaseError>;

    /// Test-and-set activation: succeeds only if the participant is idle and
    /// its cursor is at or below `block` (and below `limit`). Moves the
    /// cursor to `block` and stores `state`.
    async fn try_activate_block(
        &self,
        identity: &str,
        block: usize,
        limit: usize,
        state: &ConversationState,
    ) -> Result<bool, DatabaseError>;

    /// Write a block's answers, advance the cursor to `block + 1` and go idle,
    /// all in one statement. Returns `false` if the participant was not active
    /// on `block`.
    async fn write_block_answers(
        &self,
        completion: &BlockCompletion<'_>,
    ) -> Result<bool, DatabaseError>;

    /// Abandon an in-progress block without saving answers.
    async fn deactivate(
        &self,
        identity: &str,
        state: &ConversationState,
    ) -> Result<bool, DatabaseError>;

    /// `(ready, total)` team members with `current_block >= poem_block`.
    async fn team_readiness(
        &self,
        team: &str,
        poem_block: usize,
    ) -> Result<(usize, usize), DatabaseError>;

    /// Move every listed participant to the terminal cursor.
    async fn finish_participants(
        &self,
        identities: &[String],
        terminal_block: usize,
    ) -> Result<(), DatabaseError>;

    /// Answer columns for every participant, in registration order.
    async fn answer_rows(&self, columns: usize) -> Result<Vec<AnswerRow>, DatabaseError>;

    // ── Team poems ──────────────────────────────────────────────────

    /// Write the ledger row for a line slot. Writing the same
    /// `(team, line_number)` again replaces the earlier row.
    async fn append_contribution(&self, contribution: &Contribution) -> Result<(), DatabaseError>;

    async fn list_contributions(
        &self,
        team: Option<&str>,
    ) -> Result<Vec<Contribution>, DatabaseError>;

    /// Append a snapshot row for the poem.
    async fn save_poem_snapshot(&self, poem: &TeamPoem) -> Result<(), DatabaseError>;

    /// The most recent snapshot per team.
    async fn latest_poem_snapshots(&self) -> Result<Vec<TeamPoem>, DatabaseError>;

    async fn latest_poem_snapshot(&self, team: &str) -> Result<Option<TeamPoem>, DatabaseError>;
}
