//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All writes that guard a
//! state transition are single conditional `UPDATE`s so the row itself is
//! the arbiter when two tasks race.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::poem::model::{Contribution, TeamPoem};
use crate::quiz::state::ConversationState;
use crate::store::migrations::{self, answer_column};
use crate::store::traits::{
    AnswerRow, BlockCompletion, Database, NewParticipant, Participant, ParticipantFilter,
    ParticipantPatch,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // SQLite datetime() output
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn parse_state(raw: &str, identity: &str) -> ConversationState {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(identity, error = %e, "Unreadable session state, resetting to awaiting_name");
        ConversationState::default()
    })
}

const PARTICIPANT_COLUMNS: &str = "seq, identity, chat_id, username, display_name, team, current_block, is_active, session_state, confirmed_at, last_activity, created_at";

/// Map a libsql Row to a Participant. Column order matches PARTICIPANT_COLUMNS.
fn row_to_participant(row: &libsql::Row) -> Result<Participant, libsql::Error> {
    let identity: String = row.get(1)?;
    let state_str: String = row.get(8)?;
    let confirmed_str: Option<String> = row.get(9).ok();
    let last_activity_str: String = row.get(10)?;
    let created_str: String = row.get(11)?;

    Ok(Participant {
        seq: row.get(0)?,
        state: parse_state(&state_str, &identity),
        identity,
        chat_id: row.get(2)?,
        username: row.get(3).ok(),
        display_name: row.get(4).ok(),
        team: row.get(5).ok(),
        current_block: row.get::<i64>(6)?.max(0) as usize,
        is_active: row.get::<i64>(7)? != 0,
        confirmed_at: parse_optional_datetime(&confirmed_str),
        last_activity: parse_datetime(&last_activity_str),
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_contribution(row: &libsql::Row) -> Result<Contribution, libsql::Error> {
    let created_str: String = row.get(7)?;
    Ok(Contribution {
        team: row.get(0)?,
        identity: row.get(1)?,
        chat_id: row.get(2)?,
        display_name: row.get(3)?,
        line_number: row.get::<i64>(4)?.max(0) as usize,
        text: row.get(5)?,
        skipped: row.get::<i64>(6)? != 0,
        created_at: parse_datetime(&created_str),
    })
}

fn parse_poem(raw: &str) -> Result<TeamPoem, DatabaseError> {
    serde_json::from_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("team poem snapshot: {e}")))
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::init_schema(self.conn()).await
    }

    async fn ensure_answer_columns(&self, count: usize) -> Result<(), DatabaseError> {
        migrations::ensure_answer_columns(self.conn(), count).await
    }

    // ── Participants ────────────────────────────────────────────────

    async fn upsert_participant(&self, new: &NewParticipant) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO participants (identity, chat_id, username, last_activity, created_at) VALUES (?1, ?2, ?3, ?4, ?4)",
                params![
                    new.identity.as_str(),
                    new.chat_id.as_str(),
                    opt_text(new.username.as_deref()),
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_participant insert: {e}")))?;

        if inserted > 0 {
            debug!(identity = %new.identity, "Participant registered");
            return Ok(true);
        }

        conn.execute(
            "UPDATE participants SET chat_id = ?2, username = COALESCE(?3, username), last_activity = ?4 WHERE identity = ?1",
            params![
                new.identity.as_str(),
                new.chat_id.as_str(),
                opt_text(new.username.as_deref()),
                now.as_str()
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_participant update: {e}")))?;
        Ok(false)
    }

    async fn get_participant(&self, identity: &str) -> Result<Option<Participant>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE identity = ?1"),
                params![identity],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_participant: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_participant(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_participant row: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_participant next: {e}"))),
        }
    }

    async fn list_participants(
        &self,
        filter: &ParticipantFilter,
    ) -> Result<Vec<Participant>, DatabaseError> {
        let conn = self.conn();
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(team) = &filter.team {
            values.push(Value::Text(team.clone()));
            clauses.push(format!("team = ?{}", values.len()));
        }
        if filter.confirmed_only {
            clauses.push("confirmed_at IS NOT NULL".to_string());
        }
        if filter.inactive_only {
            clauses.push("is_active = 0".to_string());
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let mut rows = conn
            .query(
                &format!("SELECT {PARTICIPANT_COLUMNS} FROM participants {where_clause} ORDER BY seq ASC"),
                Params::Positional(values),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_participants: {e}")))?;

        let mut participants = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_participant(&row) {
                Ok(p) => participants.push(p),
                Err(e) => tracing::warn!("Skipping participant row: {e}"),
            }
        }
        Ok(participants)
    }

    async fn update_participant(
        &self,
        identity: &str,
        patch: &ParticipantPatch,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let mut sets = Vec::new();
        let mut values = vec![Value::Text(identity.to_string())];

        let mut push = |column: &str, value: Value| {
            values.push(value);
            sets.push(format!("{column} = ?{}", values.len()));
        };
        if let Some(name) = &patch.display_name {
            push("display_name", Value::Text(name.clone()));
        }
        if let Some(team) = &patch.team {
            push("team", Value::Text(team.clone()));
        }
        if let Some(state) = &patch.state {
            push("session_state", Value::Text(state.to_json()));
        }
        if let Some(at) = patch.confirmed_at {
            push("confirmed_at", Value::Text(at.to_rfc3339()));
        }
        if let Some(active) = patch.is_active {
            push("is_active", Value::Integer(active as i64));
        }
        push("last_activity", Value::Text(Utc::now().to_rfc3339()));

        let updated = conn
            .execute(
                &format!("UPDATE participants SET {} WHERE identity = ?1", sets.join(", ")),
                Params::Positional(values),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_participant: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "participant".into(),
                id: identity.to_string(),
            });
        }
        Ok(())
    }

    async fn try_activate_block(
        &self,
        identity: &str,
        block: usize,
        limit: usize,
        state: &ConversationState,
    ) -> Result<bool, DatabaseError> {
        if block >= limit {
            return Ok(false);
        }
        let conn = self.conn();
        let updated = conn
            .execute(
                "UPDATE participants SET is_active = 1, current_block = ?2, session_state = ?3, last_activity = ?4 \
                 WHERE identity = ?1 AND is_active = 0 AND current_block <= ?2",
                params![
                    identity,
                    block as i64,
                    state.to_json(),
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_activate_block: {e}")))?;
        Ok(updated > 0)
    }

    async fn write_block_answers(
        &self,
        completion: &BlockCompletion<'_>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let mut sets = Vec::new();
        let mut values = Vec::new();

        for (offset, cell) in completion.cells.iter().enumerate() {
            values.push(Value::Text(cell.clone()));
            sets.push(format!(
                "{} = ?{}",
                answer_column(completion.first_column + offset),
                values.len()
            ));
        }
        values.push(Value::Integer(completion.block as i64 + 1));
        sets.push(format!("current_block = ?{}", values.len()));
        values.push(Value::Text(completion.next_state.to_json()));
        sets.push(format!("session_state = ?{}", values.len()));
        values.push(Value::Text(Utc::now().to_rfc3339()));
        sets.push(format!("last_activity = ?{}", values.len()));
        sets.push("is_active = 0".to_string());

        values.push(Value::Text(completion.identity.to_string()));
        let identity_param = values.len();
        values.push(Value::Integer(completion.block as i64));
        let block_param = values.len();

        let updated = conn
            .execute(
                &format!(
                    "UPDATE participants SET {} WHERE identity = ?{identity_param} AND current_block = ?{block_param} AND is_active = 1",
                    sets.join(", ")
                ),
                Params::Positional(values),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("write_block_answers: {e}")))?;
        Ok(updated > 0)
    }

    async fn deactivate(
        &self,
        identity: &str,
        state: &ConversationState,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE participants SET is_active = 0, session_state = ?2, last_activity = ?3 WHERE identity = ?1 AND is_active = 1",
                params![identity, state.to_json(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("deactivate: {e}")))?;
        Ok(updated > 0)
    }

    async fn team_readiness(
        &self,
        team: &str,
        poem_block: usize,
    ) -> Result<(usize, usize), DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COALESCE(SUM(CASE WHEN current_block >= ?2 THEN 1 ELSE 0 END), 0), COUNT(*) FROM participants WHERE team = ?1",
                params![team, poem_block as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("team_readiness: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let ready: i64 = row.get(0).unwrap_or(0);
                let total: i64 = row.get(1).unwrap_or(0);
                Ok((ready.max(0) as usize, total.max(0) as usize))
            }
            Ok(None) => Ok((0, 0)),
            Err(e) => Err(DatabaseError::Query(format!("team_readiness next: {e}"))),
        }
    }

    async fn finish_participants(
        &self,
        identities: &[String],
        terminal_block: usize,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let state = ConversationState::Finished.to_json();
        let now = Utc::now().to_rfc3339();
        for identity in identities {
            conn.execute(
                "UPDATE participants SET current_block = MAX(current_block, ?2), is_active = 0, session_state = ?3, last_activity = ?4 WHERE identity = ?1",
                params![identity.as_str(), terminal_block as i64, state.as_str(), now.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_participants: {e}")))?;
        }
        Ok(())
    }

    async fn answer_rows(&self, columns: usize) -> Result<Vec<AnswerRow>, DatabaseError> {
        let mut select = vec!["identity".to_string(), "display_name".into(), "team".into()];
        select.extend((0..columns).map(answer_column));

        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {} FROM participants ORDER BY seq ASC", select.join(", ")),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("answer_rows: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let identity: String = match row.get(0) {
                Ok(identity) => identity,
                Err(e) => {
                    tracing::warn!("Skipping answer row: {e}");
                    continue;
                }
            };
            let answers = (0..columns)
                .map(|i| row.get::<String>(i as i32 + 3).ok())
                .collect();
            out.push(AnswerRow {
                identity,
                display_name: row.get(1).ok(),
                team: row.get(2).ok(),
                answers,
            });
        }
        Ok(out)
    }

    // ── Team poems ──────────────────────────────────────────────────

    async fn append_contribution(&self, contribution: &Contribution) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO poem_contributions (team, identity, chat_id, display_name, line_number, contribution, skipped, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(team, line_number) DO UPDATE SET identity = excluded.identity, chat_id = excluded.chat_id, display_name = excluded.display_name, \
                 contribution = excluded.contribution, skipped = excluded.skipped, created_at = excluded.created_at",
                params![
                    contribution.team.as_str(),
                    contribution.identity.as_str(),
                    contribution.chat_id.as_str(),
                    contribution.display_name.as_str(),
                    contribution.line_number as i64,
                    contribution.text.as_str(),
                    contribution.skipped as i64,
                    contribution.created_at.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_contribution: {e}")))?;
        Ok(())
    }

    async fn list_contributions(
        &self,
        team: Option<&str>,
    ) -> Result<Vec<Contribution>, DatabaseError> {
        let conn = self.conn();
        let select = "SELECT team, identity, chat_id, display_name, line_number, contribution, skipped, created_at FROM poem_contributions";
        let mut rows = match team {
            Some(team) => {
                conn.query(
                    &format!("{select} WHERE team = ?1 ORDER BY line_number ASC"),
                    params![team],
                )
                .await
            }
            None => {
                conn.query(&format!("{select} ORDER BY team ASC, line_number ASC"), ())
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("list_contributions: {e}")))?;

        let mut contributions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_contribution(&row) {
                Ok(c) => contributions.push(c),
                Err(e) => tracing::warn!("Skipping contribution row: {e}"),
            }
        }
        Ok(contributions)
    }

    async fn save_poem_snapshot(&self, poem: &TeamPoem) -> Result<(), DatabaseError> {
        let data = serde_json::to_string(poem)
            .map_err(|e| DatabaseError::Serialization(format!("team poem snapshot: {e}")))?;
        self.conn()
            .execute(
                "INSERT INTO team_poems (poem_id, team, status, poem_data, started_at, completed_at, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    poem.id.to_string(),
                    poem.team.as_str(),
                    poem.status.to_string(),
                    data,
                    opt_text(poem.started_at.map(|t| t.to_rfc3339()).as_deref()),
                    opt_text(poem.completed_at.map(|t| t.to_rfc3339()).as_deref()),
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_poem_snapshot: {e}")))?;
        Ok(())
    }

    async fn latest_poem_snapshots(&self) -> Result<Vec<TeamPoem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT poem_data FROM team_poems WHERE id IN (SELECT MAX(id) FROM team_poems GROUP BY team) ORDER BY team ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_poem_snapshots: {e}")))?;

        let mut poems = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let raw: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("latest_poem_snapshots row: {e}")))?;
            poems.push(parse_poem(&raw)?);
        }
        Ok(poems)
    }

    async fn latest_poem_snapshot(&self, team: &str) -> Result<Option<TeamPoem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT poem_data FROM team_poems WHERE team = ?1 ORDER BY id DESC LIMIT 1",
                params![team],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_poem_snapshot: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("latest_poem_snapshot row: {e}")))?;
                parse_poem(&raw).map(Some)
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_poem_snapshot next: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poem::model::{PoemMember, PoemStatus};
    use crate::quiz::state::Answer;

    async fn test_db() -> LibSqlBackend {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.ensure_answer_columns(4).await.unwrap();
        db
    }

    fn newcomer(identity: &str) -> NewParticipant {
        NewParticipant {
            identity: identity.into(),
            chat_id: format!("chat-{identity}"),
            username: Some(format!("user{identity}")),
        }
    }

    async fn confirmed(db: &LibSqlBackend, identity: &str, team: &str) {
        db.upsert_participant(&newcomer(identity)).await.unwrap();
        db.update_participant(
            identity,
            &ParticipantPatch {
                display_name: Some(format!("Name {identity}")),
                team: Some(team.into()),
                confirmed_at: Some(Utc::now()),
                state: Some(ConversationState::WaitingForBlock { block: 0 }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    // ── Participant tests ───────────────────────────────────────────

    #[tokio::test]
    async fn upsert_creates_once_then_refreshes() {
        let db = test_db().await;
        assert!(db.upsert_participant(&newcomer("1")).await.unwrap());

        let mut again = newcomer("1");
        again.chat_id = "moved".into();
        assert!(!db.upsert_participant(&again).await.unwrap());

        let p = db.get_participant("1").await.unwrap().unwrap();
        assert_eq!(p.chat_id, "moved");
        assert_eq!(p.state, ConversationState::AwaitingName);
        assert_eq!(p.current_block, 0);
        assert!(!p.is_active);
        assert!(p.confirmed_at.is_none());
    }

    #[tokio::test]
    async fn get_unknown_participant_is_none() {
        let db = test_db().await;
        assert!(db.get_participant("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_unknown_participant_is_not_found() {
        let db = test_db().await;
        let err = db
            .update_participant("ghost", &ParticipantPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_is_in_registration_order_and_filters() {
        let db = test_db().await;
        confirmed(&db, "30", "Red").await;
        confirmed(&db, "10", "Blue").await;
        db.upsert_participant(&newcomer("20")).await.unwrap();

        let all = db.list_participants(&ParticipantFilter::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|p| p.identity.as_str()).collect();
        assert_eq!(ids, vec!["30", "10", "20"]);

        let red = db.list_participants(&ParticipantFilter::team("Red")).await.unwrap();
        assert_eq!(red.len(), 1);

        let idle = db
            .list_participants(&ParticipantFilter::idle_confirmed())
            .await
            .unwrap();
        assert_eq!(idle.len(), 2);
    }

    #[tokio::test]
    async fn activation_is_test_and_set() {
        let db = test_db().await;
        confirmed(&db, "1", "Red").await;
        let state = ConversationState::answering(0);

        assert!(db.try_activate_block("1", 0, 3, &state).await.unwrap());
        assert!(!db.try_activate_block("1", 0, 3, &state).await.unwrap());

        let p = db.get_participant("1").await.unwrap().unwrap();
        assert!(p.is_active);
        assert_eq!(p.state, state);
    }

    #[tokio::test]
    async fn activation_never_lowers_cursor_or_passes_limit() {
        let db = test_db().await;
        confirmed(&db, "1", "Red").await;
        let state = ConversationState::answering(2);
        assert!(db.try_activate_block("1", 2, 3, &state).await.unwrap());
        db.deactivate("1", &ConversationState::WaitingForBlock { block: 2 })
            .await
            .unwrap();

        assert!(!db.try_activate_block("1", 1, 3, &ConversationState::answering(1)).await.unwrap());
        assert!(!db.try_activate_block("1", 3, 3, &ConversationState::answering(3)).await.unwrap());
        assert_eq!(db.get_participant("1").await.unwrap().unwrap().current_block, 2);
    }

    #[tokio::test]
    async fn block_answers_land_in_flattened_columns() {
        let db = test_db().await;
        confirmed(&db, "1", "Red").await;
        db.try_activate_block("1", 1, 3, &ConversationState::answering(1))
            .await
            .unwrap();

        let cells = vec![Answer::photo("F1").to_cell(), String::new()];
        let next = ConversationState::WaitingForBlock { block: 2 };
        let written = db
            .write_block_answers(&BlockCompletion {
                identity: "1",
                block: 1,
                first_column: 2,
                cells: &cells,
                next_state: &next,
            })
            .await
            .unwrap();
        assert!(written);

        let p = db.get_participant("1").await.unwrap().unwrap();
        assert_eq!(p.current_block, 2);
        assert!(!p.is_active);
        assert_eq!(p.state, next);

        let rows = db.answer_rows(4).await.unwrap();
        assert_eq!(
            rows[0].answers,
            vec![None, None, Some("photo:F1".to_string()), Some(String::new())]
        );
    }

    #[tokio::test]
    async fn block_answers_rejected_when_not_active_on_block() {
        let db = test_db().await;
        confirmed(&db, "1", "Red").await;
        let cells = vec!["x".to_string()];
        let next = ConversationState::WaitingForBlock { block: 1 };
        let written = db
            .write_block_answers(&BlockCompletion {
                identity: "1",
                block: 0,
                first_column: 0,
                cells: &cells,
                next_state: &next,
            })
            .await
            .unwrap();
        assert!(!written);
        assert_eq!(db.get_participant("1").await.unwrap().unwrap().current_block, 0);
    }

    #[tokio::test]
    async fn readiness_counts_team_members_at_poem_block() {
        let db = test_db().await;
        confirmed(&db, "1", "Blue").await;
        confirmed(&db, "2", "Blue").await;
        confirmed(&db, "3", "Red").await;
        db.try_activate_block("1", 2, 3, &ConversationState::InTeamPoem { team: "Blue".into() })
            .await
            .unwrap();

        assert_eq!(db.team_readiness("Blue", 2).await.unwrap(), (1, 2));
        assert_eq!(db.team_readiness("Green", 2).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn finish_sets_terminal_cursor() {
        let db = test_db().await;
        confirmed(&db, "1", "Blue").await;
        db.finish_participants(&["1".to_string()], 3).await.unwrap();
        let p = db.get_participant("1").await.unwrap().unwrap();
        assert_eq!(p.current_block, 3);
        assert!(!p.is_active);
        assert_eq!(p.state, ConversationState::Finished);
    }

    // ── Poem tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn latest_snapshot_wins_per_team() {
        let db = test_db().await;
        let mut blue = TeamPoem::start("Blue", vec![PoemMember::new("1", "c1", "Ann")]);
        db.save_poem_snapshot(&blue).await.unwrap();
        blue.record_line("1", "line").unwrap();
        blue.advance();
        blue.mark_completed();
        db.save_poem_snapshot(&blue).await.unwrap();
        let red = TeamPoem::start("Red", vec![PoemMember::new("2", "c2", "Bob")]);
        db.save_poem_snapshot(&red).await.unwrap();

        let latest = db.latest_poem_snapshots().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].team, "Blue");
        assert_eq!(latest[0].status, PoemStatus::Completed);
        assert_eq!(latest[1].status, PoemStatus::InProgress);

        let one = db.latest_poem_snapshot("Blue").await.unwrap().unwrap();
        assert_eq!(one.lines, vec!["line"]);
        assert!(db.latest_poem_snapshot("Green").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn contributions_are_listed_per_team_in_order() {
        let db = test_db().await;
        for (team, n, skipped) in [("Blue", 1, false), ("Red", 1, false), ("Blue", 2, true)] {
            db.append_contribution(&Contribution {
                team: team.into(),
                identity: format!("{team}{n}"),
                chat_id: "c".into(),
                display_name: "N".into(),
                line_number: n,
                text: format!("line {n}"),
                skipped,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        let blue = db.list_contributions(Some("Blue")).await.unwrap();
        assert_eq!(blue.len(), 2);
        assert_eq!(blue[1].line_number, 2);
        assert!(blue[1].skipped);
        assert_eq!(db.list_contributions(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rewriting_a_line_slot_replaces_it() {
        let db = test_db().await;
        let line = |text: &str, skipped: bool| Contribution {
            team: "Red".into(),
            identity: "1".into(),
            chat_id: "c".into(),
            display_name: "Ann".into(),
            line_number: 1,
            text: text.into(),
            skipped,
            created_at: Utc::now(),
        };
        db.append_contribution(&line("first try", false)).await.unwrap();
        db.append_contribution(&line("[skipped by Ann]", true)).await.unwrap();

        let red = db.list_contributions(Some("Red")).await.unwrap();
        assert_eq!(red.len(), 1);
        assert_eq!(red[0].text, "[skipped by Ann]");
        assert!(red[0].skipped);
    }
}
