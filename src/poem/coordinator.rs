//! Team poem coordinator — readiness gate, round-robin turns, timeouts and
//! completion.
//!
//! Each running poem lives in the registry behind its own async mutex. Every
//! change is made on a copy under that mutex, persisted (contribution row
//! plus snapshot), and only then written back and announced. A failed write
//! leaves the running poem exactly as it was. Completion flips the status
//! under the same mutex, so it runs once even when the last line and the
//! last timeout race.
//!
//! Lock order: the registry lock is never held while waiting for a team lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::catalog::BlockCatalog;
use crate::channels::{Notifier, OutgoingMessage};
use crate::error::DatabaseError;
use crate::quiz::state::ConversationState;
use crate::store::{Database, ParticipantFilter, ParticipantPatch};

use super::model::{
    Contribution, LineRejection, PoemMember, PoemStats, PoemStatus, TeamPoem,
};
use super::prompts;
use super::timers::{TimeoutQueue, TurnKey};

/// Delay before a timed-out turn whose skip could not be stored is retried.
const SKIP_RETRY_SECS: i64 = 5;

/// Result of a readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The catalog has no team poem block.
    NoPoemBlock,
    /// Not everyone has arrived yet.
    Waiting { ready: usize, total: usize },
    /// The poem was started by this call.
    Started { members: usize },
    /// A poem is already running and includes the caller's team.
    InProgress,
    /// The team's poem was already completed or cancelled.
    Finished,
}

/// Result of submitting a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Accepted { line_number: usize, completed: bool },
    Rejected(LineRejection),
    Empty,
}

#[derive(Default)]
struct PoemRegistry {
    poems: HashMap<String, Arc<Mutex<TeamPoem>>>,
    /// identity → team, for members of running poems
    member_team: HashMap<String, String>,
}

/// Coordinates every team's poem.
pub struct PoemCoordinator {
    db: Arc<dyn Database>,
    catalog: Arc<BlockCatalog>,
    notifier: Notifier,
    turn_timeout: Duration,
    registry: RwLock<PoemRegistry>,
    timeouts: StdMutex<TimeoutQueue>,
}

impl PoemCoordinator {
    pub fn new(
        db: Arc<dyn Database>,
        catalog: Arc<BlockCatalog>,
        notifier: Notifier,
        turn_timeout: Duration,
    ) -> Self {
        Self {
            db,
            catalog,
            notifier,
            turn_timeout,
            registry: RwLock::new(PoemRegistry::default()),
            timeouts: StdMutex::new(TimeoutQueue::new()),
        }
    }

    fn timeouts(&self) -> std::sync::MutexGuard<'_, TimeoutQueue> {
        self.timeouts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deadline(&self) -> DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(self.turn_timeout)
                .unwrap_or_else(|_| chrono::Duration::minutes(2))
    }

    /// The running poem of a team, if any.
    async fn poem_of_team(&self, team: &str) -> Option<Arc<Mutex<TeamPoem>>> {
        self.registry.read().await.poems.get(team).cloned()
    }

    /// The running poem `identity` belongs to, if any.
    async fn poem_of_member(&self, identity: &str) -> Option<Arc<Mutex<TeamPoem>>> {
        let registry = self.registry.read().await;
        let team = registry.member_team.get(identity)?;
        registry.poems.get(team).cloned()
    }

    /// Whether `identity` is a member of a running poem.
    pub async fn is_member(&self, identity: &str) -> bool {
        self.registry.read().await.member_team.contains_key(identity)
    }

    /// Number of poems currently running.
    pub async fn running(&self) -> usize {
        self.registry.read().await.poems.len()
    }

    // ── Readiness & start ───────────────────────────────────────────

    /// Start the team's poem if every member has reached the poem block.
    pub async fn check_readiness(&self, team: &str) -> Result<Readiness, DatabaseError> {
        let Some(poem_block) = self.catalog.poem_block() else {
            return Ok(Readiness::NoPoemBlock);
        };

        if self.poem_of_team(team).await.is_some() {
            return Ok(Readiness::InProgress);
        }

        let (ready, total) = self.db.team_readiness(team, poem_block).await?;
        if total == 0 || ready < total {
            tracing::debug!(team, ready, total, "Team not ready for poem");
            return Ok(Readiness::Waiting { ready, total });
        }

        // Hold the registry write lock across the last checks so only one
        // caller can start this team's poem.
        let mut registry = self.registry.write().await;
        if registry.poems.contains_key(team) {
            return Ok(Readiness::InProgress);
        }
        if let Some(previous) = self.db.latest_poem_snapshot(team).await? {
            if matches!(previous.status, PoemStatus::Completed | PoemStatus::Cancelled) {
                return Ok(Readiness::Finished);
            }
        }

        let participants = self
            .db
            .list_participants(&ParticipantFilter::team(team))
            .await?;

        // Teammates still waiting for the poem block's release join now, so
        // their lines reach the poem when their turn comes.
        let joined = ConversationState::InTeamPoem {
            team: team.to_string(),
        };
        for p in &participants {
            if matches!(p.state, ConversationState::WaitingForBlock { .. }) {
                self.db
                    .update_participant(
                        &p.identity,
                        &ParticipantPatch {
                            state: Some(joined.clone()),
                            is_active: Some(true),
                            ..Default::default()
                        },
                    )
                    .await?;
                tracing::debug!(team, member = %p.identity, "Enrolled waiting teammate in poem");
            }
        }

        let members: Vec<PoemMember> = participants
            .iter()
            .map(|p| PoemMember::new(p.identity.clone(), p.chat_id.clone(), p.name()))
            .collect();

        let poem = TeamPoem::start(team, members);
        self.db.save_poem_snapshot(&poem).await?;

        let count = poem.members.len();
        let cell = Arc::new(Mutex::new(poem));
        let guard = Arc::clone(&cell).lock_owned().await;
        for member in &guard.members {
            registry
                .member_team
                .insert(member.identity.clone(), team.to_string());
        }
        registry.poems.insert(team.to_string(), cell);
        drop(registry);

        tracing::info!(team, members = count, "Team poem started");
        self.announce_start(guard).await;
        Ok(Readiness::Started { members: count })
    }

    async fn announce_start(&self, poem: OwnedMutexGuard<TeamPoem>) {
        let intro = self
            .catalog
            .poem_block()
            .and_then(|i| self.catalog.block(i))
            .and_then(|b| b.prompts.first())
            .map(|p| p.text.clone())
            .unwrap_or_default();
        let text = prompts::instructions(&poem, &intro, self.turn_timeout);
        self.notifier
            .broadcast(
                poem.members.iter().map(|m| m.chat_id.as_str()),
                &OutgoingMessage::text(text),
            )
            .await;
        self.issue_turn(&poem).await;
    }

    /// Prompt the current turn-holder and arm their timeout.
    async fn issue_turn(&self, poem: &TeamPoem) {
        let Some(member) = poem.current_member() else {
            return;
        };
        self.timeouts().schedule(
            TurnKey {
                team: poem.team.clone(),
                identity: member.identity.clone(),
                index: poem.current_member_index,
            },
            self.deadline(),
        );
        tracing::debug!(team = %poem.team, member = %member.identity, index = poem.current_member_index, "Turn issued");
        self.notifier
            .text(
                &member.chat_id,
                prompts::your_turn(member, poem, self.turn_timeout),
            )
            .await;
    }

    // ── Lines & timeouts ────────────────────────────────────────────

    /// Accept a line from the participant whose turn it is.
    pub async fn process_line(
        &self,
        identity: &str,
        chat_id: &str,
        text: &str,
    ) -> Result<LineOutcome, DatabaseError> {
        let Some(cell) = self.poem_of_member(identity).await else {
            self.notifier.text(chat_id, prompts::not_in_poem()).await;
            return Ok(LineOutcome::Rejected(LineRejection::NotMember));
        };
        let mut poem = cell.lock_owned().await;

        if let Err(rejection) = poem.check_turn(identity) {
            let reply = match rejection {
                LineRejection::NotYourTurn => prompts::not_your_turn(
                    poem.current_member().map(|m| m.display_name.as_str()),
                ),
                LineRejection::AlreadyProcessed => prompts::already_written(),
                LineRejection::NotInProgress | LineRejection::NotMember => prompts::not_in_poem(),
            };
            self.notifier.text(chat_id, reply).await;
            return Ok(LineOutcome::Rejected(rejection));
        }

        let line = text.trim();
        if line.is_empty() {
            self.notifier.text(chat_id, prompts::empty_line()).await;
            return Ok(LineOutcome::Empty);
        }

        let mut next = poem.clone();
        let line_number = match next.record_line(identity, line) {
            Ok(n) => n,
            Err(rejection) => return Ok(LineOutcome::Rejected(rejection)),
        };
        next.advance();

        let (author, author_chat) = match next.member(identity) {
            Some(m) => (m.display_name.clone(), m.chat_id.clone()),
            None => (identity.to_string(), chat_id.to_string()),
        };
        let contribution = Contribution {
            team: next.team.clone(),
            identity: identity.to_string(),
            chat_id: author_chat.clone(),
            display_name: author.clone(),
            line_number,
            text: line.to_string(),
            skipped: false,
            created_at: Utc::now(),
        };
        // On failure the turn stays open and its timeout stays armed.
        self.persist_turn(&contribution, &next).await?;
        *poem = next;
        self.timeouts().cancel(&poem.team, identity);
        tracing::info!(team = %poem.team, member = identity, line_number, "Poem line accepted");

        self.notifier.text(&author_chat, prompts::line_accepted()).await;
        let update = OutgoingMessage::text(prompts::progress(
            &author,
            line,
            poem.lines.len(),
            poem.members.len(),
        ));
        self.notifier
            .broadcast(
                poem.members
                    .iter()
                    .filter(|m| m.identity != identity)
                    .map(|m| m.chat_id.as_str()),
                &update,
            )
            .await;

        let completed = self.advance_or_complete(poem).await;
        Ok(LineOutcome::Accepted {
            line_number,
            completed,
        })
    }

    /// Skip every turn-holder whose deadline is at or before `now`, then
    /// retry any completion that failed to store.
    ///
    /// Returns how many members were skipped. Stale entries are ignored.
    pub async fn expire_turns(&self, now: DateTime<Utc>) -> usize {
        let stranded = self.complete_stranded().await;
        if stranded > 0 {
            tracing::info!(poems = stranded, "Completed stranded team poems");
        }
        let expired = self.timeouts().pop_expired(now);
        let mut skipped = 0;
        for key in expired {
            match self.skip_turn(&key).await {
                Ok(true) => skipped += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(team = %key.team, member = %key.identity, error = %e, "Failed to skip poem turn");
                }
            }
        }
        skipped
    }

    async fn skip_turn(&self, key: &TurnKey) -> Result<bool, DatabaseError> {
        let Some(cell) = self.poem_of_team(&key.team).await else {
            return Ok(false);
        };
        let mut poem = cell.lock_owned().await;

        let still_current = poem.current_member_index == key.index
            && poem
                .current_member()
                .is_some_and(|m| m.identity == key.identity && !m.is_processed());
        if !still_current {
            return Ok(false);
        }
        let mut next = poem.clone();
        let Some(line) = next.record_skip() else {
            return Ok(false);
        };
        let line_number = next.lines.len();
        let (name, chat) = match next.member(&key.identity) {
            Some(m) => (m.display_name.clone(), m.chat_id.clone()),
            None => return Ok(false),
        };
        next.advance();

        let contribution = Contribution {
            team: next.team.clone(),
            identity: key.identity.clone(),
            chat_id: chat.clone(),
            display_name: name,
            line_number,
            text: line,
            skipped: true,
            created_at: Utc::now(),
        };
        if let Err(e) = self.persist_turn(&contribution, &next).await {
            self.timeouts().schedule(
                key.clone(),
                Utc::now() + chrono::Duration::seconds(SKIP_RETRY_SECS),
            );
            return Err(e);
        }
        *poem = next;
        tracing::warn!(team = %poem.team, member = %key.identity, "Poem turn timed out");

        self.notifier.text(&chat, prompts::timed_out()).await;
        self.advance_or_complete(poem).await;
        Ok(true)
    }

    /// Store a processed turn: the ledger row, then the snapshot.
    async fn persist_turn(
        &self,
        contribution: &Contribution,
        poem: &TeamPoem,
    ) -> Result<(), DatabaseError> {
        self.db.append_contribution(contribution).await?;
        self.db.save_poem_snapshot(poem).await
    }

    /// Issue the next turn, or complete the poem once every member is done.
    /// Returns whether the poem completed. A completion that fails to store
    /// is logged and retried by [`Self::expire_turns`].
    async fn advance_or_complete(&self, poem: OwnedMutexGuard<TeamPoem>) -> bool {
        if !poem.is_exhausted() {
            self.issue_turn(&poem).await;
            return false;
        }
        let team = poem.team.clone();
        match self.complete(poem).await {
            Ok(completed) => completed,
            Err(e) => {
                tracing::error!(team = %team, error = %e, "Failed to complete team poem, will retry");
                false
            }
        }
    }

    /// Finish the poem exactly once: persist, then broadcast, then evict.
    async fn complete(&self, mut poem: OwnedMutexGuard<TeamPoem>) -> Result<bool, DatabaseError> {
        if poem.status != PoemStatus::InProgress {
            return Ok(false);
        }
        let mut done = poem.clone();
        done.mark_completed();

        let identities: Vec<String> = done.members.iter().map(|m| m.identity.clone()).collect();
        self.db
            .finish_participants(&identities, self.catalog.len())
            .await?;
        self.db.save_poem_snapshot(&done).await?;
        *poem = done;
        self.timeouts().cancel_team(&poem.team);
        tracing::info!(
            team = %poem.team,
            lines = poem.lines.len(),
            authors = poem.contributed_count(),
            "Team poem completed"
        );

        let finale = OutgoingMessage::text(prompts::completed(&poem));
        self.notifier
            .broadcast(poem.members.iter().map(|m| m.chat_id.as_str()), &finale)
            .await;

        self.evict(&poem).await;
        Ok(true)
    }

    /// Complete running poems whose every member has had a turn but whose
    /// completion was not stored yet.
    async fn complete_stranded(&self) -> usize {
        let cells: Vec<Arc<Mutex<TeamPoem>>> =
            self.registry.read().await.poems.values().cloned().collect();
        let mut completed = 0;
        for cell in cells {
            let poem = cell.lock_owned().await;
            if poem.status == PoemStatus::InProgress
                && poem.is_exhausted()
                && self.advance_or_complete(poem).await
            {
                completed += 1;
            }
        }
        completed
    }

    async fn evict(&self, poem: &TeamPoem) {
        let mut registry = self.registry.write().await;
        registry.poems.remove(&poem.team);
        for member in &poem.members {
            registry.member_team.remove(&member.identity);
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Rebuild running poems from their latest snapshots and re-issue the
    /// current turn with a fresh timeout. Returns how many were resumed.
    pub async fn restore(&self) -> Result<usize, DatabaseError> {
        let snapshots = self.db.latest_poem_snapshots().await?;
        let mut resumed = 0;
        for poem in snapshots {
            if poem.status != PoemStatus::InProgress {
                continue;
            }
            let team = poem.team.clone();
            let cell = Arc::new(Mutex::new(poem));
            let guard = Arc::clone(&cell).lock_owned().await;
            {
                let mut registry = self.registry.write().await;
                if registry.poems.contains_key(&team) {
                    continue;
                }
                for member in &guard.members {
                    registry
                        .member_team
                        .insert(member.identity.clone(), team.clone());
                }
                registry.poems.insert(team.clone(), cell);
            }
            tracing::info!(team = %team, index = guard.current_member_index, "Team poem resumed");
            self.advance_or_complete(guard).await;
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Cancel every running poem. Returns how many were cancelled.
    pub async fn cancel_all(&self, reason: &str) -> usize {
        let cells: Vec<Arc<Mutex<TeamPoem>>> = {
            let mut registry = self.registry.write().await;
            registry.member_team.clear();
            registry.poems.drain().map(|(_, cell)| cell).collect()
        };

        let mut cancelled = 0;
        for cell in cells {
            let mut poem = cell.lock().await;
            self.timeouts().cancel_team(&poem.team);
            if poem.status != PoemStatus::InProgress {
                continue;
            }
            poem.mark_cancelled();
            if let Err(e) = self.db.save_poem_snapshot(&poem).await {
                tracing::error!(team = %poem.team, error = %e, "Failed to persist cancelled poem");
            }
            tracing::info!(team = %poem.team, lines = poem.lines.len(), reason, "Team poem cancelled");
            cancelled += 1;
        }
        cancelled
    }

    /// Re-send the turn prompt or a status line to a member. Returns `false`
    /// if `identity` isn't in a running poem.
    pub async fn remind(&self, identity: &str, chat_id: &str) -> bool {
        let Some(cell) = self.poem_of_member(identity).await else {
            return false;
        };
        let poem = cell.lock().await;
        let text = match poem.current_member() {
            Some(current) if current.identity == identity => {
                prompts::your_turn(current, &poem, self.turn_timeout)
            }
            current => {
                if poem.member(identity).is_some_and(|m| m.is_processed()) {
                    prompts::already_written()
                } else {
                    prompts::not_your_turn(current.map(|m| m.display_name.as_str()))
                }
            }
        };
        self.notifier.text(chat_id, text).await;
        true
    }

    // ── Stats ───────────────────────────────────────────────────────

    /// Status of one team's poem.
    pub async fn stats(&self, team: &str) -> Result<PoemStats, DatabaseError> {
        if let Some(cell) = self.poem_of_team(team).await {
            let poem = cell.lock().await;
            return Ok(PoemStats::from(&*poem));
        }
        Ok(self
            .db
            .latest_poem_snapshot(team)
            .await?
            .map(|poem| PoemStats::from(&poem))
            .unwrap_or_else(|| PoemStats::not_started(team)))
    }

    /// Status of every listed team.
    pub async fn all_stats(&self, teams: &[String]) -> Result<Vec<PoemStats>, DatabaseError> {
        let mut out = Vec::with_capacity(teams.len());
        for team in teams {
            out.push(self.stats(team).await?);
        }
        Ok(out)
    }
}
