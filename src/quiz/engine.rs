//! QuizEngine — drives each participant through registration, the question
//! blocks and into the team poem.
//!
//! Every public operation takes the participant's lock first, so a sweep
//! activation and a chained activation for the same person never interleave.
//! The store's test-and-set guard is the second line: `activate_block` only
//! succeeds on an idle participant whose cursor is at or below the block.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, FixedOffset, Utc};

use crate::catalog::{BlockCatalog, PromptKind};
use crate::channels::Notifier;
use crate::error::{Error, Result};
use crate::poem::{PoemCoordinator, Readiness};
use crate::poem::prompts as poem_prompts;
use crate::store::{BlockCompletion, Database, NewParticipant, Participant, ParticipantPatch};

use super::locks::ParticipantLocks;
use super::prompts;
use super::state::{Answer, ConversationState, Phase};

/// Who asked for a block to be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationSource {
    Confirmation,
    Chaining,
    Sweep,
    Admin,
}

impl std::fmt::Display for ActivationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirmation => write!(f, "confirmation"),
            Self::Chaining => write!(f, "chaining"),
            Self::Sweep => write!(f, "sweep"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// What happened after a block was completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextBlock {
    /// The next block was released and opened right away.
    Opened(usize),
    /// The next block is the team poem and the participant entered it.
    TeamPoem,
    /// The next block is not released yet.
    Waiting {
        block: usize,
        unlock_at: Option<DateTime<Utc>>,
    },
    /// That was the last block.
    AllDone,
}

/// Result of [`QuizEngine::submit_answer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The participant isn't mid-block.
    NotAnswering,
    /// Wrong kind of input; the prompt was sent again.
    Reprompted { expected: PromptKind },
    /// Answer stored, next prompt sent.
    Advanced { step: usize },
    /// Last prompt answered and the block written.
    BlockCompleted { block: usize, next: NextBlock },
    /// The store refused the block write (another path already closed it).
    Stale,
}

/// The per-participant progression engine.
pub struct QuizEngine {
    db: Arc<dyn Database>,
    catalog: Arc<BlockCatalog>,
    notifier: Notifier,
    poems: Arc<PoemCoordinator>,
    teams: Vec<String>,
    utc_offset: FixedOffset,
    locks: ParticipantLocks,
    closed: AtomicBool,
}

impl QuizEngine {
    pub fn new(
        db: Arc<dyn Database>,
        catalog: Arc<BlockCatalog>,
        notifier: Notifier,
        poems: Arc<PoemCoordinator>,
        teams: Vec<String>,
        utc_offset: FixedOffset,
    ) -> Self {
        Self {
            db,
            catalog,
            notifier,
            poems,
            teams,
            utc_offset,
            locks: ParticipantLocks::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn catalog(&self) -> &Arc<BlockCatalog> {
        &self.catalog
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn poems(&self) -> &Arc<PoemCoordinator> {
        &self.poems
    }

    pub fn teams(&self) -> &[String] {
        &self.teams
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset
    }

    /// Mark the event closed. Returns `true` only for the first caller.
    pub fn close_event(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn participant(&self, identity: &str) -> Result<Participant> {
        self.db
            .get_participant(identity)
            .await?
            .ok_or_else(|| Error::UnknownParticipant {
                identity: identity.to_string(),
            })
    }

    async fn set_state(&self, identity: &str, state: ConversationState) -> Result<()> {
        self.db
            .update_participant(
                identity,
                &ParticipantPatch {
                    state: Some(state),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    // ── Registration ────────────────────────────────────────────────

    /// Handle `/start`: create the participant, or resume where they left off.
    pub async fn begin(
        &self,
        identity: &str,
        chat_id: &str,
        username: Option<&str>,
    ) -> Result<Phase> {
        let _guard = self.locks.acquire(identity).await;

        let created = self
            .db
            .upsert_participant(&NewParticipant {
                identity: identity.to_string(),
                chat_id: chat_id.to_string(),
                username: username.map(str::to_string),
            })
            .await?;

        if self.is_closed() {
            self.notifier.text(chat_id, prompts::event_closed()).await;
            return Ok(self.participant(identity).await?.state.phase());
        }

        if created {
            tracing::info!(identity, "New participant");
            self.notifier.text(chat_id, prompts::greeting()).await;
            self.notifier.text(chat_id, prompts::ask_name()).await;
            return Ok(Phase::AwaitingName);
        }

        let p = self.participant(identity).await?;
        self.resume(&p).await;
        Ok(p.state.phase())
    }

    /// Re-send whatever the participant's current state is waiting for.
    async fn resume(&self, p: &Participant) {
        let chat = p.chat_id.as_str();
        match &p.state {
            ConversationState::AwaitingName => {
                self.notifier.text(chat, prompts::greeting()).await;
                self.notifier.text(chat, prompts::ask_name()).await;
            }
            ConversationState::AwaitingTeam => {
                self.notifier
                    .send(chat, prompts::team_keyboard(&p.name(), &self.teams))
                    .await;
            }
            ConversationState::AwaitingConfirmation => {
                self.notifier.send(chat, prompts::rules_with_confirm()).await;
            }
            ConversationState::Answering { block, step, .. } => {
                self.notifier
                    .text(chat, prompts::greeting_back(&p.name()))
                    .await;
                self.send_prompt(chat, *block, *step).await;
            }
            ConversationState::WaitingForBlock { .. } => {
                self.notifier
                    .text(chat, prompts::greeting_back(&p.name()))
                    .await;
                self.notifier.text(chat, prompts::still_waiting()).await;
            }
            ConversationState::InTeamPoem { .. } => {
                if !self.poems.remind(&p.identity, chat).await {
                    self.notifier.text(chat, prompts::waiting_for_team()).await;
                }
            }
            ConversationState::Finished => {
                self.notifier.text(chat, prompts::all_done()).await;
            }
        }
    }

    /// Store the display name and ask for a team.
    pub async fn register(&self, identity: &str, name: &str) -> Result<bool> {
        let _guard = self.locks.acquire(identity).await;
        let p = self.participant(identity).await?;
        self.register_locked(&p, name).await
    }

    async fn register_locked(&self, p: &Participant, name: &str) -> Result<bool> {
        if !p.state.phase().can_transition_to(Phase::AwaitingTeam) {
            return Ok(false);
        }
        let name = name.trim();
        if name.is_empty() {
            self.notifier.text(&p.chat_id, prompts::ask_name()).await;
            return Ok(false);
        }

        self.db
            .update_participant(
                &p.identity,
                &ParticipantPatch {
                    display_name: Some(name.to_string()),
                    state: Some(ConversationState::AwaitingTeam),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(identity = %p.identity, name, "Participant registered");

        self.notifier
            .send(&p.chat_id, prompts::team_keyboard(name, &self.teams))
            .await;
        Ok(true)
    }

    /// Store the chosen team. Unknown choices get a corrective message.
    pub async fn select_team(&self, identity: &str, choice: &str) -> Result<bool> {
        let _guard = self.locks.acquire(identity).await;
        let p = self.participant(identity).await?;
        if p.state.phase() != Phase::AwaitingTeam {
            return Ok(false);
        }

        let Some(team) = self.teams.iter().find(|t| t.as_str() == choice) else {
            self.notifier
                .text(&p.chat_id, prompts::unknown_team(choice))
                .await;
            self.notifier
                .send(&p.chat_id, prompts::team_keyboard(&p.name(), &self.teams))
                .await;
            return Ok(false);
        };

        self.db
            .update_participant(
                identity,
                &ParticipantPatch {
                    team: Some(team.clone()),
                    state: Some(ConversationState::AwaitingConfirmation),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(identity, team = %team, "Team selected");

        self.notifier.text(&p.chat_id, prompts::team_chosen(team)).await;
        self.notifier
            .send(&p.chat_id, prompts::rules_with_confirm())
            .await;
        Ok(true)
    }

    /// The participant pressed "start": open block 0 regardless of its release.
    pub async fn confirm_start(&self, identity: &str) -> Result<bool> {
        let _guard = self.locks.acquire(identity).await;
        let p = self.participant(identity).await?;
        if p.state.phase() != Phase::AwaitingConfirmation {
            return Ok(false);
        }
        if self.is_closed() {
            self.notifier.text(&p.chat_id, prompts::event_closed()).await;
            return Ok(false);
        }

        self.db
            .update_participant(
                identity,
                &ParticipantPatch {
                    confirmed_at: Some(Utc::now()),
                    state: Some(ConversationState::WaitingForBlock { block: 0 }),
                    ..Default::default()
                },
            )
            .await?;
        let p = self.participant(identity).await?;

        self.notifier.text(&p.chat_id, prompts::lets_go()).await;
        self.activate_locked(&p, 0, ActivationSource::Confirmation)
            .await
    }

    // ── Blocks ──────────────────────────────────────────────────────

    /// Open `block` for the participant. Returns `false` (and sends nothing)
    /// when the participant is busy, already past it, or not confirmed.
    pub async fn activate_block(
        &self,
        identity: &str,
        block: usize,
        source: ActivationSource,
    ) -> Result<bool> {
        let _guard = self.locks.acquire(identity).await;
        let p = self.participant(identity).await?;
        self.activate_locked(&p, block, source).await
    }

    async fn activate_locked(
        &self,
        p: &Participant,
        block: usize,
        source: ActivationSource,
    ) -> Result<bool> {
        if self.is_closed() || p.confirmed_at.is_none() {
            return Ok(false);
        }
        let Some(spec) = self.catalog.block(block) else {
            return Ok(false);
        };
        let limit = self.catalog.len();

        if spec.is_team_poem() {
            let Some(team) = p.team.clone() else {
                tracing::warn!(identity = %p.identity, "Participant without a team reached the poem block");
                return Ok(false);
            };
            let state = ConversationState::InTeamPoem { team: team.clone() };
            if !self
                .db
                .try_activate_block(&p.identity, block, limit, &state)
                .await?
            {
                return Ok(false);
            }
            tracing::info!(identity = %p.identity, block, %source, team = %team, "Entered team poem block");
            self.join_poem(p, &team).await?;
            return Ok(true);
        }

        let state = ConversationState::answering(block);
        if !self
            .db
            .try_activate_block(&p.identity, block, limit, &state)
            .await?
        {
            tracing::debug!(identity = %p.identity, block, %source, "Activation refused");
            return Ok(false);
        }
        tracing::info!(identity = %p.identity, block, %source, "Block activated");

        if source != ActivationSource::Confirmation {
            self.notifier
                .text(&p.chat_id, prompts::new_block(&self.catalog.title(block)))
                .await;
        }
        self.send_prompt(&p.chat_id, block, 0).await;
        Ok(true)
    }

    /// Run the readiness check after entering the poem block. Early arrivals
    /// are told to wait; a member who arrives after the team's poem already
    /// started without them, or ended, is finished.
    async fn join_poem(&self, p: &Participant, team: &str) -> Result<()> {
        let shut_out = match self.poems.check_readiness(team).await? {
            Readiness::Waiting { .. } => {
                self.notifier
                    .text(&p.chat_id, prompts::waiting_for_team())
                    .await;
                false
            }
            Readiness::Finished => true,
            Readiness::InProgress => !self.poems.is_member(&p.identity).await,
            Readiness::Started { .. } | Readiness::NoPoemBlock => false,
        };
        if shut_out {
            self.db
                .finish_participants(std::slice::from_ref(&p.identity), self.catalog.len())
                .await?;
            self.notifier
                .text(&p.chat_id, poem_prompts::team_already_done())
                .await;
        }
        Ok(())
    }

    async fn send_prompt(&self, chat_id: &str, block: usize, step: usize) {
        if let Some(prompt) = self.catalog.block(block).and_then(|b| b.prompts.get(step)) {
            self.notifier.text(chat_id, prompts::question(prompt)).await;
        }
    }

    /// Accept an answer to the current prompt.
    pub async fn submit_answer(&self, identity: &str, answer: Answer) -> Result<SubmitOutcome> {
        let _guard = self.locks.acquire(identity).await;
        let p = self.participant(identity).await?;
        self.submit_locked(&p, answer).await
    }

    async fn submit_locked(&self, p: &Participant, answer: Answer) -> Result<SubmitOutcome> {
        let ConversationState::Answering { block, step, .. } = p.state else {
            return Ok(SubmitOutcome::NotAnswering);
        };
        let Some(spec) = self.catalog.block(block) else {
            tracing::warn!(identity = %p.identity, block, "Answering a block outside the catalog");
            return Ok(SubmitOutcome::NotAnswering);
        };
        let Some(prompt) = spec.prompts.get(step) else {
            return Ok(SubmitOutcome::NotAnswering);
        };

        let accepted = matches!(
            (prompt.kind, &answer),
            (PromptKind::Text, Answer::Text { .. }) | (PromptKind::Photo, Answer::Photo { .. })
        );
        if !accepted {
            self.notifier
                .text(&p.chat_id, prompts::expected(prompt.kind))
                .await;
            self.notifier
                .text(&p.chat_id, prompts::question(prompt))
                .await;
            return Ok(SubmitOutcome::Reprompted {
                expected: prompt.kind,
            });
        }

        let mut state = p.state.clone();
        let step = state.push_answer(answer).unwrap_or(step + 1);

        if step < spec.prompts.len() {
            self.set_state(&p.identity, state).await?;
            self.send_prompt(&p.chat_id, block, step).await;
            return Ok(SubmitOutcome::Advanced { step });
        }

        let ConversationState::Answering { answers, .. } = state else {
            return Ok(SubmitOutcome::NotAnswering);
        };
        match self.complete_block(p, block, &answers).await? {
            Some(next) => Ok(SubmitOutcome::BlockCompleted { block, next }),
            None => Ok(SubmitOutcome::Stale),
        }
    }

    /// Write the block atomically, then notify, then chain or wait.
    async fn complete_block(
        &self,
        p: &Participant,
        block: usize,
        answers: &[Answer],
    ) -> Result<Option<NextBlock>> {
        let width = self
            .catalog
            .block(block)
            .map(|b| b.prompts.len())
            .unwrap_or(answers.len());
        let mut cells: Vec<String> = answers.iter().map(Answer::to_cell).collect();
        cells.resize(width.max(cells.len()), String::new());

        let next = block + 1;
        let finished = next >= self.catalog.len();
        let next_state = if finished {
            ConversationState::Finished
        } else {
            ConversationState::WaitingForBlock { block: next }
        };

        let written = self
            .db
            .write_block_answers(&BlockCompletion {
                identity: &p.identity,
                block,
                first_column: self.catalog.column_index(block, 0),
                cells: &cells,
                next_state: &next_state,
            })
            .await?;
        if !written {
            tracing::warn!(identity = %p.identity, block, "Block write refused; participant no longer active on it");
            return Ok(None);
        }
        tracing::info!(identity = %p.identity, block, "Block completed");

        self.notifier.text(&p.chat_id, prompts::block_saved()).await;
        if finished {
            self.notifier.text(&p.chat_id, prompts::all_done()).await;
            return Ok(Some(NextBlock::AllDone));
        }

        let now = Utc::now();
        if self.catalog.open_for_chaining(next, now) {
            let p = self.participant(&p.identity).await?;
            if self
                .activate_locked(&p, next, ActivationSource::Chaining)
                .await?
            {
                let is_poem = self.catalog.poem_block() == Some(next);
                return Ok(Some(if is_poem {
                    NextBlock::TeamPoem
                } else {
                    NextBlock::Opened(next)
                }));
            }
        }

        let unlock_at = self.catalog.block(next).and_then(|b| b.release.time());
        let notice = match unlock_at {
            Some(at) if at > now => prompts::next_block_at(at, self.utc_offset),
            _ => prompts::next_block_later(),
        };
        self.notifier.text(&p.chat_id, notice).await;
        Ok(Some(NextBlock::Waiting {
            block: next,
            unlock_at,
        }))
    }

    /// Handle `/stop`: drop the in-progress block without saving it.
    pub async fn reset(&self, identity: &str) -> Result<bool> {
        let _guard = self.locks.acquire(identity).await;
        let p = self.participant(identity).await?;

        let ConversationState::Answering { block, .. } = p.state else {
            self.notifier
                .text(&p.chat_id, prompts::nothing_to_reset())
                .await;
            return Ok(false);
        };
        let state = ConversationState::WaitingForBlock { block };
        if !self.db.deactivate(identity, &state).await? {
            return Ok(false);
        }
        tracing::info!(identity, block, "Block session reset");
        self.notifier.text(&p.chat_id, prompts::session_reset()).await;
        Ok(true)
    }

    // ── Inbound routing ─────────────────────────────────────────────

    /// Route a free-form text or photo by the participant's state.
    pub async fn handle_input(&self, identity: &str, answer: Answer) -> Result<()> {
        let _guard = self.locks.acquire(identity).await;
        let p = self.participant(identity).await?;
        let chat = p.chat_id.as_str();

        if self.is_closed() {
            self.notifier.text(chat, prompts::event_closed()).await;
            return Ok(());
        }

        match (&p.state, &answer) {
            (ConversationState::AwaitingName, Answer::Text { text }) => {
                self.register_locked(&p, text).await?;
            }
            (ConversationState::AwaitingName, Answer::Photo { .. }) => {
                self.notifier.text(chat, prompts::ask_name()).await;
            }
            (ConversationState::AwaitingTeam, _) => {
                self.notifier.text(chat, prompts::use_buttons()).await;
                self.notifier
                    .send(chat, prompts::team_keyboard(&p.name(), &self.teams))
                    .await;
            }
            (ConversationState::AwaitingConfirmation, _) => {
                self.notifier.text(chat, prompts::press_confirm()).await;
            }
            (ConversationState::Answering { .. }, _) => {
                self.submit_locked(&p, answer).await?;
            }
            (ConversationState::WaitingForBlock { .. }, _) => {
                self.notifier.text(chat, prompts::still_waiting()).await;
            }
            (ConversationState::InTeamPoem { .. }, Answer::Text { text }) => {
                if self.poems.is_member(identity).await {
                    self.poems.process_line(identity, chat, text).await?;
                } else {
                    self.notifier.text(chat, prompts::waiting_for_team()).await;
                }
            }
            (ConversationState::InTeamPoem { .. }, Answer::Photo { .. }) => {
                self.notifier.text(chat, poem_prompts::empty_line()).await;
            }
            (ConversationState::Finished, _) => {
                self.notifier.text(chat, prompts::all_done()).await;
            }
        }
        Ok(())
    }
}
