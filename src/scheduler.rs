//! Availability scheduler — opens released blocks for idle participants and
//! closes the event at its configured end.
//!
//! Two background tasks:
//! - A **sweep ticker** that periodically activates the next block of every
//!   idle, confirmed participant whose block has been released
//! - A one-shot **event closer** that ends the quest at a fixed time

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::channels::OutgoingMessage;
use crate::error::DatabaseError;
use crate::quiz::prompts;
use crate::quiz::{ActivationSource, QuizEngine};
use crate::store::ParticipantFilter;

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle participants with blocks left.
    pub evaluated: usize,
    pub activated: usize,
    pub failed: usize,
    /// Every known participant has reached the end of the catalog.
    pub all_done: bool,
}

pub struct AvailabilityScheduler {
    engine: Arc<QuizEngine>,
}

impl AvailabilityScheduler {
    pub fn new(engine: Arc<QuizEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<QuizEngine> {
        &self.engine
    }

    /// Activate the pending block of every idle confirmed participant whose
    /// block is released at `now`. Failures are logged per participant.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, DatabaseError> {
        let mut report = SweepReport::default();
        if self.engine.is_closed() {
            return Ok(report);
        }

        let catalog = self.engine.catalog();
        let len = catalog.len();
        let idle = self
            .engine
            .db()
            .list_participants(&ParticipantFilter::idle_confirmed())
            .await?;

        for p in idle {
            if p.current_block >= len {
                continue;
            }
            report.evaluated += 1;

            let candidate = p.current_block;
            if !catalog.open_for_sweep(candidate, now) {
                continue;
            }
            match self
                .engine
                .activate_block(&p.identity, candidate, ActivationSource::Sweep)
                .await
            {
                Ok(true) => report.activated += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(identity = %p.identity, block = candidate, error = %e, "Sweep activation failed");
                }
            }
        }

        let everyone = self
            .engine
            .db()
            .list_participants(&ParticipantFilter::default())
            .await?;
        report.all_done = !everyone.is_empty() && everyone.iter().all(|p| p.current_block >= len);
        Ok(report)
    }

    /// End the event: cancel running poems, then tell every participant.
    /// Only the first call does anything.
    pub async fn close_event(&self, reason: &str) -> Result<bool, DatabaseError> {
        if !self.engine.close_event() {
            return Ok(false);
        }

        let cancelled = self.engine.poems().cancel_all(reason).await;
        let participants = self
            .engine
            .db()
            .list_participants(&ParticipantFilter::default())
            .await?;
        let report = self
            .engine
            .notifier()
            .broadcast(
                participants.iter().map(|p| p.chat_id.as_str()),
                &OutgoingMessage::text(prompts::event_closed()),
            )
            .await;

        tracing::info!(
            reason,
            poems_cancelled = cancelled,
            notified = report.delivered,
            failed = report.failed,
            "Event closed"
        );
        Ok(true)
    }
}

/// Spawn the sweep ticker. It runs until the event closes; while every known
/// participant is done it keeps ticking quietly so late registrations still
/// get their timed blocks.
pub fn spawn_sweep_ticker(
    scheduler: Arc<AvailabilityScheduler>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut idle = false;
        loop {
            ticker.tick().await;
            if scheduler.engine.is_closed() {
                tracing::info!("Event closed, sweep stopped");
                break;
            }
            match scheduler.sweep(Utc::now()).await {
                Ok(report) => {
                    if report.activated > 0 || report.failed > 0 {
                        tracing::info!(
                            evaluated = report.evaluated,
                            activated = report.activated,
                            failed = report.failed,
                            "Sweep finished"
                        );
                    }
                    if report.all_done != idle {
                        idle = report.all_done;
                        if idle {
                            tracing::info!("Every participant finished, sweep idling");
                        } else {
                            tracing::info!("Participants with blocks left, sweep resumed");
                        }
                    }
                }
                Err(e) => tracing::error!("Sweep failed: {}", e),
            }
        }
    })
}

/// Spawn the one-shot closer that ends the event at `at`.
pub fn spawn_event_closer(
    scheduler: Arc<AvailabilityScheduler>,
    at: DateTime<Utc>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tracing::info!(at = %at, "Event closer armed");
        tokio::time::sleep(delay).await;
        if let Err(e) = scheduler.close_event("scheduled end").await {
            tracing::error!("Failed to close event: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    use crate::catalog::{Block, BlockCatalog, Prompt, Release};
    use crate::channels::{MemoryChannel, Notifier};
    use crate::poem::PoemCoordinator;
    use crate::quiz::{Answer, ConversationState};
    use crate::store::{Database, LibSqlBackend};

    async fn scheduler(blocks: Vec<Block>) -> (Arc<LibSqlBackend>, Arc<MemoryChannel>, AvailabilityScheduler) {
        let catalog = Arc::new(BlockCatalog::new(blocks).unwrap());
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.ensure_answer_columns(catalog.total_prompts()).await.unwrap();
        let channel = Arc::new(MemoryChannel::new());
        let notifier = Notifier::new(channel.clone());
        let poems = Arc::new(PoemCoordinator::new(
            db.clone(),
            catalog.clone(),
            notifier.clone(),
            Duration::from_secs(60),
        ));
        let engine = Arc::new(QuizEngine::new(
            db.clone(),
            catalog,
            notifier,
            poems,
            vec!["Red".into()],
            FixedOffset::east_opt(0).unwrap(),
        ));
        (db, channel, AvailabilityScheduler::new(engine))
    }

    async fn finish_block_zero(s: &AvailabilityScheduler, identity: &str) {
        let engine = s.engine();
        engine.begin(identity, identity, None).await.unwrap();
        engine.register(identity, "Ann").await.unwrap();
        engine.select_team(identity, "Red").await.unwrap();
        engine.confirm_start(identity).await.unwrap();
        engine.submit_answer(identity, Answer::text("a")).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_opens_block_once_released() {
        let release = Utc::now() + chrono::Duration::minutes(10);
        let (db, _, s) = scheduler(vec![
            Block::questions(Release::Immediate, vec![Prompt::text("Q1")]),
            Block::questions(Release::At(release), vec![Prompt::text("Q2")]),
        ])
        .await;
        finish_block_zero(&s, "1").await;

        let early = s.sweep(Utc::now()).await.unwrap();
        assert_eq!(early.evaluated, 1);
        assert_eq!(early.activated, 0);

        let report = s.sweep(release).await.unwrap();
        assert_eq!(report.activated, 1);
        let p = db.get_participant("1").await.unwrap().unwrap();
        assert_eq!(p.state, ConversationState::answering(1));

        let again = s.sweep(release).await.unwrap();
        assert_eq!(again.evaluated, 0, "active participants are not candidates");
    }

    #[tokio::test]
    async fn sweep_never_opens_later_immediate_blocks() {
        let (db, _, s) = scheduler(vec![
            Block::questions(Release::Immediate, vec![Prompt::text("Q1")]),
            Block::questions(Release::Immediate, vec![Prompt::text("Q2")]),
        ])
        .await;
        let engine = s.engine();
        engine.begin("1", "1", None).await.unwrap();
        engine.register("1", "Ann").await.unwrap();
        engine.select_team("1", "Red").await.unwrap();
        engine.confirm_start("1").await.unwrap();
        engine.reset("1").await.unwrap();

        // Block 0 is always eligible.
        assert_eq!(s.sweep(Utc::now()).await.unwrap().activated, 1);
        engine.submit_answer("1", Answer::text("a")).await.unwrap();
        engine.reset("1").await.unwrap();

        let report = s.sweep(Utc::now() + chrono::Duration::days(1)).await.unwrap();
        assert_eq!(report.activated, 0);
        assert_eq!(db.get_participant("1").await.unwrap().unwrap().current_block, 1);
    }

    #[tokio::test]
    async fn unconfirmed_participants_are_ignored() {
        let (_, _, s) = scheduler(vec![Block::questions(Release::Immediate, vec![Prompt::text("Q1")])]).await;
        s.engine().begin("1", "1", None).await.unwrap();
        let report = s.sweep(Utc::now()).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn reports_all_done() {
        let (_, _, s) = scheduler(vec![Block::questions(Release::Immediate, vec![Prompt::text("Q1")])]).await;
        finish_block_zero(&s, "1").await;
        assert!(s.sweep(Utc::now()).await.unwrap().all_done);
    }

    #[tokio::test]
    async fn close_event_runs_once() {
        let (_, channel, s) = scheduler(vec![
            Block::questions(Release::Immediate, vec![Prompt::text("Q1"), Prompt::text("Q2")]),
        ])
        .await;
        s.engine().begin("1", "1", None).await.unwrap();

        assert!(s.close_event("test").await.unwrap());
        assert!(!s.close_event("test").await.unwrap());
        let closing = channel
            .bodies_for("1")
            .iter()
            .filter(|b| b.contains("The quest is over"))
            .count();
        assert_eq!(closing, 1);
        assert_eq!(s.sweep(Utc::now()).await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn ticker_serves_late_registrations_after_everyone_finished() {
        let (db, _, s) = scheduler(vec![
            Block::questions(Release::Immediate, vec![Prompt::text("Q1")]),
            Block::questions(
                Release::At(Utc::now() - chrono::Duration::minutes(1)),
                vec![Prompt::text("Q2")],
            ),
        ])
        .await;
        let s = Arc::new(s);
        finish_block_zero(&s, "1").await;
        s.engine().submit_answer("1", Answer::text("b")).await.unwrap();
        assert!(s.sweep(Utc::now()).await.unwrap().all_done);

        let handle = spawn_sweep_ticker(Arc::clone(&s), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(60)).await;

        // A latecomer who drops their block can only get it back from the sweep.
        finish_block_zero(&s, "2").await;
        assert!(s.engine().reset("2").await.unwrap());

        let mut reopened = false;
        for _ in 0..50 {
            let p = db.get_participant("2").await.unwrap().unwrap();
            if p.state == ConversationState::answering(1) {
                reopened = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();
        assert!(reopened);
    }
}
