//! End-to-end quest scenarios against an in-memory store and a recording channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Utc};

use event_quest::catalog::{Block, BlockCatalog, Prompt, Release};
use event_quest::channels::{MemoryChannel, Notifier};
use event_quest::poem::{LineOutcome, LineRejection, PoemCoordinator, PoemStatus};
use event_quest::quiz::{
    ActivationSource, Answer, ConversationState, NextBlock, QuizEngine, SubmitOutcome,
};
use event_quest::scheduler::AvailabilityScheduler;
use event_quest::store::{Database, LibSqlBackend};

struct Quest {
    db: Arc<dyn Database>,
    channel: Arc<MemoryChannel>,
    engine: Arc<QuizEngine>,
    poems: Arc<PoemCoordinator>,
    scheduler: AvailabilityScheduler,
}

async fn quest_on(db: Arc<dyn Database>, catalog: BlockCatalog) -> Quest {
    let catalog = Arc::new(catalog);
    db.ensure_answer_columns(catalog.total_prompts()).await.unwrap();
    let channel = Arc::new(MemoryChannel::new());
    let notifier = Notifier::new(channel.clone());
    let poems = Arc::new(PoemCoordinator::new(
        Arc::clone(&db),
        Arc::clone(&catalog),
        notifier.clone(),
        Duration::from_secs(120),
    ));
    let engine = Arc::new(QuizEngine::new(
        Arc::clone(&db),
        catalog,
        notifier,
        Arc::clone(&poems),
        vec!["Red".into(), "Blue".into()],
        FixedOffset::east_opt(3 * 3600).unwrap(),
    ));
    let scheduler = AvailabilityScheduler::new(Arc::clone(&engine));
    Quest {
        db,
        channel,
        engine,
        poems,
        scheduler,
    }
}

async fn quest(catalog: BlockCatalog) -> Quest {
    quest_on(Arc::new(LibSqlBackend::new_memory().await.unwrap()), catalog).await
}

fn past() -> Release {
    Release::At(Utc::now() - chrono::Duration::minutes(5))
}

fn future() -> Release {
    Release::At(Utc::now() + chrono::Duration::hours(3))
}

/// Two question blocks, a photo block and the team poem.
fn event_catalog() -> BlockCatalog {
    BlockCatalog::new(vec![
        Block::questions(
            Release::Immediate,
            vec![Prompt::text("Founded in?"), Prompt::text("Values?")],
        ),
        Block::questions(past(), vec![Prompt::photo("Photo with a colleague")]),
        Block::team_poem(past(), "A poem about our company").with_title("Team poem"),
    ])
    .unwrap()
}

async fn join(q: &Quest, identity: &str, name: &str, team: &str) {
    q.engine.begin(identity, identity, None).await.unwrap();
    assert!(q.engine.register(identity, name).await.unwrap());
    assert!(q.engine.select_team(identity, team).await.unwrap());
    assert!(q.engine.confirm_start(identity).await.unwrap());
}

/// Answer every question block so the participant reaches the poem.
async fn play_to_poem(q: &Quest, identity: &str) {
    q.engine.submit_answer(identity, Answer::text("2009")).await.unwrap();
    let outcome = q.engine.submit_answer(identity, Answer::text("trust")).await.unwrap();
    assert_eq!(
        outcome,
        SubmitOutcome::BlockCompleted { block: 0, next: NextBlock::Opened(1) }
    );
    let outcome = q
        .engine
        .submit_answer(identity, Answer::photo(format!("F-{identity}")))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SubmitOutcome::BlockCompleted { block: 1, next: NextBlock::TeamPoem }
    );
}

fn count(channel: &MemoryChannel, chat: &str, needle: &str) -> usize {
    channel.bodies_for(chat).iter().filter(|b| b.contains(needle)).count()
}

#[tokio::test]
async fn red_team_writes_its_poem() {
    let q = quest(event_catalog()).await;
    join(&q, "1", "Ann", "Red").await;
    join(&q, "2", "Bob", "Red").await;

    play_to_poem(&q, "1").await;
    assert_eq!(q.poems.running().await, 0, "Bob hasn't arrived yet");
    assert!(q.channel.saw("1", "as soon as all your teammates get here"));

    play_to_poem(&q, "2").await;
    assert_eq!(q.poems.running().await, 1);
    assert_eq!(count(&q.channel, "2", "as soon as all your teammates get here"), 0);
    assert!(q.channel.saw("1", "Team Red is writing a poem together"));
    assert!(q.channel.saw("1", "Ann, it's your turn"));

    q.engine.handle_input("1", Answer::text("Our office hums with code and light")).await.unwrap();
    assert!(q.channel.saw("2", "Ann added a line"));
    assert!(q.channel.saw("2", "Bob, it's your turn"));
    q.engine.handle_input("2", Answer::text("We ship our dreams by day and night")).await.unwrap();

    for id in ["1", "2"] {
        let p = q.db.get_participant(id).await.unwrap().unwrap();
        assert_eq!(p.current_block, 3);
        assert!(!p.is_active);
        assert_eq!(p.state, ConversationState::Finished);
        assert_eq!(count(&q.channel, id, "THE POEM IS FINISHED"), 1);
    }

    let stats = q.poems.stats("Red").await.unwrap();
    assert_eq!(stats.status, PoemStatus::Completed);
    assert_eq!(stats.contributed, 2);

    let rows = q.db.answer_rows(3).await.unwrap();
    assert_eq!(
        rows[0].answers,
        vec![Some("2009".into()), Some("trust".into()), Some("photo:F-1".into())]
    );

    q.engine.handle_input("1", Answer::text("one more?")).await.unwrap();
    assert!(q.channel.saw("1", "completed the whole quest"));
}

#[tokio::test]
async fn blue_member_times_out_and_is_skipped() {
    let q = quest(event_catalog()).await;
    for (id, name) in [("1", "Ann"), ("2", "Bob"), ("3", "Cid")] {
        join(&q, id, name, "Blue").await;
    }
    for id in ["1", "2", "3"] {
        play_to_poem(&q, id).await;
    }
    assert_eq!(q.poems.running().await, 1);

    q.engine.handle_input("1", Answer::text("Blue skies above")).await.unwrap();
    assert_eq!(
        q.poems.expire_turns(Utc::now() + chrono::Duration::minutes(3)).await,
        1
    );
    assert!(q.channel.saw("2", "Time's up"));
    assert!(q.channel.saw("3", "Cid, it's your turn"));

    // Bob's late line is refused.
    q.engine.handle_input("2", Answer::text("too late")).await.unwrap();
    assert!(q.channel.saw("2", "already had your turn"));

    q.engine.handle_input("3", Answer::text("and friends we love")).await.unwrap();

    let stats = q.poems.stats("Blue").await.unwrap();
    assert_eq!(stats.status, PoemStatus::Completed);
    assert_eq!(
        stats.lines,
        vec!["Blue skies above", "[skipped by Bob]", "and friends we love"]
    );
    assert_eq!(stats.contributed, 2);
    assert_eq!(stats.skipped, 1);

    let finale = q
        .channel
        .bodies_for("2")
        .into_iter()
        .find(|b| b.contains("THE POEM IS FINISHED"))
        .unwrap();
    assert!(finale.contains("• Ann"));
    assert!(finale.contains("• Cid"));
    assert!(!finale.contains("• Bob"));

    let ledger = q.db.list_contributions(Some("Blue")).await.unwrap();
    assert_eq!(ledger.len(), 3);
    assert!(ledger[1].skipped);

    let p = q.db.get_participant("2").await.unwrap().unwrap();
    assert_eq!(p.state, ConversationState::Finished);
}

#[tokio::test]
async fn poem_waits_for_every_teammate() {
    let q = quest(event_catalog()).await;
    for (id, name) in [("1", "Ann"), ("2", "Bob"), ("3", "Cid")] {
        join(&q, id, name, "Red").await;
    }
    play_to_poem(&q, "1").await;
    play_to_poem(&q, "2").await;

    assert_eq!(q.poems.running().await, 0);
    assert!(!q.channel.saw("1", "it's your turn"));
    let stats = q.poems.stats("Red").await.unwrap();
    assert_eq!(stats.status, PoemStatus::NotStarted);
}

#[tokio::test]
async fn out_of_turn_line_changes_nothing() {
    let q = quest(event_catalog()).await;
    join(&q, "1", "Ann", "Red").await;
    join(&q, "2", "Bob", "Red").await;
    play_to_poem(&q, "1").await;
    play_to_poem(&q, "2").await;

    let outcome = q.poems.process_line("2", "2", "me first").await.unwrap();
    assert_eq!(outcome, LineOutcome::Rejected(LineRejection::NotYourTurn));
    let stats = q.poems.stats("Red").await.unwrap();
    assert!(stats.lines.is_empty());
    assert_eq!(stats.current_turn.as_deref(), Some("Ann"));
}

#[tokio::test]
async fn completion_happens_once_when_line_and_timeout_race() {
    let q = quest(event_catalog()).await;
    join(&q, "1", "Ann", "Red").await;
    join(&q, "2", "Bob", "Red").await;
    play_to_poem(&q, "1").await;
    play_to_poem(&q, "2").await;
    q.poems.process_line("1", "1", "first").await.unwrap();

    let later = Utc::now() + chrono::Duration::minutes(5);
    let (line, skipped) = tokio::join!(
        q.poems.process_line("2", "2", "second"),
        q.poems.expire_turns(later)
    );
    let line = line.unwrap();

    let stats = q.poems.stats("Red").await.unwrap();
    assert_eq!(stats.status, PoemStatus::Completed);
    assert_eq!(stats.lines.len(), 2);
    match line {
        LineOutcome::Accepted { completed, .. } => {
            assert!(completed);
            assert_eq!(skipped, 0);
        }
        LineOutcome::Rejected(_) => assert_eq!(skipped, 1),
        LineOutcome::Empty => panic!("line was not empty"),
    }
    for id in ["1", "2"] {
        assert_eq!(count(&q.channel, id, "THE POEM IS FINISHED"), 1);
    }
    assert_eq!(q.poems.expire_turns(later).await, 0);
}

#[tokio::test]
async fn sweep_and_chaining_activate_a_block_once() {
    let catalog = BlockCatalog::new(vec![
        Block::questions(Release::Immediate, vec![Prompt::text("Q1")]),
        Block::questions(past(), vec![Prompt::text("Q2")]),
        Block::questions(future(), vec![Prompt::text("Q3")]),
    ])
    .unwrap();
    let q = quest(catalog).await;
    join(&q, "1", "Ann", "Red").await;

    let (submitted, swept) = tokio::join!(
        q.engine.submit_answer("1", Answer::text("a1")),
        q.scheduler.sweep(Utc::now())
    );
    submitted.unwrap();
    swept.unwrap();
    q.scheduler.sweep(Utc::now()).await.unwrap();

    assert_eq!(count(&q.channel, "1", "A new block is open"), 1);
    assert_eq!(count(&q.channel, "1", "Q2"), 1);
    let p = q.db.get_participant("1").await.unwrap().unwrap();
    assert_eq!(p.current_block, 1);
    assert_eq!(p.state, ConversationState::answering(1));
}

#[tokio::test]
async fn waiting_participant_is_told_the_unlock_time() {
    let at = Utc::now() + chrono::Duration::hours(3);
    let catalog = BlockCatalog::new(vec![
        Block::questions(Release::Immediate, vec![Prompt::text("Q1")]),
        Block::questions(Release::At(at), vec![Prompt::text("Q2")]),
    ])
    .unwrap();
    let q = quest(catalog).await;
    join(&q, "1", "Ann", "Red").await;
    q.engine.submit_answer("1", Answer::text("a1")).await.unwrap();

    let local = at
        .with_timezone(&FixedOffset::east_opt(3 * 3600).unwrap())
        .format("%H:%M")
        .to_string();
    assert!(q.channel.saw("1", &format!("The next block opens at {local}")));

    q.engine.handle_input("1", Answer::text("anything?")).await.unwrap();
    assert!(q.channel.saw("1", "No block is open for you right now"));

    let report = q.scheduler.sweep(at).await.unwrap();
    assert_eq!(report.activated, 1);
    assert!(q.channel.saw("1", "Q2"));
}

#[tokio::test]
async fn closing_the_event_cancels_running_poems() {
    let q = quest(event_catalog()).await;
    join(&q, "1", "Ann", "Red").await;
    join(&q, "2", "Bob", "Red").await;
    play_to_poem(&q, "1").await;
    play_to_poem(&q, "2").await;
    join(&q, "3", "Cid", "Blue").await;

    assert!(q.scheduler.close_event("test").await.unwrap());
    assert_eq!(q.poems.running().await, 0);
    assert_eq!(
        q.poems.stats("Red").await.unwrap().status,
        PoemStatus::Cancelled
    );
    for id in ["1", "2", "3"] {
        assert_eq!(count(&q.channel, id, "The quest is over"), 1);
    }

    q.engine.handle_input("3", Answer::text("2009")).await.unwrap();
    assert_eq!(count(&q.channel, "3", "The quest is over"), 2);
    let p = q.db.get_participant("3").await.unwrap().unwrap();
    assert_eq!(p.state, ConversationState::answering(0));
}

#[tokio::test]
async fn progress_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quest.db");
    let catalog = || {
        BlockCatalog::new(vec![Block::questions(
            Release::Immediate,
            vec![Prompt::text("Q1"), Prompt::text("Q2")],
        )])
        .unwrap()
    };

    {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let q = quest_on(db, catalog()).await;
        join(&q, "1", "Ann", "Red").await;
        q.engine.submit_answer("1", Answer::text("a1")).await.unwrap();
    }

    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let q = quest_on(db, catalog()).await;
    q.engine.begin("1", "1", None).await.unwrap();
    assert!(q.channel.saw("1", "Welcome back, Ann"));
    assert!(q.channel.saw("1", "Q2"));

    q.engine.submit_answer("1", Answer::text("a2")).await.unwrap();
    let rows = q.db.answer_rows(2).await.unwrap();
    assert_eq!(rows[0].answers, vec![Some("a1".into()), Some("a2".into())]);
}

#[tokio::test]
async fn early_poem_start_brings_in_teammates_still_waiting_for_release() {
    let q = quest(
        BlockCatalog::new(vec![
            Block::questions(Release::Immediate, vec![Prompt::text("Year?")]),
            Block::team_poem(Release::At(Utc::now() + chrono::Duration::hours(1)), "Evening"),
        ])
        .unwrap(),
    )
    .await;
    for (id, name) in [("1", "Ann"), ("2", "Bob")] {
        join(&q, id, name, "Red").await;
        let outcome = q.engine.submit_answer(id, Answer::text("2009")).await.unwrap();
        assert!(matches!(
            outcome,
            SubmitOutcome::BlockCompleted { block: 0, next: NextBlock::Waiting { block: 1, .. } }
        ));
    }

    // An operator opens the poem for Ann before its release time.
    assert!(q.engine.activate_block("1", 1, ActivationSource::Admin).await.unwrap());
    assert_eq!(q.poems.running().await, 1);
    let bob = q.db.get_participant("2").await.unwrap().unwrap();
    assert_eq!(bob.state, ConversationState::InTeamPoem { team: "Red".into() });

    q.engine.handle_input("1", Answer::text("Lanterns glow")).await.unwrap();
    q.engine.handle_input("2", Answer::text("friends below")).await.unwrap();
    assert!(!q.channel.saw("2", "No block is open"));

    let stats = q.poems.stats("Red").await.unwrap();
    assert_eq!(stats.status, PoemStatus::Completed);
    assert_eq!(stats.lines, vec!["Lanterns glow", "friends below"]);

    let report = q
        .scheduler
        .sweep(Utc::now() + chrono::Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(report.activated, 0);
    assert!(report.all_done);
}
