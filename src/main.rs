use std::sync::Arc;
use std::time::Duration;

use event_quest::admin::{AdminService, StatusRouteState, status_routes};
use event_quest::bot::Dispatcher;
use event_quest::catalog::BlockCatalog;
use event_quest::channels::{Channel, CliChannel, Notifier, TelegramChannel};
use event_quest::config::QuestConfig;
use event_quest::export;
use event_quest::poem::{self, PoemCoordinator};
use event_quest::quiz::QuizEngine;
use event_quest::scheduler::{self, AvailabilityScheduler};
use event_quest::store::{Database, LibSqlBackend};

/// How often the turn-timer loop looks for expired poem turns.
const TURN_POLL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = QuestConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    // Initialize tracing (plus a daily log file when QUEST_LOG_DIR is set)
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "event-quest.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    eprintln!("🎯 Event Quest v{}", env!("CARGO_PKG_VERSION"));

    // ── Catalog ──────────────────────────────────────────────────────────
    let catalog = Arc::new(
        BlockCatalog::load(&config.catalog_path, config.utc_offset, config.today())
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to load catalog {}: {}",
                    config.catalog_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!(
        "   Catalog: {} ({} blocks, {} prompts{})",
        config.catalog_path.display(),
        catalog.len(),
        catalog.total_prompts(),
        match catalog.poem_block() {
            Some(i) => format!(", team poem at block {i}"),
            None => String::new(),
        }
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    db.ensure_answer_columns(catalog.total_prompts()).await?;
    eprintln!("   Database: {}", config.db_path.display());

    // ── Gateway ──────────────────────────────────────────────────────────
    let channel: Arc<dyn Channel> = match &config.telegram_token {
        Some(token) => {
            eprintln!("   Channel: telegram");
            Arc::new(TelegramChannel::new(token.clone()))
        }
        None => {
            eprintln!("   Channel: cli (set TELEGRAM_BOT_TOKEN for Telegram)");
            eprintln!("   Directives: :as <id>, :photo <file_id>, :tap <data>");
            Arc::new(CliChannel::new())
        }
    };
    if let Err(e) = channel.health_check().await {
        eprintln!("Error: {} channel is not reachable: {}", channel.name(), e);
        std::process::exit(1);
    }
    let notifier = Notifier::new(Arc::clone(&channel));

    // ── Engines ──────────────────────────────────────────────────────────
    let poems = Arc::new(PoemCoordinator::new(
        Arc::clone(&db),
        Arc::clone(&catalog),
        notifier.clone(),
        config.turn_timeout,
    ));
    let resumed = poems.restore().await?;
    if resumed > 0 {
        eprintln!("   Resumed {} team poem(s) in progress", resumed);
    }

    let engine = Arc::new(QuizEngine::new(
        Arc::clone(&db),
        Arc::clone(&catalog),
        notifier,
        Arc::clone(&poems),
        config.teams.clone(),
        config.utc_offset,
    ));
    let scheduler = Arc::new(AvailabilityScheduler::new(Arc::clone(&engine)));

    let _sweep_handle = scheduler::spawn_sweep_ticker(Arc::clone(&scheduler), config.sweep_interval);
    let _timer_handle = poem::spawn_turn_timer_loop(Arc::clone(&poems), TURN_POLL);
    eprintln!(
        "   Sweep: every {}s, poem turns: {}s",
        config.sweep_interval.as_secs(),
        config.turn_timeout.as_secs()
    );
    if let Some(at) = config.event_end_at {
        let _closer_handle = scheduler::spawn_event_closer(Arc::clone(&scheduler), at);
        eprintln!(
            "   Event ends: {}",
            at.with_timezone(&config.utc_offset).format("%Y-%m-%d %H:%M")
        );
    }

    // ── Operator surface ─────────────────────────────────────────────────
    let sinks = export::sinks_from_config(&config);
    eprintln!(
        "   Operators: {}, export sinks: {}",
        config.admin_ids.len(),
        sinks.len()
    );
    let admin = Arc::new(AdminService::new(
        Arc::clone(&scheduler),
        sinks,
        config.admin_ids.clone(),
    ));

    if let Some(port) = config.http_port {
        let app = status_routes(StatusRouteState {
            engine: Arc::clone(&engine),
        });
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        eprintln!("   Status API: http://0.0.0.0:{}/api/health", port);
        tokio::spawn(async move {
            tracing::info!(port, "Status API started");
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Status API stopped: {}", e);
            }
        });
    }

    eprintln!();
    Dispatcher::new(channel, engine, admin).run().await?;
    Ok(())
}
