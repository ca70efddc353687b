//! Read-only REST endpoints for event status.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::catalog::{BlockKind, Release};
use crate::quiz::{Phase, QuizEngine};
use crate::store::ParticipantFilter;

/// Shared state for status routes.
#[derive(Clone)]
pub struct StatusRouteState {
    pub engine: Arc<QuizEngine>,
}

#[derive(Debug, Serialize)]
struct BlockView {
    index: usize,
    title: String,
    kind: BlockKind,
    release_at: Option<DateTime<Utc>>,
    prompts: usize,
}

#[derive(Debug, Serialize)]
struct ParticipantView {
    identity: String,
    display_name: Option<String>,
    team: Option<String>,
    current_block: usize,
    is_active: bool,
    phase: Phase,
    confirmed: bool,
    last_activity: DateTime<Utc>,
}

fn internal_error(e: impl std::fmt::Display) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": e.to_string()})),
    )
        .into_response()
}

/// GET /api/health
async fn health(State(state): State<StatusRouteState>) -> impl IntoResponse {
    let running_poems = state.engine.poems().running().await;
    Json(serde_json::json!({
        "status": "ok",
        "event_closed": state.engine.is_closed(),
        "running_poems": running_poems,
    }))
}

/// GET /api/blocks
async fn list_blocks(State(state): State<StatusRouteState>) -> impl IntoResponse {
    let catalog = state.engine.catalog();
    let blocks: Vec<BlockView> = catalog
        .blocks()
        .iter()
        .enumerate()
        .map(|(index, block)| BlockView {
            index,
            title: catalog.title(index),
            kind: block.kind,
            release_at: match block.release {
                Release::Immediate => None,
                Release::At(at) => Some(at),
            },
            prompts: block.prompts.len(),
        })
        .collect();
    Json(blocks)
}

/// GET /api/participants
///
/// Every participant in registration order, without answers.
async fn list_participants(State(state): State<StatusRouteState>) -> impl IntoResponse {
    match state
        .engine
        .db()
        .list_participants(&ParticipantFilter::default())
        .await
    {
        Ok(participants) => {
            let views: Vec<ParticipantView> = participants
                .into_iter()
                .map(|p| ParticipantView {
                    phase: p.state.phase(),
                    confirmed: p.confirmed_at.is_some(),
                    identity: p.identity,
                    display_name: p.display_name,
                    team: p.team,
                    current_block: p.current_block,
                    is_active: p.is_active,
                    last_activity: p.last_activity,
                })
                .collect();
            Json(views).into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// GET /api/poems/{team}
///
/// Poem status for a configured team, or 404.
async fn poem_status(
    State(state): State<StatusRouteState>,
    Path(team): Path<String>,
) -> impl IntoResponse {
    if !state.engine.teams().iter().any(|t| *t == team) {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("Unknown team {team}")})),
        )
            .into_response();
    }
    match state.engine.poems().stats(&team).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(e),
    }
}

/// Build the status REST routes.
pub fn status_routes(state: StatusRouteState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/blocks", get(list_blocks))
        .route("/api/participants", get(list_participants))
        .route("/api/poems/{team}", get(poem_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::FixedOffset;

    use crate::catalog::{Block, BlockCatalog, Prompt};
    use crate::channels::{MemoryChannel, Notifier};
    use crate::poem::PoemCoordinator;
    use crate::store::{Database, LibSqlBackend};

    async fn state() -> StatusRouteState {
        let catalog = Arc::new(
            BlockCatalog::new(vec![
                Block::questions(Release::Immediate, vec![Prompt::text("Year?")]),
                Block::team_poem(Release::Immediate, "Write about us"),
            ])
            .unwrap(),
        );
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.ensure_answer_columns(catalog.total_prompts()).await.unwrap();
        let notifier = Notifier::new(Arc::new(MemoryChannel::new()));
        let poems = Arc::new(PoemCoordinator::new(
            Arc::clone(&db),
            Arc::clone(&catalog),
            notifier.clone(),
            Duration::from_secs(60),
        ));
        let engine = Arc::new(QuizEngine::new(
            db,
            catalog,
            notifier,
            poems,
            vec!["Red".into()],
            FixedOffset::east_opt(0).unwrap(),
        ));
        StatusRouteState { engine }
    }

    #[tokio::test]
    async fn unknown_team_is_not_found() {
        let state = state().await;
        let response = poem_status(State(state.clone()), Path("Green".into()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = poem_status(State(state), Path("Red".into()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn listings_respond_ok() {
        let state = state().await;
        state
            .engine
            .begin("1", "1", Some("ann"))
            .await
            .unwrap();

        let response = list_participants(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let response = list_blocks(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let response = health(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
