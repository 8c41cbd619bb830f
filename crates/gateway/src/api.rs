//! API endpoints.
//!
//! - `POST /v1/chat/stream` — run a turn, stream `{event, data}` SSE frames
//! - `POST /v1/sessions/cancel` — cooperative turn cancellation
//! - `GET  /v1/sessions` — session listing for the UI
//! - `GET  /healthz` — liveness

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use futures_core::Stream;
use serde::Deserialize;

use tess_engine::{run_turn, TurnDeps, TurnInput};
use tess_sessions::SessionKey;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/chat/stream", post(chat_stream))
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/sessions/cancel", post(cancel_session))
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub session_id: String,
    pub message: String,
    /// Profile tag; defaults to the first configured profile.
    #[serde(default)]
    pub profile: Option<String>,
    /// Prompt-library flow to run instead of free-form planning.
    #[serde(default)]
    pub prompt_name: Option<String>,
    #[serde(default)]
    pub prompt_arguments: serde_json::Map<String, serde_json::Value>,
}

async fn chat_stream(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> axum::response::Response {
    let key = SessionKey::new(&body.user_id, &body.session_id);

    // One turn at a time per session: turn N+1 does not start until
    // turn N reached a terminal state.
    if state.cancel_map.is_running(&key) {
        return (
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "session is busy — a turn is already in progress"
            })),
        )
            .into_response();
    }

    let profile = state.resolve_profile(body.profile.as_deref());
    let caps = match state.capabilities_for(profile) {
        Ok(caps) => caps,
        Err(e) => {
            return (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let deps = TurnDeps {
        caps,
        sessions: state.sessions.clone(),
        cancel_map: state.cancel_map.clone(),
        quota: state.quota.clone(),
    };
    let input = TurnInput {
        key,
        user_query: body.message,
        active_prompt: body.prompt_name.map(|name| tess_engine::ActivePrompt {
            name,
            arguments: body.prompt_arguments,
        }),
        attachments: Vec::new(),
        source: "user".into(),
        is_session_primer: false,
    };

    let mut rx = run_turn(deps, input);
    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        Box::pin(async_stream::stream! {
            while let Some(event) = rx.recv().await {
                let frame = Event::default().event(event.name());
                match frame.json_data(event.payload()) {
                    Ok(frame) => yield Ok(frame),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialise SSE frame");
                    }
                }
            }
        });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions: Vec<serde_json::Value> = state
        .sessions
        .list()
        .into_iter()
        .map(|s| {
            serde_json::json!({
                "user_id": s.user_id,
                "session_id": s.session_id,
                "name": s.name,
                "updated_at": s.updated_at,
                "turns": s.turns.len(),
                "input_tokens": s.input_tokens,
                "output_tokens": s.output_tokens,
                "cost_usd": s.cost_usd,
            })
        })
        .collect();
    Json(serde_json::json!({ "sessions": sessions }))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub user_id: String,
    pub session_id: String,
}

async fn cancel_session(
    State(state): State<AppState>,
    Json(body): Json<CancelRequest>,
) -> impl IntoResponse {
    let key = SessionKey::new(&body.user_id, &body.session_id);
    let found = state.cancel_map.cancel(&key);
    Json(serde_json::json!({ "cancelled": found }))
}
