//! Pipeline session endpoints

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};

use forgeline_core::{PipelineState, ProgressEvent, SessionRegistry};

use crate::error::AppError;
use crate::types::{CancelResponse, ConfirmRequest, ConfirmResponse, StartRequest, StartResponse};
use crate::AppState;

/// Build the sessions router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_sessions).post(start_session))
        .route("/:id", get(get_session))
        .route("/:id/events", get(stream_events))
        .route("/:id/confirm", post(confirm))
        .route("/:id/cancel", post(cancel))
}

/// Start a pipeline session; returns as soon as the controller task is spawned
pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<(StatusCode, Json<StartResponse>), AppError> {
    let input = req.into_input()?;
    let handle = state.registry.start(input)?;
    Ok((
        StatusCode::CREATED,
        Json(StartResponse {
            session_id: handle.session_id,
        }),
    ))
}

/// Snapshots of all registered sessions
async fn list_sessions(State(state): State<AppState>) -> Json<Vec<PipelineState>> {
    Json(state.registry.list())
}

/// Point-in-time session state
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PipelineState>, AppError> {
    Ok(Json(state.registry.snapshot(&id)?))
}

/// Progress events as SSE: full replay, then live, ending after the terminal
/// event. `Last-Event-ID` skips events the client already has.
async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let last_seen = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    let stream = event_stream(&state.registry, &id, last_seen)?.map(|event| Ok(to_sse(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub(crate) fn event_stream(
    registry: &SessionRegistry,
    id: &str,
    last_seen: Option<u64>,
) -> Result<impl Stream<Item = ProgressEvent> + Send + 'static, AppError> {
    let subscription = registry.subscribe(id)?;
    Ok(subscription.into_stream_after(last_seen.unwrap_or(0)))
}

fn to_sse(event: &ProgressEvent) -> Event {
    Event::default()
        .id(event.sequence_number.to_string())
        .event(event.event_type.as_str())
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("error"))
}

/// Answer the pending checkpoint. 409 when nothing is waiting.
async fn confirm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<ConfirmResponse>, AppError> {
    let message = req.into_message(&id)?;
    let checkpoint = state.registry.confirm(&id, message)?;
    Ok(Json(ConfirmResponse {
        session_id: id,
        checkpoint,
    }))
}

/// Request cancellation
async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), AppError> {
    state.registry.cancel(&id)?;
    let status = state.registry.snapshot(&id)?.status;
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            session_id: id,
            status,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeline_core::pipeline::EventType;
    use forgeline_core::{ForgelineConfig, Status};
    use serde_json::json;

    /// Real collaborators without an API key: every session fails at intake
    /// with `collaborator_unavailable`, deterministically and offline.
    fn offline_state(root: &std::path::Path) -> AppState {
        let mut config = ForgelineConfig::default();
        config.pipeline.workspace_root = Some(root.to_path_buf());
        config.ai.api_key = None;
        AppState::from_config(&config).expect("state")
    }

    fn start_request(repo: &std::path::Path) -> StartRequest {
        serde_json::from_value(json!({
            "prompt": "Rename UserService to AccountService",
            "mode": "autonomous",
            "repo_path": repo.to_string_lossy(),
        }))
        .expect("request should deserialize")
    }

    async fn started(state: &AppState, repo: &std::path::Path) -> String {
        let (status, Json(resp)) = start_session(State(state.clone()), Json(start_request(repo)))
            .await
            .expect("session should start");
        assert_eq!(status, StatusCode::CREATED);
        resp.session_id
    }

    #[tokio::test]
    async fn start_then_stream_until_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let state = offline_state(dir.path());
        let id = started(&state, dir.path()).await;

        let events: Vec<ProgressEvent> = event_stream(&state.registry, &id, None)
            .expect("stream")
            .collect()
            .await;
        let last = events.last().expect("at least one event");
        assert_eq!(last.event_type, EventType::Failed);
        assert_eq!(last.data.as_ref().unwrap()["kind"], "collaborator_unavailable");
        for (i, e) in events.iter().enumerate() {
            assert_eq!(e.sequence_number, i as u64 + 1);
        }

        let Json(snapshot) = get_session(State(state.clone()), Path(id.clone()))
            .await
            .expect("snapshot");
        assert_eq!(snapshot.status, Status::Failed);

        // Resume skips what the client already saw
        let resumed: Vec<ProgressEvent> = event_stream(&state.registry, &id, Some(1))
            .expect("stream")
            .collect()
            .await;
        assert_eq!(resumed.len(), events.len() - 1);
        assert_eq!(resumed[0].sequence_number, 2);
    }

    #[tokio::test]
    async fn confirm_without_checkpoint_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let state = offline_state(dir.path());
        let id = started(&state, dir.path()).await;
        state.registry.get(&id).unwrap().wait_terminal().await;

        let req: ConfirmRequest = serde_json::from_value(json!({ "action": "approve" })).unwrap();
        let err = confirm(State(state.clone()), Path(id), Json(req))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = offline_state(dir.path());

        let err = get_session(State(state.clone()), Path("nope".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = cancel(State(state.clone()), Path("nope".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert!(event_stream(&state.registry, "nope", None).is_err());
    }

    #[tokio::test]
    async fn list_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let state = offline_state(dir.path());
        let id = started(&state, dir.path()).await;

        let Json(sessions) = list_sessions(State(state.clone())).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, id);

        let (status, Json(resp)) = cancel(State(state.clone()), Path(id.clone()))
            .await
            .expect("cancel accepted");
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(resp.session_id, id);
    }
}
