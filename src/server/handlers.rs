use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::auth::AppState;
use crate::auth::PushDecision;
use crate::provisioning::TickOutcome;

#[derive(Debug, Default, Deserialize)]
pub struct ViewerQuery {
    /// Viewer key, npub or hex; absent for anonymous requests
    pub viewer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PushCheckRequest {
    /// Pushing key, npub or hex
    pub user: String,
    /// Branch name or `refs/heads/...`
    pub branch: String,
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "repository not found" }))).into_response()
}

pub async fn serve_root() -> impl IntoResponse {
    Json(json!({
        "name": "forgestr",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Maintainer set of a repository the viewer may see.
/// Private and unknown repositories are indistinguishable.
pub async fn repo_info(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    Query(query): Query<ViewerQuery>,
) -> Response {
    if !state.maintainers.can_view(query.viewer.as_deref(), &owner, &repo).await {
        return not_found();
    }

    match state.maintainers.maintainers(&owner, &repo).await {
        Ok(set) => Json(set).into_response(),
        Err(e) => {
            debug!("Resolving {}/{} failed after view check: {}", owner, repo, e);
            not_found()
        }
    }
}

pub async fn repo_protection(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    Query(query): Query<ViewerQuery>,
) -> Response {
    if !state.maintainers.can_view(query.viewer.as_deref(), &owner, &repo).await {
        return not_found();
    }
    let set = match state.maintainers.maintainers(&owner, &repo).await {
        Ok(set) => set,
        Err(_) => return not_found(),
    };

    match state.protection.rules(&set.owner, &repo).await {
        Ok(rules) => Json(json!({ "owner": set.owner, "rules": rules })).into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Would a push by `user` to `branch` be accepted. Fails closed.
pub async fn push_check(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    Json(request): Json<PushCheckRequest>,
) -> Json<PushDecision> {
    let set = match state.maintainers.maintainers(&owner, &repo).await {
        Ok(set) if set.has_announcement => set,
        Ok(_) => return Json(PushDecision::deny("repository not found")),
        Err(e) => return Json(PushDecision::deny(format!("could not resolve maintainers: {}", e))),
    };

    let is_maintainer = forgestr_relay::normalize_key(&request.user)
        .is_ok_and(|user| set.contains(&user));

    let decision = state
        .protection
        .can_push(&request.user, &set.owner, &repo, &request.branch, is_maintainer)
        .await;
    Json(decision)
}

pub async fn invalidate(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
) -> impl IntoResponse {
    let invalidated = state.maintainers.invalidate(&owner, &repo);
    Json(json!({ "invalidated": invalidated }))
}

pub async fn list_attestations(State(state): State<AppState>) -> impl IntoResponse {
    let pending = state
        .scheduler
        .as_ref()
        .map(|s| s.pending_attestations())
        .unwrap_or_default();
    Json(json!({ "pending": pending }))
}

pub async fn run_tick(State(state): State<AppState>) -> Response {
    let Some(scheduler) = &state.scheduler else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "provisioning not configured" })),
        )
            .into_response();
    };

    match scheduler.tick().await {
        TickOutcome::Completed(report) => Json(json!({ "report": report })).into_response(),
        TickOutcome::Skipped => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "a tick is already running" })),
        )
            .into_response(),
    }
}
