//! Hunt endpoints
//!
//! Creation validates the job and estimates its session count against the
//! per-user limits before queueing; the engine picks queued hunts up on
//! its next wake. Pause/play work by writing the status the engine
//! observes at its checkpoint interval. The remote endpoint is the
//! per-session RPC peers call during a scan.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{allowed, Gate};
use crate::expression;
use crate::server::error::{success, ApiError};
use crate::server::{maybe_proxy, AppState, Authed};
use crate::store::types::{
    Hunt, HuntQuery, HuntStatus, HuntType, SearchType, HUNTS_INDEX, SESSIONS_INDEX,
};
use crate::util::now_secs;

// ─────────────────────────────────────────────────────────────────────────────
// List
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/hunts - all hunts, newest first. Hunts the caller may not see
/// come back redacted.
pub async fn list(
    State(state): State<AppState>,
    Extension(authed): Authed,
) -> Result<Json<Value>, ApiError> {
    if !allowed(&authed.user, Gate::PacketSearch) {
        return Err(ApiError::Auth("Packet search not enabled".to_string()));
    }
    let result = state
        .db
        .search::<Hunt>(
            HUNTS_INDEX,
            &json!({
                "query": { "match_all": {} },
                "sort": [ { "created": { "order": "desc" } } ],
                "size": 1000,
            }),
            None,
        )
        .await?;

    let hunts: Vec<Value> = result
        .hits
        .into_iter()
        .map(|doc| {
            if doc.source.visible_to(&authed.user) {
                json!({ "id": doc.id, "hunt": doc.source })
            } else {
                // Non-authorized listers see ownership and search
                // parameters blanked, including the id
                json!({ "id": "", "hunt": doc.source.redacted() })
            }
        })
        .collect();
    Ok(Json(json!({ "recordsTotal": result.total, "data": hunts })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Create
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateHuntRequest {
    name: String,
    size: u64,
    search: String,
    #[serde(rename = "searchType")]
    search_type: SearchType,
    #[serde(rename = "type")]
    hunt_type: HuntType,
    src: bool,
    dst: bool,
    query: HuntQuery,
    #[serde(default)]
    users: Vec<String>,
    #[serde(default)]
    notifier: Option<String>,
}

/// POST /api/hunt - queue a new hunt.
pub async fn create(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Json(raw): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    if !allowed(&authed.user, Gate::PacketSearch) {
        return Err(ApiError::Auth("Packet search not enabled".to_string()));
    }
    let req: CreateHuntRequest = serde_json::from_value(raw)
        .map_err(|e| ApiError::Validation(format!("Missing hunt field: {}", e)))?;
    if req.name.is_empty() || req.search.is_empty() {
        return Err(ApiError::Validation("Hunt needs a name and a search".to_string()));
    }
    if req.size == 0 {
        return Err(ApiError::Validation("Hunt size must be positive".to_string()));
    }
    if req.query.stop_time <= req.query.start_time {
        return Err(ApiError::Validation("stopTime must be after startTime".to_string()));
    }
    // Reject patterns that would latch the hunt unrunnable at start
    crate::hunt::search::compile_pattern(req.search_type, &req.search)
        .map_err(|e| ApiError::Validation(format!("Bad search pattern: {}", e)))?;

    // Estimate the scan size against the caller's limit
    let lookups = state.db.lookup_tables(&authed.user.user_id).await?;
    let filters = expression::compose_filters(
        (req.query.start_time * 1000, req.query.stop_time * 1000),
        authed.user.expression.as_deref(),
        req.query.expression.as_deref(),
        &lookups,
    )
    .map_err(|e| ApiError::Validation(format!("Bad query: {}", e)))?;
    let count = state
        .db
        .search::<Value>(
            SESSIONS_INDEX,
            &json!({ "query": { "bool": { "filter": filters } }, "size": 0 }),
            None,
        )
        .await?
        .total;

    let limit = if authed.user.create_enabled {
        state.config.hunt_admin_limit
    } else {
        state.config.hunt_limit
    };
    if count > limit {
        return Err(ApiError::Validation(format!(
            "Hunt would scan {} sessions, over the {} limit",
            count, limit
        )));
    }

    let hunt = json!({
        "name": req.name,
        "userId": authed.user.user_id,
        "users": req.users,
        "status": HuntStatus::Queued,
        "query": req.query,
        "src": req.src,
        "dst": req.dst,
        "type": req.hunt_type,
        "searchType": req.search_type,
        "search": req.search,
        "size": req.size,
        "notifier": req.notifier,
        "totalSessions": count,
        "searchedSessions": 0,
        "matchedSessions": 0,
        "created": now_secs(),
        "lastUpdated": now_secs(),
    });
    let id = state.db.index_doc(HUNTS_INDEX, None, &hunt, true).await?;
    state.hunts.wake();
    tracing::info!("Hunt {} queued by {} ({} sessions)", id, authed.user.user_id, count);

    let mut response = json!({ "success": true, "text": "Hunt queued", "id": id });
    if count > state.config.hunt_warn {
        response["warning"] = json!(format!(
            "Hunt will scan {} sessions; this can take a while",
            count
        ));
    }
    Ok(Json(response))
}

// ─────────────────────────────────────────────────────────────────────────────
// Delete / pause / play
// ─────────────────────────────────────────────────────────────────────────────

async fn owned_hunt(
    state: &AppState,
    authed: &crate::auth::AuthedUser,
    id: &str,
) -> Result<crate::store::Doc<Hunt>, ApiError> {
    let doc = state
        .db
        .get::<Hunt>(HUNTS_INDEX, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Hunt {} not found", id)))?;
    if !doc.source.visible_to(&authed.user) {
        return Err(ApiError::Auth("Not your hunt".to_string()));
    }
    Ok(doc)
}

/// DELETE /api/hunt/:id
pub async fn remove(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !allowed(&authed.user, Gate::PacketSearch) {
        return Err(ApiError::Auth("Packet search not enabled".to_string()));
    }
    let doc = owned_hunt(&state, &authed, &id).await?;
    state.db.delete_doc(&doc.index, &id, true).await?;
    Ok(success("Hunt deleted"))
}

/// PUT /api/hunt/:id/pause - the engine observes the status flip at its
/// next checkpoint and aborts the scroll.
pub async fn pause(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !allowed(&authed.user, Gate::PacketSearch) {
        return Err(ApiError::Auth("Packet search not enabled".to_string()));
    }
    let doc = owned_hunt(&state, &authed, &id).await?;
    match doc.source.status {
        HuntStatus::Queued | HuntStatus::Running => {
            state
                .db
                .update_doc(&doc.index, &id, &json!({ "status": "paused" }), true)
                .await?;
            Ok(success("Hunt paused"))
        }
        HuntStatus::Paused => Ok(success("Hunt already paused")),
        HuntStatus::Finished => Err(ApiError::Validation("Hunt already finished".to_string())),
    }
}

/// PUT /api/hunt/:id/play - replay a paused hunt; it resumes from its
/// persisted lastPacketTime.
pub async fn play(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !allowed(&authed.user, Gate::PacketSearch) {
        return Err(ApiError::Auth("Packet search not enabled".to_string()));
    }
    let doc = owned_hunt(&state, &authed, &id).await?;
    if doc.source.unrunnable {
        return Err(ApiError::Validation(
            "Hunt is unrunnable; fix the search and create a new one".to_string(),
        ));
    }
    match doc.source.status {
        HuntStatus::Paused => {
            state
                .db
                .update_doc(&doc.index, &id, &json!({ "status": "queued" }), true)
                .await?;
            state.hunts.wake();
            Ok(success("Hunt queued"))
        }
        _ => Err(ApiError::Validation("Hunt is not paused".to_string())),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Peer RPC
// ─────────────────────────────────────────────────────────────────────────────

/// GET /:node/hunt/:huntId/remote/:sessionId - run the packet search for
/// one session on its owning node. The response body always carries
/// `{matched}`; failures travel in `error`, not in the status code, so
/// the caller can distinguish transport loss from search problems.
pub async fn remote_search(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Path((node, hunt_id, session_id)): Path<(String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if !allowed(&authed.user, Gate::PacketSearch) {
        return Err(ApiError::Auth("Packet search not enabled".to_string()));
    }

    let path = format!("/{}/hunt/{}/remote/{}", node, hunt_id, session_id);
    if let Some(proxied) =
        maybe_proxy(&state, &node, &method, &path, &headers, Bytes::new(), &authed).await?
    {
        return Ok(proxied);
    }

    let answer = |body: Value| -> Result<Response, ApiError> {
        Ok(Json(body).into_response())
    };

    let hunt = match state.db.get::<Hunt>(HUNTS_INDEX, &hunt_id).await? {
        Some(doc) => doc.source,
        None => return answer(json!({ "matched": false, "error": "Unknown hunt" })),
    };
    let session = match state.db.session_get(&session_id).await {
        Ok(Some(doc)) => doc.source,
        Ok(None) => {
            return answer(json!({ "matched": false, "error": "Unknown session" }));
        }
        Err(e) => return answer(json!({ "matched": false, "error": e.to_string() })),
    };
    if !state.cluster.is_local(&session.node) {
        return answer(json!({ "matched": false, "error": "Session not owned here" }));
    }

    match state.hunts.packet_search(&hunt, &session).await {
        Ok(matched) => answer(json!({ "matched": matched })),
        Err(e) => answer(json!({ "matched": false, "error": e.to_string() })),
    }
}
