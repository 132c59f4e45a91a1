//! Stats, files, shortcut and history listings

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{allowed, es_admin_allowed, Gate};
use crate::server::error::{success, ApiError};
use crate::server::{AppState, Authed};
use crate::store::types::{
    Lookup, NodeInfo, PcapFileRecord, FILES_INDEX, HISTORY_INDEX, LOOKUPS_INDEX, NODES_INDEX,
};

/// GET /api/stats - fleet node listing (gated by hideStats).
pub async fn stats(
    State(state): State<AppState>,
    Extension(authed): Authed,
) -> Result<Json<Value>, ApiError> {
    if !allowed(&authed.user, Gate::StatsVisible) {
        return Err(ApiError::Auth("Stats hidden".to_string()));
    }
    let result = state
        .db
        .search::<NodeInfo>(
            NODES_INDEX,
            &json!({ "query": { "match_all": {} }, "size": 1000 }),
            None,
        )
        .await?;
    let nodes: Vec<Value> = result
        .hits
        .into_iter()
        .map(|d| json!({ "id": d.id, "node": d.source }))
        .collect();
    Ok(Json(json!({ "recordsTotal": result.total, "data": nodes })))
}

#[derive(Debug, Deserialize)]
pub struct FilesParams {
    pub length: Option<u64>,
    pub start: Option<u64>,
}

/// GET /api/files - pcap file listing (gated by hideFiles).
pub async fn files(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Query(params): Query<FilesParams>,
) -> Result<Json<Value>, ApiError> {
    if !allowed(&authed.user, Gate::FilesVisible) {
        return Err(ApiError::Auth("Files hidden".to_string()));
    }
    let result = state
        .db
        .search::<PcapFileRecord>(
            FILES_INDEX,
            &json!({
                "query": { "match_all": {} },
                "sort": [ { "first": { "order": "desc" } } ],
                "from": params.start.unwrap_or(0),
                "size": params.length.unwrap_or(100).min(1000),
            }),
            None,
        )
        .await?;
    let files: Vec<Value> = result
        .hits
        .into_iter()
        .map(|d| json!({ "id": d.id, "file": d.source }))
        .collect();
    Ok(Json(json!({ "recordsTotal": result.total, "data": files })))
}

/// GET /api/lookups - shortcuts visible to the caller.
pub async fn lookups(
    State(state): State<AppState>,
    Extension(authed): Authed,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .db
        .search::<Lookup>(
            LOOKUPS_INDEX,
            &json!({
                "query": { "bool": { "should": [
                    { "term": { "userId": authed.user.user_id } },
                    { "term": { "shared": true } }
                ], "minimum_should_match": 1 } },
                "size": 1000,
            }),
            None,
        )
        .await?;
    let lookups: Vec<Value> = result
        .hits
        .into_iter()
        .map(|d| json!({ "id": d.id, "lookup": d.source }))
        .collect();
    Ok(Json(json!({ "recordsTotal": result.total, "data": lookups })))
}

#[derive(Debug, Deserialize)]
struct CreateLookupRequest {
    name: String,
    #[serde(default)]
    values: Vec<String>,
    #[serde(default)]
    shared: bool,
}

/// POST /api/lookup - create a shortcut. The existence check and the
/// create run under the lookup mutex so two callers cannot race the same
/// name into the index.
pub async fn lookup_create(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Json(raw): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let req: CreateLookupRequest = serde_json::from_value(raw)
        .map_err(|e| ApiError::Validation(format!("Missing lookup field: {}", e)))?;
    if req.name.is_empty() || !req.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(ApiError::Validation(
            "Shortcut names are alphanumeric with dashes".to_string(),
        ));
    }

    let _guard = state.lookup_mutex.lock().await;
    let existing = state
        .db
        .search::<Lookup>(
            LOOKUPS_INDEX,
            &json!({ "query": { "term": { "name": req.name } }, "size": 1 }),
            None,
        )
        .await?;
    if existing.total > 0 {
        return Err(ApiError::Validation(format!(
            "Shortcut {} already exists",
            req.name
        )));
    }
    let doc = json!({
        "name": req.name,
        "userId": authed.user.user_id,
        "values": req.values,
        "shared": req.shared,
    });
    let id = state.db.index_doc(LOOKUPS_INDEX, None, &doc, true).await?;
    Ok(Json(json!({ "success": true, "text": "Created", "id": id })))
}

/// DELETE /api/lookup/:id
pub async fn lookup_delete(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let doc = state
        .db
        .get::<Lookup>(LOOKUPS_INDEX, &id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Shortcut {} not found", id)))?;
    if doc.source.user_id != authed.user.user_id && !authed.user.create_enabled {
        return Err(ApiError::Auth("Not your shortcut".to_string()));
    }
    state.db.delete_doc(&doc.index, &id, true).await?;
    Ok(success("Deleted"))
}

/// GET /api/esadmin/tasks - running cluster tasks.
pub async fn esadmin_tasks(
    State(state): State<AppState>,
    Extension(authed): Authed,
) -> Result<Json<Value>, ApiError> {
    if !es_admin_allowed(&state.config, &authed.user) {
        return Err(ApiError::Auth("Not an ES admin".to_string()));
    }
    let tasks = state.db.admin_get("_tasks?detailed=false").await?;
    Ok(Json(tasks))
}

/// POST /api/esadmin/task/:id/cancel
pub async fn esadmin_cancel_task(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !es_admin_allowed(&state.config, &authed.user) {
        return Err(ApiError::Auth("Not an ES admin".to_string()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '-' || c == '_')
    {
        return Err(ApiError::Validation("Bad task id".to_string()));
    }
    state
        .db
        .admin_post(&format!("_tasks/{}/_cancel", id))
        .await?;
    Ok(success("Cancel requested"))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub length: Option<u64>,
}

/// GET /api/history - recent request history (admins see everyone's).
pub async fn history(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>, ApiError> {
    let query = if authed.user.create_enabled {
        json!({ "match_all": {} })
    } else {
        json!({ "term": { "userId": authed.user.user_id } })
    };
    let result = state
        .db
        .search::<Value>(
            HISTORY_INDEX,
            &json!({
                "query": query,
                "sort": [ { "timestamp": { "order": "desc" } } ],
                "size": params.length.unwrap_or(100).min(1000),
            }),
            None,
        )
        .await?;
    Ok(Json(json!({
        "recordsTotal": result.total,
        "data": result.hits.into_iter().map(|d| d.source).collect::<Vec<_>>(),
    })))
}
