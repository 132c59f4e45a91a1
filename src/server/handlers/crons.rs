//! Cron-query endpoints
//!
//! Straight index CRUD over `queries`, except that every mutation kicks
//! the cron engine so a new or re-enabled query gets a turn immediately
//! instead of waiting out the tick.

use axum::extract::State;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::server::error::{success, ApiError};
use crate::server::{AppState, Authed};
use crate::store::types::{CronAction, CronQuery, QUERIES_INDEX};
use crate::util::now_secs;

/// GET /user/cron - the caller's queries (admins see all).
pub async fn list(
    State(state): State<AppState>,
    Extension(authed): Authed,
) -> Result<Json<Value>, ApiError> {
    let query = if authed.user.create_enabled {
        json!({ "query": { "match_all": {} }, "size": 1000 })
    } else {
        json!({ "query": { "term": { "creator": authed.user.user_id } }, "size": 1000 })
    };
    let result = state.db.search::<CronQuery>(QUERIES_INDEX, &query, None).await?;
    let queries: Vec<Value> = result
        .hits
        .into_iter()
        .map(|d| json!({ "key": d.id, "query": d.source }))
        .collect();
    Ok(Json(json!({ "recordsTotal": result.total, "data": queries })))
}

#[derive(Debug, Deserialize)]
struct CreateCronRequest {
    name: String,
    query: String,
    action: String,
    #[serde(default)]
    tags: String,
    #[serde(default)]
    notifier: Option<String>,
    /// Low-watermark start, seconds since epoch; defaults to now (only
    /// new sessions match)
    #[serde(default)]
    since: Option<u64>,
}

/// POST /user/cron/create
pub async fn create(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Json(raw): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let req: CreateCronRequest = serde_json::from_value(raw)
        .map_err(|e| ApiError::Validation(format!("Missing cron field: {}", e)))?;
    if req.name.is_empty() {
        return Err(ApiError::Validation("Cron query needs a name".to_string()));
    }
    let action = CronAction::parse(&req.action)
        .ok_or_else(|| ApiError::Validation(format!("Bad action {:?}", req.action)))?;
    if let CronAction::Forward(cluster) = &action {
        if !state.config.remote_clusters.contains_key(cluster) {
            return Err(ApiError::Validation(format!(
                "Unknown remote cluster {}",
                cluster
            )));
        }
    }
    if matches!(action, CronAction::Tag) && crate::util::sanitize_tags(&req.tags).is_empty() {
        return Err(ApiError::Validation("Tag action needs tags".to_string()));
    }
    // A query that cannot compile would just burn ticks
    crate::expression::compile(&req.query, &Default::default())
        .map_err(|e| ApiError::Validation(format!("Bad query: {}", e)))?;

    let doc = json!({
        "creator": authed.user.user_id,
        "enabled": true,
        "name": req.name,
        "query": req.query,
        "tags": req.tags,
        "action": req.action,
        "notifier": req.notifier,
        "lpValue": req.since.unwrap_or_else(now_secs),
        "lastRun": 0,
        "count": 0,
        "lastNotified": 0,
        "lastNotifiedCount": 0,
    });
    let id = state.db.index_doc(QUERIES_INDEX, None, &doc, true).await?;
    state.crons.wake();
    tracing::info!("Cron query {} created by {}", id, authed.user.user_id);
    Ok(Json(json!({ "success": true, "text": "Created", "key": id })))
}

#[derive(Debug, Deserialize)]
struct UpdateCronRequest {
    key: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    tags: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    notifier: Option<String>,
}

async fn owned_cron(
    state: &AppState,
    authed: &crate::auth::AuthedUser,
    key: &str,
) -> Result<crate::store::Doc<CronQuery>, ApiError> {
    let doc = state
        .db
        .get::<CronQuery>(QUERIES_INDEX, key)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Cron query {} not found", key)))?;
    if doc.source.creator != authed.user.user_id && !authed.user.create_enabled {
        return Err(ApiError::Auth("Not your cron query".to_string()));
    }
    Ok(doc)
}

/// POST /user/cron/update
pub async fn update(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Json(raw): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let req: UpdateCronRequest = serde_json::from_value(raw)
        .map_err(|e| ApiError::Validation(format!("Missing cron field: {}", e)))?;
    let doc = owned_cron(&state, &authed, &req.key).await?;

    if let Some(action) = &req.action {
        CronAction::parse(action)
            .ok_or_else(|| ApiError::Validation(format!("Bad action {:?}", action)))?;
    }
    if let Some(query) = &req.query {
        crate::expression::compile(query, &Default::default())
            .map_err(|e| ApiError::Validation(format!("Bad query: {}", e)))?;
    }

    let mut partial = serde_json::Map::new();
    if let Some(v) = req.name {
        partial.insert("name".to_string(), json!(v));
    }
    if let Some(v) = req.query {
        partial.insert("query".to_string(), json!(v));
    }
    if let Some(v) = req.action {
        partial.insert("action".to_string(), json!(v));
    }
    if let Some(v) = req.tags {
        partial.insert("tags".to_string(), json!(v));
    }
    if let Some(v) = req.enabled {
        partial.insert("enabled".to_string(), json!(v));
    }
    if let Some(v) = req.notifier {
        partial.insert("notifier".to_string(), json!(v));
    }
    if partial.is_empty() {
        return Err(ApiError::Validation("Nothing to update".to_string()));
    }
    state
        .db
        .update_doc(&doc.index, &req.key, &Value::Object(partial), true)
        .await?;
    state.crons.wake();
    Ok(success("Updated"))
}

#[derive(Debug, Deserialize)]
struct DeleteCronRequest {
    key: String,
}

/// POST /user/cron/delete
pub async fn remove(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Json(raw): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let req: DeleteCronRequest = serde_json::from_value(raw)
        .map_err(|e| ApiError::Validation(format!("Missing cron field: {}", e)))?;
    let doc = owned_cron(&state, &authed, &req.key).await?;
    state.db.delete_doc(&doc.index, &req.key, true).await?;
    state.crons.wake();
    Ok(success("Deleted"))
}
