//! Session endpoints: search, scrub, pcap download, S2S receive
//!
//! Session-scoped requests that touch PCAP bytes must run on the owning
//! node; handlers here proxy transparently when this process is not the
//! owner.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{allowed, Gate};
use crate::cron::forward::{assemble_pcap, unframe};
use crate::expression;
use crate::pcap::scrub::scrub_packet;
use crate::pcap::OpenMode;
use crate::server::error::{success, ApiError};
use crate::server::{maybe_proxy, AppState, Authed};
use crate::store::session::scroll_body;
use crate::store::types::{Session, SESSIONS_INDEX};
use crate::util::now_ms;

// ─────────────────────────────────────────────────────────────────────────────
// Search / get
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub expression: Option<String>,
    /// Seconds since epoch
    #[serde(rename = "startTime")]
    pub start_time: Option<u64>,
    #[serde(rename = "stopTime")]
    pub stop_time: Option<u64>,
    pub length: Option<u64>,
}

/// GET /api/sessions - session search in the caller's time range.
pub async fn search(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>, ApiError> {
    let start = params.start_time.unwrap_or(0);
    let stop = params.stop_time.unwrap_or_else(crate::util::now_secs);
    let lookups = state.db.lookup_tables(&authed.user.user_id).await?;
    let filters = expression::compose_filters(
        (start * 1000, stop * 1000),
        authed.user.expression.as_deref(),
        params.expression.as_deref(),
        &lookups,
    )
    .map_err(|e| ApiError::Validation(format!("Bad expression: {}", e)))?;

    let body = scroll_body(filters, &["*"], params.length.unwrap_or(50).min(1000));
    let result = state
        .db
        .search::<Value>(SESSIONS_INDEX, &body, None)
        .await?;

    let sessions: Vec<Value> = result
        .hits
        .into_iter()
        .map(|d| json!({ "id": d.id, "index": d.index, "source": d.source }))
        .collect();
    Ok(Json(json!({
        "recordsTotal": result.total,
        "recordsFiltered": result.total,
        "data": sessions,
    })))
}

/// GET /api/session/:id - one session document.
pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let doc = state
        .db
        .session_get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", id)))?;
    Ok(Json(json!({ "id": doc.id, "index": doc.index, "source": doc.source })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Scrub / delete
// ─────────────────────────────────────────────────────────────────────────────

/// What a delete request removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhatToRemove {
    Spi,
    Pcap,
    All,
}

impl WhatToRemove {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spi" => Some(WhatToRemove::Spi),
            "pcap" => Some(WhatToRemove::Pcap),
            "all" => Some(WhatToRemove::All),
            _ => None,
        }
    }

    pub fn from_flags(remove_spi: bool, remove_pcap: bool) -> Option<Self> {
        match (remove_spi, remove_pcap) {
            (true, true) => Some(WhatToRemove::All),
            (false, true) => Some(WhatToRemove::Pcap),
            (true, false) => Some(WhatToRemove::Spi),
            (false, false) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WhatToRemove::Spi => "spi",
            WhatToRemove::Pcap => "pcap",
            WhatToRemove::All => "all",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScrubParams {
    #[serde(default, rename = "removeSpi")]
    pub remove_spi: bool,
    #[serde(default, rename = "removePcap")]
    pub remove_pcap: bool,
    /// Comma-separated session ids
    pub ids: String,
}

/// POST /delete - scrub/delete sessions; non-local sessions go through
/// the owner's peer endpoint.
pub async fn scrub_many(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Query(params): Query<ScrubParams>,
) -> Result<Json<Value>, ApiError> {
    if !allowed(&authed.user, Gate::RemoveEnabled) {
        return Err(ApiError::Auth("Remove not enabled".to_string()));
    }
    let what = WhatToRemove::from_flags(params.remove_spi, params.remove_pcap)
        .ok_or_else(|| ApiError::Validation("Nothing to remove".to_string()))?;

    for sid in params.ids.split(',').filter(|s| !s.is_empty()) {
        let doc = state
            .db
            .session_get(sid)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", sid)))?;
        if state.cluster.is_local(&doc.source.node) {
            scrub_local(&state, &authed.user.user_id, &doc.index, sid, &doc.source, what)
                .await?;
        } else {
            let path = format!("/{}/delete/{}/{}", doc.source.node, what.as_str(), sid);
            state
                .cluster
                .peer_get(&doc.source.node, &path, &authed.user.user_id)
                .await
                .map_err(|e| ApiError::Transport(e.to_string()))?;
        }
    }
    Ok(success("Deleted"))
}

/// GET /:node/delete/:what/:sid - the peer scrub endpoint; also serves
/// direct single-session requests and proxies if addressed to a peer.
pub async fn scrub_one(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Path((node, what, sid)): Path<(String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if !allowed(&authed.user, Gate::RemoveEnabled) {
        return Err(ApiError::Auth("Remove not enabled".to_string()));
    }
    let what = WhatToRemove::parse(&what)
        .ok_or_else(|| ApiError::Validation(format!("Bad whatToRemove {:?}", what)))?;

    let path = format!("/{}/delete/{}/{}", node, what.as_str(), sid);
    if let Some(proxied) = maybe_proxy(
        &state,
        &node,
        &method,
        &path,
        &headers,
        Bytes::new(),
        &authed,
    )
    .await?
    {
        return Ok(proxied);
    }

    let doc = state
        .db
        .session_get(&sid)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", sid)))?;
    scrub_local(&state, &authed.user.user_id, &doc.index, &sid, &doc.source, what).await?;
    Ok(StatusCode::OK.into_response())
}

/// Apply the scrub policy on the owning node.
async fn scrub_local(
    state: &AppState,
    user_id: &str,
    index: &str,
    sid: &str,
    session: &Session,
    what: WhatToRemove,
) -> Result<(), ApiError> {
    if matches!(what, WhatToRemove::Pcap | WhatToRemove::All) {
        for (file_num, offset) in session.packet_locations() {
            let handle = state
                .pcap
                .open(OpenMode::Write, &session.node, file_num)
                .await
                .map_err(|e| ApiError::NotFound(e.to_string()))?;
            scrub_packet(&handle, offset, false)
                .map_err(|e| ApiError::Backend(e.to_string()))?;
        }
        state
            .db
            .update_doc(
                index,
                sid,
                &json!({ "scrubby": user_id, "scrubat": now_ms() }),
                true,
            )
            .await?;
    }
    if matches!(what, WhatToRemove::Spi | WhatToRemove::All) {
        state.db.session_delete(index, sid).await?;
    }
    tracing::info!("Scrubbed session {} ({})", sid, what.as_str());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// PCAP download
// ─────────────────────────────────────────────────────────────────────────────

/// GET /:node/pcap/:id - the session's packets as a standalone pcap file,
/// served by the owner.
pub async fn pcap_download(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Path((node, id)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if !allowed(&authed.user, Gate::PcapDownload) {
        return Err(ApiError::Auth("PCAP download not enabled".to_string()));
    }

    let path = format!("/{}/pcap/{}", node, id);
    if let Some(proxied) =
        maybe_proxy(&state, &node, &method, &path, &headers, Bytes::new(), &authed).await?
    {
        return Ok(proxied);
    }

    let sid = id.trim_end_matches(".pcap");
    let doc = state
        .db
        .session_get(sid)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", sid)))?;
    let (blob, _) = assemble_pcap(&state.pcap, &doc.source)
        .await
        .map_err(|e| ApiError::NotFound(e.to_string()))?;

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/vnd.tcpdump.pcap")
        .header(
            "content-disposition",
            format!("attachment; filename={}.pcap", sid),
        )
        .body(Body::from(blob))
        .map_err(|e| ApiError::Backend(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// S2S: receive + sendSessions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ReceiveParams {
    #[serde(rename = "saveId")]
    pub save_id: String,
}

/// POST /api/sessions/receive - accept a forwarded session frame. Peer
/// token auth only; everything else is refused.
pub async fn receive(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Query(params): Query<ReceiveParams>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if authed.via != crate::auth::AuthVia::Peer {
        return Err(ApiError::Auth("S2S endpoint".to_string()));
    }
    // saveId alphabet: node names plus the base36 stamp
    if !params
        .save_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ApiError::Validation("Bad saveId".to_string()));
    }

    let (spi_raw, pcap_blob) =
        unframe(&body).map_err(|e| ApiError::Validation(format!("Bad frame: {}", e)))?;
    let mut session: Session = serde_json::from_slice(&spi_raw)
        .map_err(|e| ApiError::Validation(format!("Bad SPI json: {}", e)))?;

    // Land the pcap blob in a per-saveId file in the first capture dir;
    // frames after the first skip their redundant global header
    let dir = state
        .config
        .pcap_dirs
        .first()
        .ok_or_else(|| ApiError::Backend("No pcap directory configured".to_string()))?;
    let file_path = dir.join(format!("{}.pcap", params.save_id));
    let (shift, existing) = match std::fs::metadata(&file_path) {
        Ok(meta) => (meta.len() as i64 - crate::pcap::GLOBAL_HEADER_LEN as i64, true),
        Err(_) => (0, false),
    };
    let write = if existing {
        use std::io::Write;
        std::fs::OpenOptions::new()
            .append(true)
            .open(&file_path)
            .and_then(|mut f| f.write_all(&pcap_blob[crate::pcap::GLOBAL_HEADER_LEN.min(pcap_blob.len())..]))
    } else {
        std::fs::write(&file_path, &pcap_blob)
    };
    write.map_err(|e| ApiError::Backend(format!("Failed to store pcap: {}", e)))?;

    // Register (or grow) the files-index row and re-home the session
    let file_num = now_ms() as i64;
    let file_size = std::fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);
    let file_id = format!("{}-{}", state.config.node, params.save_id);
    let existing_num = state
        .db
        .get::<crate::store::types::PcapFileRecord>(crate::store::types::FILES_INDEX, &file_id)
        .await?
        .map(|d| d.source.num);
    let num = existing_num.unwrap_or(file_num);
    state
        .db
        .index_doc(
            crate::store::types::FILES_INDEX,
            Some(&file_id),
            &json!({
                "num": num,
                "node": state.config.node,
                "name": file_path.display().to_string(),
                "first": session.first_packet / 1000,
                "filesize": file_size,
                "locked": 0,
            }),
            false,
        )
        .await?;

    session.node = state.config.node.clone();
    session.file_id = vec![num];
    session.packet_pos = session.packet_pos.iter().map(|p| p + shift).collect();

    let day = Utc
        .timestamp_millis_opt(session.first_packet as i64)
        .single()
        .unwrap_or_else(Utc::now);
    let index = format!("sessions2-{}", day.format("%y%m%d"));
    let doc = serde_json::to_value(&session)
        .map_err(|e| ApiError::Backend(e.to_string()))?;
    state.db.index_doc(&index, None, &doc, false).await?;

    Ok(success("Received"))
}

#[derive(Debug, Deserialize)]
pub struct SendSessionsParams {
    pub cluster: String,
}

#[derive(Debug, Deserialize)]
pub struct SendSessionsBody {
    pub ids: Vec<String>,
}

/// POST /:node/sendSessions - forward the listed locally-owned sessions
/// to a remote cluster (issued by the cron node).
pub async fn send_sessions(
    State(state): State<AppState>,
    Extension(authed): Authed,
    Path(node): Path<String>,
    Query(params): Query<SendSessionsParams>,
    Json(body): Json<SendSessionsBody>,
) -> Result<Json<Value>, ApiError> {
    if authed.via != crate::auth::AuthVia::Peer {
        return Err(ApiError::Auth("S2S endpoint".to_string()));
    }
    if !state.cluster.is_local(&node) {
        return Err(ApiError::Validation(format!("Not the owner of {}", node)));
    }
    let cluster = state
        .config
        .remote_clusters
        .get(&params.cluster)
        .ok_or_else(|| {
            ApiError::NotFound(format!("Unknown remote cluster {}", params.cluster))
        })?;
    state
        .crons
        .forward_local_sessions(cluster, body.ids)
        .await;
    Ok(success("Forwarded"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_what_to_remove_parse() {
        assert_eq!(WhatToRemove::parse("spi"), Some(WhatToRemove::Spi));
        assert_eq!(WhatToRemove::parse("pcap"), Some(WhatToRemove::Pcap));
        assert_eq!(WhatToRemove::parse("all"), Some(WhatToRemove::All));
        assert_eq!(WhatToRemove::parse("everything"), None);
    }

    #[test]
    fn test_what_to_remove_from_flags() {
        assert_eq!(
            WhatToRemove::from_flags(true, true),
            Some(WhatToRemove::All)
        );
        assert_eq!(
            WhatToRemove::from_flags(true, false),
            Some(WhatToRemove::Spi)
        );
        assert_eq!(
            WhatToRemove::from_flags(false, true),
            Some(WhatToRemove::Pcap)
        );
        assert_eq!(WhatToRemove::from_flags(false, false), None);
    }
}
