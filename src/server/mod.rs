//! HTTP front
//!
//! Router construction plus the middleware chain every request passes
//! through: response-time and security headers on the way out, the
//! authentication chain and CSRF check on the way in, and an append-only
//! history row per authenticated request. Handlers hang off the injected
//! contexts carried in [`AppState`].

pub mod error;
pub mod handlers;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

use crate::auth::token::sign_csrf;
use crate::auth::{AuthCtx, AuthOutcome, AuthVia, AuthedUser};
use crate::cluster::ClusterCtx;
use crate::config::Config;
use crate::cron::CronEngine;
use crate::hunt::HuntEngine;
use crate::pcap::PcapStore;
use crate::store::types::{HistoryEntry, HISTORY_INDEX};
use crate::store::Db;
use crate::util::{now_secs, truncate_utf8_safe};

/// Requests are abandoned after this long (hunt RPCs can scan large
/// sessions; everything else finishes far earlier).
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(20 * 60);

/// Largest request body recorded into history
const HISTORY_BODY_CAP: usize = 65_536;

/// Injected contexts shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<Db>,
    pub pcap: Arc<PcapStore>,
    pub cluster: Arc<ClusterCtx>,
    pub auth: Arc<AuthCtx>,
    pub hunts: Arc<HuntEngine>,
    pub crons: Arc<CronEngine>,
    /// Serializes shortcut existence-check + create
    pub lookup_mutex: Arc<tokio::sync::Mutex<()>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Sessions
        .route("/api/sessions", get(handlers::sessions::search))
        .route("/api/session/:id", get(handlers::sessions::get_one))
        .route("/delete", post(handlers::sessions::scrub_many))
        .route(
            "/:node/delete/:what/:sid",
            get(handlers::sessions::scrub_one),
        )
        .route("/:node/pcap/:id", get(handlers::sessions::pcap_download))
        .route("/api/sessions/receive", post(handlers::sessions::receive))
        .route("/:node/sendSessions", post(handlers::sessions::send_sessions))
        // Hunts
        .route("/api/hunts", get(handlers::hunts::list))
        .route("/api/hunt", post(handlers::hunts::create))
        .route("/api/hunt/:id", delete(handlers::hunts::remove))
        .route("/api/hunt/:id/pause", put(handlers::hunts::pause))
        .route("/api/hunt/:id/play", put(handlers::hunts::play))
        .route(
            "/:node/hunt/:huntId/remote/:sessionId",
            get(handlers::hunts::remote_search),
        )
        // Cron queries
        .route("/user/cron", get(handlers::crons::list))
        .route("/user/cron/create", post(handlers::crons::create))
        .route("/user/cron/update", post(handlers::crons::update))
        .route("/user/cron/delete", post(handlers::crons::remove))
        // Stats / files / lookups / history
        .route("/api/stats", get(handlers::misc::stats))
        .route("/api/files", get(handlers::misc::files))
        .route("/api/lookups", get(handlers::misc::lookups))
        .route("/api/lookup", post(handlers::misc::lookup_create))
        .route("/api/lookup/:id", delete(handlers::misc::lookup_delete))
        .route("/api/history", get(handlers::misc::history))
        .route("/api/esadmin/tasks", get(handlers::misc::esadmin_tasks))
        .route(
            "/api/esadmin/task/:id/cancel",
            post(handlers::misc::esadmin_cancel_task),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            response_meta_middleware,
        ))
        .with_state(state)
}

/// Bind and serve until the shutdown signal fires.
pub async fn serve(
    state: AppState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let bind_addr = state.config.bind_addr;
    let app = build_router(state);

    tracing::info!("Starting viewer on {}", bind_addr);
    let listener = TcpListener::bind(bind_addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("Server error")?;

    tracing::info!("Viewer shut down gracefully");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Outer middleware: timing + security headers
// ─────────────────────────────────────────────────────────────────────────────

async fn response_meta_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let mut response = match tokio::time::timeout(REQUEST_DEADLINE, next.run(req)).await {
        Ok(response) => response,
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "success": false, "text": "Request deadline exceeded" })),
        )
            .into_response(),
    };

    let headers = response.headers_mut();
    let elapsed_ms = start.elapsed().as_millis().to_string();
    if let Ok(value) = HeaderValue::from_str(&elapsed_ms) {
        headers.insert("x-moloch-response-time", value);
    }

    // Frame policy: deny / sameorigin pass through, anything else is an
    // allowed origin
    match state.config.iframe.as_str() {
        "deny" => {
            headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
        }
        "sameorigin" => {
            headers.insert("x-frame-options", HeaderValue::from_static("SAMEORIGIN"));
        }
        origin => {
            if let Ok(value) = HeaderValue::from_str(&format!("ALLOW-FROM {}", origin)) {
                headers.insert("x-frame-options", value);
            }
        }
    }
    if state.config.hsts_header && state.config.is_https() {
        headers.insert(
            "strict-transport-security",
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
    response
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth middleware: chain, CSRF, history
// ─────────────────────────────────────────────────────────────────────────────

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::DELETE | Method::PATCH
    )
}

/// Blank any JSON field whose key mentions a password before it lands in
/// the history index.
fn scrub_passwords(value: &mut serde_json::Value) {
    if let Some(obj) = value.as_object_mut() {
        for (key, v) in obj.iter_mut() {
            if key.to_ascii_lowercase().contains("password") {
                *v = json!("********");
            } else {
                scrub_passwords(v);
            }
        }
    } else if let Some(arr) = value.as_array_mut() {
        for v in arr {
            scrub_passwords(v);
        }
    }
}

async fn auth_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(String::from);

    let authed = match state
        .auth
        .authenticate(&method, &path_and_query, req.headers())
        .await
    {
        AuthOutcome::Ok(authed) => *authed,
        AuthOutcome::Challenge(challenge) => {
            let mut response = (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "success": false, "text": "Authentication required" })),
            )
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                response.headers_mut().insert("www-authenticate", value);
            }
            return response;
        }
        AuthOutcome::Denied(text) => {
            return (
                StatusCode::FORBIDDEN,
                Json(json!({ "success": false, "text": text })),
            )
                .into_response();
        }
    };

    // CSRF: browser-originated mutations must echo the cookie token
    if is_mutating(&method) && authed.via != AuthVia::Peer && !state.auth.anonymous_mode() {
        let token = req
            .headers()
            .get("x-moloch-cookie")
            .and_then(|v| v.to_str().ok());
        let valid = token.is_some_and(|t| {
            crate::auth::token::verify_csrf(
                &state.auth.csrf_crypto,
                t,
                &authed.user.user_id,
                crate::util::now_ms(),
            )
            .is_ok()
        });
        if !valid {
            return (
                StatusCode::FORBIDDEN,
                Json(json!({ "success": false, "text": "Missing or invalid cookie token" })),
            )
                .into_response();
        }
    }

    // Buffer a bounded copy of mutating bodies for the history row
    let (mut parts, body) = req.into_parts();
    let (body, history_body) = if is_mutating(&method) {
        match axum::body::to_bytes(body, HISTORY_BODY_CAP).await {
            Ok(bytes) => {
                let mut parsed = serde_json::from_slice::<serde_json::Value>(&bytes).ok();
                if let Some(v) = parsed.as_mut() {
                    scrub_passwords(v);
                }
                (Body::from(bytes), parsed)
            }
            // Oversized or unreadable bodies pass through unrecorded
            Err(_) => (Body::empty(), None),
        }
    } else {
        (body, None)
    };

    parts.extensions.insert(authed.clone());
    let req = Request::from_parts(parts, body);

    let start = Instant::now();
    let mut response = next.run(req).await;

    // History row for every authenticated non-S2S request
    if authed.via != AuthVia::Peer {
        let entry = HistoryEntry {
            timestamp: now_secs(),
            user_id: authed.user.user_id.clone(),
            api: path,
            query: query.map(|q| truncate_utf8_safe(&q, 2048).to_string()),
            body: history_body,
            query_time: start.elapsed().as_millis() as u64,
            view: None,
            range: None,
            records_returned: None,
            records_filtered: None,
            records_total: None,
        };
        let db = state.db.clone();
        tokio::spawn(async move {
            if let Ok(body) = serde_json::to_value(&entry) {
                if let Err(e) = db.index_doc(HISTORY_INDEX, None, &body, false).await {
                    tracing::debug!("History append failed: {}", e);
                }
            }
        });
    }

    // The CSRF cookie rides UI-state GETs
    if method == Method::GET && authed.via != AuthVia::Peer {
        if let Ok(token) = sign_csrf(&state.auth.csrf_crypto, &authed.user.user_id) {
            let secure = if state.config.is_https() { "; Secure" } else { "" };
            let cookie = format!("MOLOCH-COOKIE={}; Path=/; HttpOnly{}", token, secure);
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
        }
    }

    response
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared handler helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Proxy a request for a node this process does not own. Returns None when
/// the node is local and the caller should handle it.
pub async fn maybe_proxy(
    state: &AppState,
    node: &str,
    method: &Method,
    path_and_query: &str,
    headers: &axum::http::HeaderMap,
    body: bytes::Bytes,
    user: &AuthedUser,
) -> Result<Option<Response>, error::ApiError> {
    if state.cluster.is_local(node) {
        return Ok(None);
    }
    let response = state
        .cluster
        .forward(method, node, path_and_query, headers, body, &user.user.user_id)
        .await
        .map_err(|e| error::ApiError::Transport(e.to_string()))?;
    Ok(Some(response))
}

/// Extension extractor shorthand used by handlers.
pub type Authed = Extension<AuthedUser>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_passwords_recurses() {
        let mut body = json!({
            "name": "x",
            "currentPassword": "hunter2",
            "nested": { "newPassword": "hunter3", "keep": 1 },
            "list": [ { "password": "hunter4" } ]
        });
        scrub_passwords(&mut body);
        assert_eq!(body["currentPassword"], "********");
        assert_eq!(body["nested"]["newPassword"], "********");
        assert_eq!(body["nested"]["keep"], 1);
        assert_eq!(body["list"][0]["password"], "********");
        assert_eq!(body["name"], "x");
    }

    #[test]
    fn test_is_mutating() {
        assert!(is_mutating(&Method::POST));
        assert!(is_mutating(&Method::PUT));
        assert!(is_mutating(&Method::DELETE));
        assert!(!is_mutating(&Method::GET));
        assert!(!is_mutating(&Method::HEAD));
    }
}
