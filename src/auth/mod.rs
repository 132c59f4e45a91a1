//! Request authentication and authorization
//!
//! The authentication chain runs in a fixed order, first match wins:
//! 1. Peer token header (`x-moloch-auth`) - trusted node-to-node requests
//! 2. Username header from a fronting reverse proxy (optionally requiring
//!    a second header, optionally auto-creating the user from a template)
//! 3. HTTP digest auth against the stored HA1
//! 4. Anonymous mode (regression tests / no password secret configured)
//!
//! S2S-only endpoints additionally require that the peer-token branch was
//! the one that matched.

pub mod digest;
pub mod token;

use anyhow::Result;
use axum::http::{HeaderMap, Method};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::store::types::{User, USERS_INDEX};
use crate::store::Db;
use crate::util::now_ms;
use token::TokenCrypto;

/// Cached users go stale after this long; mutations invalidate eagerly.
const USER_CACHE_TTL: Duration = Duration::from_secs(60);

/// How a request was authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVia {
    Peer,
    Header,
    Digest,
    Anonymous,
}

/// The authenticated principal attached to a request
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user: User,
    pub via: AuthVia,
}

/// Result of running the auth chain
pub enum AuthOutcome {
    Ok(Box<AuthedUser>),
    /// 401 with this WWW-Authenticate value
    Challenge(String),
    /// 403 with this message
    Denied(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Permission gates
// ─────────────────────────────────────────────────────────────────────────────

/// Per-endpoint-class permission requirements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// User management endpoints
    CreateEnabled,
    /// Stats listings (inverse of hideStats)
    StatsVisible,
    /// File listings (inverse of hideFiles)
    FilesVisible,
    /// PCAP download (inverse of disablePcapDownload)
    PcapDownload,
    /// Session delete/scrub
    RemoveEnabled,
    /// Hunt endpoints
    PacketSearch,
}

/// Check a gate against a user's permission flags.
pub fn allowed(user: &User, gate: Gate) -> bool {
    match gate {
        Gate::CreateEnabled => user.create_enabled,
        Gate::StatsVisible => !user.hide_stats,
        Gate::FilesVisible => !user.hide_files,
        Gate::PcapDownload => !user.disable_pcap_download,
        Gate::RemoveEnabled => user.remove_enabled,
        Gate::PacketSearch => user.packet_search,
    }
}

/// ES admin endpoints take an explicit user list; createEnabled only
/// substitutes on single-cluster deployments.
pub fn es_admin_allowed(config: &Config, user: &User) -> bool {
    if config.es_admin_users.iter().any(|u| u == &user.user_id) {
        return true;
    }
    !config.multi_es && user.create_enabled
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth context
// ─────────────────────────────────────────────────────────────────────────────

/// Secrets, token ciphers and the user cache
pub struct AuthCtx {
    /// Cipher for peer tokens (serverSecret)
    pub peer_crypto: TokenCrypto,
    /// Cipher for the CSRF cookie (passwordSecret)
    pub csrf_crypto: TokenCrypto,
    config: Arc<Config>,
    db: Arc<Db>,
    users: Mutex<HashMap<String, (Instant, User)>>,
}

impl AuthCtx {
    pub fn new(config: Arc<Config>, db: Arc<Db>) -> Self {
        Self {
            peer_crypto: TokenCrypto::new(&config.server_secret),
            csrf_crypto: TokenCrypto::new(&config.password_secret),
            config,
            db,
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Anonymous operation: regression mode, or no password secret at all.
    pub fn anonymous_mode(&self) -> bool {
        self.config.regression_tests || self.config.password_secret.is_empty()
    }

    /// Fetch a user through the TTL cache.
    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        if let Some((at, user)) = self
            .users
            .lock()
            .expect("user cache lock poisoned")
            .get(user_id)
            .cloned()
        {
            if at.elapsed() < USER_CACHE_TTL {
                return Ok(Some(user));
            }
        }
        let fetched = self.db.get::<User>(USERS_INDEX, user_id).await?;
        if let Some(doc) = &fetched {
            self.users
                .lock()
                .expect("user cache lock poisoned")
                .insert(user_id.to_string(), (Instant::now(), doc.source.clone()));
        }
        Ok(fetched.map(|d| d.source))
    }

    /// Drop a user from the cache. User CRUD lives outside this daemon;
    /// until those endpoints move in, the TTL is the only expiry.
    #[allow(dead_code)]
    pub fn invalidate_user(&self, user_id: &str) {
        self.users
            .lock()
            .expect("user cache lock poisoned")
            .remove(user_id);
    }

    fn anonymous_user(&self) -> User {
        User {
            user_id: "anonymous".to_string(),
            enabled: true,
            create_enabled: true,
            web_enabled: true,
            remove_enabled: true,
            packet_search: true,
            ..Default::default()
        }
    }

    /// Run the authentication chain for one request.
    pub async fn authenticate(
        &self,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
    ) -> AuthOutcome {
        // (a) peer token - presence of the header decides this branch;
        // an invalid token is a hard 403, not a fall-through
        if let Some(raw) = headers.get("x-moloch-auth").and_then(|v| v.to_str().ok()) {
            return match token::verify_peer(&self.peer_crypto, raw, path_and_query, now_ms()) {
                Ok(peer) => match self.get_user(&peer.user_id).await {
                    Ok(Some(user)) if user.enabled => AuthOutcome::Ok(Box::new(AuthedUser {
                        user,
                        via: AuthVia::Peer,
                    })),
                    Ok(Some(_)) => AuthOutcome::Denied("User disabled".to_string()),
                    Ok(None) if self.anonymous_mode() => {
                        let mut user = self.anonymous_user();
                        user.user_id = peer.user_id;
                        AuthOutcome::Ok(Box::new(AuthedUser {
                            user,
                            via: AuthVia::Peer,
                        }))
                    }
                    Ok(None) => AuthOutcome::Denied("Unknown user".to_string()),
                    Err(e) => AuthOutcome::Denied(format!("User lookup failed: {}", e)),
                },
                Err(e) => AuthOutcome::Denied(format!("Bad peer token: {}", e)),
            };
        }

        // (b) trusted username header from a fronting proxy
        if let Some(header_name) = &self.config.user_name_header {
            if let Some(user_id) = headers.get(header_name.as_str()).and_then(|v| v.to_str().ok())
            {
                if let Some(required) = &self.config.required_auth_header {
                    let value = headers.get(required.as_str()).and_then(|v| v.to_str().ok());
                    let ok = match (&self.config.required_auth_header_val, value) {
                        (_, None) => false,
                        (Some(want), Some(got)) => want.as_str() == got,
                        (None, Some(_)) => true,
                    };
                    if !ok {
                        return AuthOutcome::Denied("Missing required auth header".to_string());
                    }
                }
                return self.header_user(user_id).await;
            }
        }

        // (c) digest auth
        if let Some(raw) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
            return self.digest_user(method, raw).await;
        }

        // (d) anonymous / regression mode
        if self.anonymous_mode() {
            return AuthOutcome::Ok(Box::new(AuthedUser {
                user: self.anonymous_user(),
                via: AuthVia::Anonymous,
            }));
        }

        AuthOutcome::Challenge(digest::challenge(
            &self.config.http_realm,
            &self.config.password_secret,
        ))
    }

    async fn header_user(&self, user_id: &str) -> AuthOutcome {
        match self.get_user(user_id).await {
            Ok(Some(user)) => {
                if !user.enabled {
                    AuthOutcome::Denied("User disabled".to_string())
                } else if !user.header_auth_enabled {
                    AuthOutcome::Denied("Header auth not enabled for user".to_string())
                } else {
                    AuthOutcome::Ok(Box::new(AuthedUser {
                        user,
                        via: AuthVia::Header,
                    }))
                }
            }
            Ok(None) => match &self.config.user_auto_create_tmpl {
                Some(tmpl) => match self.auto_create(user_id, tmpl.clone()).await {
                    Ok(user) => AuthOutcome::Ok(Box::new(AuthedUser {
                        user,
                        via: AuthVia::Header,
                    })),
                    Err(e) => AuthOutcome::Denied(format!("Auto-create failed: {}", e)),
                },
                None => AuthOutcome::Denied("Unknown user".to_string()),
            },
            Err(e) => AuthOutcome::Denied(format!("User lookup failed: {}", e)),
        }
    }

    /// Create a user from the configured template, substituting the id.
    async fn auto_create(&self, user_id: &str, mut tmpl: serde_json::Value) -> Result<User> {
        if let Some(obj) = tmpl.as_object_mut() {
            obj.insert("userId".to_string(), serde_json::json!(user_id));
            obj.entry("userName")
                .or_insert_with(|| serde_json::json!(user_id));
            obj.insert("enabled".to_string(), serde_json::json!(true));
            obj.insert("headerAuthEnabled".to_string(), serde_json::json!(true));
        }
        self.db
            .index_doc(USERS_INDEX, Some(user_id), &tmpl, true)
            .await?;
        tracing::info!("Auto-created user {} from template", user_id);
        let user: User = serde_json::from_value(tmpl)?;
        self.users
            .lock()
            .expect("user cache lock poisoned")
            .insert(user_id.to_string(), (Instant::now(), user.clone()));
        Ok(user)
    }

    async fn digest_user(&self, method: &Method, raw: &str) -> AuthOutcome {
        let auth = match digest::parse_authorization(raw) {
            Ok(a) => a,
            Err(e) => return AuthOutcome::Denied(format!("Bad authorization header: {}", e)),
        };
        if auth.realm != self.config.http_realm {
            return AuthOutcome::Denied("Wrong realm".to_string());
        }
        let user = match self.get_user(&auth.username).await {
            Ok(Some(user)) => user,
            Ok(None) => return AuthOutcome::Denied("Unknown user".to_string()),
            Err(e) => return AuthOutcome::Denied(format!("User lookup failed: {}", e)),
        };
        if !user.enabled {
            return AuthOutcome::Denied("User disabled".to_string());
        }
        let stored = match &user.pass_store {
            Some(p) => p.clone(),
            None => return AuthOutcome::Denied("User has no password".to_string()),
        };
        match digest::verify(
            &auth,
            method.as_str(),
            &stored,
            &self.config.password_secret,
            now_ms(),
        ) {
            Ok(()) => AuthOutcome::Ok(Box::new(AuthedUser {
                user,
                via: AuthVia::Digest,
            })),
            // A stale nonce gets a fresh challenge rather than a 403
            Err(_) => AuthOutcome::Challenge(digest::challenge(
                &self.config.http_realm,
                &self.config.password_secret,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with(f: impl FnOnce(&mut User)) -> User {
        let mut user = User {
            user_id: "u".to_string(),
            enabled: true,
            ..Default::default()
        };
        f(&mut user);
        user
    }

    #[test]
    fn test_gate_create_enabled() {
        assert!(!allowed(&user_with(|_| {}), Gate::CreateEnabled));
        assert!(allowed(
            &user_with(|u| u.create_enabled = true),
            Gate::CreateEnabled
        ));
    }

    #[test]
    fn test_gates_inverse_flags() {
        // stats/files/pcap gates are inverses of hide/disable flags
        let plain = user_with(|_| {});
        assert!(allowed(&plain, Gate::StatsVisible));
        assert!(allowed(&plain, Gate::FilesVisible));
        assert!(allowed(&plain, Gate::PcapDownload));

        assert!(!allowed(&user_with(|u| u.hide_stats = true), Gate::StatsVisible));
        assert!(!allowed(&user_with(|u| u.hide_files = true), Gate::FilesVisible));
        assert!(!allowed(
            &user_with(|u| u.disable_pcap_download = true),
            Gate::PcapDownload
        ));
    }

    #[test]
    fn test_es_admin_gate() {
        let mut config = Config::default();
        let admin = user_with(|u| u.create_enabled = true);
        let plain = user_with(|_| {});

        // Single-cluster: createEnabled substitutes for the list
        assert!(es_admin_allowed(&config, &admin));
        assert!(!es_admin_allowed(&config, &plain));

        // multiES: only the explicit list counts
        config.multi_es = true;
        assert!(!es_admin_allowed(&config, &admin));
        config.es_admin_users = vec!["u".to_string()];
        assert!(es_admin_allowed(&config, &plain));
    }

    #[test]
    fn test_gates_positive_flags() {
        assert!(!allowed(&user_with(|_| {}), Gate::RemoveEnabled));
        assert!(allowed(
            &user_with(|u| u.remove_enabled = true),
            Gate::RemoveEnabled
        ));
        assert!(!allowed(&user_with(|_| {}), Gate::PacketSearch));
        assert!(allowed(
            &user_with(|u| u.packet_search = true),
            Gate::PacketSearch
        ));
    }
}
