//! Cluster request routing
//!
//! Session-scoped requests must be served by the node that owns the PCAP
//! bytes. This module decides local vs. remote, resolves peers through the
//! fleet map (the `nodes` index), and forwards requests with a signed
//! `x-moloch-auth` header. Transport failures surface as errors for the
//! caller to translate (502 for handlers, failed-session entries for the
//! hunt engine); nothing here retries silently.

use anyhow::{anyhow, bail, Context, Result};
use axum::body::Body;
use axum::http::{HeaderMap, Method, Response, StatusCode};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::auth::token::{sign_peer, TokenCrypto};
use crate::config::{Config, RemoteCluster};
use crate::store::types::{NodeInfo, NODES_INDEX};
use crate::store::Db;

/// Fleet-map rows go stale after this long.
const NODE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Cluster context: fleet map, per-scheme connection pools, signing keys
pub struct ClusterCtx {
    config: Arc<Config>,
    db: Arc<Db>,
    peer_crypto: TokenCrypto,
    /// One pooled client per target scheme
    http: reqwest::Client,
    https: reqwest::Client,
    nodes: Mutex<HashMap<String, (Instant, Option<String>)>>,
}

impl ClusterCtx {
    pub fn new(config: Arc<Config>, db: Arc<Db>) -> Result<Self> {
        let builder = || {
            reqwest::Client::builder()
                // Proxied requests can carry long scans; match the
                // server-side 20 minute deadline
                .timeout(Duration::from_secs(20 * 60))
                .pool_max_idle_per_host(10)
        };
        let http = builder().build().context("Failed to create http pool")?;
        let https = builder().build().context("Failed to create https pool")?;
        Ok(Self {
            peer_crypto: TokenCrypto::new(config.peer_secret()),
            config,
            db,
            http,
            https,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    /// The node that owns a session is the one recorded on the document.
    pub fn resolve<'a>(&self, session_node: &'a str) -> &'a str {
        session_node
    }

    /// True iff this process serves `node` directly.
    pub fn is_local(&self, node: &str) -> bool {
        node == self.config.node
    }

    /// Pick the pool for a target URL's scheme.
    fn client_for(&self, url: &str) -> &reqwest::Client {
        if url.starts_with("https://") {
            &self.https
        } else {
            &self.http
        }
    }

    /// Resolve a node name to its viewer base URL via the fleet map.
    pub async fn node_url(&self, node: &str) -> Result<String> {
        if let Some((at, cached)) = self
            .nodes
            .lock()
            .expect("node cache lock poisoned")
            .get(node)
            .cloned()
        {
            if at.elapsed() < NODE_CACHE_TTL {
                return cached.ok_or_else(|| anyhow!("Unknown node {}", node));
            }
        }

        let info = self.db.get::<NodeInfo>(NODES_INDEX, node).await?;
        let url = info.and_then(|doc| doc.source.url());
        self.nodes
            .lock()
            .expect("node cache lock poisoned")
            .insert(node.to_string(), (Instant::now(), url.clone()));
        url.ok_or_else(|| anyhow!("Unknown node {}", node))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Peer forwarding
    // ─────────────────────────────────────────────────────────────────────

    /// Forward a request to the owning node and stream the response back
    /// unchanged. The signed token is bound to `path_and_query`, which the
    /// peer verifies against its own request URL.
    pub async fn forward(
        &self,
        method: &Method,
        owner: &str,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
        user_id: &str,
    ) -> Result<Response<Body>> {
        let base = self.node_url(owner).await?;
        let url = format!("{}{}", base, path_and_query);
        let token = sign_peer(&self.peer_crypto, user_id, path_and_query)?;

        let forward_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .context("Invalid HTTP method")?;
        let mut req = self
            .client_for(&url)
            .request(forward_method, &url)
            .header("x-moloch-auth", token)
            .body(body.to_vec());

        // Copy request headers, skipping hop-by-hop and auth material the
        // peer must not see twice
        for (key, value) in headers.iter() {
            let name = key.as_str();
            if matches!(
                name,
                "host" | "connection" | "transfer-encoding" | "content-length" | "authorization"
                    | "x-moloch-auth"
            ) {
                continue;
            }
            req = req.header(name, value.as_bytes().to_vec());
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("Peer {} unreachable", owner))?;

        let status = resp.status();
        let mut builder = Response::builder().status(status.as_u16());
        for (key, value) in resp.headers().iter() {
            if matches!(key.as_str(), "transfer-encoding" | "connection") {
                continue;
            }
            builder = builder.header(key.as_str(), value.as_bytes().to_vec());
        }
        let body = Body::from_stream(resp.bytes_stream());
        builder.body(body).context("Failed to build proxied response")
    }

    /// Peer GET returning a JSON body, used by the hunt remote RPC.
    pub async fn peer_get_json(
        &self,
        node: &str,
        path_and_query: &str,
        user_id: &str,
    ) -> Result<Value> {
        let base = self.node_url(node).await?;
        let url = format!("{}{}", base, path_and_query);
        let token = sign_peer(&self.peer_crypto, user_id, path_and_query)?;
        let resp = self
            .client_for(&url)
            .get(&url)
            .header("x-moloch-auth", token)
            .send()
            .await
            .with_context(|| format!("Peer {} unreachable", node))?;
        if !resp.status().is_success() {
            bail!("Peer {} returned {}", node, resp.status());
        }
        resp.json().await.context("Peer returned a non-JSON body")
    }

    /// Peer POST with a JSON body, used to hand a node a work list
    /// (e.g. "forward these sessions of yours").
    pub async fn peer_post_json(
        &self,
        node: &str,
        path_and_query: &str,
        body: &Value,
        user_id: &str,
    ) -> Result<()> {
        let base = self.node_url(node).await?;
        let url = format!("{}{}", base, path_and_query);
        let token = sign_peer(&self.peer_crypto, user_id, path_and_query)?;
        let resp = self
            .client_for(&url)
            .post(&url)
            .header("x-moloch-auth", token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Peer {} unreachable", node))?;
        if !resp.status().is_success() {
            bail!("Peer {} returned {}", node, resp.status());
        }
        Ok(())
    }

    /// Peer GET discarding the body, used by remote scrub.
    pub async fn peer_get(&self, node: &str, path_and_query: &str, user_id: &str) -> Result<()> {
        let base = self.node_url(node).await?;
        let url = format!("{}{}", base, path_and_query);
        let token = sign_peer(&self.peer_crypto, user_id, path_and_query)?;
        let resp = self
            .client_for(&url)
            .get(&url)
            .header("x-moloch-auth", token)
            .send()
            .await
            .with_context(|| format!("Peer {} unreachable", node))?;
        if !resp.status().is_success() {
            bail!("Peer {} returned {}", node, resp.status());
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Remote cluster forwarding (cron forward action)
    // ─────────────────────────────────────────────────────────────────────

    /// POST a framed session to a remote cluster's receive endpoint. The
    /// body is already framed; the token is signed with the cluster's
    /// secret. Content-Length framing is forced via the form content type.
    pub async fn forward_to_cluster(
        &self,
        cluster: &RemoteCluster,
        path_and_query: &str,
        body: Bytes,
    ) -> Result<StatusCode> {
        let base = cluster.url.trim_end_matches('/');
        let url = format!("{}{}", base, path_and_query);
        let crypto = TokenCrypto::new(cluster.secret_or(&self.config.server_secret));
        let token = sign_peer(&crypto, &self.config.node, path_and_query)?;
        let resp = self
            .client_for(&url)
            .post(&url)
            .header("x-moloch-auth", token)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(body.to_vec())
            .send()
            .await
            .with_context(|| format!("Cluster {} unreachable", cluster.url))?;
        Ok(StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY))
    }
}
