//! Typed facade over the Elasticsearch HTTP API
//!
//! The index is the source of truth for hunts, cron queries, users, files
//! and sessions; this module is the crate's only seam to it. Callers get
//! typed documents back and never see raw transport details.

pub mod session;
pub mod types;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

/// A document with its index coordinates. Updates must go back to the
/// concrete index a wildcard search found the document in.
#[derive(Debug, Clone)]
pub struct Doc<T> {
    pub index: String,
    pub id: String,
    pub source: T,
}

/// One page of search results
#[derive(Debug)]
pub struct SearchResult<T> {
    /// Total matching documents (not just this page)
    pub total: u64,
    pub hits: Vec<Doc<T>>,
    /// Present when the search opened a scroll context
    pub scroll_id: Option<String>,
}

/// Elasticsearch client facade
#[derive(Clone)]
pub struct Db {
    client: reqwest::Client,
    base: String,
}

impl Db {
    pub fn new(es_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .pool_max_idle_per_host(10)
            .build()
            .context("Failed to create Elasticsearch client")?;
        Ok(Self {
            client,
            base: es_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    /// Run a request and parse the JSON body, surfacing ES error bodies.
    async fn exec(&self, req: reqwest::RequestBuilder) -> Result<Value> {
        let resp = req.send().await.context("Elasticsearch unreachable")?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("Elasticsearch returned a non-JSON body")?;
        if status.is_client_error() || status.is_server_error() {
            return Err(anyhow!(
                "Elasticsearch error {}: {}",
                status,
                body["error"]["reason"].as_str().unwrap_or("unknown")
            ));
        }
        Ok(body)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Document operations
    // ─────────────────────────────────────────────────────────────────────

    /// Get one document by id. Returns None when it does not exist.
    pub async fn get<T: DeserializeOwned>(&self, index: &str, id: &str) -> Result<Option<Doc<T>>> {
        let resp = self
            .client
            .get(self.url(&format!("{}/_doc/{}", index, id)))
            .send()
            .await
            .context("Elasticsearch unreachable")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = resp.json().await.context("Bad get response")?;
        if !body["found"].as_bool().unwrap_or(false) {
            return Ok(None);
        }
        let source: T = serde_json::from_value(body["_source"].clone())
            .with_context(|| format!("Malformed {} document {}", index, id))?;
        Ok(Some(Doc {
            index: body["_index"].as_str().unwrap_or(index).to_string(),
            id: id.to_string(),
            source,
        }))
    }

    /// Index (create or replace) a document. Returns the document id.
    pub async fn index_doc(
        &self,
        index: &str,
        id: Option<&str>,
        body: &Value,
        refresh: bool,
    ) -> Result<String> {
        let refresh = if refresh { "true" } else { "false" };
        let req = match id {
            Some(id) => self
                .client
                .put(self.url(&format!("{}/_doc/{}", index, id)))
                .query(&[("refresh", refresh)]),
            None => self
                .client
                .post(self.url(&format!("{}/_doc", index)))
                .query(&[("refresh", refresh)]),
        };
        let body = self.exec(req.json(body)).await?;
        body["_id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| anyhow!("Index response missing _id"))
    }

    /// Partial-document update.
    pub async fn update_doc(
        &self,
        index: &str,
        id: &str,
        partial: &Value,
        refresh: bool,
    ) -> Result<()> {
        let req = self
            .client
            .post(self.url(&format!("{}/_update/{}", index, id)))
            .query(&[("refresh", if refresh { "true" } else { "false" })])
            .query(&[("retry_on_conflict", "3")])
            .json(&json!({ "doc": partial }));
        self.exec(req).await?;
        Ok(())
    }

    /// Scripted update (compare-and-append semantics live in the script).
    pub async fn script_update(
        &self,
        index: &str,
        id: &str,
        script: &Value,
        refresh: bool,
    ) -> Result<()> {
        let req = self
            .client
            .post(self.url(&format!("{}/_update/{}", index, id)))
            .query(&[("refresh", if refresh { "true" } else { "false" })])
            .query(&[("retry_on_conflict", "3")])
            .json(&json!({ "script": script }));
        self.exec(req).await?;
        Ok(())
    }

    /// Delete a document.
    pub async fn delete_doc(&self, index: &str, id: &str, refresh: bool) -> Result<()> {
        let req = self
            .client
            .delete(self.url(&format!("{}/_doc/{}", index, id)))
            .query(&[("refresh", if refresh { "true" } else { "false" })]);
        self.exec(req).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Admin passthrough
    // ─────────────────────────────────────────────────────────────────────

    /// Raw GET against the cluster (ES admin endpoints).
    pub async fn admin_get(&self, path: &str) -> Result<Value> {
        self.exec(self.client.get(self.url(path))).await
    }

    /// Raw POST with an empty body (task cancellation and friends).
    pub async fn admin_post(&self, path: &str) -> Result<Value> {
        self.exec(self.client.post(self.url(path))).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Search and scroll
    // ─────────────────────────────────────────────────────────────────────

    /// Run a search. When `scroll` is set, opens a scroll context with that
    /// keep-alive (e.g. "2m") and the result carries a scroll_id.
    pub async fn search<T: DeserializeOwned>(
        &self,
        index: &str,
        query: &Value,
        scroll: Option<&str>,
    ) -> Result<SearchResult<T>> {
        let mut req = self
            .client
            .post(self.url(&format!("{}/_search", index)))
            .json(query);
        if let Some(keep_alive) = scroll {
            req = req.query(&[("scroll", keep_alive)]);
        }
        let body = self.exec(req).await?;
        Self::parse_hits(body)
    }

    /// Fetch the next page of an open scroll.
    pub async fn scroll<T: DeserializeOwned>(
        &self,
        scroll_id: &str,
        keep_alive: &str,
    ) -> Result<SearchResult<T>> {
        let req = self.client.post(self.url("_search/scroll")).json(&json!({
            "scroll": keep_alive,
            "scroll_id": scroll_id,
        }));
        let body = self.exec(req).await?;
        Self::parse_hits(body)
    }

    /// Release a scroll context. Failures are logged, not propagated; an
    /// expired context is already gone.
    pub async fn clear_scroll(&self, scroll_id: &str) {
        let req = self
            .client
            .delete(self.url("_search/scroll"))
            .json(&json!({ "scroll_id": scroll_id }));
        if let Err(e) = self.exec(req).await {
            tracing::debug!("clear_scroll failed: {}", e);
        }
    }

    fn parse_hits<T: DeserializeOwned>(body: Value) -> Result<SearchResult<T>> {
        // total is {value, relation} on ES7+, a bare number before that
        let total = body["hits"]["total"]["value"]
            .as_u64()
            .or_else(|| body["hits"]["total"].as_u64())
            .unwrap_or(0);
        let scroll_id = body["_scroll_id"].as_str().map(String::from);

        let mut hits = Vec::new();
        if let Some(raw_hits) = body["hits"]["hits"].as_array() {
            for hit in raw_hits {
                let source: T = serde_json::from_value(hit["_source"].clone())
                    .context("Malformed search hit")?;
                hits.push(Doc {
                    index: hit["_index"].as_str().unwrap_or_default().to_string(),
                    id: hit["_id"].as_str().unwrap_or_default().to_string(),
                    source,
                });
            }
        }
        Ok(SearchResult {
            total,
            hits,
            scroll_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hits_total_variants() {
        // ES7+ object form
        let body = json!({
            "hits": {"total": {"value": 42, "relation": "eq"}, "hits": []}
        });
        let result: SearchResult<Value> = Db::parse_hits(body).unwrap();
        assert_eq!(result.total, 42);
        assert!(result.scroll_id.is_none());

        // legacy bare-number form
        let body = json!({"hits": {"total": 7, "hits": []}});
        let result: SearchResult<Value> = Db::parse_hits(body).unwrap();
        assert_eq!(result.total, 7);
    }

    #[test]
    fn test_parse_hits_carries_index_and_id() {
        let body = json!({
            "_scroll_id": "abc123",
            "hits": {
                "total": {"value": 1},
                "hits": [
                    {"_index": "sessions2-240101", "_id": "s1", "_source": {"node": "cap01"}}
                ]
            }
        });
        let result: SearchResult<Value> = Db::parse_hits(body).unwrap();
        assert_eq!(result.scroll_id.as_deref(), Some("abc123"));
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].index, "sessions2-240101");
        assert_eq!(result.hits[0].id, "s1");
        assert_eq!(result.hits[0].source["node"], "cap01");
    }
}
