//! Alert delivery for hunts and cron queries
//!
//! Notifiers are first-class documents keyed by name, resolving to a
//! webhook URL. Firing is fire-and-forget from the caller's point of
//! view: failures are logged and, for background jobs, recorded in the
//! owning document's errors, never propagated.

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::store::types::{Notifier, NOTIFIERS_INDEX};
use crate::store::Db;

pub struct Alerts {
    db: Arc<Db>,
    client: reqwest::Client,
}

impl Alerts {
    pub fn new(db: Arc<Db>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create notifier client")?;
        Ok(Self { db, client })
    }

    /// Resolve a notifier by name and POST `{text}` to its webhook.
    pub async fn fire(&self, name: &str, text: &str) -> Result<()> {
        let doc = self
            .db
            .get::<Notifier>(NOTIFIERS_INDEX, name)
            .await?
            .with_context(|| format!("Unknown notifier {}", name))?;
        let resp = self
            .client
            .post(&doc.source.url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .with_context(|| format!("Notifier {} unreachable", name))?;
        if !resp.status().is_success() {
            anyhow::bail!("Notifier {} returned {}", name, resp.status());
        }
        tracing::info!("Fired notifier {}", name);
        Ok(())
    }

    /// Fire and swallow the error (callers that only want a log line).
    pub async fn fire_or_log(&self, name: &str, text: &str) {
        if let Err(e) = self.fire(name, text).await {
            tracing::warn!("Notifier {} failed: {}", name, e);
        }
    }
}
