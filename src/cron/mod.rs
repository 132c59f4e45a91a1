//! Cron-query engine
//!
//! A singleton, resumable iterator over the session timeline. Every tick
//! (and immediately after any cron mutation) each enabled query drains
//! bounded windows of at most one day between its low watermark and the
//! horizon `now - cron_delay`, applies its expression, and executes its
//! action: tag the matches, or forward them to a remote cluster.
//!
//! The watermark commits after each window, so a crash between action
//! dispatch and commit re-processes that window: actions are
//! at-least-once by design.

pub mod forward;

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

use crate::cluster::ClusterCtx;
use crate::config::Config;
use crate::expression;
use crate::notifier::Alerts;
use crate::pcap::PcapStore;
use crate::store::session::scroll_body;
use crate::store::types::{
    CronAction, CronQuery, Session, User, QUERIES_INDEX, SESSIONS_INDEX, USERS_INDEX,
};
use crate::store::{Db, Doc};
use crate::util::{base36, now_ms, now_secs, sanitize_tags};

/// Tick interval between unprompted runs
const TICK: std::time::Duration = std::time::Duration::from_secs(60);
/// A single drained window never spans more than one day
const WINDOW_MAX_SECS: u64 = 86_400;
/// Scroll page size for a window
const SCROLL_PAGE_SIZE: u64 = 500;
const SCROLL_KEEP_ALIVE: &str = "2m";
/// Forward fan-out: across nodes, and per node
const FORWARD_NODE_CONCURRENCY: usize = 15;
const FORWARD_SESSION_CONCURRENCY: usize = 10;
/// Minimum seconds between notifier firings per query
const NOTIFY_DAMP_SECS: u64 = 600;

pub struct CronEngine {
    config: Arc<Config>,
    db: Arc<Db>,
    cluster: Arc<ClusterCtx>,
    pcap: Arc<PcapStore>,
    alerts: Arc<Alerts>,
    /// Process-local singleton flag
    running: AtomicBool,
    wake_tx: mpsc::Sender<()>,
}

impl CronEngine {
    pub fn new(
        config: Arc<Config>,
        db: Arc<Db>,
        cluster: Arc<ClusterCtx>,
        pcap: Arc<PcapStore>,
        alerts: Arc<Alerts>,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (wake_tx, wake_rx) = mpsc::channel(16);
        (
            Arc::new(Self {
                config,
                db,
                cluster,
                pcap,
                alerts,
                running: AtomicBool::new(false),
                wake_tx,
            }),
            wake_rx,
        )
    }

    /// Kick the engine (cron create/update/delete endpoints).
    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub async fn run(self: Arc<Self>, mut wake_rx: mpsc::Receiver<()>) {
        tracing::info!("Cron engine started on {}", self.config.node);
        loop {
            self.process_cron_queries().await;
            tokio::select! {
                _ = wake_rx.recv() => {}
                _ = tokio::time::sleep(TICK) => {}
            }
        }
    }

    /// One full pass: every enabled query gets a turn per round; rounds
    /// repeat while any query still has windows to drain, so a long
    /// backlog on one query cannot starve the others.
    pub async fn process_cron_queries(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let end_time = now_secs().saturating_sub(self.config.cron_delay);
            let queries = match self.load_queries().await {
                Ok(q) => q,
                Err(e) => {
                    tracing::error!("Cron query load failed: {}", e);
                    break;
                }
            };

            let mut repeat = false;
            for doc in queries {
                if !doc.source.enabled || doc.source.lp_value >= end_time {
                    continue;
                }
                let name = doc.source.name.clone();
                match self.run_query(doc, end_time).await {
                    Ok(more) => repeat |= more,
                    Err(e) => tracing::warn!("Cron query {} skipped: {}", name, e),
                }
            }
            if !repeat {
                break;
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn load_queries(&self) -> Result<Vec<Doc<CronQuery>>> {
        let result = self
            .db
            .search::<CronQuery>(QUERIES_INDEX, &json!({ "size": 1000 }), None)
            .await?;
        Ok(result.hits)
    }

    /// Drain one window of one query. Returns true when more windows
    /// remain (the outer loop then gives other queries a turn first).
    async fn run_query(&self, doc: Doc<CronQuery>, end_time: u64) -> Result<bool> {
        let Doc { index, id, source: query } = doc;

        // A disabled or vanished creator stops the query cold
        let creator = self
            .db
            .get::<User>(USERS_INDEX, &query.creator)
            .await?
            .map(|d| d.source);
        let creator = match creator {
            Some(u) if u.enabled => u,
            _ => bail!("Creator {} missing or disabled", query.creator),
        };

        let action = CronAction::parse(&query.action)
            .with_context(|| format!("Bad action {:?}", query.action))?;

        let lookups = self.db.lookup_tables(&query.creator).await?;

        // Compile errors skip the query for this tick only
        let single_end = window_end(query.lp_value, end_time);
        let mut filters = vec![json!({
            "range": { "lastPacket": { "gte": query.lp_value * 1000, "lt": single_end * 1000 } }
        })];
        if let Some(forced) = creator.expression.as_deref() {
            filters.push(expression::compile(forced, &lookups)?);
        }
        filters.push(expression::compile(&query.query, &lookups)?);

        let matched = self.drain_window(&query, &action, filters).await?;

        // Commit the watermark; a crash before this line re-runs the window
        let new_count = query.count + matched;
        self.db
            .update_doc(
                &index,
                &id,
                &json!({
                    "lpValue": single_end,
                    "lastRun": now_secs(),
                    "count": new_count,
                }),
                true,
            )
            .await?;
        tracing::debug!(
            "Cron query {} advanced to {} ({} new matches)",
            query.name, single_end, matched
        );

        if let Some(notifier) = &query.notifier {
            if matched > 0 && now_secs().saturating_sub(query.last_notified) >= NOTIFY_DAMP_SECS {
                let new_matches = new_count - query.last_notified_count;
                self.alerts
                    .fire_or_log(
                        notifier,
                        &format!("Cron query {}: {} new matches", query.name, new_matches),
                    )
                    .await;
                self.db
                    .update_doc(
                        &index,
                        &id,
                        &json!({ "lastNotified": now_secs(), "lastNotifiedCount": new_count }),
                        false,
                    )
                    .await?;
            }
        }

        Ok(single_end < end_time)
    }

    /// Scroll one window and dispatch the action per page. Returns the
    /// number of matched sessions.
    async fn drain_window(
        &self,
        query: &CronQuery,
        action: &CronAction,
        filters: Vec<serde_json::Value>,
    ) -> Result<u64> {
        let body = scroll_body(filters, &["node"], SCROLL_PAGE_SIZE);
        let mut page = self
            .db
            .search::<Session>(SESSIONS_INDEX, &body, Some(SCROLL_KEEP_ALIVE))
            .await?;

        let mut matched = 0u64;
        loop {
            if page.hits.is_empty() {
                if let Some(scroll_id) = &page.scroll_id {
                    self.db.clear_scroll(scroll_id).await;
                }
                return Ok(matched);
            }
            matched += page.hits.len() as u64;

            let hits = std::mem::take(&mut page.hits);
            match action {
                CronAction::Tag => self.apply_tags(&query.tags, hits).await,
                CronAction::Forward(cluster) => {
                    self.apply_forward(cluster, &query.creator, hits).await?
                }
            }

            let scroll_id = page
                .scroll_id
                .clone()
                .context("Scroll context lost")?;
            page = self
                .db
                .scroll::<Session>(&scroll_id, SCROLL_KEEP_ALIVE)
                .await?;
        }
    }

    /// Tag action: scripted append on each matched session.
    async fn apply_tags(&self, tags: &str, hits: Vec<Doc<Session>>) {
        let tags = sanitize_tags(tags);
        if tags.is_empty() {
            return;
        }
        for hit in hits {
            if let Err(e) = self
                .db
                .add_tags_to_session(&hit.index, &hit.id, &tags)
                .await
            {
                tracing::warn!("Tagging session {} failed: {}", hit.id, e);
            }
        }
    }

    /// Forward action: sessions owned here are framed and POSTed directly;
    /// other nodes get a work-list request and do their own forwarding.
    /// Fan-out is bounded across nodes and per node independently.
    async fn apply_forward(
        &self,
        cluster_name: &str,
        creator: &str,
        hits: Vec<Doc<Session>>,
    ) -> Result<()> {
        let cluster = self
            .config
            .remote_clusters
            .get(cluster_name)
            .with_context(|| format!("Unknown remote cluster {}", cluster_name))?;

        // Group the page by owning node
        let mut by_node: HashMap<String, Vec<String>> = HashMap::new();
        for hit in hits {
            by_node.entry(hit.source.node.clone()).or_default().push(hit.id);
        }

        let node_gate = Arc::new(Semaphore::new(FORWARD_NODE_CONCURRENCY));
        let mut tasks = Vec::new();
        for (node, ids) in by_node {
            let permit = node_gate
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");
            let cluster = cluster.clone();
            let cluster_name = cluster_name.to_string();
            let this = self;
            tasks.push(async move {
                let _permit = permit;
                if this.cluster.is_local(&node) {
                    this.forward_local_sessions(&cluster, ids).await;
                } else if let Err(e) = this
                    .cluster
                    .peer_post_json(
                        &node,
                        &format!("/{}/sendSessions?cluster={}", node, cluster_name),
                        &json!({ "ids": ids }),
                        creator,
                    )
                    .await
                {
                    tracing::warn!("Node {} forward dispatch failed: {}", node, e);
                }
            });
        }
        futures::future::join_all(tasks).await;
        Ok(())
    }

    /// Forward locally-owned sessions with the per-node bound.
    pub async fn forward_local_sessions(
        &self,
        cluster: &crate::config::RemoteCluster,
        ids: Vec<String>,
    ) {
        use futures::StreamExt;
        let save_id = format!("{}-{}", self.config.node, base36(now_ms()));
        futures::stream::iter(ids)
            .for_each_concurrent(FORWARD_SESSION_CONCURRENCY, |session_id| {
                let save_id = save_id.clone();
                async move {
                    let result = async {
                        let doc = self
                            .db
                            .session_get(&session_id)
                            .await?
                            .with_context(|| format!("Session {} not found", session_id))?;
                        forward::forward_session(
                            &self.pcap,
                            &self.cluster,
                            cluster,
                            &doc.source,
                            &save_id,
                        )
                        .await
                    }
                    .await;
                    if let Err(e) = result {
                        tracing::warn!("Forward of session {} failed: {}", session_id, e);
                    }
                }
            })
            .await;
    }
}

/// The next window to drain: `[lp_value, min(end, lp_value + one day))`.
/// Exposed for the window-slicing tests.
pub fn window_end(lp_value: u64, end_time: u64) -> u64 {
    end_time.min(lp_value + WINDOW_MAX_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_end_caps_at_one_day() {
        // Backlog of a week: windows advance a day at a time
        assert_eq!(window_end(0, 7 * 86_400), 86_400);
        assert_eq!(window_end(86_400, 7 * 86_400), 2 * 86_400);
    }

    #[test]
    fn test_window_end_stops_at_horizon() {
        // Caught-up query: the window ends exactly at the horizon
        assert_eq!(window_end(1_000, 1_500), 1_500);
        assert_eq!(window_end(1_500, 1_500), 1_500);
    }

    #[test]
    fn test_window_progression_is_monotone() {
        // Each commit strictly advances lpValue until the horizon
        let horizon = 300_000;
        let mut lp = 1_000;
        let mut steps = 0;
        while lp < horizon {
            let next = window_end(lp, horizon);
            assert!(next > lp);
            assert!(next <= horizon);
            lp = next;
            steps += 1;
            assert!(steps < 100, "window slicing must terminate");
        }
        assert_eq!(lp, horizon);
    }
}
