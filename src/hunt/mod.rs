//! Packet-hunt scheduler
//!
//! A singleton, resumable background engine that drives queued hunts over
//! the whole fleet: scroll the matching sessions, run the packet search on
//! the owning node (locally or via the peer RPC), track matched /
//! searched / failed counts, retry unreachable sessions, and notify on
//! completion.
//!
//! Exactly one hunt runs at a time on the process that owns the engines
//! (`cron_queries` config). Progress checkpoints every ~2 seconds, which
//! is also when pause requests written to the hunt document are observed.
//! Counters are at-least-once: a crash may re-scan sessions between the
//! persisted lastPacketTime and the true progress point.

pub mod search;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::cluster::ClusterCtx;
use crate::config::Config;
use crate::expression;
use crate::notifier::Alerts;
use crate::pcap::{OpenMode, PcapStore};
use crate::store::session::scroll_body;
use crate::store::types::{
    Hunt, HuntError, HuntStatus, Session, User, HUNTS_INDEX, SESSIONS_INDEX, USERS_INDEX,
};
use crate::store::{Db, Doc};
use crate::util::now_secs;
use search::{CompiledPattern, SearchOptions};

/// Scroll page size for the session scan
const SCROLL_PAGE_SIZE: u64 = 100;
/// Keep-alive for the scan's scroll context
const SCROLL_KEEP_ALIVE: &str = "2m";
/// Bound on concurrent per-session searches
const SESSION_CONCURRENCY: usize = 3;
/// Checkpoint (and pause-observation) interval
const CHECKPOINT_EVERY: Duration = Duration::from_secs(2);
/// A hunt accumulating more failed sessions than this is paused for good
const FAILED_SESSIONS_CAP: usize = 10_000;
/// Idle tick when no wake arrives
const IDLE_TICK: Duration = Duration::from_secs(30);

/// How one hunt run ended
enum Outcome {
    Finished,
    Paused,
    /// Failed-session pass made progress but is not done; the next
    /// scheduler tick re-enters
    Yielded,
}

/// In-flight counters shared by the fan-out tasks
#[derive(Default)]
struct Progress {
    searched: u64,
    matched: u64,
    last_packet_time: Option<u64>,
    failed: Vec<String>,
    errors: Vec<HuntError>,
}

impl Progress {
    fn note_searched(&mut self, last_packet: u64, matched: bool) {
        self.searched += 1;
        if matched {
            self.matched += 1;
        }
        self.last_packet_time = Some(self.last_packet_time.unwrap_or(0).max(last_packet));
    }

    fn note_error(&mut self, value: String, node: Option<String>) {
        // Bounded so a flapping peer cannot grow the document unboundedly
        if self.errors.len() < 100 {
            self.errors.push(HuntError {
                value,
                time: now_secs(),
                node,
            });
        }
    }
}

pub struct HuntEngine {
    config: Arc<Config>,
    db: Arc<Db>,
    cluster: Arc<ClusterCtx>,
    pcap: Arc<PcapStore>,
    alerts: Arc<Alerts>,
    /// Process-local singleton flag
    running: AtomicBool,
    wake_tx: mpsc::Sender<()>,
}

impl HuntEngine {
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

    /// Nudge the scheduler (hunt mutations, play requests, startup).
    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Engine main loop. Restores an abandoned `running` hunt on startup,
    /// then drains queued hunts whenever woken or on the idle tick.
    pub async fn run(self: Arc<Self>, mut wake_rx: mpsc::Receiver<()>) {
        tracing::info!("Hunt engine started on {}", self.config.node);
        loop {
            self.process_hunt_jobs().await;
            tokio::select! {
                _ = wake_rx.recv() => {}
                _ = tokio::time::sleep(IDLE_TICK) => {}
            }
        }
    }

    /// Drain hunts one at a time. The in-memory flag holds the singleton:
    /// re-entry while a hunt is running is a no-op.
    pub async fn process_hunt_jobs(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let next = match self.next_hunt().await {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!("Hunt scheduling query failed: {}", e);
                    break;
                }
            };
            let Some(doc) = next else { break };
            let id = doc.id.clone();
            let index = doc.index.clone();
            match self.run_hunt(doc).await {
                Ok(Outcome::Finished) => continue,
                Ok(Outcome::Paused) => continue,
                Ok(Outcome::Yielded) => break,
                Err(e) => {
                    // Backend failure: capture into the job and pause it,
                    // never crash the process
                    tracing::error!("Hunt {} failed: {}", id, e);
                    self.pause_hunt(&index, &id, &e.to_string(), false).await;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// A still-`running` hunt (crash leftover or a yielded retry pass)
    /// takes precedence; otherwise the oldest queued hunt runs next.
    async fn next_hunt(&self) -> Result<Option<Doc<Hunt>>> {
        let running = self
            .db
            .search::<Hunt>(
                HUNTS_INDEX,
                &json!({ "query": { "term": { "status": "running" } }, "size": 1 }),
                None,
            )
            .await?;
        if let Some(doc) = running.hits.into_iter().next() {
            tracing::info!("Resuming hunt {} from lastPacketTime {:?}",
                doc.id, doc.source.last_packet_time);
            return Ok(Some(doc));
        }
        let queued = self
            .db
            .search::<Hunt>(
                HUNTS_INDEX,
                &json!({
                    "query": { "term": { "status": "queued" } },
                    "sort": [ { "created": { "order": "asc" } } ],
                    "size": 1,
                }),
                None,
            )
            .await?;
        Ok(queued.hits.into_iter().next())
    }

    // ─────────────────────────────────────────────────────────────────────
    // One hunt
    // ─────────────────────────────────────────────────────────────────────

    async fn run_hunt(&self, doc: Doc<Hunt>) -> Result<Outcome> {
        let Doc { index, id, source: mut hunt } = doc;
        tracing::info!("Running hunt {} ({})", hunt.name, id);

        hunt.status = HuntStatus::Running;
        if hunt.started.is_none() {
            hunt.started = Some(now_secs());
        }
        self.db
            .update_doc(
                &index,
                &id,
                &json!({ "status": "running", "started": hunt.started, "lastUpdated": now_secs() }),
                true,
            )
            .await?;

        // Creator context: forced expression and shortcut tables
        let creator = self
            .db
            .get::<User>(USERS_INDEX, &hunt.user_id)
            .await?
            .map(|d| d.source);
        let lookups = self.db.lookup_tables(&hunt.user_id).await?;
        let forced = creator.as_ref().and_then(|u| u.expression.as_deref());

        // Expression compile failure is terminal for the hunt
        let range = (
            hunt.last_packet_time
                .unwrap_or(hunt.query.start_time * 1000),
            hunt.query.stop_time * 1000,
        );
        let filters = match expression::compose_filters(
            range,
            forced,
            hunt.query.expression.as_deref(),
            &lookups,
        ) {
            Ok(filters) => filters,
            Err(e) => {
                self.pause_hunt(&index, &id, &format!("Bad query: {}", e), true)
                    .await;
                return Ok(Outcome::Paused);
            }
        };

        // So is a pattern that will never compile
        let pattern = match search::compile_pattern(hunt.search_type, &hunt.search) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                self.pause_hunt(&index, &id, &format!("Bad search pattern: {}", e), true)
                    .await;
                return Ok(Outcome::Paused);
            }
        };

        let progress = Arc::new(Mutex::new(Progress {
            searched: hunt.searched_sessions,
            matched: hunt.matched_sessions,
            last_packet_time: hunt.last_packet_time,
            failed: hunt.failed_session_ids.clone(),
            errors: hunt.errors.clone(),
        }));

        let outcome = self
            .scan(&index, &id, &mut hunt, filters, &pattern, &progress)
            .await?;
        if let Some(outcome) = outcome {
            return Ok(outcome);
        }

        // Normal scan done; deal with sessions that could not be reached
        let had_failures = !progress.lock().expect("hunt progress lock").failed.is_empty();
        if had_failures {
            if let Some(outcome) = self
                .failed_sessions_pass(&index, &id, &hunt, &pattern, &progress)
                .await?
            {
                return Ok(outcome);
            }
        }

        self.finish_hunt(&index, &id, &hunt, &progress).await?;
        Ok(Outcome::Finished)
    }

    /// The scroll scan. Returns Some(outcome) on early exit (pause, too
    /// many failures), None when the scan ran to the end of the range.
    async fn scan(
        &self,
        index: &str,
        id: &str,
        hunt: &mut Hunt,
        filters: Vec<serde_json::Value>,
        pattern: &Arc<CompiledPattern>,
        progress: &Arc<Mutex<Progress>>,
    ) -> Result<Option<Outcome>> {
        let body = scroll_body(
            filters,
            &["lastPacket", "node", "huntId", "huntName", "fileId"],
            SCROLL_PAGE_SIZE,
        );
        let mut page = self
            .db
            .search::<Session>(SESSIONS_INDEX, &body, Some(SCROLL_KEEP_ALIVE))
            .await?;

        // First page fixes the denominator: what is left plus what was
        // already searched before a resume
        hunt.total_sessions = page.total + hunt.searched_sessions;
        self.db
            .update_doc(index, id, &json!({ "totalSessions": hunt.total_sessions }), false)
            .await?;
        let hunt: &Hunt = &*hunt;

        let mut last_checkpoint = Instant::now();
        loop {
            if page.hits.is_empty() {
                if let Some(scroll_id) = &page.scroll_id {
                    self.db.clear_scroll(scroll_id).await;
                }
                return Ok(None);
            }

            let hits = std::mem::take(&mut page.hits);
            futures::stream::iter(hits)
                .for_each_concurrent(SESSION_CONCURRENCY, |hit| {
                    let pattern = pattern.clone();
                    let progress = progress.clone();
                    async move {
                        self.search_hit(hunt, id, hit, &pattern, &progress).await;
                    }
                })
                .await;

            // Too many unreachable sessions is a permanent condition
            let failed_count = progress.lock().expect("hunt progress lock").failed.len();
            if failed_count > FAILED_SESSIONS_CAP {
                if let Some(scroll_id) = &page.scroll_id {
                    self.db.clear_scroll(scroll_id).await;
                }
                self.persist_progress(index, id, progress, HuntStatus::Paused).await?;
                self.pause_hunt(index, id, "Too many failed sessions", false).await;
                return Ok(Some(Outcome::Paused));
            }

            // Checkpoint + observe pause requests
            if last_checkpoint.elapsed() >= CHECKPOINT_EVERY {
                last_checkpoint = Instant::now();
                self.persist_progress(index, id, progress, HuntStatus::Running).await?;
                let current = self.db.get::<Hunt>(index, id).await?;
                if current.map(|d| d.source.status) == Some(HuntStatus::Paused) {
                    tracing::info!("Hunt {} pause observed, aborting scroll", id);
                    if let Some(scroll_id) = &page.scroll_id {
                        self.db.clear_scroll(scroll_id).await;
                    }
                    self.persist_progress(index, id, progress, HuntStatus::Paused).await?;
                    return Ok(Some(Outcome::Paused));
                }
            }

            let scroll_id = page
                .scroll_id
                .clone()
                .ok_or_else(|| anyhow!("Scroll context lost"))?;
            page = self
                .db
                .scroll::<Session>(&scroll_id, SCROLL_KEEP_ALIVE)
                .await?;
        }
    }

    /// Search one scroll hit on whichever node owns it.
    async fn search_hit(
        &self,
        hunt: &Hunt,
        hunt_id: &str,
        hit: Doc<Session>,
        pattern: &Arc<CompiledPattern>,
        progress: &Arc<Mutex<Progress>>,
    ) {
        let last_packet = hit.source.last_packet;

        // Sessions with no pcap on disk count as searched, never matched
        if hit.source.file_id.is_empty() {
            progress
                .lock()
                .expect("hunt progress lock")
                .note_searched(last_packet, false);
            return;
        }

        let node = self.cluster.resolve(&hit.source.node).to_string();
        let result = if self.cluster.is_local(&node) {
            self.search_local(hunt, &hit.id, pattern).await
        } else {
            self.search_remote(hunt, &node, hunt_id, &hit.id).await
        };

        match result {
            Ok((matched, error)) => {
                if matched {
                    if let Err(e) = self
                        .db
                        .add_hunt_to_session(&hit.index, &hit.id, hunt_id, &hunt.name)
                        .await
                    {
                        tracing::warn!("Failed to mark session {}: {}", hit.id, e);
                    }
                }
                let mut p = progress.lock().expect("hunt progress lock");
                p.note_searched(last_packet, matched);
                if let Some(error) = error {
                    p.note_error(error, Some(node));
                }
            }
            Err(e) => {
                tracing::debug!("Session {} unreachable: {}", hit.id, e);
                let mut p = progress.lock().expect("hunt progress lock");
                if !p.failed.contains(&hit.id) {
                    p.failed.push(hit.id.clone());
                }
            }
        }
    }

    /// Local packet search: fetch the full session, read its packets,
    /// match. A session fetch failure is retryable (Err); a read problem
    /// is a recorded error on a searched session.
    async fn search_local(
        &self,
        hunt: &Hunt,
        session_id: &str,
        pattern: &CompiledPattern,
    ) -> Result<(bool, Option<String>)> {
        let doc = self
            .db
            .session_get(session_id)
            .await?
            .with_context(|| format!("Session {} not found", session_id))?;
        match self.packet_search_with(hunt, &doc.source, pattern).await {
            Ok(matched) => Ok((matched, None)),
            Err(e) => Ok((false, Some(e.to_string()))),
        }
    }

    /// The RPC runs on behalf of the hunt's creator, so the remote node
    /// applies the same permission gates a local run would.
    async fn search_remote(
        &self,
        hunt: &Hunt,
        node: &str,
        hunt_id: &str,
        session_id: &str,
    ) -> Result<(bool, Option<String>)> {
        let path = format!("/{}/hunt/{}/remote/{}", node, hunt_id, session_id);
        let body = self.cluster.peer_get_json(node, &path, &hunt.user_id).await?;
        let matched = body["matched"].as_bool().unwrap_or(false);
        let error = body["error"].as_str().map(String::from);
        Ok((matched, error))
    }

    /// Read a session's packets off local disk and run the matcher.
    /// Entry point for the peer RPC handler, which has no compiled
    /// pattern in hand.
    pub async fn packet_search(&self, hunt: &Hunt, session: &Session) -> Result<bool> {
        let pattern = search::compile_pattern(hunt.search_type, &hunt.search)?;
        self.packet_search_with(hunt, session, &pattern).await
    }

    async fn packet_search_with(
        &self,
        hunt: &Hunt,
        session: &Session,
        pattern: &CompiledPattern,
    ) -> Result<bool> {
        let opts = SearchOptions {
            hunt_type: hunt.hunt_type,
            src: hunt.src,
            dst: hunt.dst,
            size: hunt.size.max(1),
        };
        let packets = self.read_session_packets(session).await?;
        Ok(search::search_packets(session, &packets, pattern, &opts))
    }

    async fn read_session_packets(&self, session: &Session) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut packets = Vec::new();
        for (file_num, offset) in session.packet_locations() {
            let handle = self
                .pcap
                .open(OpenMode::Read, &session.node, file_num)
                .await?;
            let record = handle.read_packet(offset)?;
            packets.push((handle.link_type, record.data));
        }
        Ok(packets)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Failed-session retry
    // ─────────────────────────────────────────────────────────────────────

    /// One retry pass over failedSessionIds at the same concurrency bound.
    /// Zero progress pauses the hunt; partial progress yields so other
    /// work proceeds and the next tick re-enters.
    async fn failed_sessions_pass(
        &self,
        index: &str,
        id: &str,
        hunt: &Hunt,
        pattern: &Arc<CompiledPattern>,
        progress: &Arc<Mutex<Progress>>,
    ) -> Result<Option<Outcome>> {
        let snapshot: Vec<String> = {
            let p = progress.lock().expect("hunt progress lock");
            p.failed.clone()
        };
        tracing::info!("Hunt {} retrying {} failed sessions", id, snapshot.len());

        let before = snapshot.len();
        futures::stream::iter(snapshot)
            .for_each_concurrent(SESSION_CONCURRENCY, |session_id| {
                let pattern = pattern.clone();
                let progress = progress.clone();
                async move {
                    let result = match self.db.session_get(&session_id).await {
                        Ok(Some(doc)) => {
                            let node = doc.source.node.clone();
                            let r = if self.cluster.is_local(&node) {
                                self.packet_search_with(hunt, &doc.source, &pattern)
                                    .await
                                    .map(|m| (m, None))
                            } else {
                                self.search_remote(hunt, &node, id, &session_id).await
                            };
                            r.map(|ok| (ok, doc))
                        }
                        Ok(None) => Err(anyhow!("Session {} not found", session_id)),
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(((matched, error), doc)) => {
                            if matched {
                                let _ = self
                                    .db
                                    .add_hunt_to_session(&doc.index, &doc.id, id, &hunt.name)
                                    .await;
                            }
                            let mut p = progress.lock().expect("hunt progress lock");
                            p.failed.retain(|f| f != &session_id);
                            p.note_searched(doc.source.last_packet, matched);
                            if let Some(error) = error {
                                p.note_error(error, Some(doc.source.node));
                            }
                        }
                        Err(e) => {
                            tracing::debug!("Session {} still unreachable: {}", session_id, e);
                        }
                    }
                }
            })
            .await;

        let after = progress.lock().expect("hunt progress lock").failed.len();
        if after == 0 {
            return Ok(None); // all recovered, caller finishes the hunt
        }
        if after == before {
            self.persist_progress(index, id, progress, HuntStatus::Paused).await?;
            self.pause_hunt(index, id, "Unreachable sessions", false).await;
            return Ok(Some(Outcome::Paused));
        }
        // Progress was made; stay running and let the next tick retry
        self.persist_progress(index, id, progress, HuntStatus::Running).await?;
        Ok(Some(Outcome::Yielded))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    async fn persist_progress(
        &self,
        index: &str,
        id: &str,
        progress: &Arc<Mutex<Progress>>,
        status: HuntStatus,
    ) -> Result<()> {
        let partial = {
            let p = progress.lock().expect("hunt progress lock");
            json!({
                "status": status,
                "lastUpdated": now_secs(),
                "searchedSessions": p.searched,
                "matchedSessions": p.matched,
                "lastPacketTime": p.last_packet_time,
                "failedSessionIds": p.failed,
                "errors": p.errors,
            })
        };
        self.db.update_doc(index, id, &partial, false).await
    }

    /// Pause a hunt with an error note; `unrunnable` latches permanently.
    async fn pause_hunt(&self, index: &str, id: &str, error: &str, unrunnable: bool) {
        tracing::warn!("Pausing hunt {}: {} (unrunnable={})", id, error, unrunnable);
        let current_errors = match self.db.get::<Hunt>(index, id).await {
            Ok(Some(doc)) => {
                let mut errors = doc.source.errors;
                errors.push(HuntError {
                    value: error.to_string(),
                    time: now_secs(),
                    node: None,
                });
                errors
            }
            _ => vec![HuntError {
                value: error.to_string(),
                time: now_secs(),
                node: None,
            }],
        };
        let mut partial = json!({
            "status": "paused",
            "lastUpdated": now_secs(),
            "errors": current_errors,
        });
        if unrunnable {
            partial["unrunnable"] = json!(true);
        }
        if let Err(e) = self.db.update_doc(index, id, &partial, true).await {
            tracing::error!("Failed to pause hunt {}: {}", id, e);
        }
    }

    async fn finish_hunt(
        &self,
        index: &str,
        id: &str,
        hunt: &Hunt,
        progress: &Arc<Mutex<Progress>>,
    ) -> Result<()> {
        self.persist_progress(index, id, progress, HuntStatus::Finished).await?;
        self.db
            .update_doc(index, id, &json!({ "status": "finished" }), true)
            .await?;

        let (searched, matched) = {
            let p = progress.lock().expect("hunt progress lock");
            (p.searched, p.matched)
        };
        tracing::info!(
            "Hunt {} ({}) finished: {} searched, {} matched",
            hunt.name, id, searched, matched
        );
        if let Some(notifier) = &hunt.notifier {
            self.alerts
                .fire_or_log(
                    notifier,
                    &format!(
                        "Hunt {} finished: {} matched of {} searched sessions",
                        hunt.name, matched, searched
                    ),
                )
                .await;
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_counters_are_monotone() {
        let mut p = Progress::default();
        p.note_searched(1_500_000, false);
        p.note_searched(1_600_000, true);
        p.note_searched(1_550_000, false); // out-of-order completion
        assert_eq!(p.searched, 3);
        assert_eq!(p.matched, 1);
        // lastPacketTime keeps the max, not the latest
        assert_eq!(p.last_packet_time, Some(1_600_000));
    }

    #[test]
    fn test_progress_matched_never_exceeds_searched() {
        let mut p = Progress::default();
        for i in 0..50 {
            p.note_searched(i, i % 3 == 0);
        }
        assert!(p.matched <= p.searched);
    }

    #[test]
    fn test_progress_error_list_is_bounded() {
        let mut p = Progress::default();
        for i in 0..500 {
            p.note_error(format!("err {}", i), None);
        }
        assert_eq!(p.errors.len(), 100);
    }
}
