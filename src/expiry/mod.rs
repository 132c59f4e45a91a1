//! PCAP retention
//!
//! Runs every minute on nodes that write pcap to local disk. Directories
//! are grouped by underlying device; when a device's free space falls
//! below the configured target, the oldest unlocked files are deleted
//! until the target is met or the per-device file count would drop below
//! the hard floor. Locked files are never touched. A file already missing
//! from disk still loses its index row.

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::pcap::PcapStore;
use crate::store::types::{PcapFileRecord, FILES_INDEX};
use crate::store::{Db, Doc};

const TICK: std::time::Duration = std::time::Duration::from_secs(60);
/// Never reduce a device below this many files
const MIN_FILES_PER_DEVICE: u64 = 10;
/// Candidates fetched per pass, oldest first
const CANDIDATE_QUERY_SIZE: u64 = 200;

pub struct ExpiryEngine {
    config: Arc<Config>,
    db: Arc<Db>,
    pcap: Arc<PcapStore>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Filesystem probes
// ─────────────────────────────────────────────────────────────────────────────

/// Free and total bytes of the filesystem holding `path`.
fn fs_space(path: &Path) -> Result<(u64, u64)> {
    let c_path = CString::new(path.as_os_str().as_bytes()).context("Bad path")?;
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut vfs) } != 0 {
        bail!(
            "statvfs({}) failed: {}",
            path.display(),
            std::io::Error::last_os_error()
        );
    }
    let frsize = vfs.f_frsize as u64;
    Ok((vfs.f_bavail as u64 * frsize, vfs.f_blocks as u64 * frsize))
}

/// Device id holding `path`, used to group directories.
fn device_of(path: &Path) -> Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes()).context("Bad path")?;
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::stat(c_path.as_ptr(), &mut st) } != 0 {
        bail!(
            "stat({}) failed: {}",
            path.display(),
            std::io::Error::last_os_error()
        );
    }
    Ok(st.st_dev as u64)
}

// ─────────────────────────────────────────────────────────────────────────────
// Deletion planning (pure, tested)
// ─────────────────────────────────────────────────────────────────────────────

/// Pick which candidates (oldest-first, already filtered to unlocked) to
/// delete: stop once the projected free space meets the target or the
/// remaining count would fall below the floor.
fn plan_deletions<'a>(
    candidates: &'a [Doc<PcapFileRecord>],
    device_file_count: u64,
    free: u64,
    target: u64,
) -> Vec<&'a Doc<PcapFileRecord>> {
    let mut picked = Vec::new();
    let mut projected_free = free;
    let mut remaining = device_file_count;
    for doc in candidates {
        if projected_free >= target || remaining <= MIN_FILES_PER_DEVICE {
            break;
        }
        picked.push(doc);
        projected_free += doc.source.filesize;
        remaining -= 1;
    }
    picked
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

impl ExpiryEngine {
    pub fn new(config: Arc<Config>, db: Arc<Db>, pcap: Arc<PcapStore>) -> Self {
        Self { config, db, pcap }
    }

    pub async fn run(self) {
        tracing::info!("Expiry engine started on {}", self.config.node);
        loop {
            if let Err(e) = self.check_devices().await {
                tracing::error!("Expiry pass failed: {}", e);
            }
            tokio::time::sleep(TICK).await;
        }
    }

    /// One pass: group directories by device, expire each low device.
    async fn check_devices(&self) -> Result<()> {
        let mut by_device: HashMap<u64, Vec<PathBuf>> = HashMap::new();
        for dir in &self.config.pcap_dirs {
            match device_of(dir) {
                Ok(dev) => by_device.entry(dev).or_default().push(dir.clone()),
                Err(e) => tracing::warn!("Skipping pcap dir {}: {}", dir.display(), e),
            }
        }

        for dirs in by_device.values() {
            let (free, total) = fs_space(&dirs[0])?;
            let target = self.config.free_space_g.target_bytes(total);
            if free >= target {
                continue;
            }
            tracing::info!(
                "Device of {} below free-space target ({} < {}), expiring",
                dirs[0].display(),
                free,
                target
            );
            self.expire_device(dirs, free, target).await?;
        }
        Ok(())
    }

    /// Oldest unlocked files under this device's directories.
    async fn candidates(&self, dirs: &[PathBuf]) -> Result<(u64, Vec<Doc<PcapFileRecord>>)> {
        let dir_clauses: Vec<serde_json::Value> = dirs
            .iter()
            .map(|d| json!({ "wildcard": { "name": format!("{}/*", d.display()) } }))
            .collect();
        let query = json!({
            "query": { "bool": {
                "filter": [
                    { "term": { "node": self.config.node } },
                    { "bool": { "should": dir_clauses, "minimum_should_match": 1 } }
                ],
                "must_not": [ { "term": { "locked": 1 } } ]
            }},
            "sort": [ { "first": { "order": "asc" } } ],
            "size": CANDIDATE_QUERY_SIZE,
        });
        let result = self.db.search::<PcapFileRecord>(FILES_INDEX, &query, None).await?;
        Ok((result.total, result.hits))
    }

    async fn expire_device(&self, dirs: &[PathBuf], free: u64, target: u64) -> Result<()> {
        let (device_file_count, candidates) = self.candidates(dirs).await?;
        let picked = plan_deletions(&candidates, device_file_count, free, target);
        if picked.is_empty() {
            tracing::warn!(
                "Free space below target but nothing deletable (locked files or {}-file floor)",
                MIN_FILES_PER_DEVICE
            );
            return Ok(());
        }
        for doc in picked {
            let file = &doc.source;
            match std::fs::remove_file(&file.name) {
                Ok(()) => {
                    tracing::info!("Expired {} ({} bytes)", file.name, file.filesize);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Already gone from disk; the row must go regardless
                    tracing::warn!("Expiring missing file {}", file.name);
                }
                Err(e) => {
                    tracing::error!("Failed to delete {}: {}", file.name, e);
                    continue;
                }
            }
            if let Err(e) = self.db.delete_doc(&doc.index, &doc.id, false).await {
                tracing::error!("Failed to remove file row {}: {}", doc.id, e);
            }
            self.pcap.evict(&file.node, file.num);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_doc(id: &str, filesize: u64, first: u64) -> Doc<PcapFileRecord> {
        Doc {
            index: "files".to_string(),
            id: id.to_string(),
            source: PcapFileRecord {
                num: 1,
                node: "cap01".to_string(),
                name: format!("/data/pcap/{}.pcap", id),
                filesize,
                locked: 0,
                first,
                encoding: None,
                extra: Default::default(),
            },
        }
    }

    #[test]
    fn test_plan_stops_at_target() {
        let candidates = vec![
            file_doc("a", 100, 1),
            file_doc("b", 100, 2),
            file_doc("c", 100, 3),
        ];
        // free 50, target 200: two deletions reach 250
        let picked = plan_deletions(&candidates, 100, 50, 200);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].id, "a");
        assert_eq!(picked[1].id, "b");
    }

    #[test]
    fn test_plan_honours_file_floor() {
        let candidates: Vec<_> = (0..20).map(|i| file_doc(&format!("f{}", i), 1, i)).collect();
        // 12 files on the device, huge deficit: only 2 may go
        let picked = plan_deletions(&candidates, 12, 0, u64::MAX);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn test_plan_noop_when_already_at_floor() {
        let candidates = vec![file_doc("a", 1, 1)];
        let picked = plan_deletions(&candidates, MIN_FILES_PER_DEVICE, 0, u64::MAX);
        assert!(picked.is_empty());
    }

    #[test]
    fn test_plan_noop_when_free_space_fine() {
        let candidates = vec![file_doc("a", 1, 1)];
        let picked = plan_deletions(&candidates, 100, 500, 200);
        assert!(picked.is_empty());
    }
}
