//! PCAP file access
//!
//! Opens capture files by `(node, fileNum)` through the files index,
//! reads packet records by absolute byte offset, and caches open handles.
//! Write handles live under a distinct cache key so a scrub never shares a
//! handle with concurrent readers.

pub mod decode;
pub mod scrub;

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::store::types::{PcapFileRecord, FILES_INDEX};
use crate::store::Db;

/// Classic pcap global header length
pub const GLOBAL_HEADER_LEN: usize = 24;
/// Per-record header length
pub const RECORD_HEADER_LEN: usize = 16;

/// Largest record payload we will read; anything bigger means the offset
/// points at garbage (snaplen-scale captures stay far below this)
const MAX_RECORD_LEN: u32 = 0x0400_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    Read,
    Write,
}

/// One packet record read from disk
#[derive(Debug)]
pub struct PacketRecord {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub incl_len: u32,
    pub orig_len: u32,
    pub data: Vec<u8>,
}

/// An open capture file
pub struct PcapHandle {
    pub path: PathBuf,
    file: std::fs::File,
    /// Record headers use the byte order declared by the file magic
    pub big_endian: bool,
    /// Link-layer type from the global header (1 = Ethernet, 101 = raw IP)
    pub link_type: u32,
}

impl PcapHandle {
    pub(crate) fn open(path: &PathBuf, mode: OpenMode) -> Result<Self> {
        let file = match mode {
            OpenMode::Read => OpenOptions::new().read(true).open(path),
            OpenMode::Write => OpenOptions::new().read(true).write(true).open(path),
        }
        .with_context(|| format!("Failed to open {}", path.display()))?;

        let mut header = [0u8; GLOBAL_HEADER_LEN];
        file.read_exact_at(&mut header, 0)
            .with_context(|| format!("Failed to read pcap header of {}", path.display()))?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let big_endian = match magic {
            0xa1b2_c3d4 | 0xa1b2_3c4d => false,
            0xd4c3_b2a1 | 0x4d3c_b2a1 => true,
            other => bail!("{} is not a pcap file (magic {:08x})", path.display(), other),
        };
        let link_type = if big_endian {
            u32::from_be_bytes([header[20], header[21], header[22], header[23]])
        } else {
            u32::from_le_bytes([header[20], header[21], header[22], header[23]])
        };
        Ok(Self {
            path: path.clone(),
            file,
            big_endian,
            link_type,
        })
    }

    fn u32_at(&self, buf: &[u8], at: usize) -> u32 {
        let b = [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];
        if self.big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        }
    }

    /// Read the record at an absolute byte offset.
    pub fn read_packet(&self, offset: u64) -> Result<PacketRecord> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        self.file
            .read_exact_at(&mut header, offset)
            .with_context(|| format!("Short read at {} in {}", offset, self.path.display()))?;
        let incl_len = self.u32_at(&header, 8);
        if incl_len > MAX_RECORD_LEN {
            bail!(
                "Record at {} in {} has impossible length {}",
                offset,
                self.path.display(),
                incl_len
            );
        }
        let mut data = vec![0u8; incl_len as usize];
        self.file
            .read_exact_at(&mut data, offset + RECORD_HEADER_LEN as u64)
            .with_context(|| format!("Short payload at {} in {}", offset, self.path.display()))?;
        Ok(PacketRecord {
            ts_sec: self.u32_at(&header, 0),
            ts_usec: self.u32_at(&header, 4),
            incl_len,
            orig_len: self.u32_at(&header, 12),
            data,
        })
    }

    /// Read the 24-byte global header (needed when re-framing packets for
    /// a forward operation).
    pub fn global_header(&self) -> Result<[u8; GLOBAL_HEADER_LEN]> {
        let mut header = [0u8; GLOBAL_HEADER_LEN];
        self.file
            .read_exact_at(&mut header, 0)
            .context("Failed to read pcap global header")?;
        Ok(header)
    }

    /// Read the raw record (header + payload) for copy-out.
    pub fn read_raw_record(&self, offset: u64) -> Result<Vec<u8>> {
        let packet = self.read_packet(offset)?;
        let mut header = [0u8; RECORD_HEADER_LEN];
        self.file.read_exact_at(&mut header, offset)?;
        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + packet.data.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&packet.data);
        Ok(out)
    }

    /// Length of the payload at `offset` without reading it.
    pub fn payload_len(&self, offset: u64) -> Result<u32> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        self.file
            .read_exact_at(&mut header, offset)
            .with_context(|| format!("Short read at {} in {}", offset, self.path.display()))?;
        let incl_len = self.u32_at(&header, 8);
        if incl_len > MAX_RECORD_LEN {
            bail!("Record at {} has impossible length {}", offset, incl_len);
        }
        Ok(incl_len)
    }

    /// Overwrite bytes in place (scrub passes).
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .write_all_at(data, offset)
            .with_context(|| format!("Write failed at {} in {}", offset, self.path.display()))
    }
}

/// Handle cache keyed by `(mode, node, fileNum)`
pub struct PcapStore {
    db: Arc<Db>,
    handles: Mutex<HashMap<String, Arc<PcapHandle>>>,
}

impl PcapStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// The cache key; write handles get their own key space.
    fn cache_key(mode: OpenMode, node: &str, file_num: i64) -> String {
        match mode {
            OpenMode::Read => format!("{}:{}", node, file_num),
            OpenMode::Write => format!("write:{}:{}", node, file_num),
        }
    }

    /// Resolve the on-disk path of `(node, fileNum)` via the files index.
    pub async fn file_record(&self, node: &str, file_num: i64) -> Result<PcapFileRecord> {
        let query = json!({
            "query": { "bool": { "filter": [
                { "term": { "node": node } },
                { "term": { "num": file_num } }
            ]}},
            "size": 1,
        });
        let mut result = self
            .db
            .search::<PcapFileRecord>(FILES_INDEX, &query, None)
            .await?;
        result
            .hits
            .pop()
            .map(|d| d.source)
            .with_context(|| format!("No file {} on node {}", file_num, node))
    }

    /// Open (or reuse) a handle for `(mode, node, fileNum)`.
    pub async fn open(&self, mode: OpenMode, node: &str, file_num: i64) -> Result<Arc<PcapHandle>> {
        let key = Self::cache_key(mode, node, file_num);
        if let Some(handle) = self
            .handles
            .lock()
            .expect("pcap cache lock poisoned")
            .get(&key)
        {
            return Ok(handle.clone());
        }

        let record = self.file_record(node, file_num).await?;
        if record.encoding.as_deref().is_some_and(|e| e != "normal") {
            bail!(
                "Unsupported encoding {:?} for {}",
                record.encoding,
                record.name
            );
        }
        let path = PathBuf::from(&record.name);
        let handle = Arc::new(PcapHandle::open(&path, mode)?);
        self.handles
            .lock()
            .expect("pcap cache lock poisoned")
            .insert(key, handle.clone());
        Ok(handle)
    }

    /// Drop cached handles for a file (after scrub or expiry).
    pub fn evict(&self, node: &str, file_num: i64) {
        let mut handles = self.handles.lock().expect("pcap cache lock poisoned");
        handles.remove(&Self::cache_key(OpenMode::Read, node, file_num));
        handles.remove(&Self::cache_key(OpenMode::Write, node, file_num));
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::io::Write;

    /// Write a minimal little-endian pcap file with the given payloads,
    /// returning the absolute offset of each record.
    pub fn write_pcap(path: &std::path::Path, payloads: &[&[u8]]) -> Vec<u64> {
        let mut file = std::fs::File::create(path).unwrap();
        let mut header = Vec::new();
        header.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes()); // magic
        header.extend_from_slice(&2u16.to_le_bytes()); // major
        header.extend_from_slice(&4u16.to_le_bytes()); // minor
        header.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        header.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        header.extend_from_slice(&65535u32.to_le_bytes()); // snaplen
        header.extend_from_slice(&1u32.to_le_bytes()); // linktype ethernet
        file.write_all(&header).unwrap();

        let mut offsets = Vec::new();
        let mut pos = GLOBAL_HEADER_LEN as u64;
        for (i, payload) in payloads.iter().enumerate() {
            offsets.push(pos);
            let mut rec = Vec::new();
            rec.extend_from_slice(&(1000 + i as u32).to_le_bytes()); // ts_sec
            rec.extend_from_slice(&0u32.to_le_bytes()); // ts_usec
            rec.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            rec.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            rec.extend_from_slice(payload);
            file.write_all(&rec).unwrap();
            pos += (RECORD_HEADER_LEN + payload.len()) as u64;
        }
        offsets
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::write_pcap;
    use super::*;

    #[test]
    fn test_read_packet_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.pcap");
        let offsets = write_pcap(&path, &[b"first packet", b"second"]);

        let handle = PcapHandle::open(&path, OpenMode::Read).unwrap();
        assert!(!handle.big_endian);
        assert_eq!(handle.link_type, 1);

        let p0 = handle.read_packet(offsets[0]).unwrap();
        assert_eq!(p0.data, b"first packet");
        assert_eq!(p0.incl_len, 12);
        assert_eq!(p0.ts_sec, 1000);

        let p1 = handle.read_packet(offsets[1]).unwrap();
        assert_eq!(p1.data, b"second");
        assert_eq!(p1.ts_sec, 1001);
    }

    #[test]
    fn test_open_rejects_non_pcap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not.pcap");
        std::fs::write(&path, b"this is not a capture file at all!").unwrap();
        assert!(PcapHandle::open(&path, OpenMode::Read).is_err());
    }

    #[test]
    fn test_read_raw_record_includes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.pcap");
        let offsets = write_pcap(&path, &[b"abc"]);
        let handle = PcapHandle::open(&path, OpenMode::Read).unwrap();
        let raw = handle.read_raw_record(offsets[0]).unwrap();
        assert_eq!(raw.len(), RECORD_HEADER_LEN + 3);
        assert_eq!(&raw[RECORD_HEADER_LEN..], b"abc");
    }

    #[test]
    fn test_cache_key_write_prefix() {
        assert_eq!(PcapStore::cache_key(OpenMode::Read, "cap01", 7), "cap01:7");
        assert_eq!(
            PcapStore::cache_key(OpenMode::Write, "cap01", 7),
            "write:cap01:7"
        );
    }
}
