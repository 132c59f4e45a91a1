//! Three-pass destructive overwrite of packet payloads
//!
//! Scrubbing overwrites a packet's payload (and optionally its 16-byte
//! record header) in place with three fixed fill patterns. There is no
//! sync-after-write guarantee; the final pattern is what remains, so a
//! second scrub of the same packet leaves the file byte-identical.

use anyhow::Result;

use super::{PcapHandle, RECORD_HEADER_LEN};

/// The ASCII fill of the final pass, repeated to the payload length.
pub const SCRUB_TEXT: &[u8] = b"Scrubbed! Hoot! ";

/// Build one fill buffer of `len` bytes from a repeating pattern.
fn fill(pattern: &[u8], len: usize) -> Vec<u8> {
    pattern.iter().copied().cycle().take(len).collect()
}

/// Overwrite the packet at `offset` with the three passes. With
/// `also_header`, the record header is destroyed too; the payload length
/// is read before the first pass so later passes stay in bounds.
pub fn scrub_packet(handle: &PcapHandle, offset: u64, also_header: bool) -> Result<()> {
    let payload_len = handle.payload_len(offset)? as usize;
    let (start, len) = if also_header {
        (offset, RECORD_HEADER_LEN + payload_len)
    } else {
        (offset + RECORD_HEADER_LEN as u64, payload_len)
    };

    for pattern in [&[0x00u8][..], &[0x01u8][..], SCRUB_TEXT] {
        handle.write_at(start, &fill(pattern, len))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcap::testutil::write_pcap;
    use crate::pcap::OpenMode;

    #[test]
    fn test_fill_repeats_pattern() {
        assert_eq!(fill(&[0x00], 4), vec![0, 0, 0, 0]);
        assert_eq!(fill(b"ab", 5), b"ababa".to_vec());
    }

    #[test]
    fn test_scrub_overwrites_payload_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.pcap");
        let offsets = write_pcap(&path, &[b"sensitive payload bytes!", b"keep me"]);

        let handle = PcapHandle::open(&path, OpenMode::Write).unwrap();
        scrub_packet(&handle, offsets[0], false).unwrap();

        // Header is intact, payload is the final fill pattern
        let scrubbed = handle.read_packet(offsets[0]).unwrap();
        assert_eq!(scrubbed.incl_len, 24);
        assert_eq!(scrubbed.data, fill(SCRUB_TEXT, 24));

        // The neighbouring record is untouched
        let other = handle.read_packet(offsets[1]).unwrap();
        assert_eq!(other.data, b"keep me");
    }

    #[test]
    fn test_scrub_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.pcap");
        let offsets = write_pcap(&path, &[b"some payload worth hiding"]);

        let handle = PcapHandle::open(&path, OpenMode::Write).unwrap();
        scrub_packet(&handle, offsets[0], false).unwrap();
        let after_first = std::fs::read(&path).unwrap();

        scrub_packet(&handle, offsets[0], false).unwrap();
        let after_second = std::fs::read(&path).unwrap();
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn test_scrub_with_header_destroys_record_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.pcap");
        let offsets = write_pcap(&path, &[b"payload"]);

        let handle = PcapHandle::open(&path, OpenMode::Write).unwrap();
        scrub_packet(&handle, offsets[0], true).unwrap();

        let raw = std::fs::read(&path).unwrap();
        let start = offsets[0] as usize;
        let expected = fill(SCRUB_TEXT, RECORD_HEADER_LEN + 7);
        assert_eq!(&raw[start..start + RECORD_HEADER_LEN + 7], &expected[..]);
    }
}
