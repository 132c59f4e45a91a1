//! Packet-content matching for hunts
//!
//! A hunt's search pattern is compiled once per job, then applied to the
//! session's packets in one of two modes: `raw` walks records in wire
//! order, `reassembled` walks direction-alternating payload chunks in
//! application order. Matching short-circuits on the first hit.
//!
//! The regex engine is finite-automaton based, so a hostile pattern
//! cannot backtrack catastrophically.

use anyhow::{bail, Context, Result};
use std::net::IpAddr;

use crate::pcap::decode::{self, DecodedPacket};
use crate::store::types::{HuntType, SearchType, Session};

// ─────────────────────────────────────────────────────────────────────────────
// Pattern compilation
// ─────────────────────────────────────────────────────────────────────────────

/// A compiled search predicate
pub enum CompiledPattern {
    /// ascii / asciicase substring; folded when insensitive
    Substring {
        needle: Vec<u8>,
        case_insensitive: bool,
    },
    /// Substring over the lowercase hex encoding
    HexSubstring { needle: String },
    /// Regex over the payload bytes
    Regex(regex::bytes::Regex),
    /// Regex over the lowercase hex encoding
    HexRegex(regex::Regex),
}

/// Compile a hunt's search pattern. A pattern that will never compile is
/// a terminal condition for the hunt (unrunnable).
pub fn compile_pattern(search_type: SearchType, search: &str) -> Result<CompiledPattern> {
    if search.is_empty() {
        bail!("Empty search pattern");
    }
    match search_type {
        SearchType::Ascii => Ok(CompiledPattern::Substring {
            needle: search.to_ascii_lowercase().into_bytes(),
            case_insensitive: true,
        }),
        SearchType::AsciiCase => Ok(CompiledPattern::Substring {
            needle: search.as_bytes().to_vec(),
            case_insensitive: false,
        }),
        SearchType::Hex => {
            let needle = search.to_ascii_lowercase();
            if !needle.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("Hex search contains non-hex characters");
            }
            Ok(CompiledPattern::HexSubstring { needle })
        }
        SearchType::Regex => Ok(CompiledPattern::Regex(
            regex::bytes::Regex::new(search).context("Bad search regex")?,
        )),
        SearchType::HexRegex => Ok(CompiledPattern::HexRegex(
            regex::Regex::new(&search.to_ascii_lowercase()).context("Bad hex search regex")?,
        )),
        // Globs translate to an equivalent regex
        SearchType::Wildcard => {
            let mut pattern = String::new();
            for c in search.chars() {
                match c {
                    '*' => pattern.push_str(".*"),
                    '?' => pattern.push('.'),
                    c => pattern.push_str(&regex::escape(&c.to_string())),
                }
            }
            Ok(CompiledPattern::Regex(
                regex::bytes::Regex::new(&pattern).context("Bad wildcard search")?,
            ))
        }
    }
}

impl CompiledPattern {
    /// Test one buffer against the predicate.
    pub fn matches(&self, data: &[u8]) -> bool {
        match self {
            CompiledPattern::Substring {
                needle,
                case_insensitive,
            } => {
                if needle.is_empty() || data.len() < needle.len() {
                    return false;
                }
                if *case_insensitive {
                    let hay = data.to_ascii_lowercase();
                    hay.windows(needle.len()).any(|w| w == &needle[..])
                } else {
                    data.windows(needle.len()).any(|w| w == &needle[..])
                }
            }
            CompiledPattern::HexSubstring { needle } => hex::encode(data).contains(needle),
            CompiledPattern::Regex(re) => re.is_match(data),
            CompiledPattern::HexRegex(re) => re.is_match(&hex::encode(data)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Direction classification
// ─────────────────────────────────────────────────────────────────────────────

/// Which side of the session a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
    Unknown,
}

/// The session's transport fingerprint
#[derive(Debug, Clone, Copy)]
pub struct Fingerprint {
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
}

impl Fingerprint {
    pub fn of(session: &Session) -> Option<Fingerprint> {
        Some(Fingerprint {
            src: session.src_ip.as_deref()?.parse().ok()?,
            src_port: session.src_port?,
            dst: session.dst_ip.as_deref()?.parse().ok()?,
            dst_port: session.dst_port?,
        })
    }

    /// Classify a decoded packet against this fingerprint.
    pub fn classify(&self, packet: &DecodedPacket) -> Direction {
        if packet.src == self.src
            && packet.src_port == self.src_port
            && packet.dst == self.dst
            && packet.dst_port == self.dst_port
        {
            Direction::ClientToServer
        } else if packet.src == self.dst
            && packet.src_port == self.dst_port
            && packet.dst == self.src
            && packet.dst_port == self.src_port
        {
            Direction::ServerToClient
        } else {
            Direction::Unknown
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session-level search
// ─────────────────────────────────────────────────────────────────────────────

/// Per-hunt matching options
pub struct SearchOptions {
    pub hunt_type: HuntType,
    pub src: bool,
    pub dst: bool,
    /// Byte cap for reassembled matching
    pub size: u64,
}

fn direction_enabled(opts: &SearchOptions, dir: Direction) -> bool {
    match dir {
        Direction::ClientToServer => opts.src,
        Direction::ServerToClient => opts.dst,
        // Packets we cannot classify are searched unless the hunt is
        // single-sided on purpose
        Direction::Unknown => opts.src && opts.dst,
    }
}

/// Search a session's packets. `packets` carries `(link_type, record
/// bytes)` in capture order. Returns true on the first matching packet or
/// reassembled chunk.
pub fn search_packets(
    session: &Session,
    packets: &[(u32, Vec<u8>)],
    pattern: &CompiledPattern,
    opts: &SearchOptions,
) -> bool {
    let fingerprint = Fingerprint::of(session);
    match opts.hunt_type {
        HuntType::Raw => search_raw(packets, pattern, opts, fingerprint),
        HuntType::Reassembled => search_reassembled(packets, pattern, opts, fingerprint),
    }
}

/// Wire order, whole record buffers. Direction only filters which records
/// are examined.
fn search_raw(
    packets: &[(u32, Vec<u8>)],
    pattern: &CompiledPattern,
    opts: &SearchOptions,
    fingerprint: Option<Fingerprint>,
) -> bool {
    for (link_type, data) in packets {
        if !(opts.src && opts.dst) {
            let dir = match (fingerprint, decode::decode(*link_type, data)) {
                (Some(fp), Some(decoded)) => fp.classify(&decoded),
                _ => Direction::Unknown,
            };
            if !direction_enabled(opts, dir) {
                continue;
            }
        }
        if pattern.matches(data) {
            return true;
        }
    }
    false
}

/// Application order: consecutive same-direction payloads merge into one
/// chunk, chunks alternate direction, total bytes are capped by the
/// hunt's size.
fn search_reassembled(
    packets: &[(u32, Vec<u8>)],
    pattern: &CompiledPattern,
    opts: &SearchOptions,
    fingerprint: Option<Fingerprint>,
) -> bool {
    let mut chunks: Vec<(Direction, Vec<u8>)> = Vec::new();
    let mut total = 0u64;

    'outer: for (link_type, data) in packets {
        let Some(decoded) = decode::decode(*link_type, data) else {
            continue;
        };
        let dir = fingerprint
            .map(|fp| fp.classify(&decoded))
            .unwrap_or(Direction::Unknown);
        let payload = decoded.payload(data);
        if payload.is_empty() {
            continue;
        }
        let mut take = payload;
        if total + take.len() as u64 > opts.size {
            take = &take[..(opts.size - total) as usize];
        }
        total += take.len() as u64;

        match chunks.last_mut() {
            Some((last_dir, chunk)) if *last_dir == dir => chunk.extend_from_slice(take),
            _ => chunks.push((dir, take.to_vec())),
        }
        if total >= opts.size {
            break 'outer;
        }
    }

    chunks
        .iter()
        .filter(|(dir, _)| direction_enabled(opts, *dir))
        .any(|(_, chunk)| pattern.matches(chunk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcap::decode::testutil::tcp_packet;
    use crate::pcap::decode::LINKTYPE_ETHERNET;

    fn session() -> Session {
        Session {
            src_ip: Some("10.0.0.1".to_string()),
            src_port: Some(40000),
            dst_ip: Some("10.0.0.2".to_string()),
            dst_port: Some(80),
            ..Default::default()
        }
    }

    fn c2s(payload: &[u8]) -> (u32, Vec<u8>) {
        (
            LINKTYPE_ETHERNET,
            tcp_packet([10, 0, 0, 1], 40000, [10, 0, 0, 2], 80, payload),
        )
    }

    fn s2c(payload: &[u8]) -> (u32, Vec<u8>) {
        (
            LINKTYPE_ETHERNET,
            tcp_packet([10, 0, 0, 2], 80, [10, 0, 0, 1], 40000, payload),
        )
    }

    fn opts(hunt_type: HuntType, src: bool, dst: bool) -> SearchOptions {
        SearchOptions {
            hunt_type,
            src,
            dst,
            size: 10_000,
        }
    }

    #[test]
    fn test_ascii_pattern_is_case_insensitive() {
        let p = compile_pattern(SearchType::Ascii, "GET /").unwrap();
        assert!(p.matches(b"xxget /index.htmlxx"));
        assert!(p.matches(b"GET / HTTP/1.1"));
        assert!(!p.matches(b"POST / HTTP/1.1"));
    }

    #[test]
    fn test_asciicase_pattern_is_exact() {
        let p = compile_pattern(SearchType::AsciiCase, "GET /").unwrap();
        assert!(p.matches(b"GET / HTTP/1.1"));
        assert!(!p.matches(b"get / http/1.1"));
    }

    #[test]
    fn test_hex_pattern_matches_encoding() {
        // "abc" = 616263
        let p = compile_pattern(SearchType::Hex, "616263").unwrap();
        assert!(p.matches(b"xabcx"));
        assert!(!p.matches(b"xyz"));
        // Uppercase hex digits in the pattern are folded
        let p = compile_pattern(SearchType::Hex, "61626A").unwrap();
        assert!(p.matches(b"abj"));
    }

    #[test]
    fn test_hex_pattern_rejects_non_hex() {
        assert!(compile_pattern(SearchType::Hex, "61626g").is_err());
    }

    #[test]
    fn test_regex_pattern() {
        let p = compile_pattern(SearchType::Regex, r"GET /[a-z]+\.php").unwrap();
        assert!(p.matches(b"GET /admin.php HTTP/1.1"));
        assert!(!p.matches(b"GET /admin.html HTTP/1.1"));
        assert!(compile_pattern(SearchType::Regex, "[unclosed").is_err());
    }

    #[test]
    fn test_hexregex_pattern() {
        let p = compile_pattern(SearchType::HexRegex, "6162(63)+").unwrap();
        assert!(p.matches(b"xabccc!"));
        assert!(!p.matches(b"ab"));
    }

    #[test]
    fn test_wildcard_pattern() {
        let p = compile_pattern(SearchType::Wildcard, "GET /*.php").unwrap();
        assert!(p.matches(b"GET /admin.php"));
        assert!(!p.matches(b"GET /admin.html"));
    }

    #[test]
    fn test_raw_search_direction_filter() {
        let packets = vec![c2s(b"GET / HTTP/1.1"), s2c(b"HTTP/1.1 200 OK")];
        let p = compile_pattern(SearchType::Ascii, "200 OK").unwrap();

        // dst-only sees the server bytes
        assert!(search_packets(
            &session(),
            &packets,
            &p,
            &opts(HuntType::Raw, false, true)
        ));
        // src-only does not
        assert!(!search_packets(
            &session(),
            &packets,
            &p,
            &opts(HuntType::Raw, true, false)
        ));
    }

    #[test]
    fn test_raw_search_both_directions_matches_whole_record() {
        let packets = vec![c2s(b"hello")];
        // With both sides enabled the raw record (headers included) is the
        // haystack, so header bytes are fair game
        let p = compile_pattern(SearchType::Hex, "0800").unwrap();
        assert!(search_packets(
            &session(),
            &packets,
            &p,
            &opts(HuntType::Raw, true, true)
        ));
    }

    #[test]
    fn test_reassembled_search_merges_chunks() {
        // The needle spans two consecutive client packets
        let packets = vec![c2s(b"GET /in"), c2s(b"dex.html"), s2c(b"HTTP/1.1 200")];
        let p = compile_pattern(SearchType::Ascii, "/index.html").unwrap();
        assert!(search_packets(
            &session(),
            &packets,
            &p,
            &opts(HuntType::Reassembled, true, false)
        ));
        // Raw mode cannot see across the packet boundary
        assert!(!search_packets(
            &session(),
            &packets,
            &p,
            &opts(HuntType::Raw, true, false)
        ));
    }

    #[test]
    fn test_reassembled_search_respects_size_cap() {
        let packets = vec![c2s(b"AAAAAAAAAA"), c2s(b"needle")];
        let p = compile_pattern(SearchType::Ascii, "needle").unwrap();
        let mut o = opts(HuntType::Reassembled, true, true);
        o.size = 10; // cap ends before the needle arrives
        assert!(!search_packets(&session(), &packets, &p, &o));
        o.size = 16;
        assert!(search_packets(&session(), &packets, &p, &o));
    }

    #[test]
    fn test_reassembled_direction_chunks_alternate() {
        let packets = vec![c2s(b"one"), s2c(b"two"), c2s(b"three")];
        let p = compile_pattern(SearchType::Ascii, "two").unwrap();
        // server-side text is invisible to a src-only hunt
        assert!(!search_packets(
            &session(),
            &packets,
            &p,
            &opts(HuntType::Reassembled, true, false)
        ));
        assert!(search_packets(
            &session(),
            &packets,
            &p,
            &opts(HuntType::Reassembled, false, true)
        ));
    }
}
