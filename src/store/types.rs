//! Typed documents for the Elasticsearch indices
//!
//! Hunt, cron, user and session documents are free-form bags in the index;
//! here they are tagged structs with optional fields plus a flattened
//! `extra` map, so unknown keys written by other fleet versions survive a
//! read-modify-write cycle.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Index names
// ─────────────────────────────────────────────────────────────────────────────

pub const SESSIONS_INDEX: &str = "sessions2-*";
pub const HUNTS_INDEX: &str = "hunts";
pub const QUERIES_INDEX: &str = "queries";
pub const USERS_INDEX: &str = "users";
pub const FILES_INDEX: &str = "files";
pub const LOOKUPS_INDEX: &str = "lookups";
pub const HISTORY_INDEX: &str = "history";
pub const NODES_INDEX: &str = "nodes";
pub const NOTIFIERS_INDEX: &str = "notifiers";

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// A session document. Created by the capture process; this system reads
/// it and mutates tags/hunt fields only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    /// Owning node; every PCAP byte referenced by `packet_pos` lives there
    #[serde(default)]
    pub node: String,

    /// First packet time, ms since epoch
    #[serde(default, rename = "firstPacket")]
    pub first_packet: u64,

    /// Last packet time, ms since epoch
    #[serde(default, rename = "lastPacket")]
    pub last_packet: u64,

    /// File numbers this session's packets live in
    #[serde(default, rename = "fileId")]
    pub file_id: Vec<i64>,

    /// Byte offsets of packets; a leading negative entry encodes the file
    /// number for the positive offsets that follow it
    #[serde(default, rename = "packetPos")]
    pub packet_pos: Vec<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, rename = "huntId", skip_serializing_if = "Vec::is_empty")]
    pub hunt_id: Vec<String>,

    #[serde(default, rename = "huntName", skip_serializing_if = "Vec::is_empty")]
    pub hunt_name: Vec<String>,

    /// Session fingerprint, used to classify packet direction
    #[serde(default, rename = "srcIp", skip_serializing_if = "Option::is_none")]
    pub src_ip: Option<String>,
    #[serde(default, rename = "srcPort", skip_serializing_if = "Option::is_none")]
    pub src_port: Option<u16>,
    #[serde(default, rename = "dstIp", skip_serializing_if = "Option::is_none")]
    pub dst_ip: Option<String>,
    #[serde(default, rename = "dstPort", skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,

    /// Protocol and any other capture-written fields, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Session {
    /// Iterate `packet_pos` as `(file_num, offset)` pairs. A negative entry
    /// switches the current file for all following positive offsets; before
    /// the first negative entry, the first `file_id` entry applies.
    pub fn packet_locations(&self) -> Vec<(i64, u64)> {
        let mut current_file = self.file_id.first().copied().unwrap_or(0);
        let mut out = Vec::with_capacity(self.packet_pos.len());
        for &pos in &self.packet_pos {
            if pos < 0 {
                current_file = -pos;
            } else {
                out.push((current_file, pos as u64));
            }
        }
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hunt
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HuntStatus {
    Queued,
    Running,
    Paused,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HuntType {
    Raw,
    Reassembled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Ascii,
    AsciiCase,
    Hex,
    Regex,
    HexRegex,
    Wildcard,
}

/// The session query bounds for a hunt
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HuntQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    /// Seconds since epoch
    #[serde(default, rename = "startTime")]
    pub start_time: u64,

    /// Seconds since epoch
    #[serde(default, rename = "stopTime")]
    pub stop_time: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
}

/// One captured hunt error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuntError {
    pub value: String,
    pub time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

/// A packet-hunt job document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hunt {
    pub name: String,

    #[serde(rename = "userId")]
    pub user_id: String,

    /// Extra users allowed to see this hunt
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,

    pub status: HuntStatus,

    pub query: HuntQuery,

    /// Match client-to-server bytes
    pub src: bool,
    /// Match server-to-client bytes
    pub dst: bool,

    #[serde(rename = "type")]
    pub hunt_type: HuntType,

    #[serde(rename = "searchType")]
    pub search_type: SearchType,

    pub search: String,

    /// Max bytes examined per session in reassembled mode
    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifier: Option<String>,

    #[serde(default, rename = "totalSessions")]
    pub total_sessions: u64,

    #[serde(default, rename = "searchedSessions")]
    pub searched_sessions: u64,

    #[serde(default, rename = "matchedSessions")]
    pub matched_sessions: u64,

    /// Resume point: lastPacket (ms) of the newest scanned session
    #[serde(default, rename = "lastPacketTime", skip_serializing_if = "Option::is_none")]
    pub last_packet_time: Option<u64>,

    #[serde(default, rename = "failedSessionIds", skip_serializing_if = "Vec::is_empty")]
    pub failed_session_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<HuntError>,

    /// Latched on expression/pattern compile failure; never auto-resumes
    #[serde(default)]
    pub unrunnable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<u64>,

    #[serde(default, rename = "lastUpdated")]
    pub last_updated: u64,

    #[serde(default)]
    pub created: u64,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The listing view of a hunt for users outside its creator/users/admin
/// circle: `search`, `searchType` and `userId` are blanked to empty
/// strings and `query` is absent from the JSON altogether. Everything
/// else (status, counters, timestamps, unknown keys) passes through.
#[derive(Debug, Clone, Serialize)]
pub struct RedactedHunt {
    pub name: String,

    #[serde(rename = "userId")]
    pub user_id: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,

    pub status: HuntStatus,

    pub src: bool,
    pub dst: bool,

    #[serde(rename = "type")]
    pub hunt_type: HuntType,

    /// Blanked: carries no signal about the real search type
    #[serde(rename = "searchType")]
    pub search_type: String,

    pub search: String,

    pub size: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notifier: Option<String>,

    #[serde(rename = "totalSessions")]
    pub total_sessions: u64,

    #[serde(rename = "searchedSessions")]
    pub searched_sessions: u64,

    #[serde(rename = "matchedSessions")]
    pub matched_sessions: u64,

    #[serde(rename = "lastPacketTime", skip_serializing_if = "Option::is_none")]
    pub last_packet_time: Option<u64>,

    #[serde(rename = "failedSessionIds", skip_serializing_if = "Vec::is_empty")]
    pub failed_session_ids: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<HuntError>,

    pub unrunnable: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<u64>,

    #[serde(rename = "lastUpdated")]
    pub last_updated: u64,

    pub created: u64,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Hunt {
    /// Whether `user` may see this hunt unredacted.
    pub fn visible_to(&self, user: &User) -> bool {
        user.create_enabled
            || self.user_id == user.user_id
            || self.users.iter().any(|u| u == &user.user_id)
    }

    /// Redacted view for non-authorized listers: `search`, `searchType`
    /// and `userId` blanked, `query` removed.
    pub fn redacted(&self) -> RedactedHunt {
        RedactedHunt {
            name: self.name.clone(),
            user_id: String::new(),
            users: self.users.clone(),
            status: self.status,
            src: self.src,
            dst: self.dst,
            hunt_type: self.hunt_type,
            search_type: String::new(),
            search: String::new(),
            size: self.size,
            notifier: self.notifier.clone(),
            total_sessions: self.total_sessions,
            searched_sessions: self.searched_sessions,
            matched_sessions: self.matched_sessions,
            last_packet_time: self.last_packet_time,
            failed_session_ids: self.failed_session_ids.clone(),
            errors: self.errors.clone(),
            unrunnable: self.unrunnable,
            started: self.started,
            last_updated: self.last_updated,
            created: self.created,
            extra: self.extra.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cron query
// ─────────────────────────────────────────────────────────────────────────────

/// What a cron query does with its matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronAction {
    Tag,
    Forward(String),
}

impl CronAction {
    /// Parse the stored action string: "tag" or "forward:<cluster>".
    pub fn parse(action: &str) -> Option<CronAction> {
        if action == "tag" {
            Some(CronAction::Tag)
        } else {
            action
                .strip_prefix("forward:")
                .map(|c| CronAction::Forward(c.to_string()))
        }
    }
}

/// A repeating time-windowed query document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronQuery {
    pub creator: String,
    pub enabled: bool,
    pub name: String,
    pub query: String,

    /// Comma-delimited tags applied by the tag action
    #[serde(default)]
    pub tags: String,

    /// "tag" or "forward:<cluster>"
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifier: Option<String>,

    /// Low watermark: greatest lastPacket second already processed
    #[serde(default, rename = "lpValue")]
    pub lp_value: u64,

    #[serde(default, rename = "lastRun")]
    pub last_run: u64,

    #[serde(default)]
    pub count: u64,

    #[serde(default, rename = "lastNotified")]
    pub last_notified: u64,

    #[serde(default, rename = "lastNotifiedCount")]
    pub last_notified_count: u64,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// User
// ─────────────────────────────────────────────────────────────────────────────

/// A user document; CRUD is external, this system reads it for auth and
/// permission gates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "userId")]
    pub user_id: String,

    #[serde(default, rename = "userName", skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,

    #[serde(default)]
    pub enabled: bool,

    /// Admin flag: user management, unredacted hunts, ES admin
    #[serde(default, rename = "createEnabled")]
    pub create_enabled: bool,

    #[serde(default, rename = "webEnabled")]
    pub web_enabled: bool,

    #[serde(default, rename = "headerAuthEnabled")]
    pub header_auth_enabled: bool,

    #[serde(default, rename = "removeEnabled")]
    pub remove_enabled: bool,

    #[serde(default, rename = "packetSearch")]
    pub packet_search: bool,

    #[serde(default, rename = "hideStats")]
    pub hide_stats: bool,

    #[serde(default, rename = "hideFiles")]
    pub hide_files: bool,

    #[serde(default, rename = "disablePcapDownload")]
    pub disable_pcap_download: bool,

    #[serde(default, rename = "emailSearch")]
    pub email_search: bool,

    /// HA1 digest (md5(user:realm:pass)); plaintext never stored
    #[serde(default, rename = "passStore", skip_serializing_if = "Option::is_none")]
    pub pass_store: Option<String>,

    /// Forced expression ANDed into every query this user runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    /// Max query range in hours
    #[serde(default, rename = "timeLimit", skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<u64>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub settings: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub views: Map<String, Value>,

    #[serde(default, rename = "columnConfigs", skip_serializing_if = "Vec::is_empty")]
    pub column_configs: Vec<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Files, nodes, history, lookups
// ─────────────────────────────────────────────────────────────────────────────

/// A PCAP file row in the files index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcapFileRecord {
    pub num: i64,
    pub node: String,

    /// Absolute path on the owning node
    pub name: String,

    #[serde(default, rename = "filesize")]
    pub filesize: u64,

    /// Locked files are never expired
    #[serde(default)]
    pub locked: i64,

    /// First packet second in this file; expiry deletes oldest-first
    #[serde(default)]
    pub first: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A fleet-map row: where to reach a node's viewer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(rename = "nodeName")]
    pub node_name: String,

    #[serde(default, rename = "viewUrl", skip_serializing_if = "Option::is_none")]
    pub view_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, rename = "viewPort", skip_serializing_if = "Option::is_none")]
    pub view_port: Option<u16>,

    /// "http" or "https"; together with hostname/viewPort forms the URL
    /// when viewUrl is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeInfo {
    /// Resolve the base URL for proxying to this node.
    pub fn url(&self) -> Option<String> {
        if let Some(url) = &self.view_url {
            return Some(url.trim_end_matches('/').to_string());
        }
        let host = self.hostname.as_deref()?;
        let scheme = self.scheme.as_deref().unwrap_or("http");
        let port = self.view_port.unwrap_or(8005);
        Some(format!("{}://{}:{}", scheme, host, port))
    }
}

/// One append-only history row, written per authenticated request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: u64,

    #[serde(rename = "userId")]
    pub user_id: String,

    pub api: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Request body with password fields scrubbed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    #[serde(default, rename = "queryTime")]
    pub query_time: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<u64>,

    #[serde(default, rename = "recordsReturned", skip_serializing_if = "Option::is_none")]
    pub records_returned: Option<u64>,

    #[serde(default, rename = "recordsFiltered", skip_serializing_if = "Option::is_none")]
    pub records_filtered: Option<u64>,

    #[serde(default, rename = "recordsTotal", skip_serializing_if = "Option::is_none")]
    pub records_total: Option<u64>,
}

/// A named shortcut (lookup table) usable from expressions as `$name`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lookup {
    pub name: String,

    #[serde(rename = "userId")]
    pub user_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,

    #[serde(default)]
    pub shared: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A named notifier resolving to a webhook URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notifier {
    pub name: String,

    pub url: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_locations_single_file() {
        let session = Session {
            file_id: vec![12],
            packet_pos: vec![24, 120, 4096],
            ..Default::default()
        };
        assert_eq!(
            session.packet_locations(),
            vec![(12, 24), (12, 120), (12, 4096)]
        );
    }

    #[test]
    fn test_packet_locations_file_switch() {
        // A leading negative entry selects the file for following offsets
        let session = Session {
            file_id: vec![3, 4],
            packet_pos: vec![-3, 24, 120, -4, 24, 512],
            ..Default::default()
        };
        assert_eq!(
            session.packet_locations(),
            vec![(3, 24), (3, 120), (4, 24), (4, 512)]
        );
    }

    #[test]
    fn test_hunt_status_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&HuntStatus::Running).unwrap(),
            "\"running\""
        );
        let status: HuntStatus = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(status, HuntStatus::Paused);
    }

    #[test]
    fn test_search_type_serde_names() {
        assert_eq!(
            serde_json::to_string(&SearchType::AsciiCase).unwrap(),
            "\"asciicase\""
        );
        assert_eq!(
            serde_json::to_string(&SearchType::HexRegex).unwrap(),
            "\"hexregex\""
        );
    }

    #[test]
    fn test_cron_action_parse() {
        assert_eq!(CronAction::parse("tag"), Some(CronAction::Tag));
        assert_eq!(
            CronAction::parse("forward:remoteA"),
            Some(CronAction::Forward("remoteA".to_string()))
        );
        assert_eq!(CronAction::parse("bogus"), None);
    }

    #[test]
    fn test_hunt_roundtrip_preserves_unknown_keys() {
        let raw = serde_json::json!({
            "name": "h1",
            "userId": "alice",
            "status": "queued",
            "query": {"startTime": 1000, "stopTime": 2000},
            "src": true,
            "dst": false,
            "type": "reassembled",
            "searchType": "ascii",
            "search": "GET /",
            "size": 10000,
            "futureField": {"added": "by a newer fleet version"}
        });
        let hunt: Hunt = serde_json::from_value(raw.clone()).unwrap();
        assert!(hunt.extra.contains_key("futureField"));
        let back = serde_json::to_value(&hunt).unwrap();
        assert_eq!(back["futureField"], raw["futureField"]);
        assert_eq!(back["type"], "reassembled");
    }

    #[test]
    fn test_hunt_redacted_blanks_search_fields_on_the_wire() {
        let hunt: Hunt = serde_json::from_value(serde_json::json!({
            "name": "h1",
            "userId": "alice",
            "status": "running",
            "query": {"expression": "ip.src == 10.0.0.1", "startTime": 1, "stopTime": 2},
            "src": true, "dst": true,
            "type": "raw",
            "searchType": "regex",
            "search": "secret.*pattern",
            "size": 50,
            "matchedSessions": 3
        }))
        .unwrap();

        let wire = serde_json::to_value(hunt.redacted()).unwrap();

        // query is removed outright, not emptied
        assert!(wire.get("query").is_none());
        // the blanked fields are blank strings, never a real variant
        assert_eq!(wire["search"], "");
        assert_eq!(wire["searchType"], "");
        assert_eq!(wire["userId"], "");
        // everything else passes through
        assert_eq!(wire["name"], "h1");
        assert_eq!(wire["type"], "raw");
        assert_eq!(wire["matchedSessions"], 3);
    }

    #[test]
    fn test_hunt_visible_to_creator_users_and_admins() {
        let hunt: Hunt = serde_json::from_value(serde_json::json!({
            "name": "h", "userId": "alice", "users": ["bob"],
            "status": "queued", "query": {"startTime": 0, "stopTime": 1},
            "src": true, "dst": true, "type": "raw",
            "searchType": "ascii", "search": "x", "size": 10
        }))
        .unwrap();

        let mut user = User {
            user_id: "alice".to_string(),
            ..Default::default()
        };
        assert!(hunt.visible_to(&user));

        user.user_id = "bob".to_string();
        assert!(hunt.visible_to(&user));

        user.user_id = "carol".to_string();
        assert!(!hunt.visible_to(&user));

        user.create_enabled = true;
        assert!(hunt.visible_to(&user));
    }

    #[test]
    fn test_node_info_url_resolution() {
        let with_url: NodeInfo = serde_json::from_value(serde_json::json!({
            "nodeName": "cap01",
            "viewUrl": "https://cap01.example.com:8005/"
        }))
        .unwrap();
        assert_eq!(
            with_url.url().as_deref(),
            Some("https://cap01.example.com:8005")
        );

        let assembled: NodeInfo = serde_json::from_value(serde_json::json!({
            "nodeName": "cap02",
            "hostname": "cap02.example.com",
            "scheme": "https",
            "viewPort": 8123
        }))
        .unwrap();
        assert_eq!(
            assembled.url().as_deref(),
            Some("https://cap02.example.com:8123")
        );
    }
}
