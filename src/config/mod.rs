//! Configuration for the viewer daemon
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (--config flag, or ~/.config/owlview/config.toml)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

// ─────────────────────────────────────────────────────────────────────────────
// Submodules
// ─────────────────────────────────────────────────────────────────────────────

mod clusters;
mod logging;

#[cfg(test)]
mod tests;

// ─────────────────────────────────────────────────────────────────────────────
// Re-exports (maintain public API)
// ─────────────────────────────────────────────────────────────────────────────

pub use clusters::RemoteCluster;
pub use logging::{FileLogging, LoggingConfig};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Free-space target for PCAP expiry: absolute gigabytes or a percentage
/// of the device's total capacity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FreeSpace {
    Gigabytes(f64),
    Percent(f64),
}

impl FreeSpace {
    /// Parse "600" (GB) or "5%" forms.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            pct.trim().parse().ok().map(FreeSpace::Percent)
        } else {
            s.parse().ok().map(FreeSpace::Gigabytes)
        }
    }

    /// Convert to a byte target given the device's total capacity.
    pub fn target_bytes(&self, total_bytes: u64) -> u64 {
        match self {
            FreeSpace::Gigabytes(g) => (g * 1_000_000_000.0) as u64,
            FreeSpace::Percent(p) => ((total_bytes as f64) * p / 100.0) as u64,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// This process's node name; sessions whose `node` matches are local
    pub node: String,

    /// Address to bind the HTTP API to (viewHost:viewPort)
    pub bind_addr: SocketAddr,

    /// Externally reachable URL other nodes use to proxy to this one.
    /// When unset, peers consult the fleet map instead.
    pub view_url: Option<String>,

    /// Elasticsearch base URL
    pub es_url: String,

    /// Secret for user password digests and the CSRF cookie token
    pub password_secret: String,

    /// Secret for node-to-node auth tokens (defaults to password_secret)
    pub server_secret: String,

    /// Realm string for HTTP digest authentication
    pub http_realm: String,

    /// Trusted header carrying the authenticated username (reverse-proxy auth)
    pub user_name_header: Option<String>,

    /// Additional header that must be present when user_name_header is used
    pub required_auth_header: Option<String>,

    /// Required value for `required_auth_header` (any value accepted if unset)
    pub required_auth_header_val: Option<String>,

    /// JSON template for auto-creating users seen via the username header
    pub user_auto_create_tmpl: Option<serde_json::Value>,

    /// X-Frame-Options policy: "deny", "sameorigin", or an allowed origin
    pub iframe: String,

    /// Emit a Strict-Transport-Security header on HTTPS deployments
    pub hsts_header: bool,

    /// TLS key file; HTTPS is enabled when both key and cert are present
    pub key_file: Option<PathBuf>,

    /// TLS certificate file
    pub cert_file: Option<PathBuf>,

    /// Local PCAP directories (config value is a semicolon-separated list)
    pub pcap_dirs: Vec<PathBuf>,

    /// How the capture process writes pcap; expiry only runs for the
    /// local-disk methods
    pub pcap_write_method: String,

    /// Free-space target driving PCAP expiry
    pub free_space_g: FreeSpace,

    /// Whether this process runs the hunt/cron singleton engines
    pub cron_queries: bool,

    /// Cron horizon in seconds: queries never read windows newer than
    /// now - cron_delay
    pub cron_delay: u64,

    /// Max sessions an admin hunt may scan
    pub hunt_admin_limit: u64,

    /// Max sessions a non-admin hunt may scan
    pub hunt_limit: u64,

    /// Session count above which hunt creation warns the user
    pub hunt_warn: u64,

    /// Multiple-ES mode: admin rights never fall back to createEnabled
    pub multi_es: bool,

    /// Users allowed on the ES admin endpoints
    pub es_admin_users: Vec<String>,

    /// Regression-test mode: anonymous auth, clean exit allowed
    pub regression_tests: bool,

    /// Remote clusters usable as forward targets, keyed by name
    pub remote_clusters: HashMap<String, RemoteCluster>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// HTTPS is derived from key+cert presence, never set directly.
    pub fn is_https(&self) -> bool {
        self.key_file.is_some() && self.cert_file.is_some()
    }

    /// The secret peers must sign with to reach this node.
    pub fn peer_secret(&self) -> &str {
        &self.server_secret
    }

    /// Whether pcap lands on this node's local disk (drives expiry).
    pub fn local_pcap(&self) -> bool {
        matches!(self.pcap_write_method.as_str(), "simple" | "simple-nodirect")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: "localhost".to_string(),
            bind_addr: "0.0.0.0:8005".parse().unwrap(),
            view_url: None,
            es_url: "http://localhost:9200".to_string(),
            password_secret: String::new(),
            server_secret: String::new(),
            http_realm: "Moloch".to_string(),
            user_name_header: None,
            required_auth_header: None,
            required_auth_header_val: None,
            user_auto_create_tmpl: None,
            iframe: "deny".to_string(),
            hsts_header: false,
            key_file: None,
            cert_file: None,
            pcap_dirs: vec![PathBuf::from("/opt/owlview/raw")],
            pcap_write_method: "simple".to_string(),
            free_space_g: FreeSpace::Percent(5.0),
            cron_queries: false,
            cron_delay: 90,
            hunt_admin_limit: 10_000_000,
            hunt_limit: 1_000_000,
            hunt_warn: 100_000,
            multi_es: false,
            es_admin_users: Vec::new(),
            regression_tests: false,
            remote_clusters: HashMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub node: Option<String>,
    pub view_host: Option<String>,
    pub view_port: Option<u16>,
    pub view_url: Option<String>,
    pub es_url: Option<String>,
    pub password_secret: Option<String>,
    pub server_secret: Option<String>,
    pub http_realm: Option<String>,
    pub user_name_header: Option<String>,
    pub required_auth_header: Option<String>,
    pub required_auth_header_val: Option<String>,
    pub user_auto_create_tmpl: Option<String>,
    pub iframe: Option<String>,
    pub hsts_header: Option<bool>,
    pub key_file: Option<String>,
    pub cert_file: Option<String>,
    /// Semicolon-separated directory list
    pub pcap_dir: Option<String>,
    pub pcap_write_method: Option<String>,
    /// "600" (GB) or "5%" of device capacity
    pub free_space_g: Option<String>,
    pub cron_queries: Option<bool>,
    pub cron_delay: Option<u64>,
    pub hunt_admin_limit: Option<u64>,
    pub hunt_limit: Option<u64>,
    pub hunt_warn: Option<u64>,
    pub multi_es: Option<bool>,
    /// Comma-separated user ids
    pub es_admin_users: Option<String>,
    pub regression_tests: Option<bool>,

    /// Optional [logging] section
    pub logging: Option<FileLogging>,

    /// Optional [remote-clusters.X] sections
    #[serde(default, rename = "remote-clusters")]
    pub remote_clusters: HashMap<String, RemoteCluster>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the default config file path: ~/.config/owlview/config.toml
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("owlview").join("config.toml"))
    }

    /// Load file config from an explicit path or the default location.
    ///
    /// # Panics
    /// If a config file exists but cannot be parsed. This is intentional -
    /// a broken config should fail fast with a clear error, not silently
    /// fall back to defaults while the user debugs the wrong thing.
    fn load_file_config(path: Option<&PathBuf>) -> FileConfig {
        let path = match path.cloned().or_else(Self::config_path) {
            Some(p) => p,
            None => return FileConfig::default(),
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to parse config file {}: {}", path.display(), e);
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("Cannot read config file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: file -> env vars -> defaults
    pub fn load(config_file: Option<&PathBuf>, node_override: Option<&str>) -> Self {
        let file = Self::load_file_config(config_file);
        let defaults = Config::default();

        // Node name: CLI > env > file > hostname-ish default
        let node = node_override
            .map(String::from)
            .or_else(|| std::env::var("OWLVIEW_NODE").ok())
            .or(file.node)
            .unwrap_or(defaults.node);

        // Bind address assembled from viewHost/viewPort
        let view_host = std::env::var("OWLVIEW_HOST")
            .ok()
            .or(file.view_host)
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let view_port = std::env::var("OWLVIEW_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.view_port)
            .unwrap_or(8005);
        let bind_addr = format!("{}:{}", view_host, view_port)
            .parse()
            .unwrap_or_else(|_| {
                eprintln!("Invalid viewHost/viewPort: {}:{}", view_host, view_port);
                std::process::exit(1);
            });

        // Elasticsearch URL: env > file > default
        let es_url = std::env::var("OWLVIEW_ES")
            .ok()
            .or(file.es_url)
            .unwrap_or(defaults.es_url);

        let password_secret = std::env::var("OWLVIEW_PASSWORD_SECRET")
            .ok()
            .or(file.password_secret)
            .unwrap_or_default();

        // Server secret defaults to the password secret
        let server_secret = std::env::var("OWLVIEW_SERVER_SECRET")
            .ok()
            .or(file.server_secret)
            .unwrap_or_else(|| password_secret.clone());

        let user_auto_create_tmpl = file
            .user_auto_create_tmpl
            .as_deref()
            .and_then(|t| serde_json::from_str(t).ok());

        let pcap_dirs = file
            .pcap_dir
            .as_deref()
            .map(|dirs| {
                dirs.split(';')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or(defaults.pcap_dirs);

        let free_space_g = file
            .free_space_g
            .as_deref()
            .and_then(FreeSpace::parse)
            .unwrap_or(defaults.free_space_g);

        let logging = LoggingConfig::from_file(file.logging);

        Self {
            node,
            bind_addr,
            view_url: file.view_url,
            es_url,
            password_secret,
            server_secret,
            http_realm: file.http_realm.unwrap_or(defaults.http_realm),
            user_name_header: file.user_name_header,
            required_auth_header: file.required_auth_header,
            required_auth_header_val: file.required_auth_header_val,
            user_auto_create_tmpl,
            iframe: file.iframe.unwrap_or(defaults.iframe),
            hsts_header: file.hsts_header.unwrap_or(false),
            key_file: file.key_file.map(PathBuf::from),
            cert_file: file.cert_file.map(PathBuf::from),
            pcap_dirs,
            pcap_write_method: file
                .pcap_write_method
                .unwrap_or(defaults.pcap_write_method),
            free_space_g,
            cron_queries: file.cron_queries.unwrap_or(false),
            cron_delay: file.cron_delay.unwrap_or(defaults.cron_delay),
            hunt_admin_limit: file.hunt_admin_limit.unwrap_or(defaults.hunt_admin_limit),
            hunt_limit: file.hunt_limit.unwrap_or(defaults.hunt_limit),
            hunt_warn: file.hunt_warn.unwrap_or(defaults.hunt_warn),
            multi_es: file.multi_es.unwrap_or(false),
            es_admin_users: file
                .es_admin_users
                .as_deref()
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|u| !u.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            regression_tests: file.regression_tests.unwrap_or(false),
            remote_clusters: file.remote_clusters,
            logging,
        }
    }
}
