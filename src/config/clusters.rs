//! Remote cluster configuration for the forward action
//!
//! A `[remote-clusters.<name>]` section names a cluster that cron queries
//! may forward matched sessions to. Secrets fall back to this process's
//! own secrets when unset.

use serde::Deserialize;

/// One forward-target cluster
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCluster {
    /// Base URL of the receiving cluster's viewer
    pub url: String,

    /// Secret used to sign `x-moloch-auth` for this cluster
    #[serde(default, rename = "server_secret")]
    pub server_secret: Option<String>,

    /// Password secret of the remote cluster (digest interop)
    #[serde(default, rename = "password_secret")]
    pub password_secret: Option<String>,
}

impl RemoteCluster {
    /// The signing secret for this cluster, falling back to ours.
    pub fn secret_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.server_secret.as_deref().unwrap_or(fallback)
    }
}
