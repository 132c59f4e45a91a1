// owlview - per-node viewer for a network-forensics capture fleet
//
// Each capture node runs one of these daemons: an HTTP API over the
// Elasticsearch session index and the node's local pcap files.
//
// Architecture:
// - HTTP front (axum): auth chain, permission gates, session/hunt/cron API
// - Cluster routing: requests for sessions owned elsewhere proxy to the
//   owner with signed peer tokens
// - Hunt engine: singleton fleet-wide packet-search jobs
// - Cron engine: singleton time-windowed queries with tag/forward actions
// - Expiry engine: free-space-driven pcap deletion on local-disk nodes

mod auth;
mod cli;
mod cluster;
mod config;
mod cron;
mod expiry;
mod expression;
mod hunt;
mod notifier;
mod pcap;
mod server;
mod store;
mod util;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use auth::AuthCtx;
use cluster::ClusterCtx;
use config::Config;
use cron::CronEngine;
use expiry::ExpiryEngine;
use hunt::HuntEngine;
use notifier::Alerts;
use pcap::PcapStore;
use store::Db;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    if cli::handle_cli(&args) {
        return Ok(());
    }

    let config = Arc::new(Config::load(args.config.as_ref(), args.node.as_deref()));

    // Precedence: RUST_LOG env var > config file level > "info"
    let default_filter = format!("owlview={},axum=info", config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    // File logging keeps its guard alive for the process lifetime
    let _appender_guard = if let Some(dir) = &config.logging.dir {
        let appender = tracing_appender::rolling::daily(dir, "owlview.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        if config.logging.json {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(writer))
                .init();
        }
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        None
    };

    tracing::info!(
        "owlview {} starting as node {} (cron={}, https={})",
        config::VERSION,
        config.node,
        config.cron_queries,
        config.is_https()
    );

    // Injected contexts: store, auth, cluster, engines
    let db = Arc::new(Db::new(&config.es_url).context("Elasticsearch client setup failed")?);

    // Advertise this node in the fleet map so peers can route to it
    {
        let scheme = if config.is_https() { "https" } else { "http" };
        // Node names double as hostnames unless viewUrl says otherwise
        let row = serde_json::json!({
            "nodeName": config.node,
            "viewUrl": config.view_url,
            "hostname": config.node,
            "viewPort": config.bind_addr.port(),
            "scheme": scheme,
        });
        if let Err(e) = db
            .index_doc(store::types::NODES_INDEX, Some(&config.node), &row, false)
            .await
        {
            tracing::warn!("Fleet-map registration failed: {}", e);
        }
    }
    let pcap = Arc::new(PcapStore::new(db.clone()));
    let auth = Arc::new(AuthCtx::new(config.clone(), db.clone()));
    let cluster = Arc::new(ClusterCtx::new(config.clone(), db.clone())?);
    let alerts = Arc::new(Alerts::new(db.clone())?);

    let (hunts, hunt_wake_rx) = HuntEngine::new(
        config.clone(),
        db.clone(),
        cluster.clone(),
        pcap.clone(),
        alerts.clone(),
    );
    let (crons, cron_wake_rx) = CronEngine::new(
        config.clone(),
        db.clone(),
        cluster.clone(),
        pcap.clone(),
        alerts.clone(),
    );

    // The hunt and cron engines are fleet singletons: only the elected
    // node runs their loops. Every node still constructs them, since the
    // peer RPC handlers share their search and forward paths.
    if config.cron_queries {
        tokio::spawn(hunts.clone().run(hunt_wake_rx));
        tokio::spawn(crons.clone().run(cron_wake_rx));
    } else {
        drop(hunt_wake_rx);
        drop(cron_wake_rx);
    }

    if config.local_pcap() {
        let expiry = ExpiryEngine::new(config.clone(), db.clone(), pcap.clone());
        tokio::spawn(expiry.run());
    }

    let state = server::AppState {
        config: config.clone(),
        db,
        pcap,
        cluster,
        auth,
        hunts,
        crons,
        lookup_mutex: Arc::new(tokio::sync::Mutex::new(())),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let mut server_handle = tokio::spawn(server::serve(state, shutdown_rx));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutting down...");
            let _ = shutdown_tx.send(());
            server_handle.await.context("Server task panicked")??;
        }
        // A bind failure or fatal server error lands here: exit code 1
        result = &mut server_handle => {
            result.context("Server task panicked")??;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
