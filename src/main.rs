mod api;
mod config;
mod db;
mod error;
mod fetcher;
mod movement;
mod refresh;
mod state;
mod types;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::FetchLatency;
use crate::api::routes::{router, ApiState};
use crate::config::{Config, CHANNEL_CAPACITY};
use crate::db::writer::ProjectionWriter;
use crate::error::Result;
use crate::fetcher::PartnerApiClient;
use crate::refresh::{ProjectionRefresher, RefreshReport, RefreshSettings, SystemClock};
use crate::state::SnapshotStore;
use crate::types::{Direction, MovementSummary};

/// Moved lines logged individually per refresh; the rest are only counted.
const MOVED_LINES_LOGGED: usize = 10;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = db::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    if cfg.league_ids.is_empty() {
        warn!("LEAGUE_IDS is empty; every league on the partner board will be tracked.");
    } else {
        info!("Tracking league ids: {:?}", cfg.league_ids);
    }

    // --- Shared state ---
    let store = SnapshotStore::new();
    let health = Arc::new(HealthState::new());
    let latency = Arc::new(FetchLatency::new());

    // --- Channels ---
    let (report_tx, report_rx) = mpsc::channel::<Arc<RefreshReport>>(CHANNEL_CAPACITY);

    // --- Refresher ---
    let source = Arc::new(PartnerApiClient::new(&cfg)?);
    let refresher = Arc::new(
        ProjectionRefresher::new(
            source,
            Arc::clone(&store),
            Arc::new(SystemClock),
            RefreshSettings::from_config(&cfg),
        )
        .with_report_channel(report_tx)
        .with_latency(Arc::clone(&latency)),
    );

    // Report consumer: movement notifications + DB writer
    let consumer_pool = pool.clone();
    let consumer_health = Arc::clone(&health);
    tokio::spawn(async move {
        report_consumer(report_rx, consumer_pool, consumer_health).await;
    });

    // Background refresh loop (first tick fetches immediately)
    let refresh_every = cfg.refresh_interval;
    info!(
        interval_secs = refresh_every.as_secs(),
        staleness_secs = cfg.staleness.as_secs(),
        timeout_secs = cfg.fetch_timeout.as_secs(),
        "Starting projection refresher",
    );
    tokio::spawn(Arc::clone(&refresher).run(refresh_every));

    // --- HTTP API server ---
    let api_state = ApiState {
        pool,
        refresher,
        health,
        latency,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Consumes refresh reports: logs line movements and hands reports to the DB writer.
async fn report_consumer(
    mut rx: mpsc::Receiver<Arc<RefreshReport>>,
    pool: sqlx::SqlitePool,
    health: Arc<HealthState>,
) {
    let writer_tx = {
        let (tx, writer_rx) = mpsc::channel::<Arc<RefreshReport>>(CHANNEL_CAPACITY);
        let writer = ProjectionWriter::new(pool, writer_rx, Arc::clone(&health));
        tokio::spawn(async move { writer.run().await });
        tx
    };

    while let Some(report) = rx.recv().await {
        log_movements(&report.summary());
        match writer_tx.try_send(report) {
            Ok(()) => health.report_queued(),
            Err(e) => warn!("DB writer channel full: {e}"),
        }
    }
}

fn log_movements(summary: &MovementSummary) {
    if summary.moved.is_empty() {
        return;
    }

    info!(
        event = "LINE_MOVEMENT",
        moved = summary.total(),
        up = summary.up,
        down = summary.down,
        "{} lines have moved ({} up, {} down)",
        summary.total(),
        summary.up,
        summary.down,
    );

    for line in summary.moved.iter().take(MOVED_LINES_LOGGED) {
        let arrow = match line.direction {
            Direction::Up => "↑",
            Direction::Down => "↓",
            Direction::None => "-",
        };
        info!(
            projection_id = %line.projection_id,
            direction = %line.direction,
            difference = line.difference,
            "  {} ({}) {} | {:.1} → {:.1} {} {:.1}",
            line.player_name,
            line.team_name.as_deref().unwrap_or("-"),
            line.stat_display_name,
            line.old_line,
            line.new_line,
            arrow,
            line.difference,
        );
    }
    if summary.total() > MOVED_LINES_LOGGED {
        info!("  … and {} more", summary.total() - MOVED_LINES_LOGGED);
    }
}
