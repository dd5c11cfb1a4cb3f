use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::health::HealthState;
use crate::error::Result;
use crate::refresh::RefreshReport;
use crate::types::{MovedLine, PlayerRef, Projection};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteStats {
    pub total: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub errors: usize,
    pub movements: usize,
}

enum Persisted {
    Inserted,
    /// Already stored under the same projection id.
    Duplicate,
    /// Team line or no resolved player.
    NotAPlayer,
    Invalid(&'static str),
}

/// Receives refresh reports and persists the observed lines and their
/// movements to SQLite. Runs as its own task so the refresher never waits on disk.
pub struct ProjectionWriter {
    pool: sqlx::SqlitePool,
    report_rx: mpsc::Receiver<Arc<RefreshReport>>,
    health: Arc<HealthState>,
}

impl ProjectionWriter {
    pub fn new(
        pool: sqlx::SqlitePool,
        report_rx: mpsc::Receiver<Arc<RefreshReport>>,
        health: Arc<HealthState>,
    ) -> Self {
        Self { pool, report_rx, health }
    }

    pub async fn run(mut self) {
        while let Some(report) = self.report_rx.recv().await {
            let stats = persist_report(&self.pool, &report, now_ns() as i64).await;
            self.health.report_written(now_ns(), stats.errors as u64);
            info!(
                total = stats.total,
                inserted = stats.inserted,
                skipped = stats.skipped,
                errors = stats.errors,
                movements = stats.movements,
                "Persisted projections: {} new, {} skipped, {} errors, {} movements",
                stats.inserted,
                stats.skipped,
                stats.errors,
                stats.movements,
            );
        }
    }
}

/// Write every player line of `report` plus one row per moved line.
/// Row-level failures are counted, never fatal.
pub async fn persist_report(pool: &sqlx::SqlitePool, report: &RefreshReport, now_ns: i64) -> WriteStats {
    let projections = report.batch.projections();
    let mut stats = WriteStats {
        total: projections.len(),
        ..WriteStats::default()
    };

    for p in projections {
        match persist_projection(pool, p, now_ns).await {
            Ok(Persisted::Inserted) => stats.inserted += 1,
            Ok(Persisted::Duplicate) | Ok(Persisted::NotAPlayer) => stats.skipped += 1,
            Ok(Persisted::Invalid(reason)) => {
                debug!(projection_id = %p.id, reason, "Projection not persisted");
                stats.errors += 1;
            }
            Err(e) => {
                warn!(projection_id = %p.id, "DB write error: {e}");
                stats.errors += 1;
            }
        }
    }

    for moved in &report.summary().moved {
        let tracked = report
            .batch
            .get(&moved.projection_id)
            .and_then(stored_player)
            .is_some();
        if !tracked {
            continue;
        }
        match insert_movement(pool, moved, now_ns).await {
            Ok(()) => stats.movements += 1,
            Err(e) => {
                warn!(projection_id = %moved.projection_id, "Line movement write error: {e}");
                stats.errors += 1;
            }
        }
    }

    stats
}

/// The player a line is stored under. Team lines and unresolved players are not stored.
fn stored_player(p: &Projection) -> Option<&PlayerRef> {
    p.player.as_ref().filter(|_| !p.is_team_line())
}

async fn persist_projection(pool: &sqlx::SqlitePool, p: &Projection, now_ns: i64) -> Result<Persisted> {
    let Some(player) = stored_player(p) else {
        return Ok(Persisted::NotAPlayer);
    };
    let Some(line_score) = p.line_score else {
        return Ok(Persisted::Invalid("missing line score"));
    };
    let Some(start_time) = p.start_time.as_deref() else {
        return Ok(Persisted::Invalid("missing start time"));
    };

    sqlx::query(
        r#"
        INSERT INTO players (id, name, display_name, team, last_updated)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            display_name = excluded.display_name,
            team = excluded.team,
            last_updated = excluded.last_updated
        "#,
    )
    .bind(&player.id)
    .bind(&player.name)
    .bind(&player.display_name)
    .bind(&player.team)
    .bind(now_ns)
    .execute(pool)
    .await?;

    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO projections (
            id, player_id, game_id, stat_type, line_score,
            start_time, end_time, status, odds, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&p.id)
    .bind(&player.id)
    .bind(p.game_id.as_deref().unwrap_or("N/A"))
    .bind(&p.stat_type)
    .bind(line_score)
    .bind(start_time)
    .bind(p.end_time.as_deref())
    .bind(p.status.as_deref().unwrap_or("pre_game"))
    .bind(p.adjusted_odds)
    .bind(now_ns)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        Ok(Persisted::Duplicate)
    } else {
        Ok(Persisted::Inserted)
    }
}

async fn insert_movement(pool: &sqlx::SqlitePool, m: &MovedLine, now_ns: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO line_movements (
            projection_id, player_name, stat_type, old_line, new_line,
            direction, difference, observed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&m.projection_id)
    .bind(&m.player_name)
    .bind(&m.stat_type)
    .bind(m.old_line)
    .bind(m.new_line)
    .bind(m.direction.to_string())
    .bind(m.difference)
    .bind(now_ns)
    .execute(pool)
    .await?;
    Ok(())
}

pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
