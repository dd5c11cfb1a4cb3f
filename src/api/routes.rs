use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::health::HealthState;
use crate::api::latency::{FetchLatency, LatencySnapshot};
use crate::db::cleanup::{remove_duplicate_projections, CleanupReport};
use crate::db::models::{LineMovementRow, ProjectionRow};
use crate::error::AppError;
use crate::refresh::{ProjectionRefresher, RefreshOutcome, RefreshStatus};
use crate::types::{LineMovement, MovementSummary, Projection};

#[derive(Clone)]
pub struct ApiState {
    pub pool: sqlx::SqlitePool,
    pub refresher: Arc<ProjectionRefresher>,
    pub health: Arc<HealthState>,
    pub latency: Arc<FetchLatency>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/projections", get(get_projections))
        .route("/projections/stats", get(get_stat_types))
        .route("/projections/movements", get(get_movements))
        .route("/projections/refresh", post(post_refresh))
        .route("/projections/history", get(get_history))
        .route("/projections/cleanup", post(post_cleanup))
        .route("/projections/:id/movements", get(get_projection_movements))
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct BoardQuery {
    /// Filter on `stat_display_name`.
    pub stat: Option<String>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub player_id: Option<String>,
    pub game_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct MovementHistoryQuery {
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct BoardRow {
    #[serde(flatten)]
    pub projection: Projection,
    pub movement: LineMovement,
}

#[derive(Serialize)]
pub struct BoardResponse {
    pub last_updated: Option<DateTime<Utc>>,
    pub is_stale: bool,
    pub in_flight: bool,
    pub last_error: Option<String>,
    pub count: usize,
    pub projections: Vec<BoardRow>,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    pub outcome: &'static str,
    pub fetch_ms: Option<u64>,
    pub summary: Option<MovementSummary>,
    pub status: RefreshStatus,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub db_ok: bool,
    pub refresh: RefreshStatus,
    pub reports_received: u64,
    pub write_queue_pending: u64,
    pub last_write_at_ns: u64,
    pub write_errors: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// The last good batch with per-line movement. Served even when the latest
/// refresh failed; `last_error` and `is_stale` tell the client to offer a retry.
async fn get_projections(
    State(state): State<ApiState>,
    Query(params): Query<BoardQuery>,
) -> Json<BoardResponse> {
    let status = state.refresher.status();

    let projections: Vec<BoardRow> = state
        .refresher
        .latest()
        .map(|report| {
            report
                .batch
                .projections()
                .iter()
                .filter(|p| {
                    params
                        .stat
                        .as_deref()
                        .map_or(true, |s| p.stat_display_name == s)
                })
                .map(|p| BoardRow {
                    movement: report.movement(&p.id),
                    projection: p.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    Json(BoardResponse {
        last_updated: status.last_updated,
        is_stale: status.is_stale,
        in_flight: status.in_flight,
        last_error: status.last_error,
        count: projections.len(),
        projections,
    })
}

async fn get_stat_types(State(state): State<ApiState>) -> Json<Vec<String>> {
    let stats: BTreeSet<String> = state
        .refresher
        .latest()
        .map(|report| {
            report
                .batch
                .projections()
                .iter()
                .filter(|p| !p.stat_display_name.is_empty())
                .map(|p| p.stat_display_name.clone())
                .collect()
        })
        .unwrap_or_default();
    Json(stats.into_iter().collect())
}

async fn get_movements(State(state): State<ApiState>) -> Json<MovementSummary> {
    Json(
        state
            .refresher
            .latest()
            .map(|report| report.summary())
            .unwrap_or_default(),
    )
}

async fn post_refresh(State(state): State<ApiState>) -> Result<Json<RefreshResponse>, AppError> {
    let outcome = state.refresher.refresh(true).await?;
    let (summary, fetch_ms) = match &outcome {
        RefreshOutcome::Refreshed(report) => (
            Some(report.summary()),
            Some(report.fetch_duration.as_millis() as u64),
        ),
        RefreshOutcome::Fresh | RefreshOutcome::InFlight => (None, None),
    };
    Ok(Json(RefreshResponse {
        outcome: outcome.label(),
        fetch_ms,
        summary,
        status: state.refresher.status(),
    }))
}

async fn get_history(
    State(state): State<ApiState>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<Vec<ProjectionRow>>, AppError> {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);

    let rows: Vec<ProjectionRow> = sqlx::query_as(
        r#"
        SELECT p.id, p.player_id, pl.display_name AS player_name, p.game_id, p.stat_type,
               p.line_score, p.start_time, p.end_time, p.status, p.odds, p.created_at
        FROM projections p
        LEFT JOIN players pl ON pl.id = p.player_id
        WHERE (?1 IS NULL OR p.player_id = ?1)
          AND (?2 IS NULL OR p.game_id = ?2)
        ORDER BY p.start_time DESC, p.created_at DESC
        LIMIT ?3
        "#,
    )
    .bind(params.player_id)
    .bind(params.game_id)
    .bind(limit)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(rows))
}

async fn get_projection_movements(
    State(state): State<ApiState>,
    Path(projection_id): Path<String>,
    Query(params): Query<MovementHistoryQuery>,
) -> Result<Json<Vec<LineMovementRow>>, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);

    let rows: Vec<LineMovementRow> = sqlx::query_as(
        r#"
        SELECT id, projection_id, player_name, stat_type, old_line, new_line,
               direction, difference, observed_at
        FROM line_movements
        WHERE projection_id = ?
        ORDER BY observed_at DESC
        LIMIT ?
        "#,
    )
    .bind(projection_id)
    .bind(limit)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(rows))
}

async fn post_cleanup(State(state): State<ApiState>) -> Result<Json<CleanupReport>, AppError> {
    Ok(Json(remove_duplicate_projections(&state.pool).await?))
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let db_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    let refresh = state.refresher.status();
    let status = if db_ok && refresh.last_error.is_none() { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        db_ok,
        refresh,
        reports_received: state.health.reports_received(),
        write_queue_pending: state.health.write_queue_pending(),
        last_write_at_ns: state.health.last_write_at_ns(),
        write_errors: state.health.write_errors(),
    })
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencySnapshot> {
    Json(state.latency.snapshot())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::db::memory_pool;
    use crate::fetcher::ProjectionSource;
    use crate::refresh::{RefreshSettings, SystemClock};
    use crate::state::SnapshotStore;

    struct QueuedSource(Mutex<VecDeque<crate::error::Result<Vec<Projection>>>>);

    #[async_trait]
    impl ProjectionSource for QueuedSource {
        async fn fetch(&self) -> crate::error::Result<Vec<Projection>> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AppError::FetchFailure("partner API returned HTTP 503".to_string())))
        }
    }

    fn line(id: &str, stat: &str, score: f64) -> Projection {
        Projection::new(id, stat, Some(score))
    }

    async fn state_with(batches: Vec<Vec<Projection>>) -> ApiState {
        let source = QueuedSource(Mutex::new(batches.into_iter().map(Ok).collect()));
        let refresher = ProjectionRefresher::new(
            Arc::new(source),
            SnapshotStore::new(),
            Arc::new(SystemClock),
            RefreshSettings {
                staleness: Duration::from_secs(300),
                fetch_timeout: Duration::from_secs(5),
            },
        );
        ApiState {
            pool: memory_pool().await,
            refresher: Arc::new(refresher),
            health: Arc::new(HealthState::new()),
            latency: Arc::new(FetchLatency::new()),
        }
    }

    async fn call(state: &ApiState, method: &str, uri: &str) -> (StatusCode, Value) {
        let resp = router(state.clone())
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, body)
    }

    #[tokio::test]
    async fn empty_board_before_first_refresh() {
        let state = state_with(Vec::new()).await;

        let (status, body) = call(&state, "GET", "/projections").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 0);
        assert_eq!(body["is_stale"], true);
    }

    #[tokio::test]
    async fn board_carries_movement_and_filters_by_stat() {
        let state = state_with(vec![
            vec![line("p1", "Points", 24.5), line("p2", "Rebounds", 9.5)],
            vec![line("p1", "Points", 26.0), line("p2", "Rebounds", 8.5)],
        ])
        .await;
        state.refresher.refresh(true).await.unwrap();

        let (status, body) = call(&state, "POST", "/projections/refresh").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "refreshed");
        assert_eq!(body["summary"]["up"], 1);
        assert_eq!(body["summary"]["down"], 1);

        let (_, body) = call(&state, "GET", "/projections?stat=Points").await;
        assert_eq!(body["count"], 1);
        let row = &body["projections"][0];
        assert_eq!(row["id"], "p1");
        assert_eq!(row["line_score"], 26.0);
        assert_eq!(row["movement"]["direction"], "up");
        assert_eq!(row["movement"]["difference"], 1.5);

        let (_, stats) = call(&state, "GET", "/projections/stats").await;
        assert_eq!(stats, serde_json::json!(["Points", "Rebounds"]));
    }

    #[tokio::test]
    async fn failed_refresh_is_bad_gateway_and_board_survives() {
        let state = state_with(vec![vec![line("p1", "Points", 24.5)]]).await;
        state.refresher.refresh(true).await.unwrap();

        let (status, _) = call(&state, "POST", "/projections/refresh").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (status, body) = call(&state, "GET", "/projections").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert!(body["last_error"].as_str().is_some_and(|e| e.contains("503")));

        let (_, health) = call(&state, "GET", "/health").await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["db_ok"], true);
    }

    #[tokio::test]
    async fn history_and_cleanup_run_against_empty_database() {
        let state = state_with(Vec::new()).await;

        let (status, body) = call(&state, "GET", "/projections/history?player_id=pl1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));

        let (status, body) = call(&state, "POST", "/projections/cleanup").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], 0);

        let (status, body) = call(&state, "GET", "/projections/p1/movements").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }
}
