//! Database row types matching migrations/0001_projections.sql.
use serde::Serialize;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProjectionRow {
    pub id: String,
    pub player_id: String,
    pub player_name: Option<String>,
    pub game_id: String,
    pub stat_type: String,
    pub line_score: f64,
    pub start_time: String,
    pub end_time: Option<String>,
    pub status: String,
    pub odds: Option<f64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LineMovementRow {
    pub id: i64,
    pub projection_id: String,
    pub player_name: String,
    pub stat_type: String,
    pub old_line: f64,
    pub new_line: f64,
    pub direction: String,
    pub difference: f64,
    pub observed_at: i64,
}

/// The columns duplicate cleanup groups on.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ProjectionKeyRow {
    pub id: String,
    pub game_id: String,
    pub player_id: String,
    pub stat_type: String,
    pub line_score: f64,
    pub created_at: i64,
}
