use std::collections::HashMap;

use serde::Serialize;
use tracing::{info, warn};

use crate::db::models::ProjectionKeyRow;
use crate::error::Result;

/// One group of stored lines that share game, player, stat and line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub game_id: String,
    pub stat_type: String,
    pub line_score: f64,
    pub duplicate_count: usize,
    pub kept_id: String,
    pub deleted_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub groups: usize,
    pub deleted: usize,
    pub errors: usize,
    pub details: Vec<DuplicateGroup>,
}

/// Group rows by `(game_id, player_id, stat_type, line_score)` and keep the
/// newest `created_at` of each group. Groups come back in first-seen order.
pub fn plan_duplicate_removal(rows: &[ProjectionKeyRow]) -> Vec<DuplicateGroup> {
    let mut order: Vec<(&str, &str, &str, u64)> = Vec::new();
    let mut groups: HashMap<(&str, &str, &str, u64), Vec<&ProjectionKeyRow>> = HashMap::new();

    for row in rows {
        let key = (
            row.game_id.as_str(),
            row.player_id.as_str(),
            row.stat_type.as_str(),
            row.line_score.to_bits(),
        );
        let members = groups.entry(key).or_default();
        if members.is_empty() {
            order.push(key);
        }
        members.push(row);
    }

    order
        .into_iter()
        .filter_map(|key| {
            let mut members = groups.remove(&key)?;
            if members.len() < 2 {
                return None;
            }
            // Newest first; ties keep the lowest id for a stable choice.
            members.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
            let (keep, rest) = members.split_first()?;
            Some(DuplicateGroup {
                game_id: keep.game_id.clone(),
                stat_type: keep.stat_type.clone(),
                line_score: keep.line_score,
                duplicate_count: members.len(),
                kept_id: keep.id.clone(),
                deleted_ids: rest.iter().map(|r| r.id.clone()).collect(),
            })
        })
        .collect()
}

/// Delete duplicate stored lines, keeping the newest of each group.
/// A failing group is counted and skipped; the rest still run.
pub async fn remove_duplicate_projections(pool: &sqlx::SqlitePool) -> Result<CleanupReport> {
    let rows: Vec<ProjectionKeyRow> = sqlx::query_as(
        r#"
        SELECT id, game_id, player_id, stat_type, line_score, created_at
        FROM projections
        "#,
    )
    .fetch_all(pool)
    .await?;

    let plan = plan_duplicate_removal(&rows);
    let mut report = CleanupReport {
        groups: plan.len(),
        ..CleanupReport::default()
    };

    for group in plan {
        match delete_ids(pool, &group.deleted_ids).await {
            Ok(n) => {
                report.deleted += n;
                info!(
                    game_id = %group.game_id,
                    kept = %group.kept_id,
                    deleted = n,
                    "Removed duplicate {} {} lines",
                    group.stat_type,
                    group.line_score,
                );
                report.details.push(group);
            }
            Err(e) => {
                report.errors += 1;
                warn!(kept = %group.kept_id, "Duplicate cleanup failed: {e}");
            }
        }
    }

    info!(
        groups = report.groups,
        deleted = report.deleted,
        errors = report.errors,
        "Duplicate projection cleanup complete",
    );
    Ok(report)
}

async fn delete_ids(pool: &sqlx::SqlitePool, ids: &[String]) -> Result<usize> {
    let mut tx = pool.begin().await?;
    let mut deleted = 0;
    for id in ids {
        let result = sqlx::query("DELETE FROM projections WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        deleted += result.rows_affected() as usize;
    }
    tx.commit().await?;
    Ok(deleted)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
