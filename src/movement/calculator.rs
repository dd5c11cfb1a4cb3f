use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::state::Snapshot;
use crate::types::{Direction, LineMovement, MovedLine, MovementSummary, Projection};

/// Compute one movement per projection in `batch`, relative to `baseline`.
///
/// Pure: the baseline is not touched. Ids present only in the baseline are
/// dropped from the output. A projection with no baseline entry, an unchanged
/// line, or a missing/non-finite line on either side yields `none, 0`. A
/// repeated id keeps the movement of its first occurrence, matching
/// [`Snapshot::get`].
pub fn calculate_line_movements(
    baseline: &Snapshot,
    batch: &[Projection],
) -> HashMap<String, LineMovement> {
    let (movements, malformed) = diff_batch(baseline, batch);
    if malformed > 0 {
        debug!(malformed, total = batch.len(), "Line movement pass finished with malformed projections");
    }
    movements
}

/// Movements plus the number of batch entries whose own line is unusable.
fn diff_batch(baseline: &Snapshot, batch: &[Projection]) -> (HashMap<String, LineMovement>, usize) {
    let mut movements = HashMap::with_capacity(batch.len());
    let mut malformed = 0usize;

    for p in batch {
        if !is_usable(p.line_score) {
            malformed += 1;
            debug!(projection_id = %p.id, "Malformed line score, movement degraded to none");
        }
        if movements.contains_key(&p.id) {
            continue;
        }
        let movement = baseline
            .get(&p.id)
            .map_or(LineMovement::NONE, |old| movement_between(old.line_score, p.line_score));
        movements.insert(p.id.clone(), movement);
    }

    (movements, malformed)
}

/// Movement from `old` to `new`. Exact float comparison: lines are quantized
/// upstream, so `24.5 → 24.5` must compare equal and anything else is a move.
pub fn movement_between(old: Option<f64>, new: Option<f64>) -> LineMovement {
    let (Some(old), Some(new)) = (old, new) else {
        return LineMovement::NONE;
    };
    if !old.is_finite() || !new.is_finite() {
        return LineMovement::NONE;
    }

    let delta = new - old;
    if delta > 0.0 {
        LineMovement { direction: Direction::Up, difference: delta }
    } else if delta < 0.0 {
        LineMovement { direction: Direction::Down, difference: -delta }
    } else {
        LineMovement::NONE
    }
}

fn is_usable(line: Option<f64>) -> bool {
    line.is_some_and(f64::is_finite)
}

/// Collect the moved lines of one diff, in batch order, with up/down counts.
/// Each id is reported once, from its first occurrence.
pub fn summarize(movements: &HashMap<String, LineMovement>, batch: &[Projection]) -> MovementSummary {
    let mut summary = MovementSummary::default();
    let mut seen = HashSet::with_capacity(movements.len());

    for p in batch {
        if !seen.insert(p.id.as_str()) {
            continue;
        }
        let Some(movement) = movements.get(&p.id).filter(|m| m.is_moved()) else {
            continue;
        };
        let Some(new_line) = p.line_score else { continue };

        match movement.direction {
            Direction::Up => summary.up += 1,
            Direction::Down => summary.down += 1,
            Direction::None => {}
        }

        summary.moved.push(MovedLine {
            projection_id: p.id.clone(),
            player_name: p
                .player
                .as_ref()
                .map(|pl| pl.display_name.clone())
                .unwrap_or_else(|| "Unknown Player".to_string()),
            team_name: p.player.as_ref().and_then(|pl| pl.team_name.clone()),
            stat_type: p.stat_type.clone(),
            stat_display_name: p.stat_display_name.clone(),
            old_line: new_line - movement.signed_delta(),
            new_line,
            direction: movement.direction,
            difference: movement.difference,
        });
    }

    summary
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
