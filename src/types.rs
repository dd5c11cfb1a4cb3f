use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// A single betting line for a player (or player combo / team) on one stat.
///
/// `None` fields are omitted when serialized so the API never ships nulls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    /// Upstream projection id. Stable across fetches for the same logical line.
    pub id: String,
    pub stat_type: String,
    pub stat_display_name: String,
    /// `None` when upstream sent a missing or non-numeric line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub league_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat_average: Option<StatAverage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub odds_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default)]
    pub is_live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjusted_odds: Option<f64>,
}

impl Projection {
    /// Minimal projection with only the fields the diff cares about.
    #[cfg(test)]
    pub fn new(id: impl Into<String>, stat: impl Into<String>, line_score: Option<f64>) -> Self {
        let stat = stat.into();
        Self {
            id: id.into(),
            stat_type: stat.clone(),
            stat_display_name: stat,
            line_score,
            updated_at: None,
            league_id: None,
            player: None,
            stat_average: None,
            description: None,
            odds_type: None,
            game_id: None,
            status: None,
            start_time: None,
            end_time: None,
            is_live: false,
            adjusted_odds: None,
        }
    }

    /// Team lines carry `display_name == "team"` on their player record.
    pub fn is_team_line(&self) -> bool {
        self.player
            .as_ref()
            .is_some_and(|p| p.display_name == "team")
    }
}

/// Display metadata for the player (or team) a projection is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRef {
    pub id: String,
    pub name: String,
    pub display_name: String,
    /// Team abbreviation. Empty string for team lines without one.
    pub team: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub combo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub league_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatAverage {
    pub average: f64,
    pub count: u32,
    pub max_value: f64,
}

// ---------------------------------------------------------------------------
// Line movement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    None,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::None => "none",
        };
        write!(f, "{s}")
    }
}

/// Movement of one projection relative to the previous snapshot.
/// `difference` is always non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineMovement {
    pub direction: Direction,
    pub difference: f64,
}

impl LineMovement {
    pub const NONE: LineMovement = LineMovement {
        direction: Direction::None,
        difference: 0.0,
    };

    pub fn is_moved(&self) -> bool {
        self.direction != Direction::None
    }

    /// `new_line - old_line`, i.e. `difference` with the direction's sign applied.
    pub fn signed_delta(&self) -> f64 {
        match self.direction {
            Direction::Up => self.difference,
            Direction::Down => -self.difference,
            Direction::None => 0.0,
        }
    }
}

/// One moved line with enough context to notify a user about it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovedLine {
    pub projection_id: String,
    pub player_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
    pub stat_type: String,
    pub stat_display_name: String,
    pub old_line: f64,
    pub new_line: f64,
    pub direction: Direction,
    pub difference: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MovementSummary {
    pub up: usize,
    pub down: usize,
    pub moved: Vec<MovedLine>,
}

impl MovementSummary {
    pub fn total(&self) -> usize {
        self.moved.len()
    }
}
