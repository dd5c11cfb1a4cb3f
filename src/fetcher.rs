use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::types::{PlayerRef, Projection, StatAverage};

/// Anything that can produce a freshly normalized projections batch.
#[async_trait]
pub trait ProjectionSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<Projection>>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchStats {
    pub api_total: usize,
    pub rejected_malformed: usize,
    pub rejected_odds_type: usize,
    pub rejected_season_long: usize,
    pub rejected_league: usize,
    /// Kept, but their line score is missing or non-numeric.
    pub malformed_lines: usize,
    pub qualified: usize,
}

// ---------------------------------------------------------------------------
// Partner API client
// ---------------------------------------------------------------------------

pub struct PartnerApiClient {
    client: reqwest::Client,
    url: String,
    league_ids: Vec<u32>,
}

impl PartnerApiClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.fetch_timeout)
            .build()?;
        Ok(Self {
            client,
            url: cfg.projections_api_url.clone(),
            league_ids: cfg.league_ids.clone(),
        })
    }
}

#[async_trait]
impl ProjectionSource for PartnerApiClient {
    async fn fetch(&self) -> Result<Vec<Projection>> {
        let resp = self
            .client
            .get(&self.url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::FetchFailure(format!("partner API returned HTTP {status}")));
        }

        let body: Value = resp.json().await?;
        let (projections, stats) = parse_projections_response(&body, &self.league_ids)?;

        info!(
            api_total = stats.api_total,
            qualified = stats.qualified,
            malformed_lines = stats.malformed_lines,
            "Fetched {} projections ({} from API)",
            stats.qualified,
            stats.api_total,
        );
        debug!(
            "[FILTER] rejected: malformed={} odds_type={} season_long={} league={}",
            stats.rejected_malformed,
            stats.rejected_odds_type,
            stats.rejected_season_long,
            stats.rejected_league,
        );

        Ok(projections)
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize a JSON:API projections document.
///
/// Resolves `new_player` / `stat_average` / `league` relationships against
/// `included`, keeps standard (non season-long) lines for the given leagues,
/// and orders live lines first. An empty `league_ids` keeps every league.
pub fn parse_projections_response(
    body: &Value,
    league_ids: &[u32],
) -> Result<(Vec<Projection>, FetchStats)> {
    let items = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::FetchFailure("projections response had no data array".to_string()))?;

    let included = index_included(body);
    let mut stats = FetchStats {
        api_total: items.len(),
        ..FetchStats::default()
    };
    let mut projections = Vec::with_capacity(items.len());

    for item in items {
        match parse_projection_checked(item, &included, league_ids) {
            Ok(p) => {
                if p.line_score.is_none() {
                    stats.malformed_lines += 1;
                }
                projections.push(p);
            }
            Err(Rejection::Malformed) => stats.rejected_malformed += 1,
            Err(Rejection::OddsType) => stats.rejected_odds_type += 1,
            Err(Rejection::SeasonLong) => stats.rejected_season_long += 1,
            Err(Rejection::League) => stats.rejected_league += 1,
        }
    }

    // Stable: upstream order is kept within the live and not-live groups.
    projections.sort_by_key(|p| !p.is_live);

    stats.qualified = projections.len();
    Ok((projections, stats))
}

type IncludedIndex<'a> = HashMap<(&'a str, &'a str), &'a Value>;

fn index_included(body: &Value) -> IncludedIndex<'_> {
    body.get("included")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let kind = item.get("type")?.as_str()?;
                    let id = item.get("id")?.as_str()?;
                    Some(((kind, id), item))
                })
                .collect()
        })
        .unwrap_or_default()
}

enum Rejection {
    Malformed,
    OddsType,
    SeasonLong,
    League,
}

fn parse_projection_checked(
    item: &Value,
    included: &IncludedIndex<'_>,
    league_ids: &[u32],
) -> std::result::Result<Projection, Rejection> {
    let id = item.get("id").and_then(Value::as_str).ok_or(Rejection::Malformed)?;
    let attrs = item
        .get("attributes")
        .filter(|a| a.is_object())
        .ok_or(Rejection::Malformed)?;

    let odds_type = str_attr(attrs, "odds_type");
    if odds_type.as_deref() != Some("standard") {
        return Err(Rejection::OddsType);
    }

    let description = str_attr(attrs, "description");
    if description.as_deref().is_some_and(|d| d.contains("SZN")) {
        return Err(Rejection::SeasonLong);
    }

    let player = relationship_id(item, "new_player")
        .and_then(|pid| included.get(&("new_player", pid)))
        .and_then(|v| parse_player(v));

    let stat_average = relationship_id(item, "stat_average")
        .and_then(|sid| included.get(&("stat_average", sid)))
        .and_then(|v| parse_stat_average(v));

    let league_id = relationship_id(item, "league")
        .and_then(|l| l.parse::<u32>().ok())
        .or_else(|| player.as_ref().and_then(|p| p.league_id));

    if !league_ids.is_empty() && !league_id.is_some_and(|l| league_ids.contains(&l)) {
        return Err(Rejection::League);
    }

    Ok(Projection {
        id: id.to_string(),
        stat_type: str_attr(attrs, "stat_type").unwrap_or_default(),
        stat_display_name: str_attr(attrs, "stat_display_name")
            .or_else(|| str_attr(attrs, "stat_type"))
            .unwrap_or_default(),
        line_score: number(attrs.get("line_score")),
        updated_at: attrs
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(parse_timestamp),
        league_id,
        player,
        stat_average,
        description,
        odds_type,
        game_id: str_attr(attrs, "game_id"),
        status: str_attr(attrs, "status"),
        start_time: str_attr(attrs, "start_time"),
        end_time: str_attr(attrs, "end_time"),
        is_live: attrs.get("is_live").and_then(Value::as_bool).unwrap_or(false),
        adjusted_odds: number(attrs.get("adjusted_odds")),
    })
}

/// `relationships.<name>.data.id`, if the relationship is present and non-null.
fn relationship_id<'a>(item: &'a Value, name: &str) -> Option<&'a str> {
    item.get("relationships")?
        .get(name)?
        .get("data")?
        .get("id")?
        .as_str()
}

fn parse_player(v: &Value) -> Option<PlayerRef> {
    let id = v.get("id")?.as_str()?.to_string();
    let attrs = v.get("attributes")?;
    let name = str_attr(attrs, "name").unwrap_or_default();

    Some(PlayerRef {
        id,
        display_name: str_attr(attrs, "display_name").unwrap_or_else(|| name.clone()),
        name,
        team: str_attr(attrs, "team").unwrap_or_default(),
        team_name: str_attr(attrs, "team_name"),
        position: str_attr(attrs, "position"),
        image_url: str_attr(attrs, "image_url"),
        combo: attrs.get("combo").and_then(Value::as_bool).unwrap_or(false),
        league_id: attrs
            .get("league_id")
            .and_then(Value::as_u64)
            .and_then(|l| u32::try_from(l).ok()),
    })
}

fn parse_stat_average(v: &Value) -> Option<StatAverage> {
    let attrs = v.get("attributes")?;
    Some(StatAverage {
        average: number(attrs.get("average"))?,
        count: attrs
            .get("count")
            .and_then(Value::as_u64)
            .and_then(|c| u32::try_from(c).ok())
            .unwrap_or(0),
        max_value: number(attrs.get("max_value")).unwrap_or(0.0),
    })
}

/// Non-empty string attribute. Nulls and empty strings are treated as absent.
fn str_attr(attrs: &Value, key: &str) -> Option<String> {
    attrs
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Finite number, accepting numeric strings.
fn number(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
        .filter(|n| n.is_finite())
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
