use std::time::Duration;

use crate::error::{AppError, Result};

pub const PROJECTIONS_API_URL: &str =
    "https://partner-api.prizepicks.com/projections?per_page=1000&include=new_player,stat_average,league";

/// mpsc channel buffer size between the refresher, the report consumer and the DB writer.
pub const CHANNEL_CAPACITY: usize = 64;

/// A held batch younger than this is served as-is unless a refresh is forced (seconds).
pub const PROJECTION_STALENESS_SECS: u64 = 300;

/// Upper bound on a single upstream fetch (seconds). Expiry counts as a fetch failure.
pub const FETCH_TIMEOUT_SECS: u64 = 10;

/// How often the background refresher asks for a (non-forced) refresh (seconds).
pub const REFRESH_INTERVAL_SECS: u64 = 60;

/// League ids the partner feed uses for NBA boards:
/// NBA, preseason, 2nd half, 1st half, 4th quarter, general, futures.
pub const NBA_LEAGUE_IDS: [u32; 7] = [7, 18, 80, 84, 149, 158, 173];

#[derive(Debug, Clone)]
pub struct Config {
    pub projections_api_url: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// STALENESS_SECS
    pub staleness: Duration,
    /// FETCH_TIMEOUT_SECS
    pub fetch_timeout: Duration,
    /// REFRESH_INTERVAL_SECS
    pub refresh_interval: Duration,
    /// League ids to keep (LEAGUE_IDS, comma-separated). Empty keeps every league.
    pub league_ids: Vec<u32>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            projections_api_url: std::env::var("PROJECTIONS_API_URL")
                .unwrap_or_else(|_| PROJECTIONS_API_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "projections.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            staleness: Duration::from_secs(
                std::env::var("STALENESS_SECS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(PROJECTION_STALENESS_SECS),
            ),
            fetch_timeout: Duration::from_secs(
                std::env::var("FETCH_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .filter(|&s| s > 0)
                    .unwrap_or(FETCH_TIMEOUT_SECS),
            ),
            refresh_interval: Duration::from_secs(
                std::env::var("REFRESH_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .filter(|&s| s > 0)
                    .unwrap_or(REFRESH_INTERVAL_SECS),
            ),
            league_ids: match std::env::var("LEAGUE_IDS") {
                Ok(raw) => parse_league_ids(&raw)?,
                Err(_) => NBA_LEAGUE_IDS.to_vec(),
            },
        })
    }
}

/// Parse a comma-separated league id list. Blank entries are ignored.
pub fn parse_league_ids(raw: &str) -> Result<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|_| AppError::Config(format!("LEAGUE_IDS entry '{s}' is not a number")))
        })
        .collect()
}
