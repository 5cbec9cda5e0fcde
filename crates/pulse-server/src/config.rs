use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use pulse_util_error::BoxedError;
use snafu::{ResultExt as _, Snafu};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Required environment variable {name} is not set"))]
    MissingVar { name: &'static str },
    #[snafu(display("Environment variable {name} has an invalid value"))]
    InvalidVar {
        name: &'static str,
        source: BoxedError,
    },
}
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Immutable service configuration, read from the environment once at
/// startup and shared by handle.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the durable store's database file (`DB_URL`).
    pub db_path: PathBuf,
    /// MAC key material for bearer tokens (`TOKEN_SECRET`).
    pub token_secret: String,
    /// Bearer token lifetime (`TOKEN_TTL`, seconds).
    pub token_ttl: Duration,
    /// Follower count at which an author stops being fanned out
    /// (`CELEBRITY_THRESHOLD`).
    pub celebrity_threshold: u64,
    /// Max entries per cached timeline (`TIMELINE_CAP`).
    pub timeline_cap: usize,
    /// Follower chunk size during fan-out (`FANOUT_BATCH_SIZE`).
    pub fanout_batch_size: usize,
    /// Messages processed in parallel per worker (`WORKER_CONCURRENCY`).
    pub worker_concurrency: usize,
    /// Unacked message redelivery delay (`EVENT_BUS_VISIBILITY_TIMEOUT`,
    /// seconds).
    pub visibility_timeout: Duration,
    /// Deliveries before a message is dead-lettered
    /// (`EVENT_BUS_MAX_RECEIVES`).
    pub max_receives: u32,
    /// Bound on queued plus in-flight messages (`EVENT_BUS_CAPACITY`).
    pub bus_capacity: usize,
    /// How far back the celebrity pull and the database fallback scan look
    /// (`TIMELINE_LOOKBACK_SECS`).
    pub lookback: Duration,
    /// Allowed CORS origins, comma-separated (`CORS_ORIGINS`); no CORS
    /// layer when unset.
    pub cors_origins: Option<Vec<String>>,
}

impl Config {
    pub fn from_env() -> ConfigResult<Config> {
        Ok(Config {
            db_path: PathBuf::from(require_var("DB_URL")?),
            token_secret: require_var("TOKEN_SECRET")?,
            token_ttl: Duration::from_secs(parse_var("TOKEN_TTL", 86_400)?),
            celebrity_threshold: parse_var("CELEBRITY_THRESHOLD", 100_000)?,
            timeline_cap: parse_var("TIMELINE_CAP", 1_000)?,
            fanout_batch_size: parse_var("FANOUT_BATCH_SIZE", 1_000)?,
            worker_concurrency: parse_var("WORKER_CONCURRENCY", 4)?,
            visibility_timeout: Duration::from_secs(parse_var(
                "EVENT_BUS_VISIBILITY_TIMEOUT",
                30,
            )?),
            max_receives: parse_var("EVENT_BUS_MAX_RECEIVES", 3)?,
            bus_capacity: parse_var("EVENT_BUS_CAPACITY", 10_000)?,
            lookback: Duration::from_secs(parse_var("TIMELINE_LOOKBACK_SECS", 86_400)?),
            cors_origins: std::env::var("CORS_ORIGINS").ok().map(|origins| {
                origins
                    .split(',')
                    .map(|origin| origin.trim().to_owned())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            }),
        })
    }
}

fn require_var(name: &'static str) -> ConfigResult<String> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar { name })
}

fn parse_var<T>(name: &'static str, default: T) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| Box::new(e) as BoxedError)
            .context(InvalidVarSnafu { name }),
        Err(_) => Ok(default),
    }
}
