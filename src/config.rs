use std::{env, fmt::Display, num::NonZeroUsize, str::FromStr, time::Duration};

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub pool_size: u32,
    pub acquire_timeout: Duration,
    /// Pending operations that trigger a flush before the interval elapses.
    pub batch_size: usize,
    pub flush_max_attempts: u32,
    pub flush_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub capacity: NonZeroUsize,
    /// How long an expired entry survives the sweep for stale reads.
    pub stale_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
    pub idle_eviction: Duration,
}

#[derive(Debug, Clone)]
pub struct LeaderboardConfig {
    pub default_size: usize,
    pub max_size: usize,
    pub reset_period: chrono::Duration,
}

#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub flush_interval: Duration,
    pub sweep_interval: Duration,
    pub reset_check_interval: Duration,
    pub drain_timeout: Duration,
}

#[derive(Clone)]
pub struct Config {
    pub discord_token: String,
    pub guild_id: Option<u64>,
    pub message_channel_id: Option<u64>,
    pub voice_channel_id: Option<u64>,
    pub update_interval: Duration,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub leaderboard: LeaderboardConfig,
    pub tasks: TaskConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"***")
            .field("guild_id", &self.guild_id)
            .field("message_channel_id", &self.message_channel_id)
            .field("voice_channel_id", &self.voice_channel_id)
            .field("update_interval", &self.update_interval)
            .field("store", &self.store)
            .field("cache", &self.cache)
            .field("rate_limit", &self.rate_limit)
            .field("leaderboard", &self.leaderboard)
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl Config {
    /// Reads the process environment. Call `dotenv` first to pick up `.env`.
    pub fn from_env() -> Result<Config, ConfigError> {
        Config::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let discord_token = lookup("DISCORD_TOKEN")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::Missing("DISCORD_TOKEN"))?;

        let pool_size: u32 = parse(&lookup, "DB_POOL_SIZE", 10)?;
        if pool_size < 1 {
            return Err(ConfigError::invalid("DB_POOL_SIZE", "must be at least 1"));
        }
        let batch_size: usize = parse(&lookup, "BATCH_SIZE", 100)?;
        if batch_size < 1 {
            return Err(ConfigError::invalid("BATCH_SIZE", "must be at least 1"));
        }
        let flush_max_attempts: u32 = parse(&lookup, "FLUSH_MAX_ATTEMPTS", 5)?;
        if flush_max_attempts < 1 {
            return Err(ConfigError::invalid("FLUSH_MAX_ATTEMPTS", "must be at least 1"));
        }

        let ttl = positive_secs(&lookup, "CACHE_TTL", 300)?;
        let capacity = NonZeroUsize::new(parse(&lookup, "CACHE_SIZE", 1000)?)
            .ok_or_else(|| ConfigError::invalid("CACHE_SIZE", "must be positive"))?;

        let rate_capacity: u32 = parse(&lookup, "RATE_LIMIT_CAPACITY", 50)?;
        if rate_capacity < 1 {
            return Err(ConfigError::invalid("RATE_LIMIT_CAPACITY", "must be at least 1"));
        }
        let refill_per_sec: f64 = parse(&lookup, "RATE_LIMIT_REFILL", 1.0)?;
        if !refill_per_sec.is_finite() || refill_per_sec <= 0.0 {
            return Err(ConfigError::invalid("RATE_LIMIT_REFILL", "must be a positive number"));
        }

        let max_size: usize = parse(&lookup, "MAX_LEADERBOARD_SIZE", 10)?;
        let default_size: usize = parse(&lookup, "LEADERBOARD_SIZE", 10)?;
        if default_size < 1 || default_size > max_size {
            return Err(ConfigError::invalid(
                "LEADERBOARD_SIZE",
                format!("must be between 1 and {}", max_size),
            ));
        }
        let refresh_days: i64 = parse(&lookup, "LEADERBOARD_REFRESH_DAYS", 30)?;
        if refresh_days < 1 {
            return Err(ConfigError::invalid("LEADERBOARD_REFRESH_DAYS", "must be at least 1"));
        }

        let update_interval = positive_secs(&lookup, "UPDATE_INTERVAL", 300)?;
        if update_interval < Duration::from_secs(60) {
            return Err(ConfigError::invalid("UPDATE_INTERVAL", "must be at least 60 seconds"));
        }

        Ok(Config {
            discord_token,
            guild_id: optional(&lookup, "GUILD_ID")?,
            message_channel_id: optional(&lookup, "MESSAGE_CHANNEL_ID")?,
            voice_channel_id: optional(&lookup, "VOICE_CHANNEL_ID")?,
            update_interval,
            store: StoreConfig {
                database_url: lookup("DATABASE_URL")
                    .unwrap_or_else(|| "leaderboard.db".to_string()),
                pool_size,
                acquire_timeout: positive_secs(&lookup, "DB_TIMEOUT", 30)?,
                batch_size,
                flush_max_attempts,
                flush_backoff: Duration::from_millis(parse(&lookup, "FLUSH_BACKOFF_MS", 200)?),
            },
            cache: CacheConfig {
                ttl,
                capacity,
                stale_grace: Duration::from_secs(parse(&lookup, "CACHE_STALE_GRACE", 3600)?),
            },
            rate_limit: RateLimitConfig {
                capacity: rate_capacity,
                refill_per_sec,
                idle_eviction: positive_secs(&lookup, "RATE_LIMIT_IDLE", 3600)?,
            },
            leaderboard: LeaderboardConfig {
                default_size,
                max_size,
                reset_period: chrono::Duration::days(refresh_days),
            },
            tasks: TaskConfig {
                flush_interval: positive_secs(&lookup, "FLUSH_INTERVAL", 60)?,
                sweep_interval: positive_secs(&lookup, "SWEEP_INTERVAL", 60)?,
                reset_check_interval: positive_secs(&lookup, "RESET_CHECK_INTERVAL", 3600)?,
                drain_timeout: positive_secs(&lookup, "SHUTDOWN_DRAIN_TIMEOUT", 10)?,
            },
        })
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string())),
        None => Ok(default),
    }
}

fn optional<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: std::num::ParseIntError| ConfigError::invalid(key, e.to_string())),
        None => Ok(None),
    }
}

fn positive_secs<F>(lookup: &F, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse(lookup, key, default)?;
    if secs == 0 {
        return Err(ConfigError::invalid(key, "must be positive"));
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
impl Config {
    /// Small, fast settings for tests against a throwaway database file.
    pub fn for_tests(database_url: &str) -> Config {
        let mut config = Config::from_lookup(|key| match key {
            "DISCORD_TOKEN" => Some("test-token".to_string()),
            _ => None,
        })
        .expect("defaults are valid");
        config.store.database_url = database_url.to_string();
        config.store.pool_size = 2;
        config.store.acquire_timeout = Duration::from_millis(100);
        config.store.flush_backoff = Duration::from_millis(1);
        config.store.flush_max_attempts = 2;
        config.rate_limit.capacity = 1000;
        config
    }
}
