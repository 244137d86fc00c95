use serde::Deserialize;

use crate::reconcile::matcher::MatchMode;

/// Which queue a `trade.started` webhook lands in.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMode {
    /// Dispatcher assigns immediately; unassignable trades go to the
    /// automatic backlog drained by `drain_one`.
    Auto,
    /// Trades wait in the manual backlog until an operator pulls a
    /// batch with a time limit.
    Manual,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// When unset, all stores run in-memory.
    pub database_url: Option<String>,
    pub bind_address: String,
    pub exchange_base_url: String,
    pub assignment_mode: AssignmentMode,
    /// `mark_paid` overwrite policy for already-recorded
    /// `name`/`amount_paid` fields. Default: fill only if absent.
    pub overwrite_on_remark: bool,
    pub match_mode: MatchMode,
    pub stats_cache_ttl_ms: u64,
    pub chat_fetch_attempts: u32,
    pub chat_fetch_delay_ms: u64,
    pub cas_max_retries: u32,
    pub expiration_retry_delay_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            exchange_base_url: std::env::var("EXCHANGE_BASE_URL")
                .unwrap_or_else(|_| "https://api.paxful.com".to_string()),
            assignment_mode: match std::env::var("ASSIGNMENT_MODE").as_deref() {
                Ok("manual") => AssignmentMode::Manual,
                _ => AssignmentMode::Auto,
            },
            overwrite_on_remark: std::env::var("OVERWRITE_ON_REMARK")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            match_mode: match std::env::var("MATCH_MODE").as_deref() {
                Ok("exact") => MatchMode::ExactAmount,
                _ => MatchMode::LeadingDigits,
            },
            stats_cache_ttl_ms: parse_env("STATS_CACHE_TTL_MS", 30_000)?,
            chat_fetch_attempts: parse_env("CHAT_FETCH_ATTEMPTS", 5)?,
            chat_fetch_delay_ms: parse_env("CHAT_FETCH_DELAY_MS", 60_000)?,
            cas_max_retries: parse_env("CAS_MAX_RETRIES", 5)?,
            expiration_retry_delay_ms: parse_env("EXPIRATION_RETRY_DELAY_MS", 5_000)?,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, config::ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| config::ConfigError::Message(format!("invalid value for {}", name))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.assignment_mode, AssignmentMode::Auto);
        assert!(!config.overwrite_on_remark);
        assert_eq!(config.cas_max_retries, 5);
    }
}
