use std::env;
use std::str::FromStr;

use anyhow::Context;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub db_max_connections: u32,
    /// Minutes per patient used for the estimated wait shown next to a queue position.
    pub queue_slot_minutes: i64,
    pub notify_max_attempts: u32,
    pub notify_retry_delay_ms: u64,
    /// When unset, notifications are only written to the log.
    pub notify_webhook_url: Option<String>,
    pub history_max_days: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL must be set")?;
        let bind_addr = lookup("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string());

        let db_max_connections = parse_or(&lookup, "DB_MAX_CONNECTIONS", 10u32)?;
        let queue_slot_minutes = parse_or(&lookup, "QUEUE_SLOT_MINUTES", 20i64)?;
        let notify_max_attempts = parse_or(&lookup, "NOTIFY_MAX_ATTEMPTS", 2u32)?;
        let notify_retry_delay_ms = parse_or(&lookup, "NOTIFY_RETRY_DELAY_MS", 250u64)?;
        let history_max_days = parse_or(&lookup, "HISTORY_MAX_DAYS", 92i64)?;

        if db_max_connections == 0 {
            anyhow::bail!("DB_MAX_CONNECTIONS must be > 0");
        }
        if queue_slot_minutes <= 0 {
            anyhow::bail!("QUEUE_SLOT_MINUTES must be > 0");
        }
        if notify_max_attempts == 0 {
            anyhow::bail!("NOTIFY_MAX_ATTEMPTS must be > 0");
        }
        if history_max_days <= 0 {
            anyhow::bail!("HISTORY_MAX_DAYS must be > 0");
        }

        let notify_webhook_url = lookup("NOTIFY_WEBHOOK_URL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Self {
            database_url,
            bind_addr,
            db_max_connections,
            queue_slot_minutes,
            notify_max_attempts,
            notify_retry_delay_ms,
            notify_webhook_url,
            history_max_days,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let cfg = Config::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://localhost/doral")])).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:8080");
        assert_eq!(cfg.db_max_connections, 10);
        assert_eq!(cfg.queue_slot_minutes, 20);
        assert_eq!(cfg.notify_max_attempts, 2);
        assert_eq!(cfg.history_max_days, 92);
        assert!(cfg.notify_webhook_url.is_none());
    }

    #[test]
    fn missing_database_url_is_an_error() {
        assert!(Config::from_lookup(lookup_from(&[])).is_err());
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/doral"),
            ("QUEUE_SLOT_MINUTES", "twenty"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("QUEUE_SLOT_MINUTES"));
    }

    #[test]
    fn blank_webhook_url_means_log_only() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/doral"),
            ("NOTIFY_WEBHOOK_URL", "   "),
        ]))
        .unwrap();
        assert!(cfg.notify_webhook_url.is_none());
    }
}
