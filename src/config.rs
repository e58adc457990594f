use std::path::PathBuf;

use chrono::{Duration, NaiveTime};
use thiserror::Error;

use crate::engine::BookingPolicy;
use crate::model::hhmm;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not valid: {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("COURTBOOK_OPEN_TIME must be before COURTBOOK_CLOSE_TIME")]
    EmptyBusinessHours,
    #[error("COURTBOOK_TELEGRAM_TOKEN and COURTBOOK_TELEGRAM_CHAT_ID must be set together")]
    IncompleteTelegram,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramConfig {
    pub token: String,
    pub chat_id: String,
}

/// Service configuration, read from `COURTBOOK_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Shared secret the gateway presents as a bearer token. No check when unset.
    pub api_token: Option<String>,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub open_time: NaiveTime,
    pub close_time: NaiveTime,
    pub cancel_lead_minutes: i64,
    pub telegram: Option<TelegramConfig>,
    /// Local time of the daily available-slots broadcast.
    pub broadcast_at: NaiveTime,
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let telegram = match (var("COURTBOOK_TELEGRAM_TOKEN"), var("COURTBOOK_TELEGRAM_CHAT_ID")) {
            (Some(token), Some(chat_id)) => Some(TelegramConfig { token, chat_id }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTelegram),
        };

        let config = Self {
            bind: var("COURTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse("COURTBOOK_PORT", var("COURTBOOK_PORT"), 8080)?,
            data_dir: var("COURTBOOK_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            api_token: var("COURTBOOK_API_TOKEN"),
            metrics_port: var("COURTBOOK_METRICS_PORT")
                .map(|v| parse_value("COURTBOOK_METRICS_PORT", v))
                .transpose()?,
            compact_threshold: parse("COURTBOOK_COMPACT_THRESHOLD", var("COURTBOOK_COMPACT_THRESHOLD"), 1000)?,
            open_time: time("COURTBOOK_OPEN_TIME", var("COURTBOOK_OPEN_TIME"), 8)?,
            close_time: time("COURTBOOK_CLOSE_TIME", var("COURTBOOK_CLOSE_TIME"), 23)?,
            cancel_lead_minutes: parse(
                "COURTBOOK_CANCEL_LEAD_MINUTES",
                var("COURTBOOK_CANCEL_LEAD_MINUTES"),
                120,
            )?,
            telegram,
            broadcast_at: time("COURTBOOK_BROADCAST_AT", var("COURTBOOK_BROADCAST_AT"), 9)?,
        };
        if config.open_time >= config.close_time {
            return Err(ConfigError::EmptyBusinessHours);
        }
        if config.cancel_lead_minutes < 0 {
            return Err(ConfigError::Invalid {
                var: "COURTBOOK_CANCEL_LEAD_MINUTES",
                value: config.cancel_lead_minutes.to_string(),
            });
        }
        Ok(config)
    }

    pub fn policy(&self) -> BookingPolicy {
        BookingPolicy {
            open: self.open_time,
            close: self.close_time,
            cancel_lead: Duration::minutes(self.cancel_lead_minutes),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("courtbook.wal")
    }
}

fn parse_value<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}

fn parse<T: std::str::FromStr>(var: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    value.map_or(Ok(default), |v| parse_value(var, v))
}

fn time(var: &'static str, value: Option<String>, default_hour: u32) -> Result<NaiveTime, ConfigError> {
    match value {
        Some(v) => hhmm::parse(v.trim()).map_err(|_| ConfigError::Invalid { var, value: v }),
        None => NaiveTime::from_hms_opt(default_hour, 0, 0)
            .ok_or(ConfigError::Invalid { var, value: default_hour.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.telegram, None);
        assert_eq!(config.policy(), BookingPolicy::default());
        assert_eq!(config.wal_path(), PathBuf::from("./data/courtbook.wal"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("COURTBOOK_PORT", "9000"),
            ("COURTBOOK_METRICS_PORT", "9100"),
            ("COURTBOOK_OPEN_TIME", "07:30"),
            ("COURTBOOK_CLOSE_TIME", "22:00:00"),
            ("COURTBOOK_CANCEL_LEAD_MINUTES", "60"),
            ("COURTBOOK_TELEGRAM_TOKEN", "abc"),
            ("COURTBOOK_TELEGRAM_CHAT_ID", "-100"),
        ])
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.metrics_port, Some(9100));
        let policy = config.policy();
        assert_eq!(policy.open, NaiveTime::from_hms_opt(7, 30, 0).unwrap());
        assert_eq!(policy.business_hours_per_day(), 14.5);
        assert_eq!(policy.cancel_lead, Duration::minutes(60));
        assert_eq!(config.telegram.unwrap().chat_id, "-100");
    }

    #[test]
    fn bad_values_fail() {
        assert!(matches!(
            load(&[("COURTBOOK_PORT", "eighty")]),
            Err(ConfigError::Invalid { var: "COURTBOOK_PORT", .. })
        ));
        assert!(matches!(
            load(&[("COURTBOOK_OPEN_TIME", "23:00"), ("COURTBOOK_CLOSE_TIME", "08:00")]),
            Err(ConfigError::EmptyBusinessHours)
        ));
        assert!(matches!(
            load(&[("COURTBOOK_TELEGRAM_TOKEN", "abc")]),
            Err(ConfigError::IncompleteTelegram)
        ));
    }
}
