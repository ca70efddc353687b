//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use secrecy::SecretString;

use crate::error::ConfigError;

/// Default team set, in the order the team keyboard shows them.
pub const DEFAULT_TEAMS: [&str; 4] = ["Red", "Yellow", "Green", "Blue"];

/// Bot configuration, read from `QUEST_*` environment variables.
#[derive(Debug, Clone)]
pub struct QuestConfig {
    /// Telegram bot token. When unset the bot runs on the local CLI channel.
    pub telegram_token: Option<SecretString>,
    /// Operator identities allowed to use admin commands.
    pub admin_ids: Vec<String>,
    /// Team names offered at registration.
    pub teams: Vec<String>,
    pub db_path: PathBuf,
    pub catalog_path: PathBuf,
    /// How often the availability sweep runs.
    pub sweep_interval: Duration,
    /// How long a poem turn-holder has before being skipped.
    pub turn_timeout: Duration,
    /// When the event closes (broadcast + poem cancellation).
    pub event_end_at: Option<DateTime<Utc>>,
    /// Offset used to resolve wall-clock times ("09:55") and to display them.
    pub utc_offset: FixedOffset,
    /// Port for the read-only status API. `None` disables it.
    pub http_port: Option<u16>,
    pub export_dir: Option<PathBuf>,
    pub export_webhook: Option<String>,
    /// Directory for daily rolling log files.
    pub log_dir: Option<PathBuf>,
}

impl Default for QuestConfig {
    fn default() -> Self {
        Self {
            telegram_token: None,
            admin_ids: Vec::new(),
            teams: DEFAULT_TEAMS.iter().map(|t| t.to_string()).collect(),
            db_path: PathBuf::from("./data/event-quest.db"),
            catalog_path: PathBuf::from("./config/catalog.json"),
            sweep_interval: Duration::from_secs(30),
            turn_timeout: Duration::from_secs(120), // 2 minutes
            event_end_at: None,
            utc_offset: Utc.fix(),
            http_port: Some(8080),
            export_dir: None,
            export_webhook: None,
            log_dir: None,
        }
    }
}

impl QuestConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let utc_offset = match get("QUEST_UTC_OFFSET_HOURS") {
            Some(raw) => {
                let hours: i32 = parse_value("QUEST_UTC_OFFSET_HOURS", &raw)?;
                FixedOffset::east_opt(hours * 3600).ok_or_else(|| ConfigError::InvalidValue {
                    key: "QUEST_UTC_OFFSET_HOURS".into(),
                    message: format!("{hours} is out of range"),
                })?
            }
            None => defaults.utc_offset,
        };

        let teams = get("QUEST_TEAMS")
            .map(|raw| split_list(&raw))
            .unwrap_or(defaults.teams);
        if teams.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "QUEST_TEAMS".into(),
                message: "at least one team is required".into(),
            });
        }

        let sweep_interval = match get("QUEST_SWEEP_INTERVAL_SECS") {
            Some(raw) => Duration::from_secs(parse_value("QUEST_SWEEP_INTERVAL_SECS", &raw)?),
            None => defaults.sweep_interval,
        };
        let turn_timeout = match get("QUEST_TURN_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_value("QUEST_TURN_TIMEOUT_SECS", &raw)?),
            None => defaults.turn_timeout,
        };
        if sweep_interval.is_zero() || turn_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "QUEST_SWEEP_INTERVAL_SECS/QUEST_TURN_TIMEOUT_SECS".into(),
                message: "intervals must be positive".into(),
            });
        }

        let event_end_at = match get("QUEST_EVENT_END_AT") {
            Some(raw) => Some(parse_event_end(&raw, utc_offset, today_in(utc_offset))?),
            None => None,
        };

        let http_port = match get("QUEST_HTTP_PORT").as_deref() {
            Some("off") | Some("0") => None,
            Some(raw) => Some(parse_value("QUEST_HTTP_PORT", raw)?),
            None => defaults.http_port,
        };

        Ok(Self {
            telegram_token: get("TELEGRAM_BOT_TOKEN").map(SecretString::from),
            admin_ids: get("QUEST_ADMIN_IDS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            teams,
            db_path: get("QUEST_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            catalog_path: get("QUEST_CATALOG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.catalog_path),
            sweep_interval,
            turn_timeout,
            event_end_at,
            utc_offset,
            http_port,
            export_dir: get("QUEST_EXPORT_DIR").map(PathBuf::from),
            export_webhook: get("QUEST_EXPORT_WEBHOOK"),
            log_dir: get("QUEST_LOG_DIR").map(PathBuf::from),
        })
    }

    /// The event day in the configured offset.
    pub fn today(&self) -> NaiveDate {
        today_in(self.utc_offset)
    }

    /// Whether `identity` is an operator.
    pub fn is_admin(&self, identity: &str) -> bool {
        self.admin_ids.iter().any(|id| id == identity)
    }
}

fn today_in(offset: FixedOffset) -> NaiveDate {
    Utc::now().with_timezone(&offset).date_naive()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

/// Accepts an RFC 3339 timestamp or a wall-clock `HH:MM` on `today`.
fn parse_event_end(
    raw: &str,
    offset: FixedOffset,
    today: NaiveDate,
) -> Result<DateTime<Utc>, ConfigError> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "QUEST_EVENT_END_AT".into(),
        message,
    };
    let time = NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|_| invalid(format!("'{raw}' is neither RFC 3339 nor HH:MM")))?;
    offset
        .from_local_datetime(&today.and_time(time))
        .single()
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(|| invalid(format!("'{raw}' is ambiguous")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = QuestConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.telegram_token.is_none());
        assert_eq!(config.teams, vec!["Red", "Yellow", "Green", "Blue"]);
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.turn_timeout, Duration::from_secs(120));
        assert_eq!(config.http_port, Some(8080));
        assert!(config.event_end_at.is_none());
    }

    #[test]
    fn reads_lists_and_numbers() {
        let config = QuestConfig::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("QUEST_ADMIN_IDS", " 42, 7 ,"),
            ("QUEST_TEAMS", "North,South"),
            ("QUEST_TURN_TIMEOUT_SECS", "5"),
            ("QUEST_HTTP_PORT", "off"),
            ("QUEST_UTC_OFFSET_HOURS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.telegram_token.unwrap().expose_secret(), "123:abc");
        assert_eq!(config.admin_ids, vec!["42", "7"]);
        assert_eq!(config.teams, vec!["North", "South"]);
        assert_eq!(config.turn_timeout, Duration::from_secs(5));
        assert_eq!(config.http_port, None);
        assert_eq!(config.utc_offset.local_minus_utc(), 3 * 3600);
    }

    #[test]
    fn rejects_garbage_numbers() {
        let err = QuestConfig::from_lookup(lookup(&[("QUEST_SWEEP_INTERVAL_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "QUEST_SWEEP_INTERVAL_SECS"));
    }

    #[test]
    fn event_end_accepts_rfc3339_and_wall_clock() {
        let offset = FixedOffset::east_opt(3 * 3600).unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();

        let at = parse_event_end("2026-03-14T18:00:00Z", offset, day).unwrap();
        assert_eq!(at.to_rfc3339(), "2026-03-14T18:00:00+00:00");

        let at = parse_event_end("17:30", offset, day).unwrap();
        assert_eq!(at.to_rfc3339(), "2026-03-14T14:30:00+00:00");

        assert!(parse_event_end("later", offset, day).is_err());
    }

    #[test]
    fn admin_check() {
        let config = QuestConfig {
            admin_ids: vec!["1".into()],
            ..Default::default()
        };
        assert!(config.is_admin("1"));
        assert!(!config.is_admin("2"));
    }
}
