use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Business hours and daily limits. Built once at startup and shared read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// First bookable hour (inclusive).
    pub opening_hour: u32,
    /// Hour at which the last slot must have started (exclusive).
    pub closing_hour: u32,
    pub slot_minutes: u32,
    /// Max active reservations per calendar day.
    pub daily_capacity: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            opening_hour: 9,
            closing_hour: 19,
            slot_minutes: 30,
            daily_capacity: 20,
        }
    }
}

impl ScheduleConfig {
    pub fn new(
        opening_hour: u32,
        closing_hour: u32,
        slot_minutes: u32,
        daily_capacity: u32,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            opening_hour,
            closing_hour,
            slot_minutes,
            daily_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.closing_hour > 24 {
            return Err(ConfigError::Schedule(format!(
                "closing hour {} is past midnight",
                self.closing_hour
            )));
        }
        if self.opening_hour >= self.closing_hour {
            return Err(ConfigError::Schedule(format!(
                "opening hour {} must be before closing hour {}",
                self.opening_hour, self.closing_hour
            )));
        }
        if self.slot_minutes == 0 {
            return Err(ConfigError::Schedule("slot duration must be positive".into()));
        }
        if self.daily_capacity == 0 {
            return Err(ConfigError::Schedule("daily capacity must be positive".into()));
        }
        Ok(())
    }
}

/// Process-level settings read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub user: String,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub schedule: ScheduleConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = ScheduleConfig::default();
        let schedule = ScheduleConfig::new(
            parse_var(&lookup, "SLOTBOOK_OPENING_HOUR")?.unwrap_or(defaults.opening_hour),
            parse_var(&lookup, "SLOTBOOK_CLOSING_HOUR")?.unwrap_or(defaults.closing_hour),
            parse_var(&lookup, "SLOTBOOK_SLOT_MINUTES")?.unwrap_or(defaults.slot_minutes),
            parse_var(&lookup, "SLOTBOOK_DAILY_CAPACITY")?.unwrap_or(defaults.daily_capacity),
        )?;

        Ok(Self {
            bind: lookup("SLOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_var(&lookup, "SLOTBOOK_PORT")?.unwrap_or(5433),
            data_dir: lookup("SLOTBOOK_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            user: lookup("SLOTBOOK_USER").unwrap_or_else(|| "admin".into()),
            password: lookup("SLOTBOOK_PASSWORD").unwrap_or_else(|| "slotbook".into()),
            max_connections: parse_var(&lookup, "SLOTBOOK_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parse_var(&lookup, "SLOTBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parse_var(&lookup, "SLOTBOOK_METRICS_PORT")?,
            tls_cert: lookup("SLOTBOOK_TLS_CERT"),
            tls_key: lookup("SLOTBOOK_TLS_KEY"),
            schedule,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
    Schedule(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "invalid value for {key}: {value:?}"),
            ConfigError::Schedule(msg) => write!(f, "invalid schedule: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

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
    fn defaults_when_unset() {
        let cfg = ServerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.schedule, ScheduleConfig::default());
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/reservations.wal"));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = ServerConfig::from_lookup(lookup_from(&[
            ("SLOTBOOK_PORT", "6000"),
            ("SLOTBOOK_OPENING_HOUR", "8"),
            ("SLOTBOOK_CLOSING_HOUR", "17"),
            ("SLOTBOOK_SLOT_MINUTES", "45"),
            ("SLOTBOOK_DAILY_CAPACITY", "5"),
            ("SLOTBOOK_METRICS_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.schedule, ScheduleConfig::new(8, 17, 45, 5).unwrap());
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = ServerConfig::from_lookup(lookup_from(&[("SLOTBOOK_PORT", "eighty")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "SLOTBOOK_PORT",
                value: "eighty".into()
            }
        );
    }

    #[test]
    fn schedule_validation() {
        assert!(ScheduleConfig::new(9, 19, 30, 20).is_ok());
        assert!(ScheduleConfig::new(0, 24, 60, 1).is_ok());
        assert!(matches!(ScheduleConfig::new(19, 9, 30, 20), Err(ConfigError::Schedule(_))));
        assert!(matches!(ScheduleConfig::new(9, 9, 30, 20), Err(ConfigError::Schedule(_))));
        assert!(matches!(ScheduleConfig::new(9, 25, 30, 20), Err(ConfigError::Schedule(_))));
        assert!(matches!(ScheduleConfig::new(9, 19, 0, 20), Err(ConfigError::Schedule(_))));
        assert!(matches!(ScheduleConfig::new(9, 19, 30, 0), Err(ConfigError::Schedule(_))));
    }

    #[test]
    fn invalid_schedule_from_env_rejected() {
        let result = ServerConfig::from_lookup(lookup_from(&[
            ("SLOTBOOK_OPENING_HOUR", "20"),
            ("SLOTBOOK_CLOSING_HOUR", "10"),
        ]));
        assert!(matches!(result, Err(ConfigError::Schedule(_))));
    }
}
