//! Application settings loaded from the YAML file given on the command line.
//!
//! Unknown keys are ignored; absent optional sections fall back to defaults.
//! `validate()` rejects configurations the pipeline cannot run with.

use std::fmt;
use std::str::FromStr;

use config::{Config, File};
use serde::Deserialize;

use observer_common::ConfigurationError;

/// A named aggregation window, parsed from a duration string ("5m", "1h").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub name: String,
    pub seconds: i64,
}

impl FromStr for Window {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigurationError::InvalidValue {
            field: "windows_aggregation".to_string(),
            reason: format!("'{}': {}", s, reason),
        };

        let split = s
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(i, _)| i)
            .ok_or_else(|| invalid("missing unit suffix"))?;

        let (digits, unit) = s.split_at(split);
        let value: i64 = digits
            .parse()
            .map_err(|_| invalid("missing numeric value"))?;
        if value <= 0 {
            return Err(invalid("duration must be positive"));
        }

        let per_unit = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86_400,
            "w" => 604_800,
            _ => return Err(invalid("unit must be one of s, m, h, d, w")),
        };

        Ok(Window {
            name: s.to_string(),
            seconds: value * per_unit,
        })
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// "postgres" or anything else for the embedded SQLite store
    #[serde(default)]
    pub db_type: String,
    #[serde(default)]
    pub db_path: String,
    #[serde(default)]
    pub db_connection_string: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSettings {
    /// Enables proxy rotation and scrape-refresh
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub proxies: Vec<String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout", rename = "timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_retries", rename = "retries")]
    pub max_retries: u32,
    #[serde(default = "default_concurrent_requests")]
    pub concurrent_requests: usize,
    #[serde(default)]
    pub user_agent: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            proxies: Vec::new(),
            request_timeout: default_timeout(),
            max_retries: default_retries(),
            concurrent_requests: default_concurrent_requests(),
            user_agent: String::new(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}
fn default_retries() -> u32 {
    3
}
fn default_concurrent_requests() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    pub name: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataSourceSettings {
    #[serde(default = "default_retention_days")]
    pub data_retention_days: i64,
    #[serde(default = "default_update_interval")]
    pub update_interval_seconds: u64,
    #[serde(default)]
    pub sources: Vec<SourceSettings>,
}

fn default_retention_days() -> i64 {
    7
}
fn default_update_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub struct Settings {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Recognized for the external control plane; not used by this binary
    #[serde(default)]
    pub grpc_host: String,
    #[serde(default)]
    pub grpc_port: u16,
    pub storage: StorageSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    pub data_source: DataSourceSettings,
    #[serde(default)]
    pub windows_aggregation: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load and validate the configuration file at `path`.
    pub fn load(path: &str) -> Result<Self, ConfigurationError> {
        let settings: Settings = Config::builder()
            .add_source(File::with_name(path))
            .build()
            .map_err(|e| ConfigurationError::Parse(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parse(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        fn invalid(field: &str, reason: impl Into<String>) -> ConfigurationError {
            ConfigurationError::InvalidValue {
                field: field.to_string(),
                reason: reason.into(),
            }
        }

        if self.name.is_empty() {
            return Err(ConfigurationError::MissingField("name".to_string()));
        }
        if self.host.is_empty() {
            return Err(ConfigurationError::MissingField("host".to_string()));
        }
        if self.port <= 1024 {
            return Err(invalid(
                "port",
                format!("{} (must be between 1025 and 65535)", self.port),
            ));
        }
        if self.storage.db_type == "sqlite" && self.storage.db_path.is_empty() {
            return Err(ConfigurationError::MissingField(
                "storage.db_path".to_string(),
            ));
        }
        if self.network.request_timeout == 0 {
            return Err(invalid("network.timeout", "must be greater than 0"));
        }
        if self.network.concurrent_requests == 0 {
            return Err(invalid(
                "network.concurrent_requests",
                "must be greater than 0",
            ));
        }
        if self.data_source.update_interval_seconds == 0 {
            return Err(invalid(
                "data_source.update_interval_seconds",
                "must be greater than 0",
            ));
        }
        if self.data_source.data_retention_days <= 0 {
            return Err(invalid(
                "data_source.data_retention_days",
                "must be greater than 0",
            ));
        }
        if self.data_source.sources.is_empty() {
            return Err(ConfigurationError::MissingField(
                "data_source.sources".to_string(),
            ));
        }
        for (i, src) in self.data_source.sources.iter().enumerate() {
            if src.name.is_empty() {
                return Err(invalid(
                    "data_source.sources",
                    format!("source {} must have a name", i),
                ));
            }
            if src.symbols.is_empty() {
                return Err(invalid(
                    "data_source.sources",
                    format!("source '{}' must have at least one symbol", src.name),
                ));
            }
        }

        // Windows must parse; duplicates would collide on table names.
        let windows = self.windows()?;
        for (i, w) in windows.iter().enumerate() {
            if windows[..i].iter().any(|other| other.name == w.name) {
                return Err(invalid(
                    "windows_aggregation",
                    format!("duplicate window '{}'", w.name),
                ));
            }
        }

        Ok(())
    }

    /// Parsed aggregation windows, in config order.
    pub fn windows(&self) -> Result<Vec<Window>, ConfigurationError> {
        self.windows_aggregation
            .iter()
            .map(|s| s.parse())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> Settings {
        Settings {
            name: "market-observer".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8000,
            log_level: "info".to_string(),
            grpc_host: String::new(),
            grpc_port: 0,
            storage: StorageSettings {
                db_type: String::new(),
                db_path: "observer.db".to_string(),
                db_connection_string: String::new(),
            },
            network: NetworkSettings::default(),
            data_source: DataSourceSettings {
                data_retention_days: 7,
                update_interval_seconds: 60,
                sources: vec![SourceSettings {
                    name: "yahoo".to_string(),
                    symbols: vec!["AAPL".to_string()],
                    api_key: String::new(),
                }],
            },
            windows_aggregation: vec!["5m".to_string(), "1h".to_string()],
        }
    }

    #[test]
    fn test_window_parsing() {
        assert_eq!("5m".parse::<Window>().unwrap().seconds, 300);
        assert_eq!("1h".parse::<Window>().unwrap().seconds, 3600);
        assert_eq!("90s".parse::<Window>().unwrap().seconds, 90);
        assert_eq!("1d".parse::<Window>().unwrap().seconds, 86_400);

        assert!("".parse::<Window>().is_err());
        assert!("5".parse::<Window>().is_err());
        assert!("m5".parse::<Window>().is_err());
        assert!("5x".parse::<Window>().is_err());
        assert!("0m".parse::<Window>().is_err());
    }

    #[test]
    fn test_valid_settings_pass() {
        assert!(base_settings().validate().is_ok());
    }

    #[test]
    fn test_privileged_port_rejected() {
        let mut s = base_settings();
        s.port = 80;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut s = base_settings();
        s.network.request_timeout = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_zero_retention_rejected() {
        let mut s = base_settings();
        s.data_source.data_retention_days = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_empty_sources_rejected() {
        let mut s = base_settings();
        s.data_source.sources.clear();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_source_without_symbols_rejected() {
        let mut s = base_settings();
        s.data_source.sources[0].symbols.clear();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_duplicate_windows_rejected() {
        let mut s = base_settings();
        s.windows_aggregation = vec!["5m".to_string(), "5m".to_string()];
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_bad_window_rejected() {
        let mut s = base_settings();
        s.windows_aggregation = vec!["fivemin".to_string()];
        assert!(s.validate().is_err());
    }
}
