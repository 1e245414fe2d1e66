//! Server configuration and environment helpers.
//!
//! [`ServerConfig`] is layered: defaults, then `MALTOSE_SERVER_*` environment
//! variables (after `.env` is loaded), then an explicit key/value map. Keys are
//! case-insensitive and `_`/`-` are ignored, so `readTimeout`,
//! `READ_TIMEOUT` and `read-timeout` name the same setting.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, IntoError};
use crate::openapi::DEFAULT_SWAGGER_TEMPLATE;
use crate::validate::Locale;

const ENV_PREFIX: &str = "MALTOSE_SERVER_";

/// Load environment variables from `.env` files if it exists.
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}

/// Get a required environment variable.
pub fn get_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key.to_string()))
}

/// Get an optional environment with a default value
pub fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get and parse an environment variable.
pub fn get_env_parsed<T: FromStr>(key: &str) -> Result<T, ConfigError> {
    let value = get_env(key)?;
    value.parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value,
    })
}

/// Get and parse an environment variable with a default.
pub fn get_env_parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    /// A required value is not set.
    Missing(String),
    /// Several required values are not set.
    MissingMultiple(Vec<String>),
    /// A value could not be parsed.
    Invalid { key: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(key) => {
                write!(f, "Missing required configuration '{}'", key)
            }
            ConfigError::MissingMultiple(keys) => {
                writeln!(f, "Missing required configuration:")?;
                for key in keys {
                    writeln!(f, "  - {}", key)?;
                }
                Ok(())
            }
            ConfigError::Invalid { key, value } => {
                write!(f, "Invalid value '{}' for configuration '{}'", value, key)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl IntoError for ConfigError {
    fn into_error(self) -> Error {
        Error::wrap(self, "invalid server configuration")
    }
}

/// TLS settings. Both files are required when enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub enable: bool,
    pub cert_file: String,
    pub key_file: String,
}

impl TlsConfig {
    /// Checks the files are named and exist.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing: Vec<String> = [
            ("tlsCertFile", &self.cert_file),
            ("tlsKeyFile", &self.key_file),
        ]
        .into_iter()
        .filter(|(_, path)| path.is_empty() || !std::path::Path::new(path).is_file())
        .map(|(key, _)| key.to_string())
        .collect();

        match missing.len() {
            0 => Ok(()),
            1 => Err(ConfigError::Missing(missing.into_iter().next().unwrap_or_default())),
            _ => Err(ConfigError::MissingMultiple(missing)),
        }
    }
}

/// Resolved server settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// `host:port`; a bare `:port` listens on all interfaces.
    pub address: String,
    /// Used as the OpenAPI title.
    pub name: String,
    /// Language of validation messages.
    pub locale: Locale,
    /// Limit for reading request headers and body.
    pub read_timeout: Duration,
    /// Limit for producing the response. Zero disables it.
    pub write_timeout: Duration,
    /// Keep-alive connections idle this long are closed.
    pub idle_timeout: Duration,
    pub max_header_bytes: usize,
    pub health_check: bool,
    pub tls: TlsConfig,
    /// Drain budget for in-flight requests on stop.
    pub graceful_timeout: Duration,
    /// Pause before draining starts, so load balancers can react.
    pub graceful_wait_time: Duration,
    pub openapi_path: String,
    pub swagger_path: String,
    pub swagger_template: String,
    /// Prometheus exposition path. Empty disables it.
    pub metrics_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8000".to_string(),
            name: "maltose".to_string(),
            locale: Locale::En,
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::ZERO,
            idle_timeout: Duration::from_secs(60),
            max_header_bytes: 10 * 1024,
            health_check: true,
            tls: TlsConfig::default(),
            graceful_timeout: Duration::from_secs(10),
            graceful_wait_time: Duration::ZERO,
            openapi_path: "/openapi.json".to_string(),
            swagger_path: "/swagger".to_string(),
            swagger_template: DEFAULT_SWAGGER_TEMPLATE.to_string(),
            metrics_path: String::new(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by the given keys.
    pub fn from_map<I, K, V>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self::default().merge(entries)
    }

    /// Defaults overridden by `MALTOSE_SERVER_<KEY>` variables. Loads `.env`
    /// first.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        let entries = env::vars().filter_map(|(key, value)| {
            key.strip_prefix(ENV_PREFIX)
                .map(|key| (key.to_string(), value))
        });
        Self::default().merge(entries)
    }

    /// Environment, then `overrides`.
    pub fn load<I, K, V>(overrides: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self::from_env()?.merge(overrides)
    }

    /// Applies every entry on top of `self`.
    pub fn merge<I, K, V>(mut self, entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in entries {
            self.set(key.as_ref(), value.as_ref())?;
        }
        Ok(self)
    }

    /// Sets one key. Unknown keys are ignored with a warning.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        };
        let text = value.trim();

        match normalise_key(key).as_str() {
            "address" => self.address = normalise_address(text),
            "name" => self.name = text.to_string(),
            "locale" => self.locale = text.parse().map_err(|_| invalid())?,
            "readtimeout" => self.read_timeout = parse_duration(text).ok_or_else(invalid)?,
            "writetimeout" => self.write_timeout = parse_duration(text).ok_or_else(invalid)?,
            "idletimeout" => self.idle_timeout = parse_duration(text).ok_or_else(invalid)?,
            "maxheaderbytes" => self.max_header_bytes = text.parse().map_err(|_| invalid())?,
            "healthcheck" => self.health_check = parse_bool(text).ok_or_else(invalid)?,
            "tlsenable" => self.tls.enable = parse_bool(text).ok_or_else(invalid)?,
            "tlscertfile" => self.tls.cert_file = text.to_string(),
            "tlskeyfile" => self.tls.key_file = text.to_string(),
            "gracefultimeout" => {
                self.graceful_timeout = parse_duration(text).ok_or_else(invalid)?
            }
            "gracefulwaittime" => {
                self.graceful_wait_time = parse_duration(text).ok_or_else(invalid)?
            }
            "openapipath" => self.openapi_path = text.to_string(),
            "swaggerpath" => self.swagger_path = text.to_string(),
            // templates keep their whitespace
            "swaggertemplate" => self.swagger_template = value.to_string(),
            "metricspath" => self.metrics_path = text.to_string(),
            _ => tracing::warn!(key, "unknown server configuration key ignored"),
        }
        Ok(())
    }
}

fn normalise_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn normalise_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    }
}

/// `500ms`, `30s`, `1m`, `1h`, or bare seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    let seconds = match unit.trim() {
        "ms" => number / 1000.0,
        "" | "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(seconds))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for (key, _) in env::vars().filter(|(k, _)| k.starts_with(ENV_PREFIX)) {
            unsafe { env::remove_var(key) };
        }
    }

    #[test]
    fn test_get_env_missing() {
        let result = get_env("MALTOSE_TEST_MISSING_VAR_12345");
        assert!(result.is_err());
    }

    #[test]
    fn test_get_env_or_default() {
        let value = get_env_or("MALTOSE_TEST_MISSING_VAR_12345", "default");
        assert_eq!(value, "default");
    }

    #[test]
    fn test_get_env_parsed_or_default() {
        let value: u16 = get_env_parsed_or("MALTOSE_TEST_MISSING_VAR_12345", 3000);
        assert_eq!(value, 3000);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Missing("tlsCertFile".to_string());
        assert_eq!(err.to_string(), "Missing required configuration 'tlsCertFile'");

        let err = ConfigError::Invalid {
            key: "readTimeout".to_string(),
            value: "soon".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid value 'soon' for configuration 'readTimeout'"
        );
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.address, "0.0.0.0:8000");
        assert_eq!(config.name, "maltose");
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.write_timeout, Duration::ZERO);
        assert_eq!(config.max_header_bytes, 10240);
        assert!(config.health_check);
        assert!(!config.tls.enable);
        assert_eq!(config.openapi_path, "/openapi.json");
        assert_eq!(config.swagger_path, "/swagger");
        assert!(config.swagger_template.contains("%s"));
        assert!(config.metrics_path.is_empty());
    }

    #[test]
    fn test_keys_are_case_and_separator_insensitive() {
        let config = ServerConfig::from_map([
            ("readTimeout", "5s"),
            ("WRITE_TIMEOUT", "250ms"),
            ("idle-timeout", "2m"),
            ("MaxHeaderBytes", "4096"),
            ("address", ":9000"),
            ("locale", "zh-CN"),
            ("healthCheck", "off"),
        ])
        .unwrap();

        assert_eq!(config.read_timeout, Duration::from_secs(5));
        assert_eq!(config.write_timeout, Duration::from_millis(250));
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.max_header_bytes, 4096);
        assert_eq!(config.address, "0.0.0.0:9000");
        assert_eq!(config.locale, Locale::Zh);
        assert!(!config.health_check);
    }

    #[test]
    fn test_invalid_value() {
        let err = ServerConfig::from_map([("readTimeout", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "readTimeout"));
    }

    #[test]
    fn test_unknown_key_is_ignored() {
        let config = ServerConfig::from_map([("colour", "blue")]).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("15"), Some(Duration::from_secs(15)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("10d"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_tls_validation() {
        let tls = TlsConfig {
            enable: true,
            cert_file: String::new(),
            key_file: "/definitely/not/here.pem".to_string(),
        };
        assert!(matches!(tls.validate(), Err(ConfigError::MissingMultiple(keys)) if keys.len() == 2));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        unsafe {
            env::set_var("MALTOSE_SERVER_NAME", "orders");
            env::set_var("MALTOSE_SERVER_GRACEFUL_TIMEOUT", "3s");
        }
        let config = ServerConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.name, "orders");
        assert_eq!(config.graceful_timeout, Duration::from_secs(3));
    }

    #[test]
    #[serial]
    fn test_map_overrides_env() {
        clear_env();
        unsafe { env::set_var("MALTOSE_SERVER_NAME", "from-env") };
        let config = ServerConfig::load([("name", "from-map")]).unwrap();
        clear_env();

        assert_eq!(config.name, "from-map");
    }
}
