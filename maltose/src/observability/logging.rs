use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{ConfigError, get_env_or};
use crate::error::Error;

/// Configuration for the tracing/logging system.
///
/// `RUST_LOG`, when set, takes precedence over `level`.
///
/// ```ignore
/// use maltose::prelude::*;
///
/// TracingConfig::from_env()?.try_init()?;
/// Server::new(ServerConfig::load()?).bind(Hello).run().await
/// ```
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Output logs as JSON.
    pub json: bool,
    /// The minimum log level.
    pub level: Level,
    /// Include the target (module path) in logs.
    pub with_target: bool,
    /// Include the source file in logs.
    pub with_file: bool,
    /// Include line numbers in logs.
    pub with_line_number: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            json: false,
            level: Level::INFO,
            with_target: true,
            with_file: false,
            with_line_number: false,
        }
    }
}

impl TracingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `MALTOSE_LOG_LEVEL` (`trace` to `error`) and `MALTOSE_LOG_FORMAT`
    /// (`text` or `json`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let level = get_env_or("MALTOSE_LOG_LEVEL", "info");
        config.level = Level::from_str(level.trim()).map_err(|_| ConfigError::Invalid {
            key: "MALTOSE_LOG_LEVEL".to_string(),
            value: level.clone(),
        })?;

        let format = get_env_or("MALTOSE_LOG_FORMAT", "text");
        config.json = match format.trim().to_ascii_lowercase().as_str() {
            "json" => true,
            "text" | "" => false,
            _ => {
                return Err(ConfigError::Invalid {
                    key: "MALTOSE_LOG_FORMAT".to_string(),
                    value: format,
                });
            }
        };

        Ok(config)
    }

    /// Enables JSON output format.
    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Sets the minimum log level.
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn with_file(mut self, enabled: bool) -> Self {
        self.with_file = enabled;
        self
    }

    pub fn with_line_number(mut self, enabled: bool) -> Self {
        self.with_line_number = enabled;
        self
    }

    /// Installs the global subscriber. Panics if one is already set.
    pub fn init(self) {
        if let Err(err) = self.try_init() {
            panic!("{}", err);
        }
    }

    /// Installs the global subscriber, failing if one is already set.
    pub fn try_init(self) -> Result<(), Error> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.to_string()));

        let builder = fmt()
            .with_env_filter(filter)
            .with_target(self.with_target)
            .with_file(self.with_file)
            .with_line_number(self.with_line_number);

        let installed = if self.json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        installed.map_err(|e| Error::wrap(e, "installing tracing subscriber"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_tracing_config_default() {
        let config = TracingConfig::default();
        assert!(!config.json);
        assert_eq!(config.level, Level::INFO);
        assert!(config.with_target);
        assert!(!config.with_file);
        assert!(!config.with_line_number);
    }

    #[test]
    fn test_tracing_config_builder_chain() {
        let config = TracingConfig::new()
            .json()
            .level(Level::TRACE)
            .with_target(false)
            .with_file(true)
            .with_line_number(true);

        assert!(config.json);
        assert_eq!(config.level, Level::TRACE);
        assert!(!config.with_target);
        assert!(config.with_file);
        assert!(config.with_line_number);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        unsafe {
            std::env::set_var("MALTOSE_LOG_LEVEL", "debug");
            std::env::set_var("MALTOSE_LOG_FORMAT", "JSON");
        }
        let config = TracingConfig::from_env().unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.json);

        unsafe {
            std::env::remove_var("MALTOSE_LOG_LEVEL");
            std::env::remove_var("MALTOSE_LOG_FORMAT");
        }
        let config = TracingConfig::from_env().unwrap();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.json);
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_unknown_format() {
        unsafe { std::env::set_var("MALTOSE_LOG_FORMAT", "xml") };
        let err = TracingConfig::from_env().unwrap_err();
        unsafe { std::env::remove_var("MALTOSE_LOG_FORMAT") };
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "MALTOSE_LOG_FORMAT"));
    }
}
