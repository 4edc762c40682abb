//! Relay configuration module.
//!
//! Configuration is loaded from environment variables with fallback to defaults.

use std::env;

use dayflow_sync::relay::{RelayConfig, DEFAULT_RELAY_PORT};

/// Relay process configuration.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Port to listen on.
    pub port: u16,

    /// Bind address.
    pub bind_addr: String,
}

impl RelaySettings {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_vars(|name| env::var(name).ok())
    }

    fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match var("RELAY_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidValue("RELAY_PORT".to_string()))?,
            None => DEFAULT_RELAY_PORT,
        };
        let bind_addr = var("RELAY_BIND_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        if bind_addr.trim().is_empty() {
            return Err(ConfigError::InvalidValue("RELAY_BIND_ADDR".to_string()));
        }

        Ok(RelaySettings { port, bind_addr })
    }

    /// Server config for [`dayflow_sync::RelayServer`].
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            port: self.port,
            bind_addr: self.bind_addr.clone(),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = RelaySettings::from_vars(vars(&[])).unwrap();
        assert_eq!(settings.port, DEFAULT_RELAY_PORT);
        assert_eq!(settings.relay_config().bind_address(), "0.0.0.0:8787");
    }

    #[test]
    fn test_overrides() {
        let settings =
            RelaySettings::from_vars(vars(&[("RELAY_PORT", "9100"), ("RELAY_BIND_ADDR", "127.0.0.1")]))
                .unwrap();
        assert_eq!(settings.relay_config().bind_address(), "127.0.0.1:9100");
    }

    #[test]
    fn test_invalid_port() {
        let err = RelaySettings::from_vars(vars(&[("RELAY_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("RELAY_PORT"));
    }
}
