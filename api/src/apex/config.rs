use std::{
    env::var,
    net::{IpAddr, SocketAddr},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

use crate::chat::delegates::ServiceSettings;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DATABASE: &str = "petmatch_main";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Failed to parse {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    MongoDb,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Memory => "memory",
            StorageBackend::MongoDb => "mongodb",
        }
    }
}

impl FromStr for StorageBackend {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(StorageBackend::Memory),
            "mongodb" | "mongo" => Ok(StorageBackend::MongoDb),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub domain: IpAddr,
    pub port: u16,
    pub storage: StorageBackend,
    pub mongodb_uri: Option<String>,
    pub mongodb_database: String,
    pub service: ServiceSettings,
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = ServiceSettings::default();

        let domain = parsed(&lookup, "DOMAIN", IpAddr::from([0, 0, 0, 0]))?;
        let port = parsed(&lookup, "PORT", DEFAULT_PORT)?;
        let storage = parsed(&lookup, "STORAGE_BACKEND", StorageBackend::Memory)?;

        let mongodb_uri = lookup("MONGODB_URI").filter(|uri| !uri.trim().is_empty());
        if storage == StorageBackend::MongoDb && mongodb_uri.is_none() {
            return Err(ConfigError::Missing("MONGODB_URI"));
        }

        let mongodb_database =
            lookup("MONGODB_DATABASE").unwrap_or_else(|| DEFAULT_DATABASE.to_string());

        let store_timeout_ms = parsed(
            &lookup,
            "STORE_TIMEOUT_MS",
            defaults.store_timeout.as_millis() as u64,
        )?;
        if store_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "STORE_TIMEOUT_MS",
                value: "0".to_string(),
            });
        }

        let read_retry_attempts =
            parsed(&lookup, "READ_RETRY_ATTEMPTS", defaults.read_retry_attempts)?;
        let read_retry_backoff_ms = parsed(
            &lookup,
            "READ_RETRY_BACKOFF_MS",
            defaults.read_retry_backoff.as_millis() as u64,
        )?;

        Ok(Self {
            domain,
            port,
            storage,
            mongodb_uri,
            mongodb_database,
            service: ServiceSettings {
                store_timeout: Duration::from_millis(store_timeout_ms),
                read_retry_attempts,
                read_retry_backoff: Duration::from_millis(read_retry_backoff_ms),
            },
        })
    }

    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.domain, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_to_in_memory_storage() {
        let settings = settings(&[]).unwrap();
        assert_eq!(settings.storage, StorageBackend::Memory);
        assert_eq!(settings.socket_addr().to_string(), "0.0.0.0:3000");
        assert_eq!(settings.mongodb_database, DEFAULT_DATABASE);
        assert_eq!(settings.service.read_retry_attempts, 2);
    }

    #[test]
    fn mongodb_requires_uri() {
        assert_eq!(
            settings(&[("STORAGE_BACKEND", "mongodb")]).unwrap_err(),
            ConfigError::Missing("MONGODB_URI")
        );

        let settings = settings(&[
            ("STORAGE_BACKEND", "MongoDB"),
            ("MONGODB_URI", "mongodb://localhost:27017"),
            ("STORE_TIMEOUT_MS", "500"),
        ])
        .unwrap();
        assert_eq!(settings.storage, StorageBackend::MongoDb);
        assert_eq!(settings.service.store_timeout, Duration::from_millis(500));
    }

    #[test]
    fn rejects_unparseable_values() {
        assert!(matches!(
            settings(&[("PORT", "eighty")]),
            Err(ConfigError::Invalid { key: "PORT", .. })
        ));
        assert!(matches!(
            settings(&[("STORAGE_BACKEND", "sqlite")]),
            Err(ConfigError::Invalid { key: "STORAGE_BACKEND", .. })
        ));
        assert!(settings(&[("STORE_TIMEOUT_MS", "0")]).is_err());
    }
}
