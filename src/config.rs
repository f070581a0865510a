use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::logic::{AdaptorSettings, RetryPolicy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub graph: GraphConfig,
    pub adaptor: AdaptorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Neo4j,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub backend: Backend,
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
    /// JSON schema definition; the built-in pathway schema when unset.
    pub schema_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptorConfig {
    pub use_instance_cache: bool,
    pub use_attribute_cache: bool,
    pub worker_pool_size: usize,
    pub retries: u32,
    pub backoff_ms: u64,
    pub result_cap: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            uri: "127.0.0.1:7687".to_string(),
            user: "neo4j".to_string(),
            password: "neo4j".to_string(),
            database: "graph.db".to_string(),
            schema_path: None,
        }
    }
}

impl Default for AdaptorConfig {
    fn default() -> Self {
        let settings = AdaptorSettings::default();
        Self {
            use_instance_cache: settings.use_instance_cache,
            use_attribute_cache: settings.use_attribute_cache,
            worker_pool_size: settings.worker_pool_size,
            retries: settings.retry.retries,
            backoff_ms: settings.retry.backoff.as_millis() as u64,
            result_cap: settings.result_cap,
        }
    }
}

impl AdaptorConfig {
    pub fn settings(&self) -> AdaptorSettings {
        AdaptorSettings {
            use_instance_cache: self.use_instance_cache,
            use_attribute_cache: self.use_attribute_cache,
            worker_pool_size: self.worker_pool_size.max(1),
            retry: RetryPolicy {
                retries: self.retries.max(1),
                backoff: Duration::from_millis(self.backoff_ms),
            },
            result_cap: self.result_cap,
        }
    }
}

impl AppConfig {
    /// Defaults, then an optional `config` file, then `CURATOR__*` variables
    /// (e.g. `CURATOR__GRAPH__BACKEND=neo4j`).
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("CURATOR")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_adaptor_settings() {
        let config = AppConfig::default();
        let settings = config.adaptor.settings();
        assert_eq!(settings.retry, RetryPolicy::default());
        assert_eq!(settings.result_cap, 100);
        assert_eq!(config.graph.backend, Backend::Memory);
        assert_eq!(config.server_address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_zero_sizes_are_clamped() {
        let config = AdaptorConfig {
            worker_pool_size: 0,
            retries: 0,
            ..Default::default()
        };
        let settings = config.settings();
        assert_eq!(settings.worker_pool_size, 1);
        assert_eq!(settings.retry.retries, 1);
    }
}
