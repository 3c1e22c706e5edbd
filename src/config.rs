//! Runtime configuration, loadable from a TOML file.

use {
    anyhow::Context,
    serde::{Deserialize, Serialize},
    std::{path::Path, time::Duration},
};

use crate::defaults;

/// Tunable parameters for a [`TransportRuntime`](crate::runtime::TransportRuntime).
///
/// Every field has a default, so `Config::default()` is a working
/// configuration and a TOML file only needs to name the fields it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct Config {
    /// Deadline for an outbound request, dial to response.
    #[serde(with = "humantime_serde", default = "defaults::request_timeout")]
    pub request_timeout: Duration,
    /// How long a subscriber session waits on an empty queue before ending
    /// its turn.
    #[serde(with = "humantime_serde", default = "defaults::polling_queue_wait")]
    pub polling_queue_wait: Duration,
    /// Idle connections older than this are destroyed instead of reused.
    #[serde(with = "humantime_serde", default = "defaults::pool_idle_timeout")]
    pub pool_idle_timeout: Duration,
    #[serde(default = "defaults::pool_capacity_per_endpoint")]
    pub pool_capacity_per_endpoint: usize,
    /// Largest frame the framed stream will serialize or accept.
    #[serde(default = "defaults::max_frame_length")]
    pub max_frame_length: usize,
    #[serde(with = "humantime_serde", default = "defaults::polling_backoff_initial")]
    pub polling_backoff_initial: Duration,
    #[serde(with = "humantime_serde", default = "defaults::polling_backoff_max")]
    pub polling_backoff_max: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            request_timeout: defaults::request_timeout(),
            polling_queue_wait: defaults::polling_queue_wait(),
            pool_idle_timeout: defaults::pool_idle_timeout(),
            pool_capacity_per_endpoint: defaults::pool_capacity_per_endpoint(),
            max_frame_length: defaults::max_frame_length(),
            polling_backoff_initial: defaults::polling_backoff_initial(),
            polling_backoff_max: defaults::polling_backoff_max(),
        }
    }
}

impl Config {
    pub async fn load(config_path: impl AsRef<Path>) -> Result<Config, anyhow::Error> {
        let contents = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to read configuration file {:?}",
                    config_path.as_ref()
                )
            })?;
        let config: Config = toml::from_str(&contents).context("Failed to parse configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: Config = toml::from_str("request_timeout = \"5s\"").unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.pool_capacity_per_endpoint, 5);
        assert_eq!(config.polling_queue_wait, defaults::polling_queue_wait());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("no_such_field = 3").is_err());
    }
}
