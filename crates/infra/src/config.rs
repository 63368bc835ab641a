//! Service configuration loaded from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

use crate::jobs::{DEFAULT_MAX_NUM_RESETS, DEFAULT_STALLED_MAX_AGE};
use crate::queues::FrontendCredentials;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_RESET_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_FRONTEND_URL: &str = "http://localhost:3080";
const DEV_EXECUTOR_SECRET: &str = "dev-executor-secret";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Everything the service binary needs to start.
#[derive(Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    /// Postgres connection string; in-memory stores when `None`.
    pub database_url: Option<String>,
    pub executor_secret: String,
    /// Admin routes are not mounted when `None`.
    pub admin_token: Option<String>,
    pub stalled_max_age: Duration,
    pub max_num_resets: u32,
    pub reset_interval: Duration,
    pub frontend: FrontendCredentials,
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("listen_addr", &self.listen_addr)
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("admin_routes", &self.admin_token.is_some())
            .field("stalled_max_age", &self.stalled_max_age)
            .field("max_num_resets", &self.max_num_resets)
            .field("reset_interval", &self.reset_interval)
            .field("frontend", &self.frontend)
            .finish_non_exhaustive()
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            executor_secret: DEV_EXECUTOR_SECRET.to_string(),
            admin_token: None,
            stalled_max_age: DEFAULT_STALLED_MAX_AGE,
            max_num_resets: DEFAULT_MAX_NUM_RESETS,
            reset_interval: DEFAULT_RESET_INTERVAL,
            frontend: FrontendCredentials::new(DEFAULT_FRONTEND_URL, "", ""),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let listen_addr = match get("EXECQ_LISTEN_ADDR") {
            Some(raw) => raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                var: "EXECQ_LISTEN_ADDR",
                reason: e.to_string(),
            })?,
            None => defaults.listen_addr,
        };

        let executor_secret = match get("EXECUTOR_SHARED_SECRET") {
            Some(secret) => secret,
            None => {
                warn!("EXECUTOR_SHARED_SECRET is not set; using an insecure development secret");
                defaults.executor_secret
            }
        };

        let stalled_max_age = parse_secs(&get, "EXECQ_STALLED_MAX_AGE_SECS")?.unwrap_or(defaults.stalled_max_age);
        let reset_interval = parse_secs(&get, "EXECQ_RESET_INTERVAL_SECS")?.unwrap_or(defaults.reset_interval);
        if reset_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "EXECQ_RESET_INTERVAL_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }

        let max_num_resets = match get("EXECQ_MAX_NUM_RESETS") {
            Some(raw) => raw.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
                var: "EXECQ_MAX_NUM_RESETS",
                reason: e.to_string(),
            })?,
            None => defaults.max_num_resets,
        };

        let frontend = FrontendCredentials::new(
            get("EXECQ_FRONTEND_URL").unwrap_or_else(|| DEFAULT_FRONTEND_URL.to_string()),
            get("EXECQ_FRONTEND_USERNAME").unwrap_or_default(),
            get("EXECQ_FRONTEND_PASSWORD").unwrap_or_default(),
        );
        frontend.authenticated_url().map_err(|e| ConfigError::Invalid {
            var: "EXECQ_FRONTEND_URL",
            reason: e.to_string(),
        })?;

        Ok(Self {
            listen_addr,
            database_url: get("DATABASE_URL"),
            executor_secret,
            admin_token: get("EXECQ_ADMIN_TOKEN"),
            stalled_max_age,
            max_num_resets,
            reset_interval,
            frontend,
        })
    }
}

fn parse_secs(get: impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<Duration>, ConfigError> {
    get(var)
        .map(|raw| {
            raw.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ServiceConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert!(config.database_url.is_none());
        assert!(config.admin_token.is_none());
        assert_eq!(config.stalled_max_age, Duration::from_secs(25));
        assert_eq!(config.max_num_resets, 3);
        assert_eq!(config.reset_interval, Duration::from_secs(5));
        assert_eq!(config.executor_secret, DEV_EXECUTOR_SECRET);
    }

    #[test]
    fn reads_overrides() {
        let config = from_pairs(&[
            ("EXECQ_LISTEN_ADDR", "127.0.0.1:9000"),
            ("DATABASE_URL", "postgres://localhost/execq"),
            ("EXECUTOR_SHARED_SECRET", "hunter2"),
            ("EXECQ_ADMIN_TOKEN", "admin"),
            ("EXECQ_STALLED_MAX_AGE_SECS", "60"),
            ("EXECQ_MAX_NUM_RESETS", "5"),
            ("EXECQ_RESET_INTERVAL_SECS", "1"),
            ("EXECQ_FRONTEND_URL", "https://sourcegraph.example.com"),
            ("EXECQ_FRONTEND_USERNAME", "executor"),
        ])
        .unwrap();

        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/execq"));
        assert_eq!(config.executor_secret, "hunter2");
        assert_eq!(config.admin_token.as_deref(), Some("admin"));
        assert_eq!(config.stalled_max_age, Duration::from_secs(60));
        assert_eq!(config.max_num_resets, 5);
        assert_eq!(config.reset_interval, Duration::from_secs(1));
        assert_eq!(config.frontend.username, "executor");
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = from_pairs(&[("DATABASE_URL", "  "), ("EXECQ_ADMIN_TOKEN", "")]).unwrap();
        assert!(config.database_url.is_none());
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn malformed_values_are_errors() {
        for (var, value) in [
            ("EXECQ_LISTEN_ADDR", "not-an-addr"),
            ("EXECQ_STALLED_MAX_AGE_SECS", "-1"),
            ("EXECQ_MAX_NUM_RESETS", "many"),
            ("EXECQ_RESET_INTERVAL_SECS", "0"),
            ("EXECQ_FRONTEND_URL", "no-scheme"),
        ] {
            let err = from_pairs(&[(var, value)]).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { var: v, .. } if v == var), "{var}");
        }
    }

    #[test]
    fn debug_hides_secrets() {
        let config = from_pairs(&[("EXECUTOR_SHARED_SECRET", "hunter2"), ("EXECQ_FRONTEND_PASSWORD", "pw")]).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("\"pw\""));
    }
}
