//! Engine configuration.
//!
//! One hierarchical TOML file: a `[data_sources.<id>]` table per source and
//! a `[props]` table for engine-wide knobs. `${VAR}` occurrences are
//! replaced from the environment at load time; a missing variable fails
//! startup. The loader validates ranges and cross-field constraints and
//! reports every violation at once rather than stopping at the first.

use crate::catalog::SourceType;
use crate::connector::PoolSettings;
use crate::cost::CostWeights;
use crate::error::{EngineError, EngineResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DataSourceConfig {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_maximum_pool_size")]
    pub maximum_pool_size: u32,
    #[serde(default = "default_minimum_idle")]
    pub minimum_idle: u32,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,
    /// Zero disables scheduled health checks.
    #[serde(default)]
    pub health_check_interval_seconds: u64,
    #[serde(default = "default_health_check_timeout_seconds")]
    pub health_check_timeout_seconds: u64,
    #[serde(default = "default_health_check_failure_threshold")]
    pub health_check_failure_threshold: u32,
}

fn default_maximum_pool_size() -> u32 {
    20
}
fn default_minimum_idle() -> u32 {
    5
}
fn default_connection_timeout_ms() -> u64 {
    30_000
}
fn default_idle_timeout_ms() -> u64 {
    600_000
}
fn default_max_lifetime_ms() -> u64 {
    1_800_000
}
fn default_health_check_timeout_seconds() -> u64 {
    5
}
fn default_health_check_failure_threshold() -> u32 {
    3
}

impl DataSourceConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_size: self.maximum_pool_size,
            min_idle: self.minimum_idle,
            connect_timeout: Duration::from_millis(self.connection_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            max_lifetime: Duration::from_millis(self.max_lifetime_ms),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineProps {
    pub max_intermediate_rows: usize,
    pub query_timeout_seconds: u64,
    pub default_fetch_size: usize,
    pub max_concurrent_queries: usize,
    pub enable_query_logging: bool,
    pub log_level: LogLevel,
    pub cost_weights: CostWeights,
}

impl Default for EngineProps {
    fn default() -> Self {
        EngineProps {
            max_intermediate_rows: 100_000,
            query_timeout_seconds: 300,
            default_fetch_size: 1000,
            max_concurrent_queries: 100,
            enable_query_logging: true,
            log_level: LogLevel::default(),
            cost_weights: CostWeights::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub data_sources: BTreeMap<String, DataSourceConfig>,
    #[serde(default)]
    pub props: EngineProps,
}

impl EngineConfig {
    pub fn load(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Internal(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        let interpolated = interpolate_env(raw)?;
        let config: EngineConfig = toml::from_str(&interpolated)
            .map_err(|e| EngineError::Internal(format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Collect every violation before failing.
    fn validate(&self) -> EngineResult<()> {
        let mut problems: Vec<String> = Vec::new();

        if self.data_sources.is_empty() {
            problems.push("no data sources configured".to_string());
        }
        for (id, source) in &self.data_sources {
            if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                problems.push(format!(
                    "data source id '{id}' must be alphanumeric/underscore"
                ));
            }
            if source.url.is_empty() {
                problems.push(format!("data source '{id}': url is empty"));
            }
            if source.minimum_idle > source.maximum_pool_size {
                problems.push(format!(
                    "data source '{id}': minimum_idle {} exceeds maximum_pool_size {}",
                    source.minimum_idle, source.maximum_pool_size
                ));
            }
            if source.maximum_pool_size == 0 {
                problems.push(format!("data source '{id}': maximum_pool_size must be > 0"));
            }
            if source.connection_timeout_ms == 0 {
                problems.push(format!(
                    "data source '{id}': connection_timeout_ms must be > 0"
                ));
            }
            if source.health_check_interval_seconds > 0 && source.health_check_timeout_seconds == 0
            {
                problems.push(format!(
                    "data source '{id}': health_check_timeout_seconds must be > 0"
                ));
            }
            if source.health_check_failure_threshold == 0 {
                problems.push(format!(
                    "data source '{id}': health_check_failure_threshold must be > 0"
                ));
            }
        }

        let props = &self.props;
        if props.max_intermediate_rows == 0 {
            problems.push("props.max_intermediate_rows must be > 0".to_string());
        }
        if props.query_timeout_seconds == 0 {
            problems.push("props.query_timeout_seconds must be > 0".to_string());
        }
        if props.default_fetch_size == 0 {
            problems.push("props.default_fetch_size must be > 0".to_string());
        }
        if props.max_concurrent_queries == 0 {
            problems.push("props.max_concurrent_queries must be > 0".to_string());
        }
        for (name, weight) in [
            ("cpu", props.cost_weights.cpu),
            ("io", props.cost_weights.io),
            ("network", props.cost_weights.network),
            ("memory", props.cost_weights.memory),
        ] {
            if weight < 0.0 || !weight.is_finite() {
                problems.push(format!(
                    "props.cost_weights.{name} must be a non-negative number"
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Internal(format!(
                "invalid configuration:\n  - {}",
                problems.join("\n  - ")
            )))
        }
    }
}

/// Replace every `${VAR}` with its environment value; all missing
/// variables are reported together.
fn interpolate_env(raw: &str) -> EngineResult<String> {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let placeholder = PLACEHOLDER
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid pattern"));

    let mut missing: Vec<String> = Vec::new();
    let replaced = placeholder.replace_all(raw, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => {
                if !missing.contains(&name.to_string()) {
                    missing.push(name.to_string());
                }
                String::new()
            }
        }
    });
    if missing.is_empty() {
        Ok(replaced.into_owned())
    } else {
        Err(EngineError::Internal(format!(
            "missing environment variables: {}",
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [data_sources.mysql_db]
        type = "mysql"
        url = "mysql://app@db1:3306/shop"

        [data_sources.es_logs]
        type = "elastic_search"
        url = "http://es1:9200"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = EngineConfig::parse(MINIMAL).unwrap();
        let mysql = &config.data_sources["mysql_db"];
        assert_eq!(mysql.source_type, SourceType::MySql);
        assert_eq!(mysql.maximum_pool_size, 20);
        assert_eq!(mysql.minimum_idle, 5);
        assert_eq!(mysql.connection_timeout_ms, 30_000);
        assert_eq!(mysql.health_check_interval_seconds, 0);
        assert_eq!(mysql.health_check_failure_threshold, 3);
        assert_eq!(config.props.max_intermediate_rows, 100_000);
        assert_eq!(config.props.query_timeout_seconds, 300);
        assert_eq!(config.props.default_fetch_size, 1000);
        assert!(config.props.enable_query_logging);
    }

    #[test]
    fn cross_field_validation_reports_every_problem() {
        let bad = r#"
            [data_sources.a]
            type = "mysql"
            url = ""
            maximum_pool_size = 2
            minimum_idle = 10

            [props]
            default_fetch_size = 0
        "#;
        let err = EngineConfig::parse(bad).unwrap_err().to_string();
        assert!(err.contains("url is empty"), "{err}");
        assert!(err.contains("minimum_idle"), "{err}");
        assert!(err.contains("default_fetch_size"), "{err}");
    }

    #[test]
    fn env_interpolation_applies() {
        std::env::set_var("FEDSQL_TEST_PW", "s3cret");
        let raw = r#"
            [data_sources.db]
            type = "postgresql"
            url = "postgres://app:${FEDSQL_TEST_PW}@pg:5432/warehouse"
        "#;
        let config = EngineConfig::parse(raw).unwrap();
        assert!(config.data_sources["db"].url.contains("s3cret"));
        std::env::remove_var("FEDSQL_TEST_PW");
    }

    #[test]
    fn missing_env_variable_fails_startup() {
        let raw = r#"
            [data_sources.db]
            type = "postgresql"
            url = "postgres://app:${FEDSQL_DEFINITELY_UNSET}@pg:5432/warehouse"
        "#;
        let err = EngineConfig::parse(raw).unwrap_err().to_string();
        assert!(err.contains("FEDSQL_DEFINITELY_UNSET"), "{err}");
    }

    #[test]
    fn cost_weights_are_configurable() {
        let raw = r#"
            [data_sources.db]
            type = "mysql"
            url = "mysql://db/x"

            [props.cost_weights]
            cpu = 2.0
            io = 20.0
            network = 50.0
            memory = 1.0
        "#;
        let config = EngineConfig::parse(raw).unwrap();
        assert_eq!(config.props.cost_weights.network, 50.0);
        assert_eq!(config.props.cost_weights.cpu, 2.0);
    }

    #[test]
    fn empty_config_is_rejected() {
        assert!(EngineConfig::parse("").is_err());
    }

    #[test]
    fn pool_settings_carry_durations() {
        let config = EngineConfig::parse(MINIMAL).unwrap();
        let settings = config.data_sources["mysql_db"].pool_settings();
        assert_eq!(settings.connect_timeout, Duration::from_secs(30));
        assert_eq!(settings.idle_timeout, Duration::from_secs(600));
        assert_eq!(settings.max_lifetime, Duration::from_secs(1800));
    }
}
