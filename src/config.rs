use chrono::Duration;
use serde::Deserialize;
use std::env;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

use crate::error::InputError;
use crate::estimator::{EstimatorOptions, DEFAULT_CANDIDATE_MARGIN_DAYS};
use crate::lookback::parse_lookback;

/// Margins below this cut off the tail of 90-day certificates.
const MIN_RECOMMENDED_MARGIN_DAYS: i64 = 90;
const MAX_MARGIN_DAYS: i64 = 36_500;

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_true")]
    pub api: bool,
    #[serde(default = "default_true")]
    pub health: bool,
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            api: true,
            health: true,
            metrics: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_table_path")]
    pub table_path: String,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            table_path: default_table_path(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

fn default_table_path() -> String {
    "./data/ct_ledger".to_string()
}
fn default_query_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct EstimatorConfig {
    #[serde(default = "default_candidate_margin_days")]
    pub candidate_margin_days: i64,
    #[serde(default = "default_lookback")]
    pub default_lookback: String,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            candidate_margin_days: default_candidate_margin_days(),
            default_lookback: default_lookback(),
        }
    }
}

impl EstimatorConfig {
    pub fn options(&self) -> EstimatorOptions {
        EstimatorOptions {
            candidate_margin: Duration::try_days(self.candidate_margin_days)
                .unwrap_or_else(|| Duration::days(DEFAULT_CANDIDATE_MARGIN_DAYS)),
        }
    }

    pub fn default_lookback(&self) -> Result<Duration, InputError> {
        parse_lookback(&self.default_lookback)
    }
}

fn default_candidate_margin_days() -> i64 {
    DEFAULT_CANDIDATE_MARGIN_DAYS
}
fn default_lookback() -> String {
    "P7D".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub log_level: String,
    pub ledger: LedgerConfig,
    pub estimator: EstimatorConfig,
    pub protocols: ProtocolConfig,
    pub config_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct YamlConfig {
    host: Option<String>,
    port: Option<u16>,
    log_level: Option<String>,
    #[serde(default)]
    ledger: Option<LedgerConfig>,
    #[serde(default)]
    estimator: Option<EstimatorConfig>,
    #[serde(default)]
    protocols: Option<ProtocolConfig>,
}

struct YamlConfigWithPath {
    config: YamlConfig,
    path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl ConfigValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let yaml = Self::load_yaml();
        Self::resolve(yaml.config, yaml.path, |key| env::var(key).ok())
    }

    /// Build from a YAML document, ignoring the process environment.
    pub fn from_yaml_str(content: &str) -> Result<Self, serde_yaml::Error> {
        let yaml = serde_yaml::from_str::<YamlConfig>(content)?;
        Ok(Self::resolve(yaml, None, |_| None))
    }

    fn resolve<F>(yaml_config: YamlConfig, config_path: Option<String>, var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = var("CERTQUOTA_HOST")
            .or(yaml_config.host)
            .and_then(|v| v.parse().ok())
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));

        let port = var("CERTQUOTA_PORT")
            .and_then(|v| v.parse().ok())
            .or(yaml_config.port)
            .unwrap_or(8080);

        let log_level = var("CERTQUOTA_LOG_LEVEL")
            .or(yaml_config.log_level)
            .unwrap_or_else(|| "info".to_string());

        let mut ledger = yaml_config.ledger.unwrap_or_default();
        if let Some(v) = var("CERTQUOTA_TABLE_PATH") {
            ledger.table_path = v;
        }
        if let Some(v) = var("CERTQUOTA_QUERY_TIMEOUT_SECS") {
            ledger.query_timeout_secs = v.parse().unwrap_or(ledger.query_timeout_secs);
        }

        let mut estimator = yaml_config.estimator.unwrap_or_default();
        if let Some(v) = var("CERTQUOTA_CANDIDATE_MARGIN_DAYS") {
            estimator.candidate_margin_days = v.parse().unwrap_or(estimator.candidate_margin_days);
        }
        if let Some(v) = var("CERTQUOTA_DEFAULT_LOOKBACK") {
            estimator.default_lookback = v;
        }

        let protocols = yaml_config.protocols.unwrap_or_else(|| ProtocolConfig {
            api: var("CERTQUOTA_API_ENABLED")
                .map(|v| v.parse().unwrap_or(true))
                .unwrap_or(true),
            health: var("CERTQUOTA_HEALTH_ENABLED")
                .map(|v| v.parse().unwrap_or(true))
                .unwrap_or(true),
            metrics: var("CERTQUOTA_METRICS_ENABLED")
                .map(|v| v.parse().unwrap_or(true))
                .unwrap_or(true),
        });

        Self {
            host,
            port,
            log_level,
            ledger,
            estimator,
            protocols,
            config_path,
        }
    }

    pub fn validate(&self) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        if self.port == 0 {
            errors.push(ConfigValidationError::new(
                "port",
                "Port must be greater than 0",
            ));
        }

        if self.ledger.table_path.trim().is_empty() {
            errors.push(ConfigValidationError::new(
                "ledger.table_path",
                "Table path cannot be empty",
            ));
        }

        if self.ledger.query_timeout_secs == 0 {
            errors.push(ConfigValidationError::new(
                "ledger.query_timeout_secs",
                "Query timeout must be greater than 0",
            ));
        }

        if self.estimator.candidate_margin_days <= 0 {
            errors.push(ConfigValidationError::new(
                "estimator.candidate_margin_days",
                "Candidate margin must be greater than 0",
            ));
        } else if self.estimator.candidate_margin_days > MAX_MARGIN_DAYS {
            errors.push(ConfigValidationError::new(
                "estimator.candidate_margin_days",
                format!("Candidate margin cannot exceed {} days", MAX_MARGIN_DAYS),
            ));
        }

        if let Err(e) = self.estimator.default_lookback() {
            errors.push(ConfigValidationError::new(
                "estimator.default_lookback",
                e.to_string(),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Settings that are accepted but probably wrong.
    pub fn warnings(&self) -> Vec<ConfigValidationError> {
        let mut warnings = Vec::new();
        let margin = self.estimator.candidate_margin_days;
        if margin > 0 && margin < MIN_RECOMMENDED_MARGIN_DAYS {
            warnings.push(ConfigValidationError::new(
                "estimator.candidate_margin_days",
                format!(
                    "Margin of {} days is shorter than a 90-day certificate lifetime; counts may be low",
                    margin
                ),
            ));
        }
        warnings
    }

    fn load_yaml() -> YamlConfigWithPath {
        let config_paths = [
            env::var("CERTQUOTA_CONFIG").ok(),
            Some("certquota.yaml".to_string()),
            Some("certquota.yml".to_string()),
            Some("/etc/certquota/config.yaml".to_string()),
        ];

        for path in config_paths.into_iter().flatten() {
            if Path::new(&path).exists() {
                if let Ok(content) = fs::read_to_string(&path) {
                    if let Ok(config) = serde_yaml::from_str::<YamlConfig>(&content) {
                        return YamlConfigWithPath {
                            config,
                            path: Some(path),
                        };
                    }
                }
            }
        }

        YamlConfigWithPath {
            config: YamlConfig::default(),
            path: None,
        }
    }
}
