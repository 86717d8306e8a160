//! Configuration structures for the tunnel writer.
//!
//! Configuration is loaded from TOML files, or from the flat key-value map the
//! surrounding sync framework hands to each writer, and validated before any
//! remote call is made.

use crate::connection::AccountType;
use crate::partition::PartitionSpec;
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Writer configuration for one job.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WriterConfig {
    /// Catalog service endpoint
    #[serde(alias = "odpsServer")]
    pub endpoint: String,

    /// Access id
    #[serde(alias = "accessId")]
    pub access_id: String,

    /// Access secret
    #[serde(alias = "accessKey")]
    pub access_key: String,

    /// Signing scheme tag (aliyun, taobao)
    #[serde(default = "default_account_type", alias = "accountType")]
    pub account_type: String,

    /// Default project (catalog)
    pub project: String,

    /// Target table
    pub table: String,

    /// Target partition spec, required for partitioned tables
    #[serde(default)]
    pub partition: Option<String>,

    /// Tunnel endpoint override, only needed when the service cannot route it
    #[serde(default, alias = "tunnelServer")]
    pub tunnel_endpoint: Option<String>,

    /// Empty the target (table or partition) before writing
    #[serde(default)]
    pub truncate: bool,

    /// Columns the incoming records carry, in record order. `*` means all.
    #[serde(default = "default_columns", alias = "column")]
    pub columns: Vec<String>,

    /// What to do with configured columns missing from the table
    #[serde(default, alias = "columnResolution")]
    pub column_resolution: ColumnResolutionMode,

    /// Attempts for partition listing (total, not additional)
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: u32,

    /// First retry delay in milliseconds, doubled per attempt
    #[serde(default = "default_retry_base_delay_ms", alias = "retryBaseDelayMs")]
    pub retry_base_delay_ms: u64,

    /// Upper bound on total time spent retrying
    #[serde(default, alias = "retryDeadlineSeconds")]
    pub retry_deadline_seconds: Option<u64>,

    /// Rows per block before a task rolls over to its next block id
    #[serde(default = "default_block_max_rows", alias = "blockMaxRows")]
    pub block_max_rows: usize,

    /// Size of each task's disjoint block id range
    #[serde(default = "default_max_blocks_per_task", alias = "maxBlocksPerTask")]
    pub max_blocks_per_task: u64,

    /// Per-block write timeout
    #[serde(default, alias = "blockTimeoutSeconds")]
    pub block_timeout_seconds: Option<u64>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Handling of configured columns that do not exist in the table.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnResolutionMode {
    /// Fail the job (default)
    #[default]
    Strict,
    /// Log a warning and drop the column
    Lenient,
}

impl FromStr for ColumnResolutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(ColumnResolutionMode::Strict),
            "lenient" => Ok(ColumnResolutionMode::Lenient),
            other => Err(Error::Config(format!(
                "Unknown column resolution mode: [{}]",
                other
            ))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_account_type() -> String {
    "aliyun".to_string()
}
fn default_columns() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_block_max_rows() -> usize {
    10_000
}
fn default_max_blocks_per_task() -> u64 {
    20_000
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            access_id: String::new(),
            access_key: String::new(),
            account_type: default_account_type(),
            project: String::new(),
            table: String::new(),
            partition: None,
            tunnel_endpoint: None,
            truncate: false,
            columns: default_columns(),
            column_resolution: ColumnResolutionMode::default(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_deadline_seconds: None,
            block_max_rows: default_block_max_rows(),
            max_blocks_per_task: default_max_blocks_per_task(),
            block_timeout_seconds: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl WriterConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WriterConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from the framework's flat key-value map.
    ///
    /// Keys are matched ignoring case and underscores, so both `accessId` and
    /// `access_id` are accepted. Unknown keys are ignored.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let mut config = WriterConfig::default();

        for (key, value) in map {
            let normalized: String = key
                .chars()
                .filter(|c| *c != '_')
                .collect::<String>()
                .to_ascii_lowercase();

            match normalized.as_str() {
                "endpoint" | "odpsserver" => config.endpoint = value.clone(),
                "accessid" => config.access_id = value.clone(),
                "accesskey" => config.access_key = value.clone(),
                "accounttype" => config.account_type = value.clone(),
                "project" => config.project = value.clone(),
                "table" => config.table = value.clone(),
                "partition" => config.partition = Some(value.clone()),
                "tunnelendpoint" | "tunnelserver" => {
                    config.tunnel_endpoint = Some(value.clone())
                }
                "truncate" => config.truncate = parse_value(key, value)?,
                "column" | "columns" => {
                    config.columns = value
                        .split(',')
                        .map(|c| c.trim().to_string())
                        .filter(|c| !c.is_empty())
                        .collect()
                }
                "columnresolution" => config.column_resolution = value.parse()?,
                "maxretries" => config.max_retries = parse_value(key, value)?,
                "retrybasedelayms" => config.retry_base_delay_ms = parse_value(key, value)?,
                "retrydeadlineseconds" => {
                    config.retry_deadline_seconds = Some(parse_value(key, value)?)
                }
                "blockmaxrows" => config.block_max_rows = parse_value(key, value)?,
                "maxblockspertask" => config.max_blocks_per_task = parse_value(key, value)?,
                "blocktimeoutseconds" => {
                    config.block_timeout_seconds = Some(parse_value(key, value)?)
                }
                _ => debug!(key = %key, "Ignoring unrecognized writer setting"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("endpoint", &self.endpoint),
            ("access_id", &self.access_id),
            ("access_key", &self.access_key),
            ("project", &self.project),
            ("table", &self.table),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{} is required", name)));
            }
        }

        self.account_type.parse::<AccountType>()?;

        if let Some(partition) = &self.partition {
            PartitionSpec::parse(partition)?;
        }

        if self.columns.is_empty() {
            return Err(Error::Config("At least one column is required".into()));
        }

        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".into()));
        }

        if self.block_max_rows == 0 {
            return Err(Error::Config("block_max_rows must be positive".into()));
        }

        if self.max_blocks_per_task == 0 {
            return Err(Error::Config("max_blocks_per_task must be positive".into()));
        }

        Ok(())
    }

    /// Retry policy for metadata calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::new(self.max_retries)
            .with_base_delay(Duration::from_millis(self.retry_base_delay_ms));
        if let Some(seconds) = self.retry_deadline_seconds {
            policy = policy.with_deadline(Duration::from_secs(seconds));
        }
        policy
    }

    /// Per-block write timeout, if configured.
    pub fn block_timeout(&self) -> Option<Duration> {
        self.block_timeout_seconds.map(Duration::from_secs)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid value [{}] for {}", value, key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config() -> WriterConfig {
        WriterConfig {
            endpoint: "http://service.example.com/api".to_string(),
            access_id: "id".to_string(),
            access_key: "secret".to_string(),
            project: "warehouse".to_string(),
            table: "orders".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = WriterConfig::default();
        assert_eq!(config.account_type, "aliyun");
        assert_eq!(config.columns, vec!["*"]);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_delay_ms, 1000);
        assert_eq!(config.column_resolution, ColumnResolutionMode::Strict);
        assert!(!config.truncate);
        assert_eq!(config.logging.log_format, LogFormat::Json);
    }

    #[test]
    fn test_config_validation() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_config_validation_blank_table() {
        let config = WriterConfig {
            table: "  ".into(),
            ..valid_config()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("table is required"));
    }

    #[test]
    fn test_config_validation_bad_account_type() {
        let config = WriterConfig {
            account_type: "ldap".into(),
            ..valid_config()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::UnsupportedAccountType(_))
        ));
    }

    #[test]
    fn test_config_validation_blank_partition() {
        let config = WriterConfig {
            partition: Some("   ".into()),
            ..valid_config()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_validation_zero_retries() {
        let config = WriterConfig {
            max_retries: 0,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_with_aliases() {
        let content = r#"
            odpsServer = "http://service.example.com/api"
            accessId = "id"
            accessKey = "secret"
            accountType = "taobao"
            project = "warehouse"
            table = "orders"
            partition = "pt = '20240101'"
            column = ["id", "amount"]
            truncate = true

            [logging]
            log_format = "text"
        "#;

        let config: WriterConfig = toml::from_str(content).unwrap();
        assert_eq!(config.endpoint, "http://service.example.com/api");
        assert_eq!(config.account_type, "taobao");
        assert_eq!(config.columns, vec!["id", "amount"]);
        assert!(config.truncate);
        assert_eq!(config.logging.log_format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            endpoint = "http://service.example.com/api"
            access_id = "id"
            access_key = "secret"
            project = "warehouse"
            table = "orders"
            max_retries = 5
            "#
        )
        .unwrap();

        let config = WriterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_policy().max_attempts, 5);
    }

    #[test]
    fn test_from_file_missing_field() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"endpoint = "http://service.example.com/api""#).unwrap();

        let result = WriterConfig::from_file(file.path());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_map() {
        let map: HashMap<String, String> = [
            ("odpsServer", "http://service.example.com/api"),
            ("accessId", "id"),
            ("accessKey", "secret"),
            ("project", "warehouse"),
            ("table", "orders"),
            ("column", "id, amount ,name"),
            ("truncate", "true"),
            ("max_retries", "4"),
            ("columnResolution", "lenient"),
            ("someOtherPluginKey", "ignored"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = WriterConfig::from_map(&map).unwrap();
        assert_eq!(config.columns, vec!["id", "amount", "name"]);
        assert!(config.truncate);
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.column_resolution, ColumnResolutionMode::Lenient);
    }

    #[test]
    fn test_from_map_invalid_number() {
        let mut map = HashMap::new();
        map.insert("maxRetries".to_string(), "many".to_string());

        let err = WriterConfig::from_map(&map).unwrap_err();
        assert!(err.to_string().contains("many"));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = WriterConfig {
            retry_base_delay_ms: 250,
            retry_deadline_seconds: Some(30),
            ..valid_config()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.deadline, Some(Duration::from_secs(30)));
    }
}
