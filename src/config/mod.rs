/// Configuration management for kumo

use crate::core::SelectAlgorithm;
use crate::driver::ConnectionConf;
use crate::expr::ShardEvaluator;
use crate::utils::parse_ip_port;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Main kumo configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Background loops and process policy
    pub manager: ManagerOptions,
    /// Database services to route to
    pub services: Vec<ServiceOptions>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerOptions {
    pub name: String,
    /// Interval of the expensive health pass in seconds, 0 disables the loop
    pub healthy_check_secs: u64,
    /// Run the hang check loop
    pub hang_check: bool,
    /// Terminate the process when a shard loses every instance
    pub faulty_exit: bool,
    /// Backoff before reconnecting after a permission failure
    pub no_permission_wait_secs: u64,
    /// Discovery refresh interval in seconds, 0 disables the loop
    pub discovery_sync_secs: u64,
    /// Health loop tick; the cheap pass runs on every tick
    pub health_tick_ms: u64,
    pub hang_check_interval_ms: u64,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            name: "kumo".to_string(),
            healthy_check_secs: 10,
            hang_check: false,
            faulty_exit: false,
            no_permission_wait_secs: 30,
            discovery_sync_secs: 0,
            health_tick_ms: 500,
            hang_check_interval_ms: 1000,
        }
    }
}

/// One database service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    pub service_name: String,
    /// Connections spread over the instances of each shard at init
    pub connection_num: usize,
    /// Statement prefix template; `{service}`, `{shard}` and `{instance}`
    /// are substituted
    pub comment_format: String,
    pub hang_check: bool,
    /// 0 means unbounded
    pub max_connection_per_instance: usize,
    pub select_algorithm: SelectAlgorithm,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub charset: String,
    pub username: String,
    pub password: String,
    /// Connect every connection at init instead of on first use
    pub connect_all: bool,
    /// Maps a partition key to a shard id; required with more than one shard
    pub db_split_function: String,
    /// Failed probes before an instance is marked faulty
    pub failure_threshold: u32,
    /// Latency above which an instance is DELAYED, 0 disables
    pub delay_threshold_ms: u64,
    /// Statements running longer than this are killed by the hang check
    pub hang_timeout_ms: u64,
    /// Latency samples kept per instance
    pub latency_window: usize,
    pub db_shards: Vec<DbShardOption>,
    pub logic_dbs: Vec<LogicDbOption>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        let conf = ConnectionConf::default();
        Self {
            service_name: String::new(),
            connection_num: 4,
            comment_format: String::new(),
            hang_check: false,
            max_connection_per_instance: 0,
            select_algorithm: SelectAlgorithm::Rolling,
            read_timeout_ms: conf.read_timeout_ms,
            write_timeout_ms: conf.write_timeout_ms,
            connect_timeout_ms: conf.connect_timeout_ms,
            charset: conf.charset,
            username: String::new(),
            password: String::new(),
            connect_all: false,
            db_split_function: String::new(),
            failure_threshold: 3,
            delay_threshold_ms: 0,
            hang_timeout_ms: 30_000,
            latency_window: 32,
            db_shards: Vec::new(),
            logic_dbs: Vec::new(),
        }
    }
}

/// One shard of a service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbShardOption {
    pub id: u32,
    /// `ip:port,ip:port`; empty means the instances come from discovery
    pub ip_list: String,
    /// Discovery tag of the shard
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl DbShardOption {
    pub fn new(id: u32, ip_list: &str) -> Self {
        Self {
            id,
            ip_list: ip_list.to_string(),
            ..Default::default()
        }
    }

    /// Addresses of the configured list, skipping blanks
    pub fn addresses(&self) -> Vec<&str> {
        self.ip_list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn uses_discovery(&self) -> bool {
        self.addresses().is_empty()
    }
}

/// A logic database and its table splits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicDbOption {
    pub name: String,
    pub table_splits: Vec<TableSplitOption>,
}

/// One split table, or several as `"a|b|c"`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSplitOption {
    pub name: String,
    pub sub_tables: u32,
    pub table_split_function: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

impl ServiceOptions {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            ..Default::default()
        }
    }

    /// Build a service from a link url of the form
    /// `list://0$ip:port,ip:port;1$ip:port`
    pub fn from_link_url(
        service_name: &str,
        url: &str,
        username: &str,
        password: &str,
        charset: &str,
    ) -> Result<Self, ConfigError> {
        let body = url.strip_prefix("list://").ok_or_else(|| {
            ConfigError::ValidationError(format!("Unsupported link url: {}", url))
        })?;

        let mut shards = Vec::new();
        for group in body.split(';').map(str::trim).filter(|g| !g.is_empty()) {
            let (id, list) = group.split_once('$').ok_or_else(|| {
                ConfigError::ValidationError(format!("Shard group missing '$': {}", group))
            })?;
            let id = id.trim().parse::<u32>().map_err(|_| {
                ConfigError::ValidationError(format!("Invalid shard id in link url: {}", id))
            })?;
            shards.push(DbShardOption::new(id, list.trim()));
        }

        let mut options = ServiceOptions::new(service_name);
        options.username = username.to_string();
        options.password = password.to_string();
        if !charset.is_empty() {
            options.charset = charset.to_string();
        }
        options.db_shards = shards;
        Ok(options)
    }

    /// Driver parameters for one shard, with its overrides applied
    pub fn connection_conf(&self, shard: &DbShardOption) -> ConnectionConf {
        ConnectionConf {
            read_timeout_ms: shard.read_timeout_ms.unwrap_or(self.read_timeout_ms),
            write_timeout_ms: shard.write_timeout_ms.unwrap_or(self.write_timeout_ms),
            connect_timeout_ms: shard.connect_timeout_ms.unwrap_or(self.connect_timeout_ms),
            charset: shard.charset.clone().unwrap_or_else(|| self.charset.clone()),
            username: shard.username.clone().unwrap_or_else(|| self.username.clone()),
            password: shard.password.clone().unwrap_or_else(|| self.password.clone()),
        }
    }

    /// Validate one service
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        let name = &self.service_name;

        if self.db_shards.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Service '{}' has no db_shards",
                name
            )));
        }

        let mut ids = HashSet::new();
        for shard in &self.db_shards {
            if !ids.insert(shard.id) {
                return Err(ConfigError::ValidationError(format!(
                    "Service '{}' has duplicate shard id {}",
                    name, shard.id
                )));
            }
            for addr in shard.addresses() {
                if parse_ip_port(addr).is_none() {
                    return Err(ConfigError::ValidationError(format!(
                        "Invalid instance address in shard {}: {}",
                        shard.id, addr
                    )));
                }
            }
        }

        let evaluator = ShardEvaluator::new();
        if self.db_shards.len() > 1 && self.db_split_function.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Service '{}' has {} shards but no db_split_function",
                name,
                self.db_shards.len()
            )));
        }
        evaluator.parse(&self.db_split_function).map_err(|e| {
            ConfigError::ValidationError(format!("Invalid db_split_function for '{}': {}", name, e))
        })?;

        let mut dbs = HashSet::new();
        for db in &self.logic_dbs {
            if db.name.trim().is_empty() || !dbs.insert(db.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Service '{}' has an empty or duplicate logic db name '{}'",
                    name, db.name
                )));
            }
            for split in &db.table_splits {
                if split.sub_tables == 0 {
                    return Err(ConfigError::ValidationError(format!(
                        "Table '{}' in logic db '{}' must have sub_tables > 0",
                        split.name, db.name
                    )));
                }
                let function = evaluator.parse(&split.table_split_function).map_err(|e| {
                    ConfigError::ValidationError(format!(
                        "Invalid table_split_function for '{}': {}",
                        split.name, e
                    ))
                })?;
                if split.sub_tables != 1 && function.is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "Table '{}' has {} sub tables but no table_split_function",
                        split.name, split.sub_tables
                    )));
                }
            }
        }

        if self.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.manager.health_tick_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health_tick_ms must be greater than 0".to_string(),
            ));
        }

        if self.manager.hang_check_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "hang_check_interval_ms must be greater than 0".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !names.insert(service.service_name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate service name: {}",
                    service.service_name
                )));
            }
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let mut orders = ServiceOptions::new("orders");
        orders.db_split_function = "$ % 2".to_string();
        orders.comment_format = "{service}:{shard}".to_string();
        orders.db_shards = vec![
            DbShardOption::new(0, "10.0.1.10:3306,10.0.1.11:3306"),
            DbShardOption::new(1, "10.0.1.20:3306,10.0.1.21:3306"),
        ];
        orders.logic_dbs = vec![LogicDbOption {
            name: "order_db".to_string(),
            table_splits: vec![
                TableSplitOption {
                    name: "orders|order_items".to_string(),
                    sub_tables: 16,
                    table_split_function: "($ >> 1) % 16".to_string(),
                },
                TableSplitOption {
                    name: "merchants".to_string(),
                    sub_tables: 1,
                    table_split_function: String::new(),
                },
            ],
        }];

        let config = Config {
            services: vec![orders],
            ..Default::default()
        };
        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
