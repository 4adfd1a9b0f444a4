/// Unified error handling for kumo
///
/// This module provides the error taxonomy shared by the expression
/// evaluator, connections, instance pools, services and the manager.
/// Per-request failures are returned to the caller; background-loop probe
/// failures are logged by their loops and never surface here.

use crate::config::ConfigError;
use crate::driver::DriverError;
use crate::expr::ExprError;
use std::fmt;
use thiserror::Error;

/// Main error type for kumo operations
#[derive(Debug, Error)]
pub enum KumoError {
    /// Malformed shard/table-split or service configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Input parameter missing, e.g. an empty split expression
    #[error("Input parameter error: {message}")]
    InputParam { message: String },

    /// Shard or table id computation failed
    #[error("Compute error: {message}")]
    Compute { message: String },

    #[error("Service not found: {name}")]
    ServiceNotFound { name: String },

    #[error("Get service failed: {message}")]
    GetServiceFail { message: String },

    #[error("Service is not initialized")]
    ServiceNotInit,

    #[error("Shard {shard_id} not found in service {service}")]
    ShardNotFound { service: String, shard_id: u32 },

    /// No online instance left in a shard
    #[error("No usable instance in shard {shard_id} of service {service}")]
    InstanceNotEnough { service: String, shard_id: u32 },

    #[error("Fetch connection failed: {message}")]
    FetchConnectFail { message: String },

    #[error("Connect to {addr} failed: {source}")]
    ConnectFail {
        addr: String,
        #[source]
        source: DriverError,
    },

    #[error("Ping {addr} failed: {message}")]
    PingFail { addr: String, message: String },

    /// The connection has no driver handle
    #[error("Connection handle is null")]
    HandleNull,

    /// Dispatch on an unusable connection
    #[error("Execute failed: {message}")]
    ExecuteFail { message: String },

    #[error("Query failed [{code}]: {message}")]
    QueryFail { code: u32, message: String },

    /// A split table was referenced without a bound partition key
    #[error("Table {table} is split but no partition key is bound")]
    NoPartitionKey { table: String },

    #[error("Connection to {addr} was killed by hang check")]
    ConnectionKilled { addr: String },

    #[error("Get value error: {message}")]
    GetValue { message: String },

    #[error("Value of column {column} is NULL")]
    ValueIsNull { column: String },

    #[error("Background task {task} is already running")]
    TaskStartRepeat { task: String },

    /// Escalated when `faulty_exit` is set and a shard stays without instances
    #[error("Shard {shard_id} of service {service} has no usable instance left")]
    ShardExhausted { service: String, shard_id: u32 },

    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

/// Result type alias for kumo operations
pub type KumoResult<T> = Result<T, KumoError>;

/// Convenience methods for creating specific error types
impl KumoError {
    pub fn input_param<S: Into<String>>(message: S) -> Self {
        KumoError::InputParam {
            message: message.into(),
        }
    }

    pub fn compute<S: Into<String>>(message: S) -> Self {
        KumoError::Compute {
            message: message.into(),
        }
    }

    pub fn get_service<S: Into<String>>(message: S) -> Self {
        KumoError::GetServiceFail {
            message: message.into(),
        }
    }

    pub fn fetch_connect<S: Into<String>>(message: S) -> Self {
        KumoError::FetchConnectFail {
            message: message.into(),
        }
    }

    pub fn execute<S: Into<String>>(message: S) -> Self {
        KumoError::ExecuteFail {
            message: message.into(),
        }
    }

    pub fn get_value<S: Into<String>>(message: S) -> Self {
        KumoError::GetValue {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        KumoError::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if this error is recoverable (the caller may retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            KumoError::InstanceNotEnough { .. } => true,
            KumoError::FetchConnectFail { .. } => true,
            KumoError::ConnectFail { .. } => true,
            KumoError::PingFail { .. } => true,
            KumoError::ConnectionKilled { .. } => true,
            KumoError::Timeout { .. } => true,
            KumoError::Driver(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            KumoError::Config(_) => ErrorSeverity::Critical,
            KumoError::ExecuteFail { .. } => ErrorSeverity::Critical,
            KumoError::ShardExhausted { .. } => ErrorSeverity::Critical,
            KumoError::ConnectFail { .. } => ErrorSeverity::Warning,
            KumoError::PingFail { .. } => ErrorSeverity::Warning,
            KumoError::InstanceNotEnough { .. } => ErrorSeverity::Warning,
            KumoError::Timeout { .. } => ErrorSeverity::Warning,
            KumoError::ValueIsNull { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

impl From<ExprError> for KumoError {
    fn from(err: ExprError) -> Self {
        match err {
            ExprError::Empty => KumoError::input_param("split expression is empty"),
            ExprError::Compute(message) => KumoError::compute(message),
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
