/// SQL driver interface
///
/// The wire protocol is not implemented here. Any client library that can
/// connect, run a statement, ping, reset and close is plugged in through
/// [`Driver`] and [`DriverConnection`].
pub mod scripted;

use crate::core::InstanceAddr;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;

/// Connection parameters handed to the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConf {
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub charset: String,
    pub username: String,
    pub password: String,
}

impl Default for ConnectionConf {
    fn default() -> Self {
        Self {
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            charset: "gbk".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Classification of driver failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Connect,
    /// The server rejected the credentials
    AccessDenied,
    /// The server went away mid-session
    ConnectionLost,
    Query,
    Timeout,
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverErrorKind::Connect => "connect",
            DriverErrorKind::AccessDenied => "access denied",
            DriverErrorKind::ConnectionLost => "connection lost",
            DriverErrorKind::Query => "query",
            DriverErrorKind::Timeout => "timeout",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error [{code}]: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub code: u32,
    pub message: String,
}

impl DriverError {
    pub fn new<S: Into<String>>(kind: DriverErrorKind, code: u32, message: S) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    /// Whether retrying on a fresh connection may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            DriverErrorKind::Connect | DriverErrorKind::ConnectionLost | DriverErrorKind::Timeout
        )
    }
}

/// Server-side column types, as reported in result metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Tiny,
    Short,
    Long,
    Int24,
    LongLong,
    Float,
    Double,
    Decimal,
    VarChar,
    Blob,
    DateTime,
    Null,
}

/// Result column metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub unsigned: bool,
}

impl Column {
    pub fn new<S: Into<String>>(name: S, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            unsigned: false,
        }
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }
}

/// One row of raw cells; `None` is SQL NULL
pub type RawRow = Vec<Option<Bytes>>;

/// Forward-only source of result rows
pub trait RowStream: Send {
    fn next_row(&mut self) -> Option<RawRow>;
}

/// Row stream backed by an in-memory queue
#[derive(Debug, Default)]
pub struct VecRowStream {
    rows: VecDeque<RawRow>,
}

impl VecRowStream {
    pub fn new(rows: Vec<RawRow>) -> Self {
        Self { rows: rows.into() }
    }
}

impl RowStream for VecRowStream {
    fn next_row(&mut self) -> Option<RawRow> {
        self.rows.pop_front()
    }
}

/// Outcome of one statement
pub enum QueryOutcome {
    Rows {
        columns: Vec<Column>,
        stream: Box<dyn RowStream>,
    },
    Affected {
        affected_rows: u64,
        last_insert_id: u64,
    },
}

impl fmt::Debug for QueryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryOutcome::Rows { columns, .. } => f
                .debug_struct("Rows")
                .field("columns", &columns.len())
                .finish(),
            QueryOutcome::Affected {
                affected_rows,
                last_insert_id,
            } => f
                .debug_struct("Affected")
                .field("affected_rows", affected_rows)
                .field("last_insert_id", last_insert_id)
                .finish(),
        }
    }
}

/// Factory for driver sessions
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(
        &self,
        addr: &InstanceAddr,
        conf: &ConnectionConf,
    ) -> Result<Box<dyn DriverConnection>, DriverError>;

    /// Driver name for logging
    fn name(&self) -> &str {
        "driver"
    }
}

/// One open driver session
#[async_trait]
pub trait DriverConnection: Send {
    /// Run a statement. `store` asks the driver to buffer the whole result.
    async fn query(&mut self, sql: &str, store: bool) -> Result<QueryOutcome, DriverError>;

    async fn ping(&mut self) -> Result<(), DriverError>;

    /// Reset session state (variables, temporary tables, open transaction)
    async fn reset(&mut self) -> Result<(), DriverError>;

    async fn close(&mut self);
}
