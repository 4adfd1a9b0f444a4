/// In-memory scripted driver
///
/// `ScriptedDriver` answers statements from a script instead of a server.
/// Addresses can be taken down, have their credentials rejected or drop
/// their next sessions, and every statement executed per address is
/// recorded so routing can be asserted.
use super::{
    Column, ColumnType, ConnectionConf, Driver, DriverConnection, DriverError, DriverErrorKind,
    QueryOutcome, RawRow, VecRowStream,
};
use crate::core::InstanceAddr;
use async_trait::async_trait;
use bytes::Bytes;
use fnv::{FnvHashMap, FnvHashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A canned answer for statements containing a pattern
#[derive(Debug, Clone)]
pub enum ScriptedResult {
    Rows {
        columns: Vec<Column>,
        rows: Vec<Vec<Option<String>>>,
    },
    Affected {
        affected_rows: u64,
        last_insert_id: u64,
    },
    Error {
        code: u32,
        message: String,
    },
}

impl ScriptedResult {
    /// String-typed rows, `None` cells are NULL
    pub fn rows(columns: &[&str], rows: Vec<Vec<Option<&str>>>) -> Self {
        ScriptedResult::Rows {
            columns: columns
                .iter()
                .map(|name| Column::new(*name, ColumnType::VarChar))
                .collect(),
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(|c| c.map(str::to_string)).collect())
                .collect(),
        }
    }

    pub fn affected(affected_rows: u64) -> Self {
        ScriptedResult::Affected {
            affected_rows,
            last_insert_id: 0,
        }
    }

    fn outcome(&self) -> Result<QueryOutcome, DriverError> {
        match self {
            ScriptedResult::Rows { columns, rows } => {
                let raw: Vec<RawRow> = rows
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|cell| cell.as_ref().map(|v| Bytes::from(v.clone())))
                            .collect()
                    })
                    .collect();
                Ok(QueryOutcome::Rows {
                    columns: columns.clone(),
                    stream: Box::new(VecRowStream::new(raw)),
                })
            }
            ScriptedResult::Affected {
                affected_rows,
                last_insert_id,
            } => Ok(QueryOutcome::Affected {
                affected_rows: *affected_rows,
                last_insert_id: *last_insert_id,
            }),
            ScriptedResult::Error { code, message } => Err(DriverError::new(
                DriverErrorKind::Query,
                *code,
                message.clone(),
            )),
        }
    }
}

#[derive(Default)]
struct ScriptState {
    down: FnvHashSet<String>,
    denied: FnvHashSet<String>,
    lose_sessions: FnvHashMap<String, u32>,
    responses: Vec<(String, ScriptedResult)>,
    delays: Vec<(String, Duration)>,
    connect_delays: FnvHashMap<String, Duration>,
    executed: FnvHashMap<String, Vec<String>>,
    connects: FnvHashMap<String, usize>,
    pings: FnvHashMap<String, usize>,
}

/// Scripted in-memory driver
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    state: Arc<Mutex<ScriptState>>,
}

fn lock(state: &Mutex<ScriptState>) -> MutexGuard<'_, ScriptState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an address down (connect, ping and query fail) or bring it back
    pub fn set_down(&self, addr: &str, down: bool) {
        let mut state = lock(&self.state);
        if down {
            state.down.insert(addr.to_string());
        } else {
            state.down.remove(addr);
        }
    }

    /// Reject credentials on an address
    pub fn set_access_denied(&self, addr: &str, denied: bool) {
        let mut state = lock(&self.state);
        if denied {
            state.denied.insert(addr.to_string());
        } else {
            state.denied.remove(addr);
        }
    }

    /// The next `count` statements on `addr` fail with a lost connection
    pub fn lose_next_queries(&self, addr: &str, count: u32) {
        lock(&self.state)
            .lose_sessions
            .insert(addr.to_string(), count);
    }

    /// Answer statements containing `pattern` with `result`
    pub fn respond(&self, pattern: &str, result: ScriptedResult) {
        lock(&self.state)
            .responses
            .push((pattern.to_string(), result));
    }

    /// Delay statements containing `pattern`
    pub fn delay(&self, pattern: &str, delay: Duration) {
        lock(&self.state).delays.push((pattern.to_string(), delay));
    }

    /// Slow down every connect to `addr`
    pub fn delay_connect(&self, addr: &str, delay: Duration) {
        lock(&self.state)
            .connect_delays
            .insert(addr.to_string(), delay);
    }

    /// Statements executed on `addr`, in order
    pub fn executed(&self, addr: &str) -> Vec<String> {
        lock(&self.state)
            .executed
            .get(addr)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connect_count(&self, addr: &str) -> usize {
        lock(&self.state).connects.get(addr).copied().unwrap_or(0)
    }

    pub fn ping_count(&self, addr: &str) -> usize {
        lock(&self.state).pings.get(addr).copied().unwrap_or(0)
    }

    pub fn clear_log(&self) {
        let mut state = lock(&self.state);
        state.executed.clear();
        state.connects.clear();
        state.pings.clear();
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn connect(
        &self,
        addr: &InstanceAddr,
        _conf: &ConnectionConf,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        let key = addr.to_string();
        let delay = lock(&self.state).connect_delays.get(&key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        *state.connects.entry(key.clone()).or_insert(0) += 1;

        if state.down.contains(&key) {
            return Err(DriverError::new(
                DriverErrorKind::Connect,
                2003,
                format!("Can't connect to server on '{}'", key),
            ));
        }
        if state.denied.contains(&key) {
            return Err(DriverError::new(
                DriverErrorKind::AccessDenied,
                1045,
                format!("Access denied on '{}'", key),
            ));
        }

        Ok(Box::new(ScriptedConnection {
            addr: key,
            state: self.state.clone(),
            closed: false,
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct ScriptedConnection {
    addr: String,
    state: Arc<Mutex<ScriptState>>,
    closed: bool,
}

impl ScriptedConnection {
    fn gone(&self) -> DriverError {
        DriverError::new(
            DriverErrorKind::ConnectionLost,
            2013,
            format!("Lost connection to server '{}'", self.addr),
        )
    }
}

#[async_trait]
impl DriverConnection for ScriptedConnection {
    async fn query(&mut self, sql: &str, _store: bool) -> Result<QueryOutcome, DriverError> {
        if self.closed {
            return Err(self.gone());
        }

        let (delay, result) = {
            let mut state = lock(&self.state);
            if state.down.contains(&self.addr) {
                return Err(self.gone());
            }
            if let Some(remaining) = state.lose_sessions.get_mut(&self.addr) {
                if *remaining > 0 {
                    *remaining -= 1;
                    self.closed = true;
                    return Err(self.gone());
                }
            }

            state
                .executed
                .entry(self.addr.clone())
                .or_default()
                .push(sql.to_string());

            let delay = state
                .delays
                .iter()
                .find(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|(_, delay)| *delay);
            let result = state
                .responses
                .iter()
                .rev()
                .find(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|(_, result)| result.clone());
            (delay, result)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match result {
            Some(result) => result.outcome(),
            None => {
                let head = sql.trim_start().to_ascii_uppercase();
                if head.starts_with("SELECT") || head.starts_with("SHOW") {
                    Ok(QueryOutcome::Rows {
                        columns: Vec::new(),
                        stream: Box::new(VecRowStream::default()),
                    })
                } else {
                    Ok(QueryOutcome::Affected {
                        affected_rows: 0,
                        last_insert_id: 0,
                    })
                }
            }
        }
    }

    async fn ping(&mut self) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        *state.pings.entry(self.addr.clone()).or_insert(0) += 1;
        if self.closed || state.down.contains(&self.addr) {
            return Err(self.gone());
        }
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), DriverError> {
        if self.closed {
            return Err(self.gone());
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
