/// Pooled connections and their checkout state machine
use super::instance::Instance;
use super::{ConnectionStatus, InstanceAddr, ShardContext};
use crate::driver::{DriverConnection, DriverError, DriverErrorKind};
use crate::error::{KumoError, KumoResult};
use crate::result::ResultSet;
use crate::sql::rewrite_sql;
use crate::utils::{elapsed_us, now_us};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

#[derive(Debug, Default)]
struct Binding {
    partition_key: Option<u32>,
    logic_db: Option<String>,
}

#[derive(Debug, Default)]
struct LastError {
    code: u32,
    description: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One driver session bound to an instance.
///
/// Exactly one caller may hold a connection in `USING`; entering and
/// leaving that state are compare-and-swap transitions.
pub struct Connection {
    id: usize,
    status: AtomicU8,
    binding: Mutex<Binding>,
    handle: tokio::sync::Mutex<Option<Box<dyn DriverConnection>>>,
    executing: AtomicBool,
    begin_us: AtomicU64,
    abort: Notify,
    broken: AtomicBool,
    last_error: Mutex<LastError>,
    instance: Weak<Instance>,
    ctx: Arc<ShardContext>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("broken", &self.is_broken())
            .finish()
    }
}

impl Connection {
    pub fn new(id: usize, instance: Weak<Instance>, ctx: Arc<ShardContext>) -> Arc<Self> {
        Arc::new(Self {
            id,
            status: AtomicU8::new(ConnectionStatus::NotConnected as u8),
            binding: Mutex::new(Binding::default()),
            handle: tokio::sync::Mutex::new(None),
            executing: AtomicBool::new(false),
            begin_us: AtomicU64::new(0),
            abort: Notify::new(),
            broken: AtomicBool::new(false),
            last_error: Mutex::new(LastError::default()),
            instance,
            ctx,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Validated compare-and-swap on the status
    pub fn transition(&self, from: ConnectionStatus, to: ConnectionStatus) -> bool {
        from.can_transition(to)
            && self
                .status
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Whether the session was lost or killed and needs a reconnect
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Flag the session unusable after an abandoned statement
    pub(crate) fn mark_broken(&self) {
        self.executing.store(false, Ordering::Release);
        self.broken.store(true, Ordering::Release);
    }

    pub fn instance(&self) -> Option<Arc<Instance>> {
        self.instance.upgrade()
    }

    pub fn instance_addr(&self) -> Option<InstanceAddr> {
        self.instance.upgrade().map(|i| i.addr().clone())
    }

    pub fn shard_id(&self) -> u32 {
        self.ctx.shard_id
    }

    /// Bind the partition key and logic database used for table rewriting
    pub fn bind(&self, partition_key: Option<u32>, logic_db: Option<&str>) {
        let mut binding = lock(&self.binding);
        binding.partition_key = partition_key;
        binding.logic_db = logic_db.map(str::to_string);
    }

    pub fn partition_key(&self) -> Option<u32> {
        lock(&self.binding).partition_key
    }

    pub fn logic_db(&self) -> Option<String> {
        lock(&self.binding).logic_db.clone()
    }

    pub fn error_code(&self) -> u32 {
        lock(&self.last_error).code
    }

    pub fn error_description(&self) -> String {
        lock(&self.last_error).description.clone()
    }

    fn record_error(&self, err: &DriverError) {
        let mut last = lock(&self.last_error);
        last.code = err.code;
        last.description = err.message.clone();
    }

    fn clear_error(&self) {
        let mut last = lock(&self.last_error);
        last.code = 0;
        last.description.clear();
    }

    /// Open a driver session. With `change_status` a successful connect
    /// also makes a `NOT_CONNECTED` or `CHECKING` connection available
    /// (`NOT_USED`); a connection in `USING` keeps its owner.
    pub async fn connect(&self, change_status: bool) -> KumoResult<()> {
        let instance = self.instance.upgrade().ok_or(KumoError::HandleNull)?;
        match self.ctx.driver.connect(instance.addr(), &self.ctx.conf).await {
            Ok(session) => {
                let old = self.handle.lock().await.replace(session);
                if let Some(mut old) = old {
                    old.close().await;
                }
                self.broken.store(false, Ordering::Release);
                self.clear_error();
                if change_status
                    && !self.transition(ConnectionStatus::Checking, ConnectionStatus::NotUsed)
                {
                    self.transition(ConnectionStatus::NotConnected, ConnectionStatus::NotUsed);
                }
                debug!(instance = %instance.key(), conn = self.id, "connected");
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                if e.kind == DriverErrorKind::AccessDenied {
                    instance.block_reconnect(self.ctx.no_permission_wait_secs);
                }
                warn!(
                    service = %self.ctx.service,
                    shard = self.ctx.shard_id,
                    instance = %instance.key(),
                    error = %e,
                    "connect failed"
                );
                Err(KumoError::ConnectFail {
                    addr: instance.key().to_string(),
                    source: e,
                })
            }
        }
    }

    /// Drop the current session and open a new one
    pub async fn reconnect(&self, change_status: bool) -> KumoResult<()> {
        self.close_handle().await;
        self.connect(change_status).await
    }

    /// Close the driver session, if any
    pub async fn close_handle(&self) {
        let old = self.handle.lock().await.take();
        if let Some(mut old) = old {
            old.close().await;
        }
    }

    pub async fn ping(&self) -> KumoResult<()> {
        let mut guard = self.handle.lock().await;
        let session = guard.as_mut().ok_or(KumoError::HandleNull)?;
        session.ping().await.map_err(|e| {
            self.record_error(&e);
            KumoError::PingFail {
                addr: self.addr_string(),
                message: e.message,
            }
        })
    }

    pub async fn reset(&self) -> KumoResult<()> {
        let mut guard = self.handle.lock().await;
        let session = guard.as_mut().ok_or(KumoError::HandleNull)?;
        session.reset().await.map_err(|e| {
            self.record_error(&e);
            KumoError::Driver(e)
        })
    }

    fn addr_string(&self) -> String {
        self.instance
            .upgrade()
            .map(|i| i.key().to_string())
            .unwrap_or_default()
    }

    /// Run a statement, buffering the result and rewriting the tables it
    /// references
    pub async fn execute(&self, sql: &str) -> KumoResult<ResultSet> {
        self.execute_inner(sql, None, true).await
    }

    /// Run a statement; `store = false` leaves the result streaming
    pub async fn execute_with(&self, sql: &str, store: bool) -> KumoResult<ResultSet> {
        self.execute_inner(sql, None, store).await
    }

    /// Run a statement, rewriting only the listed tables
    pub async fn execute_tables(
        &self,
        sql: &str,
        tables: &[&str],
        store: bool,
    ) -> KumoResult<ResultSet> {
        self.execute_inner(sql, Some(tables), store).await
    }

    pub async fn begin_transaction(&self) -> KumoResult<()> {
        self.execute_with("BEGIN", true).await.map(|_| ())
    }

    pub async fn commit(&self) -> KumoResult<()> {
        self.execute_with("COMMIT", true).await.map(|_| ())
    }

    pub async fn rollback(&self) -> KumoResult<()> {
        self.execute_with("ROLLBACK", true).await.map(|_| ())
    }

    /// Switch the session to `db`
    pub async fn use_db(&self, db: &str) -> KumoResult<()> {
        self.execute_with(&format!("USE `{}`", db), true)
            .await
            .map(|_| ())
    }

    fn comment(&self) -> String {
        if self.ctx.comment_format.is_empty() {
            return String::new();
        }
        let body = self
            .ctx
            .comment_format
            .replace("{service}", &self.ctx.service)
            .replace("{shard}", &self.ctx.shard_id.to_string())
            .replace("{instance}", &self.addr_string());
        format!("/* {} */ ", body)
    }

    /// Rewrite split tables and prepend the comment tag
    pub fn prepare(&self, sql: &str, tables: Option<&[&str]>) -> KumoResult<String> {
        let (key, bound) = {
            let binding = lock(&self.binding);
            (binding.partition_key, binding.logic_db.clone())
        };
        let logic_dbs = &self.ctx.logic_dbs;
        let evaluator = &self.ctx.evaluator;

        // Without a bound logic database, a service with a single one uses it.
        let fallback = match (&bound, logic_dbs.len()) {
            (None, 1) => logic_dbs.keys().next().cloned(),
            _ => bound,
        };

        let rewritten = rewrite_sql(sql, tables, |db, table| {
            let logic_db = match db {
                Some(db) => logic_dbs.get(db),
                None => fallback.as_deref().and_then(|name| logic_dbs.get(name)),
            };
            match logic_db {
                Some(logic_db) => logic_db.table_id(table, key, evaluator),
                None => Ok(None),
            }
        })?;

        let comment = self.comment();
        if comment.is_empty() {
            Ok(rewritten)
        } else {
            Ok(comment + &rewritten)
        }
    }

    async fn execute_inner(
        &self,
        sql: &str,
        tables: Option<&[&str]>,
        store: bool,
    ) -> KumoResult<ResultSet> {
        if self.status() != ConnectionStatus::Using {
            error!(
                conn = self.id,
                status = %self.status(),
                "execute on a connection that is not checked out"
            );
            return Err(KumoError::execute(format!(
                "connection is {}, not USING",
                self.status()
            )));
        }
        let instance = self
            .instance
            .upgrade()
            .ok_or_else(|| KumoError::execute("instance no longer exists"))?;

        let statement = self.prepare(sql, tables)?;
        let _scope = instance.weight_scope();
        let mut reconnected = false;

        loop {
            let err = match self.run(&statement, store).await {
                Ok(outcome) => return Ok(ResultSet::from_outcome(outcome, store)),
                Err(err) => err,
            };

            let lost = match &err {
                KumoError::HandleNull => true,
                KumoError::Driver(e) => e.kind == DriverErrorKind::ConnectionLost,
                _ => false,
            };
            if !lost || reconnected {
                if lost {
                    self.broken.store(true, Ordering::Release);
                }
                return Err(match err {
                    KumoError::Driver(e) if e.kind == DriverErrorKind::Query => {
                        KumoError::QueryFail {
                            code: e.code,
                            message: e.message,
                        }
                    }
                    other => other,
                });
            }

            reconnected = true;
            debug!(instance = %instance.key(), conn = self.id, "session lost, reconnecting");
            if let Err(e) = self.reconnect(false).await {
                self.broken.store(true, Ordering::Release);
                instance.status_online_to_faulty();
                return Err(e);
            }
        }
    }

    async fn run(&self, statement: &str, store: bool) -> KumoResult<crate::driver::QueryOutcome> {
        let mut guard = self.handle.lock().await;
        let session = guard.as_mut().ok_or(KumoError::HandleNull)?;

        let killed = self.abort.notified();
        tokio::pin!(killed);
        self.begin_us.store(now_us(), Ordering::Release);
        self.executing.store(true, Ordering::Release);

        let result = tokio::select! {
            result = session.query(statement, store) => Some(result),
            _ = &mut killed => None,
        };
        self.executing.store(false, Ordering::Release);

        match result {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(e)) => {
                self.record_error(&e);
                Err(KumoError::Driver(e))
            }
            None => {
                *guard = None;
                self.broken.store(true, Ordering::Release);
                Err(KumoError::ConnectionKilled {
                    addr: self.addr_string(),
                })
            }
        }
    }

    /// Abort the running statement if it started more than `timeout_us` ago
    pub fn kill_if_hung(&self, timeout_us: u64) -> bool {
        if self.status() != ConnectionStatus::Using || !self.executing.load(Ordering::Acquire) {
            return false;
        }
        let running_us = elapsed_us(self.begin_us.load(Ordering::Acquire));
        if running_us < timeout_us {
            return false;
        }
        warn!(
            service = %self.ctx.service,
            shard = self.ctx.shard_id,
            instance = %self.addr_string(),
            conn = self.id,
            running_us,
            "killing hung statement"
        );
        self.abort.notify_waiters();
        true
    }

    /// Give the connection back: `USING` to `NOT_USED`, or to `BAD` when the
    /// session was lost. Clears the partition key and logic database.
    pub fn close(&self) -> bool {
        let target = if self.is_broken() {
            ConnectionStatus::Bad
        } else {
            ConnectionStatus::NotUsed
        };
        if self.transition(ConnectionStatus::Using, target) {
            self.bind(None, None);
            true
        } else {
            warn!(
                conn = self.id,
                status = %self.status(),
                "close on a connection that is not in use"
            );
            false
        }
    }
}

/// Checkout guard handed out by pools and services.
///
/// Dereferences to the [`Connection`]; the connection goes back to its
/// instance when the guard is closed or dropped.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Arc<Connection>,
    closed: bool,
}

impl PooledConnection {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            closed: false,
        }
    }

    /// Return the connection now
    pub fn close(mut self) -> bool {
        self.closed = true;
        self.conn.close()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.conn.close();
        }
    }
}
