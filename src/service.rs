/// Database services: shard routing over a set of instance pools
use crate::config::{ConfigError, DbShardOption, ManagerOptions, ServiceOptions};
use crate::core::{
    InstanceInfo, InstancePool, PoolOptions, PooledConnection, ShardContext, FETCH_CONN_TIMES,
};
use crate::discovery::{shard_instances, Discovery};
use crate::driver::Driver;
use crate::error::{KumoError, KumoResult};
use crate::expr::{ShardEvaluator, SplitExpr};
use crate::health::HealthReport;
use crate::logic_db::LogicDb;
use crate::result::ResultSet;
use crate::utils::parse_ip_port;
use fnv::FnvHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// One logical database service: its shards and logic databases
pub struct Service {
    name: String,
    options: ServiceOptions,
    evaluator: Arc<ShardEvaluator>,
    shard_function: SplitExpr,
    shard_ids: Vec<u32>,
    pools: FnvHashMap<u32, Arc<InstancePool>>,
    logic_dbs: Arc<FnvHashMap<String, LogicDb>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("shards", &self.shard_ids)
            .field("shard_function", &self.shard_function.source())
            .finish()
    }
}

fn static_instances(shard: &DbShardOption) -> KumoResult<Vec<InstanceInfo>> {
    let tag = format!("shard:{}", shard.id);
    shard
        .addresses()
        .into_iter()
        .map(|addr| {
            parse_ip_port(addr)
                .map(|(ip, port)| InstanceInfo::new(ip, port, &tag))
                .ok_or_else(|| {
                    KumoError::Config(ConfigError::ValidationError(format!(
                        "Invalid instance address: {}",
                        addr
                    )))
                })
        })
        .collect()
}

impl Service {
    /// Build every shard pool and logic database of one service
    pub async fn init(
        options: &ServiceOptions,
        manager: &ManagerOptions,
        driver: Arc<dyn Driver>,
        evaluator: Arc<ShardEvaluator>,
        discovery: Option<&dyn Discovery>,
    ) -> KumoResult<Self> {
        options.validate()?;
        let name = options.service_name.clone();
        let shard_function = evaluator.parse(&options.db_split_function)?;

        let mut logic_dbs = FnvHashMap::default();
        for db in &options.logic_dbs {
            logic_dbs.insert(db.name.clone(), LogicDb::from_option(db, &evaluator)?);
        }
        let logic_dbs = Arc::new(logic_dbs);

        let records = if options.db_shards.iter().any(DbShardOption::uses_discovery) {
            let discovery = discovery.ok_or_else(|| {
                KumoError::Config(ConfigError::ValidationError(format!(
                    "Service '{}' has shards without ip_list but no discovery",
                    name
                )))
            })?;
            discovery.instances(&name).await?
        } else {
            Vec::new()
        };

        let mut pools = FnvHashMap::default();
        let mut shard_ids = Vec::with_capacity(options.db_shards.len());
        for shard in &options.db_shards {
            let ctx = ShardContext {
                conf: options.connection_conf(shard),
                evaluator: evaluator.clone(),
                logic_dbs: logic_dbs.clone(),
                comment_format: options.comment_format.clone(),
                max_connection_per_instance: options.max_connection_per_instance,
                latency_window: options.latency_window,
                no_permission_wait_secs: manager.no_permission_wait_secs,
                ..ShardContext::new(&name, shard.id, driver.clone())
            };
            let pool_options = PoolOptions {
                algorithm: options.select_algorithm,
                connection_num: options.connection_num,
                failure_threshold: options.failure_threshold,
                delay_threshold_ms: options.delay_threshold_ms,
                faulty_exit: manager.faulty_exit,
            };

            let static_list = !shard.uses_discovery();
            let instances = if static_list {
                static_instances(shard)?
            } else {
                shard_instances(&records, shard.id)
            };
            let tag = if shard.tag.is_empty() { &name } else { &shard.tag };

            let pool = InstancePool::new(Arc::new(ctx), tag, static_list, pool_options);
            pool.init(options.connect_all, &instances).await?;
            pools.insert(shard.id, Arc::new(pool));
            shard_ids.push(shard.id);
        }
        shard_ids.sort_unstable();

        info!(
            service = %name,
            shards = shard_ids.len(),
            logic_dbs = logic_dbs.len(),
            "service initialized"
        );
        Ok(Self {
            name,
            options: options.clone(),
            evaluator,
            shard_function,
            shard_ids,
            pools,
            logic_dbs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// Shard ids in ascending order
    pub fn shard_ids(&self) -> &[u32] {
        &self.shard_ids
    }

    pub fn pool(&self, shard_id: u32) -> Option<&Arc<InstancePool>> {
        self.pools.get(&shard_id)
    }

    pub fn logic_db(&self, name: &str) -> Option<&LogicDb> {
        self.logic_dbs.get(name)
    }

    fn pool_for(&self, shard_id: u32) -> KumoResult<&Arc<InstancePool>> {
        self.pools.get(&shard_id).ok_or_else(|| KumoError::ShardNotFound {
            service: self.name.clone(),
            shard_id,
        })
    }

    /// Shard owning `key`. A single-shard service routes every key, and no
    /// key, to its one shard.
    pub fn shard_id(&self, key: Option<u32>) -> KumoResult<u32> {
        if let [only] = self.shard_ids.as_slice() {
            return Ok(*only);
        }
        let key = key.ok_or_else(|| {
            KumoError::get_service(format!(
                "service '{}' has {} shards, a partition key is required",
                self.name,
                self.shard_ids.len()
            ))
        })?;
        let shard_id = self.evaluator.eval(&self.shard_function, key)?;
        self.pool_for(shard_id)?;
        Ok(shard_id)
    }

    /// Sub-table index of `table` in `logic_db` for `key`
    pub fn table_id(&self, logic_db: &str, table: &str, key: Option<u32>) -> KumoResult<Option<u32>> {
        let db = self.logic_db(logic_db).ok_or_else(|| {
            KumoError::input_param(format!(
                "logic db '{}' is not defined in service '{}'",
                logic_db, self.name
            ))
        })?;
        db.table_id(table, key, &self.evaluator)
    }

    async fn checkout(
        &self,
        shard_id: u32,
        key: Option<u32>,
        logic_db: Option<&str>,
        preferred: Option<&str>,
    ) -> KumoResult<PooledConnection> {
        if let Some(db) = logic_db {
            if !self.logic_dbs.contains_key(db) {
                return Err(KumoError::input_param(format!(
                    "logic db '{}' is not defined in service '{}'",
                    db, self.name
                )));
            }
        }

        let pool = self.pool_for(shard_id)?;
        let conn = PooledConnection::new(pool.fetch_connection(preferred).await?);
        if let Some(db) = logic_db {
            conn.use_db(db).await?;
        }
        conn.bind(key, logic_db);
        debug!(
            service = %self.name,
            shard = shard_id,
            conn = conn.id(),
            "connection checked out"
        );
        Ok(conn)
    }

    /// Connection without a partition key; only a single-shard service can
    /// route it
    pub async fn fetch_connection(&self) -> KumoResult<PooledConnection> {
        let shard_id = self.shard_id(None)?;
        self.checkout(shard_id, None, None, None).await
    }

    /// Connection to the shard owning `key`, with `key` bound for table
    /// rewriting
    pub async fn fetch_connection_by_key(&self, key: u32) -> KumoResult<PooledConnection> {
        let shard_id = self.shard_id(Some(key))?;
        self.checkout(shard_id, Some(key), None, None).await
    }

    /// Connection switched to `logic_db`
    pub async fn fetch_connection_by_db(&self, logic_db: &str) -> KumoResult<PooledConnection> {
        let shard_id = self.shard_id(None)?;
        self.checkout(shard_id, None, Some(logic_db), None).await
    }

    /// Connection to the shard owning `key`, switched to `logic_db`
    pub async fn fetch_connection_by_db_key(
        &self,
        logic_db: &str,
        key: u32,
    ) -> KumoResult<PooledConnection> {
        let shard_id = self.shard_id(Some(key))?;
        self.checkout(shard_id, Some(key), Some(logic_db), None)
            .await
    }

    /// Connection to `shard_id`, preferring the instance at `ip_port`
    pub async fn fetch_connection_by_shard(
        &self,
        shard_id: u32,
        ip_port: &str,
    ) -> KumoResult<PooledConnection> {
        self.checkout(shard_id, None, None, Some(ip_port)).await
    }

    /// Whether `ip_port` is a usable instance of `shard_id`
    pub async fn check_ip_by_shard(&self, shard_id: u32, ip_port: &str) -> bool {
        match self.pools.get(&shard_id) {
            Some(pool) => pool
                .select_instance(ip_port)
                .await
                .map_or(false, |inst| inst.is_usable()),
            None => false,
        }
    }

    /// Run one statement on a single-shard service
    pub async fn query(&self, key: Option<u32>, sql: &str) -> KumoResult<ResultSet> {
        if self.shard_ids.len() != 1 {
            return Err(KumoError::get_service(format!(
                "query needs a single-shard service, '{}' has {} shards",
                self.name,
                self.shard_ids.len()
            )));
        }
        let conn = match key {
            Some(key) => self.fetch_connection_by_key(key).await?,
            None => self.fetch_connection().await?,
        };
        let result = conn.execute(sql).await;
        conn.close();
        result
    }

    /// Run one statement on `shard_id`, preferring `ip_port`, bounded by
    /// `limit`. Fetching and recoverable failures are retried.
    pub async fn query_timeout(
        &self,
        shard_id: u32,
        ip_port: &str,
        sql: &str,
        limit: Duration,
    ) -> KumoResult<ResultSet> {
        let mut last_error = None;
        for _ in 0..FETCH_CONN_TIMES {
            let conn = match self.fetch_connection_by_shard(shard_id, ip_port).await {
                Ok(conn) => conn,
                Err(e) if e.is_recoverable() => {
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match timeout(limit, conn.execute(sql)).await {
                Ok(Ok(result)) => {
                    conn.close();
                    return Ok(result);
                }
                Ok(Err(e)) if e.is_recoverable() => {
                    warn!(service = %self.name, shard = shard_id, error = %e, "query failed, retrying");
                    conn.close();
                    last_error = Some(e);
                }
                Ok(Err(e)) => {
                    conn.close();
                    return Err(e);
                }
                Err(_) => {
                    conn.mark_broken();
                    conn.close();
                    return Err(KumoError::timeout(format!(
                        "query on shard {} of '{}' after {:?}",
                        shard_id, self.name, limit
                    )));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| KumoError::fetch_connect("no attempt made")))
    }

    /// One health pass over every shard; the first exhausted shard is
    /// reported after all shards were checked
    pub async fn healthy_check(&self, detect_dead: bool) -> KumoResult<HealthReport> {
        let mut report = HealthReport::default();
        let mut exhausted = None;
        for shard_id in &self.shard_ids {
            let pool = self.pool_for(*shard_id)?;
            match pool.healthy_check(detect_dead).await {
                Ok(shard_report) => report.merge(&shard_report),
                Err(e) => {
                    exhausted.get_or_insert(e);
                }
            }
        }
        match exhausted {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Kill hung statements when the hang check is enabled for this service
    pub async fn hang_check(&self) -> usize {
        if !self.options.hang_check {
            return 0;
        }
        let mut killed = 0;
        for pool in self.pools.values() {
            killed += pool.hang_check(self.options.hang_timeout_ms).await;
        }
        killed
    }

    /// Refresh every discovery-backed shard; returns (added, removed)
    pub async fn sync_instances(&self, discovery: &dyn Discovery) -> KumoResult<(usize, usize)> {
        if self.pools.values().all(|pool| pool.is_static()) {
            return Ok((0, 0));
        }
        let records = discovery.instances(&self.name).await?;
        let mut total = (0, 0);
        for shard_id in &self.shard_ids {
            let pool = self.pool_for(*shard_id)?;
            if pool.is_static() {
                continue;
            }
            let (added, removed) = pool
                .sync_instances(&shard_instances(&records, *shard_id))
                .await?;
            total.0 += added;
            total.1 += removed;
        }
        Ok(total)
    }

    pub async fn shutdown(&self) {
        for pool in self.pools.values() {
            pool.shutdown().await;
        }
        info!(service = %self.name, "service shut down");
    }
}
