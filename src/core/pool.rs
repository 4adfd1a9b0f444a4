/// Instance pools: the instances backing one shard
use super::balancer::{create_selector, SelectionAlgorithm};
use super::connection::Connection;
use super::instance::Instance;
use super::{ConnectionStatus, InstanceInfo, InstanceStatus, SelectAlgorithm, ShardContext};
use crate::error::{KumoError, KumoResult};
use crate::health::{HealthCheckManager, HealthChecker, HealthReport, PingHealthChecker};
use crate::utils::divide_ceil;
use fnv::FnvHashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Instance selection attempts per fetch before giving up
pub const FETCH_CONN_TIMES: usize = 3;

/// Pool behaviour knobs
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub algorithm: SelectAlgorithm,
    /// Connections spread over the instances at init
    pub connection_num: usize,
    /// Failed probes before an instance becomes FAULTY; also the number of
    /// exhausted passes tolerated under `faulty_exit`
    pub failure_threshold: u32,
    /// 0 disables DELAYED
    pub delay_threshold_ms: u64,
    pub faulty_exit: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            algorithm: SelectAlgorithm::Rolling,
            connection_num: 4,
            failure_threshold: 3,
            delay_threshold_ms: 0,
            faulty_exit: false,
        }
    }
}

/// Point-in-time view of one instance
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSnapshot {
    pub addr: String,
    pub index: usize,
    pub status: InstanceStatus,
    pub inflight: i64,
    pub weight: i64,
    pub weight_share: f64,
    pub latency_us: u64,
    pub connections: usize,
}

#[derive(Default)]
struct Topology {
    instances: Vec<Arc<Instance>>,
    by_addr: FnvHashMap<String, usize>,
}

impl Topology {
    fn reindex(&mut self) {
        self.by_addr.clear();
        for (index, inst) in self.instances.iter().enumerate() {
            inst.set_index(index);
            self.by_addr.insert(inst.key().to_string(), index);
        }
    }

    fn get(&self, addr: &str) -> Option<&Arc<Instance>> {
        self.by_addr.get(addr).and_then(|&i| self.instances.get(i))
    }
}

/// All instances of one shard.
///
/// The ordered instance list and the address map change together under
/// the write lock; selection only takes the read lock.
pub struct InstancePool {
    tag: String,
    static_list: bool,
    options: PoolOptions,
    ctx: Arc<ShardContext>,
    selector: Box<dyn SelectionAlgorithm>,
    topology: RwLock<Topology>,
    total_weight: Arc<AtomicI64>,
    exhausted_rounds: AtomicU32,
    health: HealthCheckManager,
}

impl InstancePool {
    /// `static_list` pools come from a configured address list and are not
    /// refreshed from discovery
    pub fn new(ctx: Arc<ShardContext>, tag: &str, static_list: bool, options: PoolOptions) -> Self {
        let probe_timeout = Duration::from_millis(ctx.conf.read_timeout_ms.max(1));
        Self {
            tag: tag.to_string(),
            static_list,
            selector: create_selector(options.algorithm),
            options,
            ctx,
            topology: RwLock::new(Topology::default()),
            total_weight: Arc::new(AtomicI64::new(0)),
            exhausted_rounds: AtomicU32::new(0),
            health: HealthCheckManager::new(Arc::new(PingHealthChecker::new(probe_timeout))),
        }
    }

    pub fn with_health_checker(mut self, checker: Arc<dyn HealthChecker>) -> Self {
        self.health = HealthCheckManager::new(checker);
        self
    }

    pub fn shard_id(&self) -> u32 {
        self.ctx.shard_id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_static(&self) -> bool {
        self.static_list
    }

    pub fn algorithm(&self) -> SelectAlgorithm {
        self.options.algorithm
    }

    pub fn total_weight(&self) -> i64 {
        self.total_weight.load(Ordering::Acquire)
    }

    /// Build the instance list from discovery data or a configured list
    pub async fn init(&self, connect_all: bool, list: &[InstanceInfo]) -> KumoResult<()> {
        {
            let mut topo = self.topology.write().await;
            for info in list {
                let key = info.addr().to_string();
                if topo.by_addr.contains_key(&key) {
                    continue;
                }
                let status = if info.is_available() {
                    InstanceStatus::Online
                } else {
                    InstanceStatus::Offline
                };
                let index = topo.instances.len();
                let inst = Instance::new(
                    info.addr(),
                    index,
                    status,
                    self.ctx.clone(),
                    self.total_weight.clone(),
                );
                topo.instances.push(inst);
                topo.by_addr.insert(key, index);
            }
        }

        let allocated = self
            .alloc_connection(self.options.connection_num, connect_all)
            .await;
        info!(
            service = %self.ctx.service,
            shard = self.ctx.shard_id,
            instances = list.len(),
            connections = allocated,
            "instance pool initialized"
        );
        Ok(())
    }

    /// Spread `count` connections over the usable instances
    pub async fn alloc_connection(&self, count: usize, connect: bool) -> usize {
        let usable: Vec<Arc<Instance>> = self
            .instances()
            .await
            .into_iter()
            .filter(|inst| inst.is_usable())
            .collect();
        let per_instance = divide_ceil(count, usable.len());

        let mut allocated = 0;
        for inst in usable {
            match inst.ensure_connections(per_instance, connect).await {
                Ok(n) => allocated += n,
                Err(e) => {
                    warn!(instance = %inst.key(), error = %e, "connection allocation failed");
                    inst.status_online_to_faulty();
                }
            }
        }
        allocated
    }

    /// Snapshot of the ordered instance list
    pub async fn instances(&self) -> Vec<Arc<Instance>> {
        self.topology.read().await.instances.clone()
    }

    /// Look up an instance by `ip:port`
    pub async fn select_instance(&self, addr: &str) -> Option<Arc<Instance>> {
        self.topology.read().await.get(addr).cloned()
    }

    /// Instances able to serve requests (ONLINE or DELAYED)
    pub async fn online_instance_num(&self) -> usize {
        self.topology
            .read()
            .await
            .instances
            .iter()
            .filter(|inst| inst.is_usable())
            .count()
    }

    fn pick(&self, topo: &Topology) -> Option<Arc<Instance>> {
        let online = |inst: &Instance| inst.status() == InstanceStatus::Online;
        let delayed = |inst: &Instance| inst.status() == InstanceStatus::Delayed;
        self.selector
            .select(&topo.instances, &online)
            .or_else(|| self.selector.select(&topo.instances, &delayed))
            .and_then(|i| topo.instances.get(i).cloned())
    }

    /// Check out a connection, preferring `preferred` (`ip:port`) while it
    /// is usable
    pub async fn fetch_connection(&self, preferred: Option<&str>) -> KumoResult<Arc<Connection>> {
        let mut last_error = None;

        for attempt in 0..FETCH_CONN_TIMES {
            let instance = {
                let topo = self.topology.read().await;
                let preferred = if attempt == 0 {
                    preferred
                        .and_then(|addr| topo.get(addr))
                        .filter(|inst| inst.is_usable())
                        .cloned()
                } else {
                    None
                };
                preferred.or_else(|| self.pick(&topo))
            };
            let instance = match instance {
                Some(instance) => instance,
                None => break,
            };

            match instance.checkout().await {
                Ok(Some(conn)) => return Ok(conn),
                Ok(None) => debug!(instance = %instance.key(), "all connections busy"),
                Err(e) => {
                    warn!(
                        service = %self.ctx.service,
                        shard = self.ctx.shard_id,
                        instance = %instance.key(),
                        error = %e,
                        "checkout failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        if self.online_instance_num().await == 0 {
            return Err(KumoError::InstanceNotEnough {
                service: self.ctx.service.clone(),
                shard_id: self.ctx.shard_id,
            });
        }
        Err(KumoError::fetch_connect(match last_error {
            Some(e) => format!("shard {}: {}", self.ctx.shard_id, e),
            None => format!("shard {}: every instance is at capacity", self.ctx.shard_id),
        }))
    }

    /// Probe the idle and broken connections of one instance.
    /// Returns whether the server answered and how many sessions were
    /// re-established.
    async fn probe_instance(&self, inst: &Instance) -> (bool, usize) {
        if inst.reconnect_blocked() {
            return (false, 0);
        }

        let mut tried = false;
        let mut healthy = false;
        let mut reconnected = 0;

        for conn in inst.connections().await {
            match conn.status() {
                ConnectionStatus::NotUsed => {
                    if !conn.transition(ConnectionStatus::NotUsed, ConnectionStatus::Checking) {
                        continue;
                    }
                    tried = true;
                    let status = self.health.check_connection(&conn).await;
                    if status.is_healthy() {
                        healthy = true;
                        conn.transition(ConnectionStatus::Checking, ConnectionStatus::NotUsed);
                        continue;
                    }
                    debug!(instance = %inst.key(), conn = conn.id(), %status, "probe failed");
                }
                ConnectionStatus::Bad => {
                    if !conn.transition(ConnectionStatus::Bad, ConnectionStatus::Checking) {
                        continue;
                    }
                    tried = true;
                }
                _ => continue,
            }

            if !inst.reconnect_blocked() && conn.reconnect(false).await.is_ok() {
                healthy = true;
                reconnected += 1;
                conn.transition(ConnectionStatus::Checking, ConnectionStatus::NotUsed);
            } else {
                conn.transition(ConnectionStatus::Checking, ConnectionStatus::Bad);
            }
        }

        if !tried {
            healthy = inst.probe_connect().await.is_ok();
        }
        (healthy, reconnected)
    }

    /// One health pass. The cheap pass (`detect_dead = false`) only
    /// re-evaluates DELAYED; the expensive pass also probes every
    /// instance that is not OFFLINE.
    pub async fn healthy_check(&self, detect_dead: bool) -> KumoResult<HealthReport> {
        let instances = self.instances().await;
        let delay_threshold_us = self.options.delay_threshold_ms * 1000;
        let mut report = HealthReport::default();

        for inst in &instances {
            if inst.status() == InstanceStatus::Offline {
                report.offline += 1;
                continue;
            }
            inst.evaluate_delay(delay_threshold_us);

            if detect_dead {
                let (healthy, reconnected) = self.probe_instance(inst).await;
                report.reconnected += reconnected;
                if healthy {
                    inst.reset_failures();
                    inst.status_faulty_to_online();
                } else {
                    let failures = inst.record_failure();
                    if failures >= self.options.failure_threshold {
                        inst.status_online_to_faulty();
                    } else {
                        debug!(instance = %inst.key(), failures, "probe failed");
                    }
                }
            }

            match inst.status() {
                InstanceStatus::Online => report.online += 1,
                InstanceStatus::Delayed => report.delayed += 1,
                InstanceStatus::Faulty => report.faulty += 1,
                InstanceStatus::Offline => report.offline += 1,
            }
        }

        if detect_dead {
            if report.usable() == 0 {
                let rounds = self.exhausted_rounds.fetch_add(1, Ordering::AcqRel) + 1;
                error!(
                    service = %self.ctx.service,
                    shard = self.ctx.shard_id,
                    rounds,
                    "no usable instance in shard"
                );
                if self.options.faulty_exit && rounds >= self.options.failure_threshold {
                    return Err(KumoError::ShardExhausted {
                        service: self.ctx.service.clone(),
                        shard_id: self.ctx.shard_id,
                    });
                }
            } else {
                self.exhausted_rounds.store(0, Ordering::Release);
            }
        }

        Ok(report)
    }

    /// Kill statements running longer than `timeout_ms`; instances that
    /// had one are marked FAULTY
    pub async fn hang_check(&self, timeout_ms: u64) -> usize {
        if timeout_ms == 0 {
            return 0;
        }
        let mut killed = 0;
        for inst in self.instances().await {
            let n = inst.kill_hung(timeout_ms * 1000).await;
            if n > 0 {
                inst.status_online_to_faulty();
                killed += n;
            }
        }
        killed
    }

    /// Apply a fresh discovery snapshot; returns (added, removed)
    pub async fn sync_instances(&self, infos: &[InstanceInfo]) -> KumoResult<(usize, usize)> {
        let mut retired = Vec::new();
        let mut added = Vec::new();
        {
            let mut topo = self.topology.write().await;
            let wanted: FnvHashMap<String, &InstanceInfo> = infos
                .iter()
                .map(|info| (info.addr().to_string(), info))
                .collect();

            let mut kept = Vec::with_capacity(infos.len());
            for inst in topo.instances.drain(..) {
                match wanted.get(inst.key()) {
                    Some(info) if info.is_available() => {
                        if inst.status() == InstanceStatus::Offline {
                            inst.set_status(InstanceStatus::Online);
                            info!(instance = %inst.key(), "instance back from OFFLINE");
                        }
                        kept.push(inst);
                    }
                    Some(_) => {
                        if inst.set_status(InstanceStatus::Offline) != InstanceStatus::Offline {
                            info!(instance = %inst.key(), "instance withdrawn, OFFLINE");
                        }
                        kept.push(inst);
                    }
                    None => retired.push(inst),
                }
            }

            for info in infos {
                let key = info.addr().to_string();
                if !info.is_available() || kept.iter().any(|i: &Arc<Instance>| i.key() == key) {
                    continue;
                }
                let inst = Instance::new(
                    info.addr(),
                    kept.len(),
                    InstanceStatus::Online,
                    self.ctx.clone(),
                    self.total_weight.clone(),
                );
                kept.push(inst.clone());
                added.push(inst);
            }

            topo.instances = kept;
            topo.reindex();
        }

        for inst in &retired {
            info!(instance = %inst.key(), "instance removed by discovery");
            inst.retire().await;
        }

        if !added.is_empty() {
            let usable = self.online_instance_num().await;
            let per_instance = divide_ceil(self.options.connection_num, usable);
            for inst in &added {
                info!(instance = %inst.key(), "instance added by discovery");
                inst.ensure_connections(per_instance, false).await?;
            }
        }

        Ok((added.len(), retired.len()))
    }

    pub async fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let mut out = Vec::new();
        for inst in self.instances().await {
            out.push(InstanceSnapshot {
                addr: inst.key().to_string(),
                index: inst.index(),
                status: inst.status(),
                inflight: inst.inflight(),
                weight: inst.weight(),
                weight_share: inst.weight_share(),
                latency_us: inst.latency_estimate_us(),
                connections: inst.connection_count().await,
            });
        }
        out
    }

    /// Close every session and drop all instances
    pub async fn shutdown(&self) {
        let instances = {
            let mut topo = self.topology.write().await;
            let instances = std::mem::take(&mut topo.instances);
            topo.reindex();
            instances
        };
        for inst in instances {
            inst.retire().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::scripted::ScriptedDriver;

    fn infos(ports: &[u16]) -> Vec<InstanceInfo> {
        ports
            .iter()
            .map(|p| InstanceInfo::new("10.0.0.1", *p, "shard:0"))
            .collect()
    }

    async fn make_pool(
        ports: &[u16],
        options: PoolOptions,
    ) -> (InstancePool, ScriptedDriver) {
        let driver = ScriptedDriver::new();
        let ctx = Arc::new(ShardContext::new("svc", 0, Arc::new(driver.clone())));
        let pool = InstancePool::new(ctx, "svc", true, options);
        pool.init(false, &infos(ports)).await.unwrap();
        (pool, driver)
    }

    fn addr(port: u16) -> String {
        format!("10.0.0.1:{}", port)
    }

    #[tokio::test]
    async fn test_rolling_fetch_visits_every_instance() {
        let (pool, _) = make_pool(&[3001, 3002, 3003], PoolOptions::default()).await;
        let mut seen = Vec::new();
        for _ in 0..3 {
            let conn = pool.fetch_connection(None).await.unwrap();
            seen.push(conn.instance_addr().unwrap().port);
            conn.close();
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![3001, 3002, 3003]);
    }

    #[tokio::test]
    async fn test_offline_instance_never_selected() {
        let mut infos = infos(&[3001, 3002]);
        infos[0].enabled = false;
        let driver = ScriptedDriver::new();
        let ctx = Arc::new(ShardContext::new("svc", 0, Arc::new(driver.clone())));
        let pool = InstancePool::new(
            ctx,
            "svc",
            false,
            PoolOptions {
                algorithm: SelectAlgorithm::Random,
                ..Default::default()
            },
        );
        pool.init(false, &infos).await.unwrap();

        for _ in 0..20 {
            let conn = pool.fetch_connection(Some(&addr(3001))).await.unwrap();
            assert_eq!(conn.instance_addr().unwrap().port, 3002);
            conn.close();
        }
        assert_eq!(pool.online_instance_num().await, 1);
    }

    #[tokio::test]
    async fn test_preferred_instance() {
        let (pool, _) = make_pool(&[3001, 3002], PoolOptions::default()).await;
        for _ in 0..3 {
            let conn = pool.fetch_connection(Some(&addr(3002))).await.unwrap();
            assert_eq!(conn.instance_addr().unwrap().port, 3002);
            conn.close();
        }
        assert!(pool.select_instance(&addr(3001)).await.is_some());
        assert!(pool.select_instance(&addr(9999)).await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_skips_dead_instance() {
        let (pool, driver) = make_pool(&[3001, 3002], PoolOptions::default()).await;
        driver.set_down(&addr(3001), true);
        for _ in 0..4 {
            let conn = pool.fetch_connection(None).await.unwrap();
            assert_eq!(conn.instance_addr().unwrap().port, 3002);
            conn.close();
        }
        let first = pool.select_instance(&addr(3001)).await.unwrap();
        assert_eq!(first.status(), InstanceStatus::Faulty);
    }

    #[tokio::test]
    async fn test_instance_not_enough() {
        let (pool, driver) = make_pool(&[3001], PoolOptions::default()).await;
        driver.set_down(&addr(3001), true);
        let err = pool.fetch_connection(None).await.unwrap_err();
        assert!(matches!(err, KumoError::InstanceNotEnough { .. }));
    }

    #[tokio::test]
    async fn test_healthy_check_faulty_and_recovery() {
        let options = PoolOptions {
            failure_threshold: 2,
            ..Default::default()
        };
        let (pool, driver) = make_pool(&[3001, 3002], options).await;
        pool.alloc_connection(2, true).await;

        driver.set_down(&addr(3001), true);
        let report = pool.healthy_check(true).await.unwrap();
        assert_eq!(report.online, 2);
        let report = pool.healthy_check(true).await.unwrap();
        assert_eq!(report.online, 1);
        assert_eq!(report.faulty, 1);

        // The cheap pass never probes.
        driver.set_down(&addr(3001), false);
        let report = pool.healthy_check(false).await.unwrap();
        assert_eq!(report.faulty, 1);

        let report = pool.healthy_check(true).await.unwrap();
        assert_eq!(report.online, 2);
        assert!(report.reconnected > 0);
        let inst = pool.select_instance(&addr(3001)).await.unwrap();
        assert_eq!(inst.failures(), 0);
        for conn in inst.connections().await {
            assert_eq!(conn.status(), ConnectionStatus::NotUsed);
        }
    }

    #[tokio::test]
    async fn test_faulty_exit_escalates() {
        let options = PoolOptions {
            failure_threshold: 1,
            faulty_exit: true,
            ..Default::default()
        };
        let (pool, driver) = make_pool(&[3001], options).await;
        driver.set_down(&addr(3001), true);
        let err = pool.healthy_check(true).await.unwrap_err();
        assert!(matches!(err, KumoError::ShardExhausted { .. }));
    }

    #[tokio::test]
    async fn test_delayed_used_only_without_online() {
        let options = PoolOptions {
            delay_threshold_ms: 1,
            ..Default::default()
        };
        let (pool, _) = make_pool(&[3001, 3002], options).await;
        let slow = pool.select_instance(&addr(3001)).await.unwrap();
        let begin = crate::utils::now_us();
        tokio::time::sleep(Duration::from_millis(5)).await;
        for _ in 0..64 {
            slow.update(begin);
        }
        pool.healthy_check(false).await.unwrap();
        assert_eq!(slow.status(), InstanceStatus::Delayed);

        for _ in 0..4 {
            let conn = pool.fetch_connection(None).await.unwrap();
            assert_eq!(conn.instance_addr().unwrap().port, 3002);
            conn.close();
        }

        pool.select_instance(&addr(3002))
            .await
            .unwrap()
            .set_status(InstanceStatus::Faulty);
        let conn = pool.fetch_connection(None).await.unwrap();
        assert_eq!(conn.instance_addr().unwrap().port, 3001);
        conn.close();
    }

    #[tokio::test]
    async fn test_hang_check_kills_and_marks_faulty() {
        let (pool, driver) = make_pool(&[3001], PoolOptions::default()).await;
        driver.delay("SLEEP", Duration::from_secs(30));
        let conn = pool.fetch_connection(None).await.unwrap();
        let runner = conn.clone();
        let task = tokio::spawn(async move { runner.execute("SELECT SLEEP(30)").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(pool.hang_check(10_000).await, 0);
        assert_eq!(pool.hang_check(10).await, 1);
        assert!(matches!(
            task.await.unwrap(),
            Err(KumoError::ConnectionKilled { .. })
        ));
        conn.close();
        let inst = pool.select_instance(&addr(3001)).await.unwrap();
        assert_eq!(inst.status(), InstanceStatus::Faulty);
    }

    #[tokio::test]
    async fn test_sync_instances() {
        let (pool, _) = make_pool(&[3001, 3002], PoolOptions::default()).await;
        let weight_before = pool.total_weight();

        let mut next = infos(&[3002, 3003]);
        next[0].status = 1;
        let (added, removed) = pool.sync_instances(&next).await.unwrap();
        assert_eq!((added, removed), (1, 1));

        let snapshot = pool.snapshot().await;
        let addrs: Vec<&str> = snapshot.iter().map(|s| s.addr.as_str()).collect();
        assert_eq!(addrs, vec!["10.0.0.1:3002", "10.0.0.1:3003"]);
        assert_eq!(snapshot[0].status, InstanceStatus::Offline);
        assert_eq!(snapshot[0].index, 0);
        assert_eq!(snapshot[1].index, 1);
        assert_eq!(pool.total_weight(), weight_before);
        assert!(pool.select_instance(&addr(3001)).await.is_none());

        let (added, removed) = pool.sync_instances(&infos(&[3002, 3003])).await.unwrap();
        assert_eq!((added, removed), (0, 0));
        assert_eq!(pool.online_instance_num().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_fetch_single_owner() {
        let options = PoolOptions {
            connection_num: 2,
            ..Default::default()
        };
        let (pool, _) = make_pool(&[3001, 3002], options).await;
        let pool = Arc::new(pool);

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let conn = pool.fetch_connection(None).await.unwrap();
                    assert_eq!(conn.status(), ConnectionStatus::Using);
                    tokio::task::yield_now().await;
                    assert!(conn.close());
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }
}
