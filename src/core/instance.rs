/// Database instances and their live load signal
use super::connection::Connection;
use super::{ConnectionStatus, InstanceAddr, InstanceStatus, ShardContext};
use crate::driver::DriverError;
use crate::error::KumoResult;
use crate::utils::{elapsed_us, now_us};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Weight of an instance answering in one microsecond
pub const WEIGHT_SCALE: i64 = 1_000_000_000;

/// Latency assumed before any request has been measured
const SEED_LATENCY_US: u64 = 1_000;

/// Ring of the most recent request latencies.
///
/// Writers claim a slot with one atomic increment and never block; the
/// estimate is the 25th percentile of whatever the slots hold when read.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: Box<[AtomicU64]>,
    cursor: AtomicUsize,
}

impl LatencyWindow {
    pub fn new(size: usize, seed_us: u64) -> Self {
        let samples = (0..size.max(1))
            .map(|_| AtomicU64::new(seed_us.max(1)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            samples,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn record(&self, latency_us: u64) {
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.samples.len();
        self.samples[slot].store(latency_us.max(1), Ordering::Relaxed);
    }

    /// Low-percentile estimate of recent latency
    pub fn estimate(&self) -> u64 {
        let mut values: Vec<u64> = self
            .samples
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .collect();
        values.sort_unstable();
        values[values.len() / 4]
    }
}

/// One physical database endpoint.
///
/// Instances are owned by their pool; connections refer back to them
/// weakly.
pub struct Instance {
    addr: InstanceAddr,
    key: String,
    index: AtomicUsize,
    status: AtomicU8,
    inflight: AtomicI64,
    weight: AtomicI64,
    total_weight: Arc<AtomicI64>,
    latency: LatencyWindow,
    consecutive_failures: AtomicU32,
    retry_after_us: AtomicU64,
    retired: AtomicBool,
    connections: RwLock<Vec<Arc<Connection>>>,
    ctx: Arc<ShardContext>,
    me: Weak<Instance>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("addr", &self.key)
            .field("index", &self.index())
            .field("status", &self.status())
            .field("inflight", &self.inflight())
            .field("weight", &self.weight())
            .finish()
    }
}

impl Instance {
    pub fn new(
        addr: InstanceAddr,
        index: usize,
        status: InstanceStatus,
        ctx: Arc<ShardContext>,
        total_weight: Arc<AtomicI64>,
    ) -> Arc<Self> {
        let latency = LatencyWindow::new(ctx.latency_window, SEED_LATENCY_US);
        let weight = WEIGHT_SCALE / SEED_LATENCY_US as i64;
        total_weight.fetch_add(weight, Ordering::AcqRel);

        Arc::new_cyclic(|me| Instance {
            key: addr.to_string(),
            addr,
            index: AtomicUsize::new(index),
            status: AtomicU8::new(status as u8),
            inflight: AtomicI64::new(0),
            weight: AtomicI64::new(weight),
            total_weight,
            latency,
            consecutive_failures: AtomicU32::new(0),
            retry_after_us: AtomicU64::new(0),
            retired: AtomicBool::new(false),
            connections: RwLock::new(Vec::new()),
            ctx,
            me: me.clone(),
        })
    }

    pub fn addr(&self) -> &InstanceAddr {
        &self.addr
    }

    /// `ip:port`
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    pub(crate) fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::Release);
    }

    pub fn context(&self) -> &Arc<ShardContext> {
        &self.ctx
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: InstanceStatus) -> InstanceStatus {
        InstanceStatus::from_u8(self.status.swap(status as u8, Ordering::AcqRel))
    }

    fn cas_status(&self, from: InstanceStatus, to: InstanceStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_usable(&self) -> bool {
        self.status().is_usable()
    }

    /// ONLINE (or DELAYED, which is online but slow) to FAULTY
    pub fn status_online_to_faulty(&self) -> bool {
        let changed = self.cas_status(InstanceStatus::Online, InstanceStatus::Faulty)
            || self.cas_status(InstanceStatus::Delayed, InstanceStatus::Faulty);
        if changed {
            warn!(
                service = %self.ctx.service,
                shard = self.ctx.shard_id,
                instance = %self.key,
                "instance marked FAULTY"
            );
        }
        changed
    }

    /// FAULTY to ONLINE after a successful probe
    pub fn status_faulty_to_online(&self) -> bool {
        let changed = self.cas_status(InstanceStatus::Faulty, InstanceStatus::Online);
        if changed {
            info!(
                service = %self.ctx.service,
                shard = self.ctx.shard_id,
                instance = %self.key,
                "instance recovered, back ONLINE"
            );
        }
        changed
    }

    /// Re-evaluate ONLINE/DELAYED against a latency threshold
    pub fn evaluate_delay(&self, threshold_us: u64) -> InstanceStatus {
        if threshold_us == 0 {
            return self.status();
        }
        let estimate = self.latency.estimate();
        if estimate > threshold_us {
            if self.cas_status(InstanceStatus::Online, InstanceStatus::Delayed) {
                debug!(instance = %self.key, estimate_us = estimate, "instance DELAYED");
            }
        } else if self.cas_status(InstanceStatus::Delayed, InstanceStatus::Online) {
            debug!(instance = %self.key, estimate_us = estimate, "instance no longer DELAYED");
        }
        self.status()
    }

    pub fn add_inflight(&self) -> i64 {
        self.inflight.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn sub_inflight(&self) -> i64 {
        self.inflight.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Acquire)
    }

    /// Record a request that started at `begin_us` and return the change
    /// in this instance's weight
    pub fn update(&self, begin_us: u64) -> i64 {
        self.latency.record(elapsed_us(begin_us));
        if self.retired.load(Ordering::Acquire) {
            return 0;
        }
        let weight = WEIGHT_SCALE / self.latency.estimate().max(1) as i64;
        let old = self.weight.swap(weight, Ordering::AcqRel);
        weight - old
    }

    pub fn weight(&self) -> i64 {
        self.weight.load(Ordering::Acquire)
    }

    pub fn latency_estimate_us(&self) -> u64 {
        self.latency.estimate()
    }

    /// This instance's fraction of the pool's total weight
    pub fn weight_share(&self) -> f64 {
        let total = self.total_weight.load(Ordering::Acquire);
        if total <= 0 {
            return 0.0;
        }
        self.weight() as f64 / total as f64
    }

    /// Track one request: inflight while alive, weight update on drop
    pub fn weight_scope(&self) -> WeightScope<'_> {
        self.add_inflight();
        WeightScope {
            instance: self,
            begin_us: now_us(),
        }
    }

    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Hold off reconnecting after the server rejected our credentials
    pub fn block_reconnect(&self, secs: u64) {
        if secs == 0 {
            return;
        }
        self.retry_after_us
            .store(now_us() + secs * 1_000_000, Ordering::Release);
        warn!(
            instance = %self.key,
            wait_secs = secs,
            "access denied, backing off reconnects"
        );
    }

    pub fn reconnect_blocked(&self) -> bool {
        now_us() < self.retry_after_us.load(Ordering::Acquire)
    }

    /// Snapshot of the connection list
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.clone()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Grow the connection list to `count`, optionally connecting every
    /// connection that has no session yet
    pub async fn ensure_connections(&self, count: usize, connect: bool) -> KumoResult<usize> {
        let max = self.ctx.max_connection_per_instance;
        let target = if max == 0 { count } else { count.min(max) };
        {
            let mut conns = self.connections.write().await;
            while conns.len() < target {
                let id = conns.len();
                conns.push(Connection::new(id, self.me.clone(), self.ctx.clone()));
            }
        }

        if connect {
            for conn in self.connections().await {
                if !conn.transition(ConnectionStatus::NotConnected, ConnectionStatus::Checking) {
                    continue;
                }
                if let Err(e) = conn.connect(true).await {
                    conn.transition(ConnectionStatus::Checking, ConnectionStatus::Bad);
                    return Err(e);
                }
            }
        }
        Ok(target)
    }

    /// Check out a free connection, growing the list when every
    /// connection is busy. `Ok(None)` means the instance is at capacity.
    pub async fn checkout(&self) -> KumoResult<Option<Arc<Connection>>> {
        let mut pending = None;
        {
            let conns = self.connections.read().await;
            for conn in conns.iter() {
                if conn.transition(ConnectionStatus::NotUsed, ConnectionStatus::Using) {
                    return Ok(Some(conn.clone()));
                }
            }
            for conn in conns.iter() {
                if conn.transition(ConnectionStatus::NotConnected, ConnectionStatus::Using) {
                    pending = Some(conn.clone());
                    break;
                }
            }
        }

        if pending.is_none() {
            let max = self.ctx.max_connection_per_instance;
            let mut conns = self.connections.write().await;
            if max == 0 || conns.len() < max {
                let conn = Connection::new(conns.len(), self.me.clone(), self.ctx.clone());
                conn.transition(ConnectionStatus::NotConnected, ConnectionStatus::Using);
                conns.push(conn.clone());
                pending = Some(conn);
            }
        }

        let conn = match pending {
            Some(conn) => conn,
            None => return Ok(None),
        };
        if let Err(e) = conn.connect(false).await {
            conn.transition(ConnectionStatus::Using, ConnectionStatus::Bad);
            self.status_online_to_faulty();
            return Err(e);
        }
        Ok(Some(conn))
    }

    /// Open and close a throwaway session to see whether the server answers
    pub async fn probe_connect(&self) -> Result<(), DriverError> {
        let mut session = self.ctx.driver.connect(&self.addr, &self.ctx.conf).await?;
        session.close().await;
        Ok(())
    }

    /// Abort statements running longer than `timeout_us`
    pub async fn kill_hung(&self, timeout_us: u64) -> usize {
        let mut killed = 0;
        for conn in self.connections().await {
            if conn.kill_if_hung(timeout_us) {
                killed += 1;
            }
        }
        killed
    }

    /// Detach from the pool: give back the weight and close every session
    pub async fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        let weight = self.weight.swap(0, Ordering::AcqRel);
        self.total_weight.fetch_sub(weight, Ordering::AcqRel);
        self.set_status(InstanceStatus::Offline);
        let conns = std::mem::take(&mut *self.connections.write().await);
        for conn in conns {
            conn.close_handle().await;
        }
    }
}

/// RAII request tracker returned by [`Instance::weight_scope`]
pub struct WeightScope<'a> {
    instance: &'a Instance,
    begin_us: u64,
}

impl Drop for WeightScope<'_> {
    fn drop(&mut self) {
        self.instance.sub_inflight();
        let delta = self.instance.update(self.begin_us);
        self.instance.total_weight.fetch_add(delta, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::scripted::ScriptedDriver;
    use std::time::Duration;

    fn instance(max_connections: usize) -> (Arc<Instance>, Arc<AtomicI64>, ScriptedDriver) {
        let driver = ScriptedDriver::new();
        let mut ctx = ShardContext::new("svc", 0, Arc::new(driver.clone()));
        ctx.max_connection_per_instance = max_connections;
        ctx.latency_window = 8;
        let total = Arc::new(AtomicI64::new(0));
        let inst = Instance::new(
            InstanceAddr::new("10.0.0.1", 3306),
            0,
            InstanceStatus::Online,
            Arc::new(ctx),
            total.clone(),
        );
        (inst, total, driver)
    }

    #[test]
    fn test_latency_window_quartile() {
        let window = LatencyWindow::new(4, 1000);
        for us in [400, 100, 300, 200] {
            window.record(us);
        }
        assert_eq!(window.estimate(), 200);
        window.record(5000);
        assert_eq!(window.estimate(), 200);
    }

    #[test]
    fn test_status_transitions() {
        let (inst, _, _) = instance(0);
        assert!(inst.status_online_to_faulty());
        assert!(!inst.status_online_to_faulty());
        assert_eq!(inst.status(), InstanceStatus::Faulty);
        assert!(inst.status_faulty_to_online());
        inst.set_status(InstanceStatus::Offline);
        assert!(!inst.status_online_to_faulty());
        assert!(!inst.is_usable());
    }

    #[test]
    fn test_update_moves_weight() {
        let (inst, total, _) = instance(0);
        let initial = inst.weight();
        assert_eq!(total.load(Ordering::Acquire), initial);

        {
            let _scope = inst.weight_scope();
            assert_eq!(inst.inflight(), 1);
        }
        assert_eq!(inst.inflight(), 0);
        assert_eq!(total.load(Ordering::Acquire), inst.weight());
        assert!((inst.weight_share() - 1.0).abs() < f64::EPSILON);

        let _ = now_us();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let begin = now_us() - 4_000;
        let mut moved = 0;
        for _ in 0..8 {
            moved += inst.update(begin);
        }
        assert!(inst.latency_estimate_us() >= 4_000);
        assert!(moved < 0);
        assert_eq!(inst.weight(), initial + moved);
    }

    #[test]
    fn test_evaluate_delay() {
        let (inst, _, _) = instance(0);
        for _ in 0..8 {
            inst.latency.record(20_000);
        }
        assert_eq!(inst.evaluate_delay(10_000), InstanceStatus::Delayed);
        assert!(inst.is_usable());
        for _ in 0..8 {
            inst.latency.record(100);
        }
        assert_eq!(inst.evaluate_delay(10_000), InstanceStatus::Online);
        assert_eq!(inst.evaluate_delay(0), InstanceStatus::Online);
    }

    #[tokio::test]
    async fn test_checkout_grows_to_limit() {
        let (inst, _, driver) = instance(2);
        let a = inst.checkout().await.unwrap().unwrap();
        let b = inst.checkout().await.unwrap().unwrap();
        assert!(inst.checkout().await.unwrap().is_none());
        assert_eq!(driver.connect_count("10.0.0.1:3306"), 2);

        assert!(a.close());
        let c = inst.checkout().await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &c));
        assert!(b.close());
        assert!(c.close());
    }

    #[tokio::test]
    async fn test_checkout_connect_failure_marks_faulty() {
        let (inst, _, driver) = instance(0);
        driver.set_down("10.0.0.1:3306", true);
        assert!(inst.checkout().await.is_err());
        assert_eq!(inst.status(), InstanceStatus::Faulty);
        let conns = inst.connections().await;
        assert_eq!(conns[0].status(), ConnectionStatus::Bad);
    }

    #[tokio::test]
    async fn test_access_denied_blocks_reconnect() {
        let driver = ScriptedDriver::new();
        let mut ctx = ShardContext::new("svc", 0, Arc::new(driver.clone()));
        ctx.no_permission_wait_secs = 30;
        let inst = Instance::new(
            InstanceAddr::new("10.0.0.2", 3306),
            0,
            InstanceStatus::Online,
            Arc::new(ctx),
            Arc::new(AtomicI64::new(0)),
        );
        driver.set_access_denied("10.0.0.2:3306", true);
        assert!(inst.checkout().await.is_err());
        assert!(inst.reconnect_blocked());
    }

    #[tokio::test]
    async fn test_retire_returns_weight() {
        let (inst, total, _) = instance(0);
        inst.ensure_connections(3, true).await.unwrap();
        assert_eq!(inst.connection_count().await, 3);
        inst.retire().await;
        assert_eq!(total.load(Ordering::Acquire), 0);
        assert_eq!(inst.status(), InstanceStatus::Offline);
        assert_eq!(inst.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_retired_instance_keeps_weight_out_of_total() {
        let (inst, total, _) = instance(0);
        let scope = inst.weight_scope();
        inst.retire().await;
        drop(scope);
        assert_eq!(inst.inflight(), 0);
        assert_eq!(inst.weight(), 0);
        assert_eq!(total.load(Ordering::Acquire), 0);
        assert_eq!(inst.weight_share(), 0.0);
    }

    #[tokio::test]
    async fn test_allocation_racing_checkout_keeps_single_owner() {
        let (inst, _, driver) = instance(1);
        driver.delay_connect("10.0.0.1:3306", Duration::from_millis(50));

        let alloc = {
            let inst = inst.clone();
            tokio::spawn(async move { inst.ensure_connections(1, true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        // The allocator holds the only connection while it connects.
        assert!(inst.checkout().await.unwrap().is_none());
        alloc.await.unwrap().unwrap();

        let owner = inst.checkout().await.unwrap().unwrap();
        inst.ensure_connections(1, true).await.unwrap();
        owner.connect(true).await.unwrap();
        assert_eq!(owner.status(), ConnectionStatus::Using);
        assert!(inst.checkout().await.unwrap().is_none());
        assert!(owner.close());
    }

    #[tokio::test]
    async fn test_checkout_racing_allocation_keeps_single_owner() {
        let (inst, _, driver) = instance(1);
        driver.delay_connect("10.0.0.1:3306", Duration::from_millis(50));

        let checkout = {
            let inst = inst.clone();
            tokio::spawn(async move { inst.checkout().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        inst.ensure_connections(1, true).await.unwrap();

        let owner = checkout.await.unwrap().unwrap().unwrap();
        assert_eq!(owner.status(), ConnectionStatus::Using);
        assert!(inst.checkout().await.unwrap().is_none());
        assert!(owner.close());
        assert_eq!(driver.connect_count("10.0.0.1:3306"), 1);
    }
}
