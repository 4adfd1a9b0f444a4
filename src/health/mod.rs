/// Health checking for pooled connections
use crate::core::Connection;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Probe one idle connection, held in `CHECKING` by the caller
    async fn check_connection(&self, conn: &Connection) -> HealthStatus;

    /// Upper bound for one probe
    fn check_timeout(&self) -> Duration;
}

/// Default probe: a driver-level ping
pub struct PingHealthChecker {
    timeout: Duration,
}

impl PingHealthChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for PingHealthChecker {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl HealthChecker for PingHealthChecker {
    async fn check_connection(&self, conn: &Connection) -> HealthStatus {
        match conn.ping().await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unhealthy {
                reason: e.to_string(),
            },
        }
    }

    fn check_timeout(&self) -> Duration {
        self.timeout
    }
}

/// Runs a checker with its timeout applied
#[derive(Clone)]
pub struct HealthCheckManager {
    checker: Arc<dyn HealthChecker>,
}

impl HealthCheckManager {
    pub fn new(checker: Arc<dyn HealthChecker>) -> Self {
        Self { checker }
    }

    pub async fn check_connection(&self, conn: &Connection) -> HealthStatus {
        match timeout(self.checker.check_timeout(), self.checker.check_connection(conn)).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        }
    }
}

impl Default for HealthCheckManager {
    fn default() -> Self {
        Self::new(Arc::new(PingHealthChecker::default()))
    }
}

/// Instance counts after one health pass over a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub online: usize,
    pub delayed: usize,
    pub faulty: usize,
    pub offline: usize,
    /// Connections re-established during the pass
    pub reconnected: usize,
}

impl HealthReport {
    /// Instances that can serve requests
    pub fn usable(&self) -> usize {
        self.online + self.delayed
    }

    pub fn merge(&mut self, other: &HealthReport) {
        self.online += other.online;
        self.delayed += other.delayed;
        self.faulty += other.faulty;
        self.offline += other.offline;
        self.reconnected += other.reconnected;
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "online={} delayed={} faulty={} offline={} reconnected={}",
            self.online, self.delayed, self.faulty, self.offline, self.reconnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Instance, InstanceAddr, InstanceStatus, ShardContext};
    use crate::driver::scripted::ScriptedDriver;
    use std::sync::atomic::AtomicI64;

    struct MockHealthChecker {
        delay: Duration,
    }

    #[async_trait]
    impl HealthChecker for MockHealthChecker {
        async fn check_connection(&self, _conn: &Connection) -> HealthStatus {
            tokio::time::sleep(self.delay).await;
            HealthStatus::Healthy
        }

        fn check_timeout(&self) -> Duration {
            Duration::from_millis(20)
        }
    }

    fn instance(driver: &ScriptedDriver) -> Arc<Instance> {
        Instance::new(
            InstanceAddr::new("10.0.0.1", 3306),
            0,
            InstanceStatus::Online,
            Arc::new(ShardContext::new("svc", 0, Arc::new(driver.clone()))),
            Arc::new(AtomicI64::new(0)),
        )
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "Healthy");
        assert_eq!(
            HealthStatus::Unhealthy {
                reason: "test".to_string()
            }
            .to_string(),
            "Unhealthy: test"
        );
        assert!(!HealthStatus::Timeout.is_healthy());
    }

    #[tokio::test]
    async fn test_ping_checker() {
        let driver = ScriptedDriver::new();
        let inst = instance(&driver);
        inst.ensure_connections(1, true).await.unwrap();
        let conn = inst.connections().await.remove(0);

        let manager = HealthCheckManager::default();
        assert!(manager.check_connection(&conn).await.is_healthy());

        driver.set_down("10.0.0.1:3306", true);
        assert!(matches!(
            manager.check_connection(&conn).await,
            HealthStatus::Unhealthy { .. }
        ));
        assert_eq!(driver.ping_count("10.0.0.1:3306"), 2);
    }

    #[tokio::test]
    async fn test_checker_timeout() {
        let driver = ScriptedDriver::new();
        let inst = instance(&driver);
        inst.ensure_connections(1, true).await.unwrap();
        let conn = inst.connections().await.remove(0);

        let slow = HealthCheckManager::new(Arc::new(MockHealthChecker {
            delay: Duration::from_millis(200),
        }));
        assert_eq!(slow.check_connection(&conn).await, HealthStatus::Timeout);

        let fast = HealthCheckManager::new(Arc::new(MockHealthChecker {
            delay: Duration::from_millis(1),
        }));
        assert!(fast.check_connection(&conn).await.is_healthy());
    }

    #[test]
    fn test_report_merge() {
        let mut total = HealthReport::default();
        total.merge(&HealthReport {
            online: 2,
            faulty: 1,
            ..Default::default()
        });
        total.merge(&HealthReport {
            delayed: 1,
            reconnected: 3,
            ..Default::default()
        });
        assert_eq!(total.usable(), 3);
        assert_eq!(
            total.to_string(),
            "online=2 delayed=1 faulty=1 offline=0 reconnected=3"
        );
    }
}
