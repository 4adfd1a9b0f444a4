/// Core routing abstractions: instances, connections, selection and pools
pub mod balancer;
pub mod connection;
pub mod instance;
pub mod pool;

use crate::driver::{ConnectionConf, Driver};
use crate::expr::ShardEvaluator;
use crate::logic_db::LogicDb;
use crate::utils::parse_ip_port;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use balancer::{create_selector, SelectionAlgorithm};
pub use connection::{Connection, PooledConnection};
pub use instance::Instance;
pub use pool::{InstancePool, InstanceSnapshot, PoolOptions, FETCH_CONN_TIMES};

/// Network address of one database instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceAddr {
    pub ip: String,
    pub port: u16,
}

impl InstanceAddr {
    pub fn new<S: Into<String>>(ip: S, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Parse `ip:port`
    pub fn parse(addr: &str) -> Option<Self> {
        parse_ip_port(addr).map(|(ip, port)| Self { ip, port })
    }
}

impl fmt::Display for InstanceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A discovery-service record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub tag: String,
    /// Operator override; `false` withdraws the instance
    pub enabled: bool,
    /// Raw status reported by discovery, 0 is healthy
    pub status: i32,
}

impl InstanceInfo {
    pub fn new<S: Into<String>>(ip: S, port: u16, tag: &str) -> Self {
        let ip = ip.into();
        Self {
            id: format!("{}:{}", ip, port),
            ip,
            port,
            tag: tag.to_string(),
            enabled: true,
            status: 0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.enabled && self.status == 0
    }

    pub fn addr(&self) -> InstanceAddr {
        InstanceAddr::new(self.ip.clone(), self.port)
    }

    pub fn shard_id(&self) -> u32 {
        crate::utils::shard_id_from_tag(&self.tag)
    }
}

/// Instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InstanceStatus {
    Online = 0,
    Offline = 1,
    Faulty = 2,
    /// Usable but measurably slow
    Delayed = 3,
}

impl InstanceStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => InstanceStatus::Online,
            1 => InstanceStatus::Offline,
            2 => InstanceStatus::Faulty,
            _ => InstanceStatus::Delayed,
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, InstanceStatus::Online | InstanceStatus::Delayed)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Online => write!(f, "ONLINE"),
            InstanceStatus::Offline => write!(f, "OFFLINE"),
            InstanceStatus::Faulty => write!(f, "FAULTY"),
            InstanceStatus::Delayed => write!(f, "DELAYED"),
        }
    }
}

/// Connection checkout status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    NotConnected = 0,
    NotUsed = 1,
    Using = 2,
    Checking = 3,
    Bad = 4,
}

impl ConnectionStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionStatus::NotConnected,
            1 => ConnectionStatus::NotUsed,
            2 => ConnectionStatus::Using,
            3 => ConnectionStatus::Checking,
            _ => ConnectionStatus::Bad,
        }
    }

    /// Transition table of the checkout state machine
    pub fn can_transition(self, to: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, to),
            (NotConnected, NotUsed)
                | (NotConnected, Using)
                | (NotConnected, Checking)
                | (NotConnected, Bad)
                | (NotUsed, Using)
                | (NotUsed, Checking)
                | (Using, NotUsed)
                | (Using, Bad)
                | (Checking, NotUsed)
                | (Checking, Bad)
                | (Bad, Checking)
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::NotConnected => "NOT_CONNECTED",
            ConnectionStatus::NotUsed => "NOT_USED",
            ConnectionStatus::Using => "USING",
            ConnectionStatus::Checking => "CHECKING",
            ConnectionStatus::Bad => "BAD",
        };
        write!(f, "{}", name)
    }
}

/// Instance selection algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectAlgorithm {
    Random,
    #[default]
    Rolling,
    LocalAware,
}

/// Settings shared by every instance and connection of one shard
pub struct ShardContext {
    pub service: String,
    pub shard_id: u32,
    pub conf: ConnectionConf,
    pub driver: Arc<dyn Driver>,
    pub evaluator: Arc<ShardEvaluator>,
    pub logic_dbs: Arc<FnvHashMap<String, LogicDb>>,
    /// `/* .. */` prefix template, empty for none
    pub comment_format: String,
    /// 0 means unbounded
    pub max_connection_per_instance: usize,
    pub latency_window: usize,
    pub no_permission_wait_secs: u64,
}

impl ShardContext {
    pub fn new(service: &str, shard_id: u32, driver: Arc<dyn Driver>) -> Self {
        Self {
            service: service.to_string(),
            shard_id,
            conf: ConnectionConf::default(),
            driver,
            evaluator: Arc::new(ShardEvaluator::new()),
            logic_dbs: Arc::new(FnvHashMap::default()),
            comment_format: String::new(),
            max_connection_per_instance: 0,
            latency_window: 32,
            no_permission_wait_secs: 0,
        }
    }
}

impl fmt::Debug for ShardContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardContext")
            .field("service", &self.service)
            .field("shard_id", &self.shard_id)
            .field("driver", &self.driver.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_info_availability() {
        let mut info = InstanceInfo::new("10.0.0.1", 3306, "shard:2");
        assert!(info.is_available());
        assert_eq!(info.shard_id(), 2);
        assert_eq!(info.addr().to_string(), "10.0.0.1:3306");

        info.status = 3;
        assert!(!info.is_available());
        info.status = 0;
        info.enabled = false;
        assert!(!info.is_available());
    }

    #[test]
    fn test_connection_transitions() {
        use ConnectionStatus::*;
        assert!(NotUsed.can_transition(Using));
        assert!(Using.can_transition(NotUsed));
        assert!(Bad.can_transition(Checking));
        assert!(NotConnected.can_transition(Checking));
        assert!(!Using.can_transition(Using));
        assert!(!Using.can_transition(Checking));
        assert!(!Bad.can_transition(Using));
        assert!(!NotUsed.can_transition(Bad));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            InstanceStatus::Online,
            InstanceStatus::Offline,
            InstanceStatus::Faulty,
            InstanceStatus::Delayed,
        ] {
            assert_eq!(InstanceStatus::from_u8(status as u8), status);
        }
        assert!(InstanceStatus::Delayed.is_usable());
        assert!(!InstanceStatus::Faulty.is_usable());
        assert_eq!(ConnectionStatus::from_u8(2), ConnectionStatus::Using);
    }

    #[test]
    fn test_select_algorithm_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            algorithm: SelectAlgorithm,
        }
        let w: Wrapper = toml::from_str("algorithm = \"local_aware\"").unwrap();
        assert_eq!(w.algorithm, SelectAlgorithm::LocalAware);
        assert_eq!(SelectAlgorithm::default(), SelectAlgorithm::Rolling);
    }

    #[test]
    fn test_addr_parse() {
        assert_eq!(
            InstanceAddr::parse("127.0.0.1:3306"),
            Some(InstanceAddr::new("127.0.0.1", 3306))
        );
        assert_eq!(InstanceAddr::parse("bad"), None);
    }
}
