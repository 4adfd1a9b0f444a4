/// Kumo - client-side sharding middleware for SQL databases
///
/// Kumo routes a statement to the shard owning a partition key, picks a
/// healthy instance of that shard, checks out a pooled connection and
/// rewrites split table names to their physical sub-tables before handing
/// the statement to the driver:
///
/// 1. [`expr::ShardEvaluator`] computes shard and table ids from split
///    expressions such as `($ >> 1) % 16`
/// 2. [`core::InstancePool`] selects an instance (random, rolling or
///    latency aware) and owns its connections
/// 3. [`service::Service`] ties the shards and logic databases of one
///    database service together
/// 4. [`manager::Manager`] owns every service and runs the health, hang
///    and discovery loops
pub mod config;
pub mod core;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod expr;
pub mod health;
pub mod logging;
pub mod logic_db;
pub mod manager;
pub mod result;
pub mod service;
pub mod sql;
pub mod utils;

pub use crate::config::{Config, ConfigError, ManagerOptions, ServiceOptions};
pub use crate::core::{
    Connection, InstanceAddr, InstanceInfo, InstanceStatus, PooledConnection, SelectAlgorithm,
};
pub use crate::discovery::{Discovery, StaticDiscovery};
pub use crate::driver::{Driver, DriverConnection, DriverError};
pub use crate::error::{KumoError, KumoResult};
pub use crate::expr::ShardEvaluator;
pub use crate::manager::Manager;
pub use crate::result::ResultSet;
pub use crate::service::Service;
