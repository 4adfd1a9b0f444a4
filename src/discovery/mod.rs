/// Instance discovery: the source of live instance lists
use crate::core::InstanceInfo;
use crate::error::{KumoError, KumoResult};
use async_trait::async_trait;
use fnv::FnvHashMap;
use tokio::sync::RwLock;

/// A naming service that knows which instances back a service
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Every record registered for `service`, across all shards
    async fn instances(&self, service: &str) -> KumoResult<Vec<InstanceInfo>>;
}

/// Records of one shard, taken from a service-wide list
pub fn shard_instances(records: &[InstanceInfo], shard_id: u32) -> Vec<InstanceInfo> {
    records
        .iter()
        .filter(|info| info.shard_id() == shard_id)
        .cloned()
        .collect()
}

/// Fixed, replaceable snapshots keyed by service name
#[derive(Default)]
pub struct StaticDiscovery {
    services: RwLock<FnvHashMap<String, Vec<InstanceInfo>>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot served for `service`
    pub async fn set(&self, service: &str, records: Vec<InstanceInfo>) {
        self.services
            .write()
            .await
            .insert(service.to_string(), records);
    }

    pub async fn remove(&self, service: &str) -> Option<Vec<InstanceInfo>> {
        self.services.write().await.remove(service)
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn instances(&self, service: &str) -> KumoResult<Vec<InstanceInfo>> {
        self.services
            .read()
            .await
            .get(service)
            .cloned()
            .ok_or_else(|| KumoError::ServiceNotFound {
                name: service.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_discovery() {
        let discovery = StaticDiscovery::new();
        assert!(discovery.instances("db").await.is_err());

        discovery
            .set(
                "db",
                vec![
                    InstanceInfo::new("10.0.0.1", 3306, "shard:0"),
                    InstanceInfo::new("10.0.0.2", 3306, "idc:bj,shard:1"),
                    InstanceInfo::new("10.0.0.3", 3306, "shard:1"),
                ],
            )
            .await;
        let records = discovery.instances("db").await.unwrap();
        assert_eq!(records.len(), 3);

        let shard1 = shard_instances(&records, 1);
        let ips: Vec<&str> = shard1.iter().map(|i| i.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.2", "10.0.0.3"]);
        assert!(shard_instances(&records, 7).is_empty());

        assert!(discovery.remove("db").await.is_some());
        assert!(discovery.instances("db").await.is_err());
    }

    #[test]
    fn test_discovery_behind_trait_object() {
        let discovery = StaticDiscovery::new();
        let shared: &dyn Discovery = &discovery;
        tokio_test::block_on(async {
            discovery
                .set("db", vec![InstanceInfo::new("10.0.0.9", 3307, "shard:2")])
                .await;
            let records = shared.instances("db").await.unwrap();
            assert_eq!(records[0].addr().to_string(), "10.0.0.9:3307");
            assert_eq!(records[0].shard_id(), 2);
        });
    }
}
