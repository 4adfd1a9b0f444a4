/// Service registry and background maintenance loops
use crate::config::{Config, ManagerOptions, ServiceOptions};
use crate::discovery::Discovery;
use crate::driver::Driver;
use crate::error::{KumoError, KumoResult};
use crate::expr::ShardEvaluator;
use crate::health::HealthReport;
use crate::result::ResultSet;
use crate::service::Service;
use fnv::FnvHashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const HEALTH_TASK: &str = "health_check";
const HANG_TASK: &str = "hang_check";
const DISCOVERY_TASK: &str = "discovery_sync";

struct LoopHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LoopHandle {
    async fn join(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
}

#[derive(Default)]
struct Tasks {
    health: Option<LoopHandle>,
    hang: Option<LoopHandle>,
    discovery: Option<LoopHandle>,
}

impl Tasks {
    fn slot(&mut self, task: &str) -> &mut Option<LoopHandle> {
        match task {
            HEALTH_TASK => &mut self.health,
            HANG_TASK => &mut self.hang,
            _ => &mut self.discovery,
        }
    }
}

/// State shared with the background loops
struct Registry {
    options: ManagerOptions,
    services: FnvHashMap<String, Arc<Service>>,
    discovery: Option<Arc<dyn Discovery>>,
}

impl Registry {
    async fn healthy_check(&self, detect_dead: bool) -> KumoResult<HealthReport> {
        let checks = self
            .services
            .values()
            .map(|service| service.healthy_check(detect_dead));
        let mut report = HealthReport::default();
        let mut exhausted = None;
        for result in join_all(checks).await {
            match result {
                Ok(service_report) => report.merge(&service_report),
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

    async fn hang_check(&self) -> usize {
        join_all(self.services.values().map(|service| service.hang_check()))
            .await
            .into_iter()
            .sum()
    }

    async fn discovery_sync(&self) -> KumoResult<(usize, usize)> {
        let discovery = match &self.discovery {
            Some(discovery) => discovery.as_ref(),
            None => return Ok((0, 0)),
        };
        let mut total = (0, 0);
        for service in self.services.values() {
            match service.sync_instances(discovery).await {
                Ok((added, removed)) => {
                    total.0 += added;
                    total.1 += removed;
                }
                Err(e) => warn!(service = %service.name(), error = %e, "discovery sync failed"),
            }
        }
        Ok(total)
    }
}

/// Entry point: owns every service and the loops that maintain them.
///
/// Dropping a manager signals its loops to stop; [`Manager::shutdown`]
/// also waits for them and closes every connection.
pub struct Manager {
    registry: Arc<Registry>,
    evaluator: Arc<ShardEvaluator>,
    tasks: Mutex<Tasks>,
}

impl Manager {
    /// Initialize every service, then start the loops the options enable
    pub async fn init(
        options: ManagerOptions,
        services: &[ServiceOptions],
        driver: Arc<dyn Driver>,
        discovery: Option<Arc<dyn Discovery>>,
    ) -> KumoResult<Self> {
        let evaluator = Arc::new(ShardEvaluator::new());
        let mut registry = FnvHashMap::default();
        for service_options in services {
            let service = Service::init(
                service_options,
                &options,
                driver.clone(),
                evaluator.clone(),
                discovery.as_deref(),
            )
            .await?;
            if registry
                .insert(service.name().to_string(), Arc::new(service))
                .is_some()
            {
                return Err(KumoError::Config(crate::config::ConfigError::ValidationError(
                    format!("Duplicate service name: {}", service_options.service_name),
                )));
            }
        }

        let manager = Self {
            registry: Arc::new(Registry {
                options,
                services: registry,
                discovery,
            }),
            evaluator,
            tasks: Mutex::new(Tasks::default()),
        };

        let options = &manager.registry.options;
        if options.healthy_check_secs > 0 {
            manager.start_health_check().await?;
        }
        if options.hang_check {
            manager.start_hang_check().await?;
        }
        if options.discovery_sync_secs > 0 && manager.registry.discovery.is_some() {
            manager.start_discovery_sync().await?;
        }

        info!(
            manager = %manager.name(),
            services = manager.registry.services.len(),
            "manager initialized"
        );
        Ok(manager)
    }

    /// Initialize from a loaded configuration file
    pub async fn from_config(
        config: &Config,
        driver: Arc<dyn Driver>,
        discovery: Option<Arc<dyn Discovery>>,
    ) -> KumoResult<Self> {
        config.validate()?;
        Self::init(config.manager.clone(), &config.services, driver, discovery).await
    }

    pub fn name(&self) -> &str {
        &self.registry.options.name
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.registry.options
    }

    pub fn evaluator(&self) -> &Arc<ShardEvaluator> {
        &self.evaluator
    }

    pub fn get_service(&self, name: &str) -> Option<Arc<Service>> {
        self.registry.services.get(name).cloned()
    }

    pub fn service(&self, name: &str) -> KumoResult<Arc<Service>> {
        self.get_service(name)
            .ok_or_else(|| KumoError::ServiceNotFound {
                name: name.to_string(),
            })
    }

    /// Registered service names, sorted
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run one statement when exactly one service is registered
    pub async fn query(&self, key: Option<u32>, sql: &str) -> KumoResult<ResultSet> {
        let mut services = self.registry.services.values();
        match (services.next(), services.next()) {
            (Some(service), None) => service.query(key, sql).await,
            (None, _) => Err(KumoError::ServiceNotInit),
            _ => Err(KumoError::get_service(format!(
                "query needs exactly one service, {} registered",
                self.registry.services.len()
            ))),
        }
    }

    /// One health pass over every service
    pub async fn healthy_check_function(&self, detect_dead: bool) -> KumoResult<HealthReport> {
        self.registry.healthy_check(detect_dead).await
    }

    /// One hang check pass; returns the number of statements killed
    pub async fn hang_check_function(&self) -> usize {
        self.registry.hang_check().await
    }

    /// One discovery refresh; returns (added, removed)
    pub async fn discovery_sync_function(&self) -> KumoResult<(usize, usize)> {
        self.registry.discovery_sync().await
    }

    async fn start_task<F, Fut>(&self, task: &'static str, body: F) -> KumoResult<()>
    where
        F: FnOnce(Arc<Registry>, watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        let slot = tasks.slot(task);
        if slot.as_ref().map_or(false, |h| !h.handle.is_finished()) {
            return Err(KumoError::TaskStartRepeat {
                task: task.to_string(),
            });
        }
        let (stop, stopped) = watch::channel(false);
        let handle = tokio::spawn(body(self.registry.clone(), stopped));
        *slot = Some(LoopHandle { stop, handle });
        debug!(task, "background task started");
        Ok(())
    }

    async fn stop_task(&self, task: &'static str) -> bool {
        let handle = self.tasks.lock().await.slot(task).take();
        match handle {
            Some(handle) => {
                handle.join().await;
                debug!(task, "background task stopped");
                true
            }
            None => false,
        }
    }

    pub async fn start_health_check(&self) -> KumoResult<()> {
        self.start_task(HEALTH_TASK, health_loop).await
    }

    pub async fn stop_health_check(&self) -> bool {
        self.stop_task(HEALTH_TASK).await
    }

    pub async fn start_hang_check(&self) -> KumoResult<()> {
        self.start_task(HANG_TASK, hang_loop).await
    }

    pub async fn stop_hang_check(&self) -> bool {
        self.stop_task(HANG_TASK).await
    }

    pub async fn start_discovery_sync(&self) -> KumoResult<()> {
        self.start_task(DISCOVERY_TASK, discovery_loop).await
    }

    pub async fn stop_discovery_sync(&self) -> bool {
        self.stop_task(DISCOVERY_TASK).await
    }

    /// Stop and join every loop, then close every connection
    pub async fn shutdown(&self) {
        self.stop_health_check().await;
        self.stop_hang_check().await;
        self.stop_discovery_sync().await;
        for service in self.registry.services.values() {
            service.shutdown().await;
        }
        info!(manager = %self.name(), "manager shut down");
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        for slot in [&mut tasks.health, &mut tasks.hang, &mut tasks.discovery] {
            if let Some(handle) = slot.take() {
                let _ = handle.stop.send(true);
            }
        }
    }
}

/// Cheap pass on every tick, expensive pass every `healthy_check_secs`
async fn health_loop(registry: Arc<Registry>, mut stop: watch::Receiver<bool>) {
    let tick_ms = registry.options.health_tick_ms.max(1);
    let every = (registry.options.healthy_check_secs * 1000 / tick_ms).max(1);
    let mut ticker = interval(Duration::from_millis(tick_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }
        ticks += 1;
        let detect_dead = ticks % every == 0;

        match registry.healthy_check(detect_dead).await {
            Ok(report) if detect_dead => debug!(%report, "health check pass"),
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "health check escalated");
                if registry.options.faulty_exit {
                    error!("faulty_exit is set, terminating the process");
                    std::process::exit(1);
                }
            }
        }
    }
}

async fn hang_loop(registry: Arc<Registry>, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_millis(
        registry.options.hang_check_interval_ms.max(1),
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }
        let killed = registry.hang_check().await;
        if killed > 0 {
            warn!(killed, "hang check killed statements");
        }
    }
}

async fn discovery_loop(registry: Arc<Registry>, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_secs(
        registry.options.discovery_sync_secs.max(1),
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately and init already loaded the lists.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }
        match registry.discovery_sync().await {
            Ok((0, 0)) => {}
            Ok((added, removed)) => info!(added, removed, "discovery sync applied"),
            Err(e) => warn!(error = %e, "discovery sync failed"),
        }
    }
}
