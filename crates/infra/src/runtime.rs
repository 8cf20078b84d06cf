//! Process wiring: backends from config, consumer replicas, shutdown.
//!
//! Startup fails fast when the bus or the store is unreachable. Once running,
//! business-level errors never stop a replica; only [`PipelineRuntime::shutdown`]
//! does.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use creatiflow_core::Stage;
use creatiflow_events::{BusError, ConsumerOptions, InMemoryBus, MessageBus, StageHandler};

use crate::config::{BusBackend, ConfigError, PipelineConfig, StoreBackend};
use crate::coordinator::PipelineCoordinator;
use crate::stages::{
    AssetGenerationStage, Collaborators, CompositionStage, ContentGenerationStage, EnrichmentStage,
    FinalizationStage,
};
use crate::store::{InMemoryPipelineStore, PipelineStore, PostgresPipelineStore, StoreError};
use crate::workers::{
    CompletionTracker, DeliveryProcessor, EscalationMonitor, StageWorker, WorkerHandle,
    spawn_consumer, stage_worker::durable_name,
};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("message bus unavailable: {0}")]
    Bus(#[from] BusError),

    #[error("persistence store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),

    #[error("backend '{0}' requires a cargo feature that is not enabled")]
    FeatureDisabled(&'static str),
}

/// Running set of consumer replicas sharing one coordinator.
pub struct PipelineRuntime {
    coordinator: PipelineCoordinator,
    workers: Vec<WorkerHandle>,
}

impl std::fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRuntime")
            .field("workers", &self.worker_names())
            .finish_non_exhaustive()
    }
}

impl PipelineRuntime {
    /// Build backends from `config`, initialise logging and start every consumer.
    pub fn from_config(config: &PipelineConfig, collaborators: Collaborators) -> Result<Self, StartupError> {
        creatiflow_observability::init_with(&config.logging);
        config.validate()?;

        let bus = connect_bus(&config.bus)?;
        let store: Arc<dyn PipelineStore> = match &config.store {
            StoreBackend::InMemory => Arc::new(InMemoryPipelineStore::new()),
            StoreBackend::Postgres {
                url,
                max_connections,
            } => Arc::new(PostgresPipelineStore::connect(url, *max_connections)?),
        };
        Self::start(config, store, bus, collaborators)
    }

    /// Start every consumer against already-built backends.
    pub fn start(
        config: &PipelineConfig,
        store: Arc<dyn PipelineStore>,
        bus: Arc<dyn MessageBus>,
        collaborators: Collaborators,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        bus.health_check()?;
        store.health_check()?;

        let coordinator = PipelineCoordinator::new(store.clone(), bus.clone());
        let mut spawner = Spawner {
            bus: bus.as_ref(),
            poll: config.poll_interval(),
            workers: Vec::new(),
        };

        let c = &collaborators;
        let started = (|| -> Result<(), StartupError> {
            spawner.stage(
                config,
                EnrichmentStage::new(c.enricher.clone(), c.objects.clone()),
                &coordinator,
            )?;
            spawner.stage(
                config,
                ContentGenerationStage::new(c.content.clone(), c.objects.clone()),
                &coordinator,
            )?;
            spawner.stage(
                config,
                AssetGenerationStage::new(c.assets.clone(), c.objects.clone()),
                &coordinator,
            )?;
            spawner.stage(config, CompositionStage::new(c.compositor.clone()), &coordinator)?;
            spawner.stage(
                config,
                FinalizationStage::new(c.compositor.clone(), c.objects.clone()),
                &coordinator,
            )?;

            let tracker: Arc<dyn DeliveryProcessor> =
                Arc::new(CompletionTracker::new(store.clone(), bus.clone()));
            let tracker_config = &config.completion_tracker;
            spawner.replicas(
                tracker_config.replicas,
                CompletionTracker::terminal_options(tracker_config),
                &tracker,
            )?;
            spawner.replicas(
                tracker_config.replicas,
                CompletionTracker::dead_letter_options(tracker_config),
                &tracker,
            )?;

            let monitor: Arc<dyn DeliveryProcessor> =
                Arc::new(EscalationMonitor::new(store.clone(), bus.clone()));
            let monitor_config = &config.escalation_monitor;
            spawner.replicas(
                monitor_config.replicas,
                EscalationMonitor::options(monitor_config),
                &monitor,
            )?;
            Ok(())
        })();

        if let Err(e) = started {
            warn!(error = %e, started = spawner.workers.len(), "startup aborted; stopping workers");
            stop_all(spawner.workers);
            return Err(e);
        }

        info!(workers = spawner.workers.len(), "pipeline runtime started");
        Ok(Self {
            coordinator,
            workers: spawner.workers,
        })
    }

    /// Entry point for submissions, status queries and revisions.
    pub fn coordinator(&self) -> &PipelineCoordinator {
        &self.coordinator
    }

    pub fn worker_names(&self) -> Vec<&str> {
        self.workers.iter().map(WorkerHandle::name).collect()
    }

    /// Signal every replica, then wait for all of them to finish their
    /// current delivery.
    pub fn shutdown(self) {
        info!(workers = self.workers.len(), "pipeline runtime stopping");
        stop_all(self.workers);
    }
}

fn stop_all(workers: Vec<WorkerHandle>) {
    for worker in &workers {
        worker.signal();
    }
    for worker in workers {
        worker.join();
    }
}

fn connect_bus(backend: &BusBackend) -> Result<Arc<dyn MessageBus>, StartupError> {
    match backend {
        BusBackend::InMemory => Ok(Arc::new(InMemoryBus::new())),
        #[cfg(feature = "redis")]
        BusBackend::Redis { url, stream_key } => {
            let bus = crate::event_bus::RedisStreamsBus::new(url, Some(stream_key.clone()))
                .map_err(BusError::from)?;
            Ok(Arc::new(bus))
        }
        #[cfg(not(feature = "redis"))]
        BusBackend::Redis { .. } => Err(StartupError::FeatureDisabled("redis")),
    }
}

struct Spawner<'a> {
    bus: &'a dyn MessageBus,
    poll: Duration,
    workers: Vec<WorkerHandle>,
}

impl Spawner<'_> {
    fn stage<H>(
        &mut self,
        config: &PipelineConfig,
        handler: H,
        coordinator: &PipelineCoordinator,
    ) -> Result<(), StartupError>
    where
        H: StageHandler + 'static,
    {
        let stage: Stage = handler.stage();
        let stage_config = config.stage(stage);
        let worker = StageWorker::new(handler, coordinator.clone());
        let options = worker.consumer_options(stage_config);
        let processor: Arc<dyn DeliveryProcessor> = Arc::new(worker);
        self.replicas(stage_config.replicas, options, &processor)?;
        info!(stage = %stage, durable = %durable_name(stage), replicas = stage_config.replicas, "stage consumers started");
        Ok(())
    }

    fn replicas(
        &mut self,
        count: usize,
        options: ConsumerOptions,
        processor: &Arc<dyn DeliveryProcessor>,
    ) -> Result<(), StartupError> {
        for i in 0..count {
            let name = format!("{}-{i}", options.durable_name);
            let subscription = self.bus.subscribe(options.clone())?;
            let handle = spawn_consumer(name, subscription, processor.clone(), self.poll)?;
            self.workers.push(handle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.poll_interval_ms = 10;
        config
    }

    #[test]
    fn starts_every_consumer_group() {
        let config = small_config();
        let runtime = PipelineRuntime::start(
            &config,
            Arc::new(InMemoryPipelineStore::new()),
            Arc::new(InMemoryBus::new()),
            Collaborators::in_memory(),
        )
        .unwrap();

        let names = runtime.worker_names();
        // Two replicas per stage, one per tracker subscription, one monitor.
        assert_eq!(names.len(), 5 * 2 + 2 + 1);
        assert!(names.contains(&"asset-generation-1"));
        assert!(names.contains(&"completion-tracker-0"));
        assert!(names.contains(&"completion-tracker-dlq-0"));
        assert!(names.contains(&"escalation-monitor-0"));
        runtime.shutdown();
    }

    #[test]
    fn unreachable_store_fails_startup() {
        let store = InMemoryPipelineStore::new();
        store.inject_failures("health_check", 1);
        let err = PipelineRuntime::start(
            &small_config(),
            Arc::new(store),
            Arc::new(InMemoryBus::new()),
            Collaborators::in_memory(),
        )
        .unwrap_err();
        assert!(matches!(err, StartupError::Store(_)));
    }

    #[test]
    fn unreachable_postgres_fails_startup_before_any_worker_starts() {
        let mut config = small_config();
        config.store = StoreBackend::Postgres {
            url: "postgres://creatiflow@127.0.0.1:1/creatiflow".into(),
            max_connections: 1,
        };
        let err = PipelineRuntime::from_config(&config, Collaborators::in_memory()).unwrap_err();
        assert!(matches!(err, StartupError::Store(StoreError::Storage(msg)) if msg.starts_with("connect")));
    }

    #[cfg(not(feature = "redis"))]
    #[test]
    fn redis_backend_needs_the_feature() {
        let mut config = small_config();
        config.bus = BusBackend::Redis {
            url: "redis://localhost:6379".into(),
            stream_key: "creatiflow:messages".into(),
        };
        assert!(matches!(
            connect_bus(&config.bus),
            Err(StartupError::FeatureDisabled("redis"))
        ));
    }
}
