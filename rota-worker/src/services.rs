//! Wiring of the stores, collaborators and domain services.

use std::sync::Arc;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rota_core::{DefaultClock, LogNotifier, Notifier, SharedClock, Store};
use rota_match::{Matchmaker, ProfileService};
use rota_schedule::{LeaveCoordinator, Scheduler, SuspensionGate};
use rota_store::app_config::StoreBackend;
use rota_store::{Config, DbClient, MemoryStore, PgStore, RedisClient};
use tracing::info;
use uuid::Uuid;

use crate::jobs::{BatchClusteringJob, ExpirySweepJob};
use crate::runner::{PeriodicTask, TaskRunner};

pub struct Services {
    pub store: Arc<dyn Store>,
    pub clock: SharedClock,
    pub scheduler: Arc<Scheduler>,
    pub matchmaker: Arc<Matchmaker>,
    pub leave: Arc<LeaveCoordinator>,
    pub suspension: Arc<SuspensionGate>,
    pub profiles: Arc<ProfileService>,
}

impl Services {
    pub fn new(
        store: Arc<dyn Store>,
        clock: SharedClock,
        notifier: Arc<dyn Notifier>,
        rng: StdRng,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            clock.clone(),
            notifier.clone(),
            rng,
        ));
        let matchmaker = Arc::new(Matchmaker::new(store.clone(), clock.clone(), scheduler.clone()));
        let leave = Arc::new(LeaveCoordinator::new(
            store.clone(),
            clock.clone(),
            notifier.clone(),
            scheduler.clone(),
        ));
        let suspension = Arc::new(SuspensionGate::new(store.clone(), notifier, scheduler.clone()));
        let profiles = Arc::new(ProfileService::new(store.clone(), matchmaker.clone()));

        Self {
            store,
            clock,
            scheduler,
            matchmaker,
            leave,
            suspension,
            profiles,
        }
    }

    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store: Arc<dyn Store> = match config.store.backend {
            StoreBackend::Memory => {
                info!("Using in-memory store");
                Arc::new(MemoryStore::new())
            }
            StoreBackend::Postgres => {
                let database = config
                    .database
                    .as_ref()
                    .context("store.backend = \"postgres\" needs a [database] section")?;
                let db = DbClient::new(database)
                    .await
                    .context("Failed to connect to Postgres")?;
                db.migrate().await.context("Failed to run migrations")?;
                Arc::new(PgStore::new(db.pool))
            }
        };

        let rng = match config.rules.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self::new(store, Arc::new(DefaultClock), notifier(config)?, rng))
    }

    /// The two periodic jobs at their configured times.
    pub async fn task_runner(&self, config: &Config) -> anyhow::Result<TaskRunner> {
        let mut runner = TaskRunner::new(self.clock.clone())
            .with_task(PeriodicTask::new(
                Arc::new(BatchClusteringJob::new(self.matchmaker.clone())),
                config.schedule.batch_times()?,
            ))
            .with_task(PeriodicTask::new(
                Arc::new(ExpirySweepJob::new(self.leave.clone())),
                config.schedule.sweep_times()?,
            ));

        if let Some(redis) = &config.redis {
            let holder = format!("rota-worker-{}", Uuid::new_v4());
            let client = RedisClient::new(&redis.url, holder)
                .await
                .context("Failed to open Redis client")?;
            runner = runner.with_lease(Arc::new(client), redis.lease_seconds);
            info!("Job leases enabled");
        }
        Ok(runner)
    }
}

#[cfg(feature = "kafka")]
fn notifier(config: &Config) -> anyhow::Result<Arc<dyn Notifier>> {
    match &config.kafka {
        Some(kafka) => {
            let producer = rota_store::KafkaNotifier::new(kafka)
                .context("Failed to create Kafka producer")?;
            info!(topic = %kafka.topic, "Publishing notifications to Kafka");
            Ok(Arc::new(producer))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}

#[cfg(not(feature = "kafka"))]
fn notifier(config: &Config) -> anyhow::Result<Arc<dyn Notifier>> {
    if config.kafka.is_some() {
        tracing::warn!("Kafka configured but the kafka feature is off; logging notifications");
    }
    Ok(Arc::new(LogNotifier))
}
