use std::sync::Arc;

use async_trait::async_trait;
use rota_core::{CoreError, CoreResult};
use rota_match::Matchmaker;
use rota_schedule::LeaveCoordinator;
use rota_store::RedisClient;

use crate::runner::{Job, JobLease};

pub const BATCH_CLUSTERING: &str = "batch_clustering";
pub const EXPIRY_SWEEP: &str = "expiry_sweep";

pub struct BatchClusteringJob {
    matchmaker: Arc<Matchmaker>,
}

impl BatchClusteringJob {
    pub fn new(matchmaker: Arc<Matchmaker>) -> Self {
        Self { matchmaker }
    }
}

#[async_trait]
impl Job for BatchClusteringJob {
    fn name(&self) -> &'static str {
        BATCH_CLUSTERING
    }

    async fn run(&self) -> CoreResult<()> {
        self.matchmaker.run_batch_clustering().await.map(|_| ())
    }
}

pub struct ExpirySweepJob {
    leave: Arc<LeaveCoordinator>,
}

impl ExpirySweepJob {
    pub fn new(leave: Arc<LeaveCoordinator>) -> Self {
        Self { leave }
    }
}

#[async_trait]
impl Job for ExpirySweepJob {
    fn name(&self) -> &'static str {
        EXPIRY_SWEEP
    }

    async fn run(&self) -> CoreResult<()> {
        self.leave
            .process_leave_returns_and_expirations()
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl JobLease for RedisClient {
    async fn acquire(&self, job: &str, ttl_seconds: u64) -> CoreResult<bool> {
        self.acquire_job_lease(job, ttl_seconds)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))
    }

    async fn release(&self, job: &str) -> CoreResult<()> {
        self.release_job_lease(job)
            .await
            .map(|_| ())
            .map_err(|e| CoreError::Storage(e.to_string()))
    }
}
