use redis::RedisResult;
use tracing::{debug, info};

/// Cross-process job leases, so one worker replica runs a periodic job at a
/// time.
#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
    owner: String,
}

impl RedisClient {
    pub async fn new(connection_string: &str, owner: impl Into<String>) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self {
            client,
            owner: owner.into(),
        })
    }

    fn lease_key(job: &str) -> String {
        format!("rota:job:{}:lease", job)
    }

    /// SET NX EX: true if this process now holds the lease.
    pub async fn acquire_job_lease(&self, job: &str, ttl_seconds: u64) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = Self::lease_key(job);

        let result: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&self.owner)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;

        let acquired = result.is_some();
        debug!(job, acquired, "Job lease attempt");
        Ok(acquired)
    }

    /// Deletes the lease only if this process still owns it.
    pub async fn release_job_lease(&self, job: &str) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let script = redis::Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#,
        );

        let removed: i64 = script
            .key(Self::lease_key(job))
            .arg(&self.owner)
            .invoke_async(&mut conn)
            .await?;

        if removed == 1 {
            info!(job, "Job lease released");
        }
        Ok(removed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_key_is_namespaced_per_job() {
        assert_eq!(RedisClient::lease_key("batch_clustering"), "rota:job:batch_clustering:lease");
    }
}
