pub mod app_config;
pub mod database;
#[cfg(feature = "kafka")]
pub mod events;
pub mod memory;
pub mod pg_store;
pub mod redis_repo;

pub use app_config::Config;
pub use database::DbClient;
#[cfg(feature = "kafka")]
pub use events::KafkaNotifier;
pub use memory::MemoryStore;
pub use pg_store::PgStore;
pub use redis_repo::RedisClient;
