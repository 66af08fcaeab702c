pub mod bootstrap;
pub mod config;
pub mod db;
pub mod events;
pub mod pg_store;
pub mod redis_bus;
pub mod stats;

pub use bootstrap::commission_service;
pub use config::ServiceConfig;
pub use db::{connect_database, pool_options};
pub use events::StatsRefreshRequested;
pub use pg_store::{PgCommissionStore, PgUnitOfWork};
pub use redis_bus::{RedisBus, decode_json, decode_message};
pub use stats::RedisStatsRefresher;
