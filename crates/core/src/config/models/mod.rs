pub mod app_config;
pub mod observability;
pub mod redis;
pub mod resource;
pub mod scheduler;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use observability::ObservabilityConfig;
pub use redis::RedisConfig;
pub use resource::{NamespaceConfig, RateLimitConfig};
pub use scheduler::{SchedulerConfig, WorkerConfig};
