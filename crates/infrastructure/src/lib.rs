//! 协调存储的 Redis 实现、内存实现, 以及基于事件流的可观测性事件发布。

pub mod event_stream;
pub mod in_memory_store;
pub mod redis_store;

pub use event_stream::StreamEventPublisher;
pub use in_memory_store::InMemoryCoordinationStore;
pub use redis_store::{RedisConnectionManager, RedisCoordinationStore};
