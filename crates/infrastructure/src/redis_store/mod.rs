mod connection_manager;
mod scripts;
mod store;

pub use connection_manager::RedisConnectionManager;
pub use scripts::VERSION_FIELD;
pub use store::RedisCoordinationStore;
