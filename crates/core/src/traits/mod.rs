pub mod cluster_callback;
pub mod event_publisher;
pub mod store;
pub mod task_handler;

pub use cluster_callback::ClusterCallback;
pub use event_publisher::{EventPublisher, NoopEventPublisher};
pub use store::{CoordinationStore, StoreOp, VersionedRecord};
pub use task_handler::{CallbackWait, HandlerOutcome, TaskContext, TaskHandler};
