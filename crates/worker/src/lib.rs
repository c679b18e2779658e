pub mod callbacks;
pub mod handlers;
pub mod registry;
pub mod service;

pub use callbacks::CallbackDispatcher;
pub use handlers::{ClusterJobHandler, NamespaceScopedHandler, RateLimitedHandler, NAMESPACE_PAYLOAD_FIELD};
pub use registry::HandlerRegistry;
pub use service::{WorkerService, WorkerServiceBuilder};
