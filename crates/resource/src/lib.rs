//! 共享资源协调
//!
//! 命名空间租约锁与令牌桶限流, 两者都只依赖协调存储的版本化记录做乐观事务,
//! 多个调度进程之间没有额外的锁服务。

pub mod namespace_lock;
pub mod token_bucket;

pub use namespace_lock::NamespaceLockManager;
pub use token_bucket::{service_for_task, TokenBucketManager, SERVICE_ALGO, SERVICE_BUILD, SERVICE_RESTART};
