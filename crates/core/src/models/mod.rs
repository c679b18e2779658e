//! # 数据模型
//!
//! 调度器与资源锁层共享的核心数据结构:
//!
//! - [`Task`] - 可调度的工作单元及其状态机
//! - [`NamespaceLock`] / [`TokenHold`] - 命名空间租约与令牌桶持有记录
//! - [`TraceEvent`] - 写入可观测性事件流的结构化事件
//! - [`CallbackEvent`] - 集群协调器回调转换后的类型化事件
//!
//! 所有模型都实现了 `serde` 序列化, 队列条目与状态记录以 JSON 形式存放在协调存储中。

pub mod event;
pub mod resource;
pub mod task;

pub use event::*;
pub use resource::*;
pub use task::*;
