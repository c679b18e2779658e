//! 任务队列与调度器
//!
//! 提交、延迟任务到期移动、取消、重试决策、cron 重新调度以及任务索引修复。

pub mod cron_utils;
pub mod retry_service;
pub mod scheduler;
pub mod task_queue;

pub use retry_service::{RetryDecision, TaskRetryService};
pub use scheduler::TaskScheduler;
pub use task_queue::{PromotionReport, QueueKeys, ReconcileReport, TaskQueue};
