use async_trait::async_trait;

use crate::models::TraceEvent;

/// 可观测性事件发布接口
///
/// 事件流只是副作用, 发布失败由实现方自行记录日志, 不影响调用方的正确性。
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: TraceEvent);
}

/// 丢弃所有事件
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _event: TraceEvent) {}
}
