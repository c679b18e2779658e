//! 通用处理器
//!
//! - [`ClusterJobHandler`]: 等待集群回调确认任务在集群中结束
//! - [`RateLimitedHandler`]: 执行前从令牌桶获取令牌, 拿不到时延后重新入队
//! - [`NamespaceScopedHandler`]: 执行前租用一个空闲命名空间, 结束后释放

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use chaos_core::models::{token_holder_id, CallbackKind, TaskType};
use chaos_core::traits::{CallbackWait, HandlerOutcome, TaskContext, TaskHandler};
use chaos_core::{SchedulerError, SchedulerResult};
use chaos_resource::{service_for_task, NamespaceLockManager, TokenBucketManager};

/// 任务负载中记录分配到的命名空间的字段
pub const NAMESPACE_PAYLOAD_FIELD: &str = "namespace";

/// 等待集群侧的 Job 或自定义资源报告结果
///
/// `JobSucceeded` 和 `CrdConditionChanged` 视为成功, `JobFailed` 视为失败,
/// `JobAdded` 只记录日志后继续等待。
pub struct ClusterJobHandler {
    task_type: TaskType,
    timeout: Duration,
}

impl ClusterJobHandler {
    pub fn new(task_type: TaskType, timeout: Duration) -> Self {
        Self { task_type, timeout }
    }
}

#[async_trait]
impl TaskHandler for ClusterJobHandler {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn handle(&self, mut ctx: TaskContext) -> SchedulerResult<HandlerOutcome> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match ctx.wait_callback(remaining).await {
                CallbackWait::Event(event) => match event.kind {
                    CallbackKind::JobAdded => {
                        debug!(task_id = %ctx.task.id, "集群 Job 已创建");
                    }
                    CallbackKind::JobSucceeded | CallbackKind::CrdConditionChanged => {
                        return Ok(HandlerOutcome::Completed);
                    }
                    CallbackKind::JobFailed => {
                        return Err(SchedulerError::handler_failure(
                            event.reason.unwrap_or_else(|| "job failed".to_string()),
                        ));
                    }
                },
                CallbackWait::Cancelled => {
                    return Err(SchedulerError::handler_failure("cancelled"));
                }
                CallbackWait::TimedOut => {
                    return Err(SchedulerError::handler_failure(format!(
                        "no cluster callback within {}s",
                        self.timeout.as_secs()
                    )));
                }
            }
        }
    }
}

/// 令牌桶限流包装
///
/// 等待令牌超时后返回 `Deferred`, 任务延后重新入队且不消耗重试次数。
pub struct RateLimitedHandler {
    inner: Arc<dyn TaskHandler>,
    buckets: Arc<TokenBucketManager>,
    wait_timeout: Duration,
    defer_delay: Duration,
}

impl RateLimitedHandler {
    pub fn new(
        inner: Arc<dyn TaskHandler>,
        buckets: Arc<TokenBucketManager>,
        defer_delay: Duration,
    ) -> Self {
        let wait_timeout = buckets.wait_timeout();
        Self {
            inner,
            buckets,
            wait_timeout,
            defer_delay,
        }
    }
}

#[async_trait]
impl TaskHandler for RateLimitedHandler {
    fn task_type(&self) -> TaskType {
        self.inner.task_type()
    }

    async fn handle(&self, ctx: TaskContext) -> SchedulerResult<HandlerOutcome> {
        let Some(service) = service_for_task(ctx.task.task_type) else {
            return self.inner.handle(ctx).await;
        };

        let holder = token_holder_id(&ctx.task.id, &ctx.task.trace_id);
        if !self
            .buckets
            .wait_for_token(service, &holder, self.wait_timeout)
            .await?
        {
            info!(task_id = %ctx.task.id, service, "暂无可用令牌, 任务延后执行");
            return Ok(HandlerOutcome::Deferred(self.defer_delay));
        }

        let result = self.inner.handle(ctx).await;
        if let Err(e) = self.buckets.release_token(service, &holder).await {
            // 未释放的令牌会在过期后被回收
            warn!(service, holder = %holder, "释放令牌失败: {}", e);
        }
        result
    }
}

/// 命名空间租用包装
///
/// 分配到的命名空间写入任务负载的 `namespace` 字段后交给内部处理器。
/// 没有空闲命名空间时返回 `Deferred`。
pub struct NamespaceScopedHandler {
    inner: Arc<dyn TaskHandler>,
    locks: Arc<NamespaceLockManager>,
    lease: chrono::Duration,
    defer_delay: Duration,
}

impl NamespaceScopedHandler {
    pub fn new(
        inner: Arc<dyn TaskHandler>,
        locks: Arc<NamespaceLockManager>,
        lease: Duration,
        defer_delay: Duration,
    ) -> Self {
        Self {
            inner,
            locks,
            lease: chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::hours(1)),
            defer_delay,
        }
    }
}

#[async_trait]
impl TaskHandler for NamespaceScopedHandler {
    fn task_type(&self) -> TaskType {
        self.inner.task_type()
    }

    async fn handle(&self, mut ctx: TaskContext) -> SchedulerResult<HandlerOutcome> {
        let holder = ctx.task.trace_id.clone();
        let end_time = Utc::now() + self.lease;
        let Some(namespace) = self.locks.get_free_namespace(end_time, &holder).await? else {
            info!(task_id = %ctx.task.id, "暂无空闲命名空间, 任务延后执行");
            return Ok(HandlerOutcome::Deferred(self.defer_delay));
        };

        if let Some(payload) = ctx.task.payload.as_object_mut() {
            payload.insert(
                NAMESPACE_PAYLOAD_FIELD.to_string(),
                serde_json::Value::String(namespace.clone()),
            );
        }

        let result = self.inner.handle(ctx).await;
        match self.locks.release_lock(&namespace, &holder).await {
            Ok(()) => {}
            // 租约已过期并被其他持有者获取
            Err(SchedulerError::NotOwner { .. }) => {
                warn!(namespace = %namespace, trace_id = %holder, "命名空间租约已被接管");
            }
            Err(e) => warn!(namespace = %namespace, "释放命名空间失败: {}", e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaos_core::config::RateLimitConfig;
    use chaos_core::models::{labels, CallbackEvent, Task};
    use chaos_core::traits::NoopEventPublisher;
    use chaos_infrastructure::InMemoryCoordinationStore;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::{mpsc, watch};

    struct Recording {
        task_type: TaskType,
        seen: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl TaskHandler for Recording {
        fn task_type(&self) -> TaskType {
            self.task_type
        }

        async fn handle(&self, ctx: TaskContext) -> SchedulerResult<HandlerOutcome> {
            self.seen.lock().unwrap().push(ctx.task.payload.clone());
            Ok(HandlerOutcome::Completed)
        }
    }

    fn recording(task_type: TaskType) -> Arc<Recording> {
        Arc::new(Recording {
            task_type,
            seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_cluster_job_handler_follows_callbacks() {
        let handler = ClusterJobHandler::new(TaskType::BuildImage, Duration::from_secs(5));
        let task = Task::new(TaskType::BuildImage, json!({})).with_id("t1");
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (tx, rx) = mpsc::unbounded_channel();
        let job_labels = HashMap::from([(labels::TASK_ID.to_string(), "t1".to_string())]);
        tx.send(CallbackEvent::new(CallbackKind::JobAdded, job_labels.clone()))
            .unwrap();
        tx.send(CallbackEvent::new(CallbackKind::JobFailed, job_labels).with_reason("ImagePullBackOff"))
            .unwrap();

        let err = handler
            .handle(TaskContext::new(task, cancel_rx, rx))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::HandlerFailure(ref r) if r == "ImagePullBackOff"));
    }

    #[tokio::test]
    async fn test_cluster_job_handler_times_out() {
        let handler = ClusterJobHandler::new(TaskType::CollectResult, Duration::from_millis(20));
        let task = Task::new(TaskType::CollectResult, json!({}));
        let err = handler.handle(TaskContext::detached(task)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::HandlerFailure(_)));
    }

    #[tokio::test]
    async fn test_rate_limited_defers_when_bucket_full() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let config = RateLimitConfig {
            max_concurrent_algo_executions: 1,
            token_wait_timeout_seconds: 0,
            poll_interval_ms: 5,
            ..RateLimitConfig::default()
        };
        let buckets = Arc::new(TokenBucketManager::new(
            store,
            Arc::new(NoopEventPublisher),
            "test",
            &config,
            8,
        ));
        let inner = recording(TaskType::RunAlgorithm);
        let handler = RateLimitedHandler::new(inner.clone(), buckets.clone(), Duration::from_secs(300));

        let task = Task::new(TaskType::RunAlgorithm, json!({})).with_id("a1");
        let outcome = handler.handle(TaskContext::detached(task)).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Completed);
        // 执行结束后令牌已归还
        assert!(buckets
            .inspect_tokens("algo_execution", Utc::now())
            .await
            .unwrap()
            .is_empty());

        assert!(buckets.acquire_token("algo_execution", "other:x").await.unwrap());
        let task = Task::new(TaskType::RunAlgorithm, json!({})).with_id("a2");
        let outcome = handler.handle(TaskContext::detached(task)).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Deferred(Duration::from_secs(300)));
        assert_eq!(inner.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_namespace_scoped_assigns_and_releases() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let locks = Arc::new(NamespaceLockManager::new(
            store,
            Arc::new(NoopEventPublisher),
            "test",
            8,
        ));
        locks
            .initialize_namespaces(&["ns-0".to_string()])
            .await
            .unwrap();
        let inner = recording(TaskType::FaultInjection);
        let handler = NamespaceScopedHandler::new(
            inner.clone(),
            locks.clone(),
            Duration::from_secs(600),
            Duration::from_secs(60),
        );

        let task = Task::new(TaskType::FaultInjection, json!({"fault": "pod-kill"}))
            .with_trace_id("trace-1");
        let outcome = handler.handle(TaskContext::detached(task)).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Completed);
        assert_eq!(inner.seen.lock().unwrap()[0]["namespace"], "ns-0");
        assert!(!locks.inspect_locks(Utc::now()).await.unwrap()[0].held);

        locks
            .acquire_lock("ns-0", Utc::now() + chrono::Duration::seconds(600), "someone")
            .await
            .unwrap();
        let task = Task::new(TaskType::FaultInjection, json!({})).with_trace_id("trace-2");
        let outcome = handler.handle(TaskContext::detached(task)).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Deferred(Duration::from_secs(60)));
    }
}
