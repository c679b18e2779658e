use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

use chaos_core::config::RateLimitConfig;
use chaos_core::models::{EventName, TaskType, TokenHold, TraceEvent};
use chaos_core::traits::{CoordinationStore, EventPublisher};
use chaos_core::{SchedulerError, SchedulerResult};

pub const SERVICE_RESTART: &str = "restart_service";
pub const SERVICE_BUILD: &str = "build";
pub const SERVICE_ALGO: &str = "algo_execution";

/// 任务类型对应的限流服务, 不受限流的类型返回 None
pub fn service_for_task(task_type: TaskType) -> Option<&'static str> {
    match task_type {
        TaskType::RestartService => Some(SERVICE_RESTART),
        TaskType::BuildImage | TaskType::BuildDataset => Some(SERVICE_BUILD),
        TaskType::RunAlgorithm => Some(SERVICE_ALGO),
        TaskType::FaultInjection | TaskType::CollectResult | TaskType::CronJob => None,
    }
}

/// 令牌桶限流管理器
///
/// 令牌桶是带过期时间的有界持有者集合, 用作跨进程的计数信号量。每个服务一条
/// 版本化记录, 字段为 `holder -> 过期时间戳`; 过期的持有者在下一次写入时被清除。
pub struct TokenBucketManager {
    store: Arc<dyn CoordinationStore>,
    events: Arc<dyn EventPublisher>,
    key_prefix: String,
    capacities: HashMap<String, usize>,
    token_ttl: Duration,
    poll_interval: std::time::Duration,
    wait_timeout: std::time::Duration,
    cas_retry_attempts: usize,
}

impl TokenBucketManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        events: Arc<dyn EventPublisher>,
        key_prefix: &str,
        config: &RateLimitConfig,
        cas_retry_attempts: usize,
    ) -> Self {
        let capacities = HashMap::from([
            (SERVICE_RESTART.to_string(), config.max_concurrent_restarts as usize),
            (SERVICE_BUILD.to_string(), config.max_concurrent_builds as usize),
            (
                SERVICE_ALGO.to_string(),
                config.max_concurrent_algo_executions as usize,
            ),
        ]);

        Self {
            store,
            events,
            key_prefix: key_prefix.to_string(),
            capacities,
            token_ttl: Duration::seconds(config.token_ttl_seconds as i64),
            poll_interval: std::time::Duration::from_millis(config.poll_interval_ms),
            wait_timeout: std::time::Duration::from_secs(config.token_wait_timeout_seconds),
            cas_retry_attempts: cas_retry_attempts.max(1),
        }
    }

    fn bucket_key(&self, service: &str) -> String {
        format!("{}:token_bucket:{}", self.key_prefix, service)
    }

    pub fn capacity(&self, service: &str) -> SchedulerResult<usize> {
        self.capacities
            .get(service)
            .copied()
            .ok_or_else(|| SchedulerError::TokenBucketNotFound {
                service: service.to_string(),
            })
    }

    /// 配置中的默认等待时间
    pub fn wait_timeout(&self) -> std::time::Duration {
        self.wait_timeout
    }

    pub async fn acquire_token(&self, service: &str, holder: &str) -> SchedulerResult<bool> {
        self.acquire_token_at(service, holder, Utc::now()).await
    }

    /// 尝试获取令牌
    ///
    /// 未过期的持有者数量达到上限时返回 false。已经持有令牌的持有者会刷新过期时间。
    pub async fn acquire_token_at(
        &self,
        service: &str,
        holder: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let capacity = self.capacity(service)?;
        let key = self.bucket_key(service);

        for attempt in 0..self.cas_retry_attempts {
            let record = self.store.record_get(&key).await?;
            let version = record.as_ref().map(|r| r.version);
            let mut live: HashMap<String, String> = record
                .map(|r| TokenHold::from_fields(&r.fields))
                .unwrap_or_default()
                .into_iter()
                .filter(|hold| hold.is_live_at(now))
                .map(|hold| (hold.holder, hold.expires_at.to_string()))
                .collect();

            if !live.contains_key(holder) && live.len() >= capacity {
                counter!("resource_token_rejected_total", "service" => service.to_string())
                    .increment(1);
                debug!(service, holder, held = live.len(), capacity, "令牌桶已满");
                return Ok(false);
            }

            let expires_at = now + self.token_ttl;
            live.insert(holder.to_string(), expires_at.timestamp().to_string());
            if self
                .store
                .record_compare_and_set(&key, version, &live)
                .await?
            {
                counter!("resource_token_acquired_total", "service" => service.to_string())
                    .increment(1);
                info!(service, holder, "令牌已获取 ({}/{})", live.len(), capacity);
                self.publish(EventName::TokenAcquired, service, holder).await;
                return Ok(true);
            }

            counter!("resource_token_contention_total", "service" => service.to_string())
                .increment(1);
            debug!(service, attempt, "令牌桶记录被并发修改, 重试");
            tokio::task::yield_now().await;
        }

        Err(SchedulerError::LockContended { key })
    }

    pub async fn release_token(&self, service: &str, holder: &str) -> SchedulerResult<bool> {
        self.release_token_at(service, holder, Utc::now()).await
    }

    /// 释放令牌, 返回该持有者此前是否持有令牌
    pub async fn release_token_at(
        &self,
        service: &str,
        holder: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.capacity(service)?;
        let key = self.bucket_key(service);

        for attempt in 0..self.cas_retry_attempts {
            let Some(record) = self.store.record_get(&key).await? else {
                return Ok(false);
            };
            if !record.fields.contains_key(holder) {
                return Ok(false);
            }

            let remaining: HashMap<String, String> = TokenHold::from_fields(&record.fields)
                .into_iter()
                .filter(|hold| hold.holder != holder && hold.is_live_at(now))
                .map(|hold| (hold.holder, hold.expires_at.to_string()))
                .collect();
            if self
                .store
                .record_compare_and_set(&key, Some(record.version), &remaining)
                .await?
            {
                counter!("resource_token_released_total", "service" => service.to_string())
                    .increment(1);
                info!(service, holder, "令牌已释放");
                self.publish(EventName::TokenReleased, service, holder).await;
                return Ok(true);
            }

            debug!(service, attempt, "令牌桶记录被并发修改, 重试");
            tokio::task::yield_now().await;
        }

        Err(SchedulerError::LockContended { key })
    }

    /// 按固定间隔轮询获取令牌, 超时返回 false 而不是错误
    ///
    /// 调用方据此决定把任务延后重新入队。
    pub async fn wait_for_token(
        &self,
        service: &str,
        holder: &str,
        timeout: std::time::Duration,
    ) -> SchedulerResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.acquire_token(service, holder).await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                info!(service, holder, "等待令牌超时");
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// 当前未过期的持有者
    pub async fn inspect_tokens(
        &self,
        service: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<TokenHold>> {
        self.capacity(service)?;
        let holds = match self.store.record_get(&self.bucket_key(service)).await? {
            Some(record) => TokenHold::from_fields(&record.fields),
            None => Vec::new(),
        };
        Ok(holds.into_iter().filter(|h| h.is_live_at(now)).collect())
    }

    async fn publish(&self, event_name: EventName, service: &str, holder: &str) {
        // holder 形如 task_id:trace_id
        let trace_id = holder.rsplit_once(':').map_or(holder, |(_, trace)| trace);
        self.events
            .publish(TraceEvent::new(
                event_name,
                trace_id,
                json!({"service": service, "holder": holder}),
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaos_core::traits::NoopEventPublisher;
    use chaos_infrastructure::InMemoryCoordinationStore;

    fn manager(store: Arc<InMemoryCoordinationStore>) -> TokenBucketManager {
        let config = RateLimitConfig {
            max_concurrent_builds: 2,
            token_ttl_seconds: 60,
            poll_interval_ms: 10,
            ..RateLimitConfig::default()
        };
        TokenBucketManager::new(store, Arc::new(NoopEventPublisher), "test", &config, 8)
    }

    #[test]
    fn test_service_mapping() {
        assert_eq!(service_for_task(TaskType::BuildImage), Some(SERVICE_BUILD));
        assert_eq!(service_for_task(TaskType::BuildDataset), Some(SERVICE_BUILD));
        assert_eq!(service_for_task(TaskType::RunAlgorithm), Some(SERVICE_ALGO));
        assert_eq!(service_for_task(TaskType::RestartService), Some(SERVICE_RESTART));
        assert_eq!(service_for_task(TaskType::FaultInjection), None);
    }

    #[tokio::test]
    async fn test_bucket_capacity_and_release() {
        let buckets = manager(Arc::new(InMemoryCoordinationStore::new()));
        let now = Utc::now();

        assert!(buckets.acquire_token_at(SERVICE_BUILD, "t1:a", now).await.unwrap());
        assert!(buckets.acquire_token_at(SERVICE_BUILD, "t2:b", now).await.unwrap());
        assert!(!buckets.acquire_token_at(SERVICE_BUILD, "t3:c", now).await.unwrap());
        // 已持有者刷新不占用新名额
        assert!(buckets.acquire_token_at(SERVICE_BUILD, "t1:a", now).await.unwrap());

        assert!(buckets.release_token_at(SERVICE_BUILD, "t1:a", now).await.unwrap());
        assert!(!buckets.release_token_at(SERVICE_BUILD, "t1:a", now).await.unwrap());
        assert!(buckets.acquire_token_at(SERVICE_BUILD, "t3:c", now).await.unwrap());

        let holders: Vec<_> = buckets
            .inspect_tokens(SERVICE_BUILD, now)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.holder)
            .collect();
        assert_eq!(holders, vec!["t2:b".to_string(), "t3:c".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_tokens_are_reclaimed() {
        let buckets = manager(Arc::new(InMemoryCoordinationStore::new()));
        let now = Utc::now();
        assert!(buckets.acquire_token_at(SERVICE_BUILD, "t1:a", now).await.unwrap());
        assert!(buckets.acquire_token_at(SERVICE_BUILD, "t2:b", now).await.unwrap());

        let later = now + Duration::seconds(61);
        assert!(buckets.acquire_token_at(SERVICE_BUILD, "t3:c", later).await.unwrap());
        assert_eq!(buckets.inspect_tokens(SERVICE_BUILD, later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let buckets = manager(Arc::new(InMemoryCoordinationStore::new()));
        let err = buckets.acquire_token("gpu", "t1:a").await.unwrap_err();
        assert!(matches!(err, SchedulerError::TokenBucketNotFound { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_token_times_out() {
        let buckets = manager(Arc::new(InMemoryCoordinationStore::new()));
        assert!(buckets.acquire_token(SERVICE_BUILD, "t1:a").await.unwrap());
        assert!(buckets.acquire_token(SERVICE_BUILD, "t2:b").await.unwrap());

        let acquired = buckets
            .wait_for_token(SERVICE_BUILD, "t3:c", std::time::Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!acquired);
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let buckets = manager(store.clone());
        store.set_unavailable(true);
        let err = buckets.acquire_token(SERVICE_BUILD, "t1:a").await.unwrap_err();
        assert!(matches!(err, SchedulerError::Store(_)));
    }
}
