use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use chaos_core::models::{EventName, NamespaceLock, NamespaceLockStatus, TraceEvent};
use chaos_core::traits::{CoordinationStore, EventPublisher};
use chaos_core::{SchedulerError, SchedulerResult};

/// 命名空间租约锁管理器
///
/// 每个命名空间对应一条版本化记录 `{end_time, trace_id}`。获取与释放都是
/// "读记录 → 判断 → 带版本号写回", 版本号变化说明有并发写入, 重新读取后重试。
/// 持有者崩溃后租约到期即可被其他持有者获取, 不需要看门狗进程。
pub struct NamespaceLockManager {
    store: Arc<dyn CoordinationStore>,
    events: Arc<dyn EventPublisher>,
    key_prefix: String,
    registry_key: String,
    cas_retry_attempts: usize,
}

impl NamespaceLockManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        events: Arc<dyn EventPublisher>,
        key_prefix: &str,
        cas_retry_attempts: usize,
    ) -> Self {
        Self {
            store,
            events,
            key_prefix: key_prefix.to_string(),
            registry_key: format!("{key_prefix}:namespaces"),
            cas_retry_attempts: cas_retry_attempts.max(1),
        }
    }

    fn lock_key(&self, namespace: &str) -> String {
        format!("{}:ns_lock:{}", self.key_prefix, namespace)
    }

    /// 预先创建空闲的锁记录并登记到命名空间集合, 已存在的记录保持不变
    pub async fn initialize_namespaces(&self, namespaces: &[String]) -> SchedulerResult<usize> {
        let mut created = 0;
        for namespace in namespaces {
            let free = NamespaceLock::free(namespace.as_str());
            if self
                .store
                .record_compare_and_set(&self.lock_key(namespace), None, &free.to_fields())
                .await?
            {
                created += 1;
            }
            self.store.set_add(&self.registry_key, namespace).await?;
        }
        info!(
            "命名空间池初始化完成: 共 {} 个, 新建 {} 个",
            namespaces.len(),
            created
        );
        Ok(created)
    }

    pub async fn namespaces(&self) -> SchedulerResult<Vec<String>> {
        let mut names = self.store.set_members(&self.registry_key).await?;
        names.sort();
        Ok(names)
    }

    pub async fn acquire_lock(
        &self,
        namespace: &str,
        end_time: DateTime<Utc>,
        holder: &str,
    ) -> SchedulerResult<()> {
        self.acquire_lock_at(namespace, end_time, holder, Utc::now())
            .await
    }

    /// 获取命名空间租约
    ///
    /// 其他持有者的租约未到期时返回 `LockHeld`; 同一持有者再次获取视为续期。
    pub async fn acquire_lock_at(
        &self,
        namespace: &str,
        end_time: DateTime<Utc>,
        holder: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let key = self.lock_key(namespace);

        for attempt in 0..self.cas_retry_attempts {
            let record = self
                .store
                .record_get(&key)
                .await?
                .ok_or_else(|| SchedulerError::namespace_not_found(namespace))?;
            let current = NamespaceLock::from_fields(namespace, &record.fields);

            if current.is_held_at(now) && current.holder_trace_id != holder {
                counter!("resource_lock_rejected_total").increment(1);
                return Err(SchedulerError::LockHeld {
                    namespace: namespace.to_string(),
                    holder: current.holder_trace_id.clone(),
                    until: current.end_time_utc(),
                });
            }

            let next = NamespaceLock {
                namespace: namespace.to_string(),
                end_time: end_time.timestamp(),
                holder_trace_id: holder.to_string(),
            };
            if self
                .store
                .record_compare_and_set(&key, Some(record.version), &next.to_fields())
                .await?
            {
                counter!("resource_lock_acquired_total").increment(1);
                info!(
                    namespace,
                    trace_id = holder,
                    "命名空间已锁定至 {}",
                    end_time.format("%Y-%m-%d %H:%M:%S UTC")
                );
                self.events
                    .publish(TraceEvent::new(
                        EventName::NamespaceLocked,
                        holder,
                        json!({"namespace": namespace, "end_time": end_time.timestamp()}),
                    ))
                    .await;
                return Ok(());
            }

            counter!("resource_lock_contention_total").increment(1);
            debug!(namespace, attempt, "命名空间锁记录被并发修改, 重试");
            tokio::task::yield_now().await;
        }

        Err(SchedulerError::LockContended { key })
    }

    pub async fn release_lock(&self, namespace: &str, holder: &str) -> SchedulerResult<()> {
        self.release_lock_at(namespace, holder, Utc::now()).await
    }

    /// 释放租约, 只有当前持有者可以释放
    ///
    /// 迟到或重复的释放请求不会覆盖新持有者的租约。
    pub async fn release_lock_at(
        &self,
        namespace: &str,
        holder: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let key = self.lock_key(namespace);

        for attempt in 0..self.cas_retry_attempts {
            let record = self
                .store
                .record_get(&key)
                .await?
                .ok_or_else(|| SchedulerError::namespace_not_found(namespace))?;
            let current = NamespaceLock::from_fields(namespace, &record.fields);

            if current.holder_trace_id != holder {
                warn!(
                    namespace,
                    trace_id = holder,
                    owner = %current.holder_trace_id,
                    "拒绝非持有者释放命名空间"
                );
                return Err(SchedulerError::NotOwner {
                    namespace: namespace.to_string(),
                    holder: holder.to_string(),
                    owner: current.holder_trace_id,
                });
            }

            let released = NamespaceLock {
                namespace: namespace.to_string(),
                end_time: now.timestamp(),
                holder_trace_id: String::new(),
            };
            if self
                .store
                .record_compare_and_set(&key, Some(record.version), &released.to_fields())
                .await?
            {
                counter!("resource_lock_released_total").increment(1);
                info!(namespace, trace_id = holder, "命名空间已释放");
                self.events
                    .publish(TraceEvent::new(
                        EventName::NamespaceReleased,
                        holder,
                        json!({"namespace": namespace}),
                    ))
                    .await;
                return Ok(());
            }

            counter!("resource_lock_contention_total").increment(1);
            debug!(namespace, attempt, "命名空间锁记录被并发修改, 重试");
            tokio::task::yield_now().await;
        }

        Err(SchedulerError::LockContended { key })
    }

    pub async fn get_free_namespace(
        &self,
        end_time: DateTime<Utc>,
        holder: &str,
    ) -> SchedulerResult<Option<String>> {
        self.get_free_namespace_at(end_time, holder, Utc::now())
            .await
    }

    /// 按字典序依次尝试获取, 返回第一个成功锁定的命名空间
    ///
    /// 被占用或竞争失败的命名空间会被跳过, 存储错误直接返回。
    pub async fn get_free_namespace_at(
        &self,
        end_time: DateTime<Utc>,
        holder: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<String>> {
        for namespace in self.namespaces().await? {
            match self.acquire_lock_at(&namespace, end_time, holder, now).await {
                Ok(()) => return Ok(Some(namespace)),
                Err(e) if e.is_contention() => {
                    debug!(namespace = %namespace, "跳过不可用的命名空间: {}", e);
                }
                Err(SchedulerError::NamespaceNotFound { .. }) => {
                    warn!(namespace = %namespace, "命名空间已登记但缺少锁记录");
                }
                Err(e) => return Err(e),
            }
        }

        debug!(trace_id = holder, "当前没有空闲的命名空间");
        Ok(None)
    }

    /// 所有命名空间锁的只读快照
    pub async fn inspect_locks(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<NamespaceLockStatus>> {
        let mut statuses = Vec::new();
        for namespace in self.namespaces().await? {
            let Some(record) = self.store.record_get(&self.lock_key(&namespace)).await? else {
                continue;
            };
            let lock = NamespaceLock::from_fields(&namespace, &record.fields);
            statuses.push(NamespaceLockStatus {
                held: lock.is_held_at(now),
                end_time: lock.end_time_utc(),
                holder_trace_id: lock.holder_trace_id,
                namespace,
            });
        }
        Ok(statuses)
    }
}
