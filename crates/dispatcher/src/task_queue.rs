use chrono::{DateTime, TimeZone, Utc};
use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use chaos_core::models::{QueueLocation, QueueStats, Task, TaskStatus, TaskStatusRecord};
use chaos_core::traits::{CoordinationStore, StoreOp};
use chaos_core::{SchedulerError, SchedulerResult};

/// 条目在查找与删除之间被其他进程移动时, 取消操作的重试次数
const CANCEL_ATTEMPTS: usize = 3;

/// 队列在协调存储中使用的键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub ready: String,
    pub delayed: String,
    pub index: String,
    pub status: String,
    pub dead_letter: String,
}

impl QueueKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            ready: format!("{prefix}:tasks:ready"),
            delayed: format!("{prefix}:tasks:delayed"),
            index: format!("{prefix}:tasks:index"),
            status: format!("{prefix}:tasks:status"),
            dead_letter: format!("{prefix}:tasks:dead_letter"),
        }
    }
}

/// 一次延迟队列扫描的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromotionReport {
    pub promoted: Vec<Task>,
    pub dead_lettered: usize,
}

/// 一次索引修复的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub restored: usize,
    pub removed: usize,
}

/// 任务队列
///
/// - ready: 列表, 尾部追加头部弹出
/// - delayed: 有序集合, 分数为 execute_time
/// - index: 哈希, task id → `ready` | `delayed`
/// - status: 哈希, task id → [`TaskStatusRecord`] JSON
/// - dead_letter: 列表, 无法反序列化的原始条目
///
/// 队列结构与索引总是在同一个原子步骤中修改。
pub struct TaskQueue {
    store: Arc<dyn CoordinationStore>,
    keys: QueueKeys,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn CoordinationStore>, key_prefix: &str) -> Self {
        Self {
            store,
            keys: QueueKeys::new(key_prefix),
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    fn status_op(&self, task: &Task, now: DateTime<Utc>, message: Option<String>) -> SchedulerResult<StoreOp> {
        let record = TaskStatusRecord::from_task(task, now, message);
        Ok(StoreOp::hash_set(
            &self.keys.status,
            &task.id,
            serde_json::to_string(&record)?,
        ))
    }

    /// 追加到就绪队列尾部并把索引设为 `ready`
    pub async fn enqueue_ready(&self, task: &Task, now: DateTime<Utc>) -> SchedulerResult<()> {
        let ops = [
            StoreOp::list_push(&self.keys.ready, task.to_entry()?),
            StoreOp::hash_set(&self.keys.index, &task.id, QueueLocation::Ready.as_str()),
            self.status_op(task, now, None)?,
        ];
        self.store.execute_atomic(&ops).await
    }

    /// 放入延迟队列并把索引设为 `delayed`
    pub async fn enqueue_delayed(
        &self,
        task: &Task,
        execute_at: DateTime<Utc>,
        now: DateTime<Utc>,
        message: Option<String>,
    ) -> SchedulerResult<()> {
        let ops = [
            StoreOp::sorted_set_add(
                &self.keys.delayed,
                task.to_entry()?,
                execute_at.timestamp() as f64,
            ),
            StoreOp::hash_set(&self.keys.index, &task.id, QueueLocation::Delayed.as_str()),
            self.status_op(task, now, message)?,
        ];
        self.store.execute_atomic(&ops).await
    }

    /// 把所有到期的延迟任务移入就绪队列
    ///
    /// 每个条目以"从延迟队列删除成功"为前提原子地完成移动, 多个进程并发扫描时
    /// 同一条目只会有一个赢家; 已经被移走的条目再次扫描时不会被找到。
    pub async fn promote_due(&self, now: DateTime<Utc>) -> SchedulerResult<PromotionReport> {
        let due = self
            .store
            .sorted_set_range_by_score(&self.keys.delayed, now.timestamp() as f64)
            .await?;
        let mut report = PromotionReport::default();

        for raw in due {
            let mut task = match Task::from_entry(&raw) {
                Ok(task) => task,
                Err(e) => {
                    let guard = StoreOp::sorted_set_remove(&self.keys.delayed, &raw);
                    if self.move_to_dead_letter(guard, &raw, &e).await? {
                        report.dead_lettered += 1;
                    }
                    continue;
                }
            };

            task.status = TaskStatus::Pending;
            let guard = StoreOp::sorted_set_remove(&self.keys.delayed, &raw);
            let ops = [
                StoreOp::list_push(&self.keys.ready, task.to_entry()?),
                StoreOp::hash_set(&self.keys.index, &task.id, QueueLocation::Ready.as_str()),
                self.status_op(&task, now, None)?,
            ];
            if self.store.execute_if(&guard, &ops).await? {
                debug!(task_id = %task.id, "延迟任务已到期, 移入就绪队列");
                report.promoted.push(task);
            } else {
                debug!(task_id = %task.id, "延迟任务已被其他进程处理");
            }
        }

        Ok(report)
    }

    /// 从就绪队列头部阻塞弹出一个任务, 并移除其索引
    ///
    /// 无法反序列化的条目会被转入死信列表, 本次返回 `None`。
    pub async fn pop(&self, timeout: Duration) -> SchedulerResult<Option<Task>> {
        let Some(raw) = self
            .store
            .list_pop_blocking(&self.keys.ready, timeout)
            .await?
        else {
            return Ok(None);
        };

        let task = match Task::from_entry(&raw) {
            Ok(task) => task,
            Err(e) => {
                self.record_dead_letter(&raw, &e).await?;
                if let Some(id) = entry_id(&raw) {
                    self.remove_index_entry(&id).await;
                }
                return Ok(None);
            }
        };

        self.remove_index_entry(&task.id).await;
        Ok(Some(task))
    }

    /// 条目已经离开队列, 索引删除失败只记录日志, 由索引修复清理
    async fn remove_index_entry(&self, task_id: &str) {
        if let Err(e) = self.store.hash_delete(&self.keys.index, task_id).await {
            warn!(task_id, "移除任务索引失败, 等待索引修复: {}", e);
        }
    }

    /// 取消仍在队列中的任务
    ///
    /// 以索引为准定位条目, 再以"从对应结构删除成功"为前提原子地移除索引并写入
    /// Cancelled 状态。已经被取出执行的任务返回 `TaskNotFound`。
    pub async fn cancel(&self, task_id: &str, now: DateTime<Utc>) -> SchedulerResult<Task> {
        for attempt in 0..CANCEL_ATTEMPTS {
            let Some(tag) = self.store.hash_get(&self.keys.index, task_id).await? else {
                return Err(SchedulerError::task_not_found(task_id));
            };
            let location: QueueLocation = tag.parse()?;

            let found = match location {
                QueueLocation::Ready => self.find_ready(task_id).await?,
                QueueLocation::Delayed => self.find_delayed(task_id).await?,
            };
            let Some((raw, mut task)) = found else {
                debug!(task_id, attempt, %location, "索引指向的条目不存在, 重新读取索引");
                continue;
            };

            let guard = match location {
                QueueLocation::Ready => StoreOp::list_remove(&self.keys.ready, &raw),
                QueueLocation::Delayed => StoreOp::sorted_set_remove(&self.keys.delayed, &raw),
            };
            task.status = TaskStatus::Cancelled;
            let ops = [
                StoreOp::hash_delete(&self.keys.index, task_id),
                self.status_op(&task, now, Some("cancelled before execution".to_string()))?,
            ];
            if self.store.execute_if(&guard, &ops).await? {
                return Ok(task);
            }
        }

        Err(SchedulerError::task_not_found(task_id))
    }

    async fn find_ready(&self, task_id: &str) -> SchedulerResult<Option<(String, Task)>> {
        let entries = self.store.list_range(&self.keys.ready).await?;
        Ok(find_entry(entries, task_id))
    }

    async fn find_delayed(&self, task_id: &str) -> SchedulerResult<Option<(String, Task)>> {
        let entries = self
            .store
            .sorted_set_range_with_scores(&self.keys.delayed)
            .await?;
        Ok(find_entry(entries.into_iter().map(|(raw, _)| raw), task_id))
    }

    async fn move_to_dead_letter(
        &self,
        guard: StoreOp,
        raw: &str,
        err: &SchedulerError,
    ) -> SchedulerResult<bool> {
        let moved = self
            .store
            .execute_if(&guard, &[StoreOp::list_push(&self.keys.dead_letter, raw)])
            .await?;
        if moved {
            counter!("scheduler_tasks_dead_lettered_total").increment(1);
            warn!("丢弃格式错误的队列条目: {}", err);
        }
        Ok(moved)
    }

    async fn record_dead_letter(&self, raw: &str, err: &SchedulerError) -> SchedulerResult<()> {
        self.store.list_push(&self.keys.dead_letter, raw).await?;
        counter!("scheduler_tasks_dead_lettered_total").increment(1);
        warn!("丢弃格式错误的队列条目: {}", err);
        Ok(())
    }

    /// 根据队列结构修复索引
    ///
    /// 读取顺序为索引、延迟队列、就绪队列。到期移动只会把条目从延迟队列移到
    /// 就绪队列, 按这个顺序读取时, 扫描期间被移动的任务至少会被看到一次。
    /// 所有修改都以读取到的索引值为前提, 扫描期间被其他进程改写的索引项保持不变。
    pub async fn reconcile(&self) -> SchedulerResult<ReconcileReport> {
        let index = self.store.hash_get_all(&self.keys.index).await?;
        let delayed: HashSet<String> = self
            .store
            .sorted_set_range_with_scores(&self.keys.delayed)
            .await?
            .iter()
            .filter_map(|(raw, _)| entry_id(raw))
            .collect();
        let ready: HashSet<String> = self
            .store
            .list_range(&self.keys.ready)
            .await?
            .iter()
            .filter_map(|raw| entry_id(raw))
            .collect();

        let mut expected: HashMap<&str, QueueLocation> = HashMap::new();
        for id in &delayed {
            expected.insert(id, QueueLocation::Delayed);
        }
        for id in &ready {
            expected.insert(id, QueueLocation::Ready);
        }

        let mut report = ReconcileReport::default();
        for (id, location) in &expected {
            let seen = index.get(*id).map(String::as_str);
            if seen == Some(location.as_str()) {
                continue;
            }
            let swap = StoreOp::hash_compare_and_swap(
                &self.keys.index,
                *id,
                seen,
                Some(location.as_str()),
            );
            if self.store.execute_if(&swap, &[]).await? {
                report.restored += 1;
            } else {
                debug!(task_id = %id, "索引在修复期间已被改写, 跳过");
            }
        }
        for (id, tag) in &index {
            if expected.contains_key(id.as_str()) {
                continue;
            }
            let swap =
                StoreOp::hash_compare_and_swap(&self.keys.index, id, Some(tag.as_str()), None);
            if self.store.execute_if(&swap, &[]).await? {
                report.removed += 1;
            } else {
                debug!(task_id = %id, "索引在修复期间已被改写, 跳过");
            }
        }

        Ok(report)
    }

    pub async fn location(&self, task_id: &str) -> SchedulerResult<Option<QueueLocation>> {
        match self.store.hash_get(&self.keys.index, task_id).await? {
            Some(tag) => Ok(Some(tag.parse()?)),
            None => Ok(None),
        }
    }

    pub async fn write_status(
        &self,
        task: &Task,
        now: DateTime<Utc>,
        message: Option<String>,
    ) -> SchedulerResult<()> {
        let record = TaskStatusRecord::from_task(task, now, message);
        self.store
            .hash_set(&self.keys.status, &task.id, &serde_json::to_string(&record)?)
            .await
    }

    pub async fn get_status(&self, task_id: &str) -> SchedulerResult<Option<TaskStatusRecord>> {
        match self.store.hash_get(&self.keys.status, task_id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn stats(&self) -> SchedulerResult<QueueStats> {
        Ok(QueueStats {
            ready: self.store.list_len(&self.keys.ready).await?,
            delayed: self.store.sorted_set_len(&self.keys.delayed).await?,
            indexed: self.store.hash_len(&self.keys.index).await?,
            dead_letter: self.store.list_len(&self.keys.dead_letter).await?,
        })
    }

    /// 就绪队列中的任务, 按出队顺序
    pub async fn list_ready(&self) -> SchedulerResult<Vec<Task>> {
        Ok(self
            .store
            .list_range(&self.keys.ready)
            .await?
            .iter()
            .filter_map(|raw| Task::from_entry(raw).ok())
            .collect())
    }

    /// 延迟队列中的任务及其到期时间, 按到期时间升序
    pub async fn list_delayed(&self) -> SchedulerResult<Vec<(Task, DateTime<Utc>)>> {
        Ok(self
            .store
            .sorted_set_range_with_scores(&self.keys.delayed)
            .await?
            .iter()
            .filter_map(|(raw, score)| {
                let task = Task::from_entry(raw).ok()?;
                let due = Utc.timestamp_opt(*score as i64, 0).single()?;
                Some((task, due))
            })
            .collect())
    }

    pub async fn dead_letters(&self) -> SchedulerResult<Vec<String>> {
        self.store.list_range(&self.keys.dead_letter).await
    }
}

fn find_entry(entries: impl IntoIterator<Item = String>, task_id: &str) -> Option<(String, Task)> {
    entries.into_iter().find_map(|raw| {
        let task = Task::from_entry(&raw).ok()?;
        (task.id == task_id).then_some((raw, task))
    })
}

/// 尽力从条目中取出 id, 条目不是合法任务时也可能成功
fn entry_id(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value
        .get("id")
        .and_then(|id| id.as_str())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaos_core::models::TaskType;
    use chaos_infrastructure::InMemoryCoordinationStore;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn setup() -> (Arc<InMemoryCoordinationStore>, TaskQueue) {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let queue = TaskQueue::new(store.clone(), "test");
        (store, queue)
    }

    #[tokio::test]
    async fn test_enqueue_ready_and_pop_clears_index() {
        let (_store, queue) = setup();
        let now = Utc::now();
        let task = Task::new(TaskType::BuildImage, json!({})).with_id("t1");

        queue.enqueue_ready(&task, now).await.unwrap();
        assert_eq!(queue.location("t1").await.unwrap(), Some(QueueLocation::Ready));
        assert_eq!(queue.stats().await.unwrap().ready, 1);

        let popped = queue.pop(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(popped.id, "t1");
        assert_eq!(queue.location("t1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_ready_entry_goes_to_dead_letter() {
        let (store, queue) = setup();
        store
            .execute_atomic(&[
                StoreOp::list_push(&queue.keys().ready, r#"{"id":"bad","type":"nope"}"#),
                StoreOp::hash_set(&queue.keys().index, "bad", "ready"),
            ])
            .await
            .unwrap();

        assert!(queue.pop(Duration::from_millis(50)).await.unwrap().is_none());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.indexed, 0);
        assert_eq!(queue.dead_letters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_delayed_entry_is_dead_lettered_once() {
        let (store, queue) = setup();
        let now = Utc::now();
        store
            .sorted_set_add(&queue.keys().delayed, "garbage", (now.timestamp() - 5) as f64)
            .await
            .unwrap();

        let report = queue.promote_due(now).await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert!(report.promoted.is_empty());

        let report = queue.promote_due(now).await.unwrap();
        assert_eq!(report.dead_lettered, 0);
        assert_eq!(queue.stats().await.unwrap().dead_letter, 1);
    }

    #[tokio::test]
    async fn test_cancel_delayed_removes_everything() {
        let (_store, queue) = setup();
        let now = Utc::now();
        let task = Task::new(TaskType::FaultInjection, json!({})).with_id("t2");
        queue
            .enqueue_delayed(&task, now + ChronoDuration::hours(1), now, None)
            .await
            .unwrap();

        let cancelled = queue.cancel("t2", now).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.ready, stats.delayed, stats.indexed), (0, 0, 0));
        let record = queue.get_status("t2").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);

        assert!(queue.cancel("t2", now).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_cancel_with_stale_index_is_not_found() {
        let (store, queue) = setup();
        store
            .hash_set(&queue.keys().index, "ghost", "ready")
            .await
            .unwrap();

        let err = queue.cancel("ghost", Utc::now()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_reconcile_repairs_index() {
        let (store, queue) = setup();
        let now = Utc::now();
        let ready = Task::new(TaskType::CollectResult, json!({})).with_id("r1");
        let delayed = Task::new(TaskType::CollectResult, json!({})).with_id("d1");

        // 模拟写入队列后、写入索引前崩溃
        store
            .list_push(&queue.keys().ready, &ready.to_entry().unwrap())
            .await
            .unwrap();
        store
            .sorted_set_add(
                &queue.keys().delayed,
                &delayed.to_entry().unwrap(),
                (now.timestamp() + 60) as f64,
            )
            .await
            .unwrap();
        store
            .hash_set(&queue.keys().index, "gone", "delayed")
            .await
            .unwrap();

        let report = queue.reconcile().await.unwrap();
        assert_eq!(report, ReconcileReport { restored: 2, removed: 1 });
        assert_eq!(queue.location("r1").await.unwrap(), Some(QueueLocation::Ready));
        assert_eq!(queue.location("d1").await.unwrap(), Some(QueueLocation::Delayed));
        assert_eq!(queue.location("gone").await.unwrap(), None);

        let again = queue.reconcile().await.unwrap();
        assert_eq!(again, ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_list_delayed_in_due_order() {
        let (_store, queue) = setup();
        let now = Utc::now();
        for (id, offset) in [("late", 120), ("early", 60)] {
            let task = Task::new(TaskType::RunAlgorithm, json!({})).with_id(id);
            queue
                .enqueue_delayed(&task, now + ChronoDuration::seconds(offset), now, None)
                .await
                .unwrap();
        }

        let delayed = queue.list_delayed().await.unwrap();
        let ids: Vec<_> = delayed.iter().map(|(t, _)| t.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
        assert_eq!(delayed[0].1.timestamp(), now.timestamp() + 60);
    }
}
