use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use chaos_core::models::{
    EventName, QueueStats, SubmitReceipt, Task, TaskStatus, TaskStatusRecord, TraceEvent,
};
use chaos_core::traits::{CoordinationStore, EventPublisher};
use chaos_core::{SchedulerError, SchedulerResult};

use crate::cron_utils::CronScheduler;
use crate::retry_service::{RetryDecision, TaskRetryService};
use crate::task_queue::{PromotionReport, ReconcileReport, TaskQueue};

/// 任务调度器
///
/// 负责任务生命周期中与队列相关的部分: 提交、延迟任务到期移动、取消、
/// 以及 worker 执行结束后的重试/重新调度/终结。
pub struct TaskScheduler {
    queue: TaskQueue,
    events: Arc<dyn EventPublisher>,
    retry: TaskRetryService,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        events: Arc<dyn EventPublisher>,
        key_prefix: &str,
    ) -> Self {
        Self {
            queue: TaskQueue::new(store, key_prefix),
            events,
            retry: TaskRetryService::new(),
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub async fn submit_task(&self, task: Task) -> SchedulerResult<SubmitReceipt> {
        self.submit_task_at(task, Utc::now()).await
    }

    /// 提交任务
    ///
    /// `immediate` 或没有未来的 `execute_time` 时进入就绪队列, 否则进入延迟队列。
    /// 带 cron 表达式且没有指定时间的任务在下一个触发时间执行。
    pub async fn submit_task_at(
        &self,
        mut task: Task,
        now: DateTime<Utc>,
    ) -> SchedulerResult<SubmitReceipt> {
        if task.id.trim().is_empty() {
            return Err(SchedulerError::invalid_task("任务ID不能为空"));
        }

        let cron = match task.cron_expr.as_deref() {
            Some(expr) if task.is_recurring() => Some(
                CronScheduler::new(expr).map_err(|e| SchedulerError::invalid_task(e.to_string()))?,
            ),
            _ => None,
        };

        if self.queue.location(&task.id).await?.is_some() {
            return Err(SchedulerError::invalid_task(format!(
                "任务 {} 已在队列中",
                task.id
            )));
        }

        if task.trace_id.is_empty() {
            task.trace_id = uuid::Uuid::new_v4().to_string();
        }

        let execute_at = if task.immediate {
            None
        } else {
            match (task.execute_at(), &cron) {
                (Some(at), _) => Some(at),
                (None, Some(cron)) => cron.next_execution_time(now),
                (None, None) => None,
            }
        };

        match execute_at.filter(|at| *at > now) {
            Some(at) => {
                task.status = TaskStatus::Scheduled;
                task.execute_time = Some(at.timestamp());
                self.queue.enqueue_delayed(&task, at, now, None).await?;
                info!(
                    task_id = %task.id,
                    trace_id = %task.trace_id,
                    task_type = %task.task_type,
                    "任务已提交到延迟队列, 执行时间: {}",
                    at.format("%Y-%m-%d %H:%M:%S UTC")
                );
                self.publish(&task, EventName::TaskScheduled, json!({"execute_time": at.timestamp()}))
                    .await;
            }
            None => {
                task.status = TaskStatus::Pending;
                self.queue.enqueue_ready(&task, now).await?;
                info!(
                    task_id = %task.id,
                    trace_id = %task.trace_id,
                    task_type = %task.task_type,
                    "任务已提交到就绪队列"
                );
                self.publish(&task, EventName::TaskSubmitted, json!({})).await;
            }
        }

        counter!("scheduler_tasks_submitted_total", "task_type" => task.task_type.as_str())
            .increment(1);
        Ok(SubmitReceipt {
            task_id: task.id,
            trace_id: task.trace_id,
        })
    }

    /// 把到期的延迟任务移入就绪队列, 可在多个进程上并发执行
    pub async fn process_delayed_tasks(&self, now: DateTime<Utc>) -> SchedulerResult<PromotionReport> {
        let report = self.queue.promote_due(now).await?;
        if !report.promoted.is_empty() {
            counter!("scheduler_tasks_promoted_total").increment(report.promoted.len() as u64);
            info!("延迟队列扫描: {} 个任务已到期", report.promoted.len());
            for task in &report.promoted {
                self.publish(task, EventName::TaskPromoted, json!({})).await;
            }
        }
        Ok(report)
    }

    /// 取消 Pending/Scheduled 状态的任务
    pub async fn cancel_task(&self, task_id: &str) -> SchedulerResult<()> {
        self.cancel_task_at(task_id, Utc::now()).await
    }

    pub async fn cancel_task_at(&self, task_id: &str, now: DateTime<Utc>) -> SchedulerResult<()> {
        let task = self.queue.cancel(task_id, now).await?;
        counter!("scheduler_tasks_cancelled_total").increment(1);
        info!(task_id = %task.id, trace_id = %task.trace_id, "任务已取消");
        self.publish(&task, EventName::TaskCancelled, json!({"running": false}))
            .await;
        Ok(())
    }

    pub async fn get_task_status(&self, task_id: &str) -> SchedulerResult<TaskStatusRecord> {
        self.queue
            .get_status(task_id)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(task_id))
    }

    pub async fn queue_stats(&self) -> SchedulerResult<QueueStats> {
        self.queue.stats().await
    }

    pub async fn reconcile_index(&self) -> SchedulerResult<ReconcileReport> {
        let report = self.queue.reconcile().await?;
        if report != ReconcileReport::default() {
            warn!(
                restored = report.restored,
                removed = report.removed,
                "任务索引已修复"
            );
        }
        Ok(report)
    }

    /// 从就绪队列取出下一个任务
    pub async fn next_task(&self, timeout: std::time::Duration) -> SchedulerResult<Option<Task>> {
        self.queue.pop(timeout).await
    }

    /// 记录开始执行; `attempt_count` 由调用方递增
    pub async fn mark_running(&self, task: &mut Task, now: DateTime<Utc>) -> SchedulerResult<()> {
        task.status = TaskStatus::Running;
        self.queue.write_status(task, now, None).await?;
        self.publish(task, EventName::TaskStarted, json!({"attempt": task.attempt_count}))
            .await;
        Ok(())
    }

    /// 处理器成功: 周期任务重新调度, 其余任务终结为 Completed
    pub async fn complete_task(&self, mut task: Task, now: DateTime<Utc>) -> SchedulerResult<TaskStatus> {
        if task.is_recurring() {
            let next = task
                .cron_expr
                .as_deref()
                .map(CronScheduler::new)
                .transpose()?
                .and_then(|cron| cron.next_execution_time(now));
            if let Some(next) = next {
                task.status = TaskStatus::Rescheduled;
                task.attempt_count = 0;
                task.execute_time = Some(next.timestamp());
                self.queue
                    .enqueue_delayed(&task, next, now, Some("rescheduled by cron".to_string()))
                    .await?;
                counter!("scheduler_tasks_rescheduled_total").increment(1);
                info!(
                    task_id = %task.id,
                    trace_id = %task.trace_id,
                    "周期任务已重新调度, 下次执行时间: {}",
                    next.format("%Y-%m-%d %H:%M:%S UTC")
                );
                self.publish(&task, EventName::TaskRescheduled, json!({"execute_time": next.timestamp()}))
                    .await;
                return Ok(TaskStatus::Rescheduled);
            }
            warn!(task_id = %task.id, "CRON表达式没有后续执行时间, 任务终结");
        }

        task.status = TaskStatus::Completed;
        self.queue.write_status(&task, now, None).await?;
        counter!("scheduler_tasks_completed_total", "task_type" => task.task_type.as_str())
            .increment(1);
        info!(task_id = %task.id, trace_id = %task.trace_id, "任务执行完成");
        self.publish(&task, EventName::TaskCompleted, json!({"attempts": task.attempt_count}))
            .await;
        Ok(TaskStatus::Completed)
    }

    /// 处理器失败: 有剩余次数时按线性退避放回延迟队列, 否则终结为 Error
    pub async fn fail_task(
        &self,
        mut task: Task,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<TaskStatus> {
        task.status = TaskStatus::Error;
        match self.retry.decide(&task, now) {
            RetryDecision::Retry { execute_at } => {
                task.execute_time = Some(execute_at.timestamp());
                self.queue
                    .enqueue_delayed(&task, execute_at, now, Some(reason.to_string()))
                    .await?;
                counter!("scheduler_tasks_retried_total").increment(1);
                warn!(
                    task_id = %task.id,
                    trace_id = %task.trace_id,
                    attempt = task.attempt_count,
                    "任务执行失败, 将于 {} 重试: {}",
                    execute_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    reason
                );
                self.publish(
                    &task,
                    EventName::TaskRetrying,
                    json!({"reason": reason, "attempt": task.attempt_count, "execute_time": execute_at.timestamp()}),
                )
                .await;
            }
            RetryDecision::Exhausted => {
                self.queue
                    .write_status(&task, now, Some(reason.to_string()))
                    .await?;
                counter!("scheduler_tasks_failed_total", "task_type" => task.task_type.as_str())
                    .increment(1);
                warn!(
                    task_id = %task.id,
                    trace_id = %task.trace_id,
                    attempts = task.attempt_count,
                    "任务重试次数已用尽: {}",
                    reason
                );
                self.publish(
                    &task,
                    EventName::TaskFailed,
                    json!({"reason": reason, "attempts": task.attempt_count}),
                )
                .await;
            }
        }
        Ok(TaskStatus::Error)
    }

    /// 处理器要求延后: 放回延迟队列, 本次执行不计入尝试次数
    pub async fn defer_task(
        &self,
        mut task: Task,
        delay: std::time::Duration,
        now: DateTime<Utc>,
    ) -> SchedulerResult<TaskStatus> {
        let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::seconds(60));
        let execute_at = now + delay;
        task.attempt_count = task.attempt_count.saturating_sub(1);
        task.status = TaskStatus::Scheduled;
        task.execute_time = Some(execute_at.timestamp());
        self.queue
            .enqueue_delayed(&task, execute_at, now, Some("deferred by handler".to_string()))
            .await?;
        counter!("scheduler_tasks_deferred_total").increment(1);
        debug!(
            task_id = %task.id,
            "任务延后至 {} 执行",
            execute_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        self.publish(&task, EventName::TaskDeferred, json!({"execute_time": execute_at.timestamp()}))
            .await;
        Ok(TaskStatus::Scheduled)
    }

    /// 运行中的任务在协作式取消后终结
    pub async fn finalize_cancelled(&self, mut task: Task, now: DateTime<Utc>) -> SchedulerResult<TaskStatus> {
        task.status = TaskStatus::Cancelled;
        self.queue
            .write_status(&task, now, Some("cancelled while running".to_string()))
            .await?;
        counter!("scheduler_tasks_cancelled_total").increment(1);
        info!(task_id = %task.id, trace_id = %task.trace_id, "运行中的任务已取消");
        self.publish(&task, EventName::TaskCancelled, json!({"running": true}))
            .await;
        Ok(TaskStatus::Cancelled)
    }

    async fn publish(&self, task: &Task, event_name: EventName, payload: serde_json::Value) {
        self.events
            .publish(TraceEvent::for_task(task, event_name, payload))
            .await;
    }
}
