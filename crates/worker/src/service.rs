use chrono::Utc;
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use chaos_core::models::{Task, TaskStatus};
use chaos_core::traits::{HandlerOutcome, TaskContext};
use chaos_core::{SchedulerError, SchedulerResult};
use chaos_dispatcher::TaskScheduler;

use crate::callbacks::CallbackDispatcher;
use crate::registry::HandlerRegistry;

/// 存储错误后 worker 循环的退避时间
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// 写入任务结果重试的最长退避
const FINALIZE_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// 处理器结束后需要写回存储的结果
enum Finalize {
    Complete,
    Defer(Duration),
    Cancelled,
    Fail(String),
}

/// Worker 池
///
/// 每个执行槽循环地从就绪队列阻塞弹出任务并调用对应的处理器。处理器可以在
/// 自己的执行槽中等待集群回调直到任务在真实世界里结束, 所以并发数决定了同时
/// 在途的长任务数量。
pub struct WorkerService {
    worker_id: String,
    scheduler: Arc<TaskScheduler>,
    registry: Arc<HandlerRegistry>,
    callbacks: Arc<CallbackDispatcher>,
    running: RwLock<HashMap<String, watch::Sender<bool>>>,
    concurrency: usize,
    pop_timeout: Duration,
    finalize_backoff: Duration,
}

pub struct WorkerServiceBuilder {
    worker_id: String,
    scheduler: Arc<TaskScheduler>,
    registry: Arc<HandlerRegistry>,
    callbacks: Arc<CallbackDispatcher>,
    concurrency: usize,
    pop_timeout: Duration,
    finalize_backoff: Duration,
}

impl WorkerServiceBuilder {
    pub fn new(
        worker_id: impl Into<String>,
        scheduler: Arc<TaskScheduler>,
        registry: Arc<HandlerRegistry>,
        callbacks: Arc<CallbackDispatcher>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            scheduler,
            registry,
            callbacks,
            concurrency: 4,
            pop_timeout: Duration::from_secs(1),
            finalize_backoff: Duration::from_millis(500),
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn pop_timeout(mut self, pop_timeout: Duration) -> Self {
        self.pop_timeout = pop_timeout;
        self
    }

    /// 写入任务结果失败后的首次退避, 之后按倍数增长
    pub fn finalize_backoff(mut self, backoff: Duration) -> Self {
        self.finalize_backoff = backoff;
        self
    }

    pub fn build(self) -> WorkerService {
        WorkerService {
            worker_id: self.worker_id,
            scheduler: self.scheduler,
            registry: self.registry,
            callbacks: self.callbacks,
            running: RwLock::new(HashMap::new()),
            concurrency: self.concurrency,
            pop_timeout: self.pop_timeout,
            finalize_backoff: self.finalize_backoff,
        }
    }
}

impl WorkerService {
    pub fn builder(
        worker_id: impl Into<String>,
        scheduler: Arc<TaskScheduler>,
        registry: Arc<HandlerRegistry>,
        callbacks: Arc<CallbackDispatcher>,
    ) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(worker_id, scheduler, registry, callbacks)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// 启动所有执行槽, 收到关闭信号后每个槽在当前任务结束后退出
    pub fn start(self: &Arc<Self>, shutdown_rx: broadcast::Receiver<()>) -> Vec<JoinHandle<()>> {
        info!(
            worker_id = %self.worker_id,
            "启动 {} 个 worker 执行槽",
            self.concurrency
        );
        (0..self.concurrency)
            .map(|slot| {
                let service = Arc::clone(self);
                let shutdown_rx = shutdown_rx.resubscribe();
                tokio::spawn(async move { service.run_slot(slot, shutdown_rx).await })
            })
            .collect()
    }

    async fn run_slot(&self, slot: usize, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            // 只在两次弹出之间检查关闭信号, 已经弹出的任务总会被处理完
            match shutdown_rx.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => {
                    info!(worker_id = %self.worker_id, slot, "worker 执行槽收到关闭信号");
                    break;
                }
            }

            if let Err(e) = self.run_once().await {
                error!(worker_id = %self.worker_id, slot, "worker 循环出错: {}", e);
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }

    /// 弹出并处理一个任务, 队列为空时返回 None
    pub async fn run_once(&self) -> SchedulerResult<Option<TaskStatus>> {
        match self.scheduler.next_task(self.pop_timeout).await? {
            Some(task) => self.process_task(task).await.map(Some),
            None => Ok(None),
        }
    }

    /// 执行一个已经离开就绪队列的任务并记录结果
    pub async fn process_task(&self, mut task: Task) -> SchedulerResult<TaskStatus> {
        task.attempt_count += 1;
        if let Err(e) = self.scheduler.mark_running(&mut task, Utc::now()).await {
            warn!(task_id = %task.id, "写入运行状态失败: {}", e);
        }

        let Some(handler) = self.registry.get(task.task_type).await else {
            error!(task_id = %task.id, task_type = %task.task_type, "没有注册对应的处理器");
            let reason = format!("no handler registered for {}", task.task_type);
            return self.finalize(task, Finalize::Fail(reason)).await;
        };

        // 先注册回调路由, 任务出现在 running 中时一定可以接收回调
        let callback_rx = self.callbacks.register(&task.id).await;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.running.write().await.insert(task.id.clone(), cancel_tx);
        gauge!("worker_running_tasks").increment(1.0);

        let span = info_span!(
            "execute_task",
            task_id = %task.id,
            trace_id = %task.trace_id,
            task_type = %task.task_type,
            attempt = task.attempt_count,
            worker_id = %self.worker_id,
        );
        let started = Instant::now();
        // 处理器 panic 按一次普通失败处理, 执行槽和 running 登记都不受影响
        let result = AssertUnwindSafe(
            handler.handle(TaskContext::new(task.clone(), cancel_rx, callback_rx)),
        )
        .catch_unwind()
        .instrument(span)
        .await
        .unwrap_or_else(|panic| {
            error!(task_id = %task.id, "处理器 panic: {}", panic_message(&*panic));
            Err(SchedulerError::handler_failure(format!(
                "handler panicked: {}",
                panic_message(&*panic)
            )))
        });
        histogram!("worker_handler_duration_seconds", "task_type" => task.task_type.as_str())
            .record(started.elapsed().as_secs_f64());

        gauge!("worker_running_tasks").decrement(1.0);
        self.callbacks.unregister(&task.id).await;
        let cancelled = self
            .running
            .write()
            .await
            .remove(&task.id)
            .map(|tx| *tx.borrow())
            .unwrap_or(false);

        let outcome = match result {
            Ok(HandlerOutcome::Completed) => Finalize::Complete,
            Ok(HandlerOutcome::Deferred(delay)) => Finalize::Defer(delay),
            Err(e) if cancelled => {
                info!(task_id = %task.id, "任务在取消后结束: {}", e);
                Finalize::Cancelled
            }
            Err(e) => {
                counter!("worker_handler_failures_total", "task_type" => task.task_type.as_str())
                    .increment(1);
                Finalize::Fail(match e {
                    SchedulerError::HandlerFailure(reason) => reason,
                    other => other.to_string(),
                })
            }
        };
        self.finalize(task, outcome).await
    }

    /// 把处理结果写回存储
    ///
    /// 任务此时已经不在任何队列结构里, 存储故障时一直退避重试直到写入成功,
    /// 否则任务会永久丢失。非存储错误直接返回。
    async fn finalize(&self, task: Task, outcome: Finalize) -> SchedulerResult<TaskStatus> {
        let mut backoff = self.finalize_backoff;
        let mut attempt: u32 = 1;
        loop {
            let now = Utc::now();
            let result = match &outcome {
                Finalize::Complete => self.scheduler.complete_task(task.clone(), now).await,
                Finalize::Defer(delay) => {
                    self.scheduler.defer_task(task.clone(), *delay, now).await
                }
                Finalize::Cancelled => self.scheduler.finalize_cancelled(task.clone(), now).await,
                Finalize::Fail(reason) => self.scheduler.fail_task(task.clone(), reason, now).await,
            };
            match result {
                Err(e @ SchedulerError::Store(_)) => {
                    counter!("worker_finalize_retries_total").increment(1);
                    error!(
                        task_id = %task.id,
                        attempt,
                        "写入任务结果失败, {}ms 后重试: {}",
                        backoff.as_millis(),
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(FINALIZE_BACKOFF_MAX);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// 向运行中的任务发送协作式取消信号, 任务不在本进程运行时返回 false
    pub async fn cancel_running(&self, task_id: &str) -> bool {
        match self.running.read().await.get(task_id) {
            Some(tx) => {
                tx.send_replace(true);
                info!(task_id, "已向运行中的任务发送取消信号");
                true
            }
            None => false,
        }
    }

    pub async fn running_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
