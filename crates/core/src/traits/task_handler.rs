use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::models::{CallbackEvent, Task, TaskType};
use crate::SchedulerResult;

/// 处理器的执行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Completed,
    /// 暂时无法执行(例如等待令牌超时), 延后重新入队且不计入尝试次数
    Deferred(Duration),
}

/// 单次任务执行的上下文
///
/// 携带任务本身、协作式取消信号以及关联到该任务的集群回调事件。
pub struct TaskContext {
    pub task: Task,
    cancellation: watch::Receiver<bool>,
    callbacks: mpsc::UnboundedReceiver<CallbackEvent>,
}

impl TaskContext {
    pub fn new(
        task: Task,
        cancellation: watch::Receiver<bool>,
        callbacks: mpsc::UnboundedReceiver<CallbackEvent>,
    ) -> Self {
        Self {
            task,
            cancellation,
            callbacks,
        }
    }

    /// 不接收取消信号和回调的上下文
    pub fn detached(task: Task) -> Self {
        let (_cancel_tx, cancellation) = watch::channel(false);
        let (_callback_tx, callbacks) = mpsc::unbounded_channel();
        Self::new(task, cancellation, callbacks)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancellation.borrow()
    }

    /// 等待取消信号; 发送端已关闭时永不返回
    pub async fn cancelled(&mut self) {
        let raised = self.cancellation.wait_for(|cancelled| *cancelled).await.is_ok();
        if !raised {
            std::future::pending::<()>().await;
        }
    }

    /// 等待下一个回调事件, 超时或通道关闭时返回 None
    pub async fn next_callback(&mut self, timeout: Duration) -> Option<CallbackEvent> {
        tokio::time::timeout(timeout, self.callbacks.recv())
            .await
            .ok()
            .flatten()
    }

    /// 同时等待回调事件和取消信号, 取消优先
    pub async fn wait_callback(&mut self, timeout: Duration) -> CallbackWait {
        let cancellation = &mut self.cancellation;
        let callbacks = &mut self.callbacks;

        let cancelled = async {
            let raised = cancellation.wait_for(|cancelled| *cancelled).await.is_ok();
            if !raised {
                std::future::pending::<()>().await;
            }
        };
        let next_event = async {
            match callbacks.recv().await {
                Some(event) => event,
                None => std::future::pending().await,
            }
        };
        let wait = async {
            tokio::select! {
                biased;
                _ = cancelled => CallbackWait::Cancelled,
                event = next_event => CallbackWait::Event(event),
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(CallbackWait::TimedOut)
    }
}

/// [`TaskContext::wait_callback`] 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackWait {
    Event(CallbackEvent),
    Cancelled,
    TimedOut,
}

/// 任务类型处理器
///
/// worker 在自己的执行槽中调用 `handle`, 处理器可以长时间阻塞等待集群回调。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> TaskType;

    async fn handle(&self, ctx: TaskContext) -> SchedulerResult<HandlerOutcome>;
}
