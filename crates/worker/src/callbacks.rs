use async_trait::async_trait;
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use chaos_core::models::{CallbackEvent, CallbackKind};
use chaos_core::traits::{ClusterCallback, EventPublisher};

/// 集群回调分发器
///
/// 外部 watcher 的回调被转换成 [`CallbackEvent`], 写入事件流, 并按标签中的
/// `task_id` 投递给正在执行该任务的处理器。没有匹配的运行中任务时只记录日志。
///
/// 路由表只包含本进程内正在运行的任务, 不跨进程转发。watcher 必须和 worker
/// 池跑在同一个进程里, 接到其他进程任务的回调只会写入事件流, 对应处理器
/// 收不到通知, 只能等到自己的超时。
pub struct CallbackDispatcher {
    routes: RwLock<HashMap<String, mpsc::UnboundedSender<CallbackEvent>>>,
    events: Arc<dyn EventPublisher>,
}

impl CallbackDispatcher {
    pub fn new(events: Arc<dyn EventPublisher>) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// 为运行中的任务注册回调通道
    pub async fn register(&self, task_id: &str) -> mpsc::UnboundedReceiver<CallbackEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.write().await.insert(task_id.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, task_id: &str) {
        self.routes.write().await.remove(task_id);
    }

    /// 发布并投递一个回调事件, 返回是否送达了运行中的任务
    pub async fn dispatch(&self, event: CallbackEvent) -> bool {
        self.events.publish(event.to_trace_event()).await;

        let Some(task_id) = event.task_id().map(str::to_string) else {
            warn!(kind = ?event.kind, "回调事件缺少 task_id 标签, 已丢弃");
            counter!("worker_callbacks_dropped_total").increment(1);
            return false;
        };

        let delivered = match self.routes.read().await.get(&task_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        };
        if delivered {
            debug!(task_id = %task_id, "回调事件已投递");
            counter!("worker_callbacks_delivered_total").increment(1);
        } else {
            warn!(task_id = %task_id, "没有运行中的任务接收回调事件, 已丢弃");
            counter!("worker_callbacks_dropped_total").increment(1);
        }
        delivered
    }
}

#[async_trait]
impl ClusterCallback for CallbackDispatcher {
    async fn on_job_added(&self, labels: &HashMap<String, String>) {
        self.dispatch(CallbackEvent::new(CallbackKind::JobAdded, labels.clone()))
            .await;
    }

    async fn on_job_succeeded(&self, labels: &HashMap<String, String>) {
        self.dispatch(CallbackEvent::new(CallbackKind::JobSucceeded, labels.clone()))
            .await;
    }

    async fn on_job_failed(&self, labels: &HashMap<String, String>, reason: &str) {
        self.dispatch(CallbackEvent::new(CallbackKind::JobFailed, labels.clone()).with_reason(reason))
            .await;
    }

    async fn on_crd_condition_changed(
        &self,
        namespace: &str,
        name: &str,
        labels: &HashMap<String, String>,
    ) {
        self.dispatch(
            CallbackEvent::new(CallbackKind::CrdConditionChanged, labels.clone())
                .with_resource(namespace, name),
        )
        .await;
    }
}
