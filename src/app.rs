use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use chaos_core::config::AppConfig;
use chaos_core::models::TaskType;
use chaos_core::traits::{ClusterCallback, CoordinationStore, EventPublisher, TaskHandler};
use chaos_dispatcher::TaskScheduler;
use chaos_infrastructure::{RedisCoordinationStore, StreamEventPublisher};
use chaos_resource::{service_for_task, NamespaceLockManager, TokenBucketManager};
use chaos_worker::{
    CallbackDispatcher, ClusterJobHandler, HandlerRegistry, NamespaceScopedHandler,
    RateLimitedHandler, WorkerService,
};

/// 主应用程序
///
/// 协调存储客户端在启动时创建一次, 以 `Arc<dyn CoordinationStore>` 注入所有组件。
pub struct Application {
    config: AppConfig,
    store: Arc<dyn CoordinationStore>,
    scheduler: Arc<TaskScheduler>,
    locks: Arc<NamespaceLockManager>,
    buckets: Arc<TokenBucketManager>,
    registry: Arc<HandlerRegistry>,
    callbacks: Arc<CallbackDispatcher>,
    worker: Arc<WorkerService>,
}

impl Application {
    /// 连接 Redis 并创建应用实例
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!(
            "连接协调存储: redis://{}:{}/{}",
            config.redis.host, config.redis.port, config.redis.database
        );
        let store = RedisCoordinationStore::connect(config.redis.clone())
            .await
            .context("连接Redis失败")?;
        info!("协调存储连接成功");

        Self::with_store(config, Arc::new(store)).await
    }

    /// 使用给定的协调存储创建应用实例
    pub async fn with_store(config: AppConfig, store: Arc<dyn CoordinationStore>) -> Result<Self> {
        config.validate().context("配置验证失败")?;

        let prefix = config.scheduler.key_prefix.as_str();
        let cas_retry_attempts = config.scheduler.cas_retry_attempts as usize;
        let events: Arc<dyn EventPublisher> = Arc::new(StreamEventPublisher::new(
            store.clone(),
            config.scheduler.event_stream_key.clone(),
            config.scheduler.event_stream_max_len,
        ));

        let scheduler = Arc::new(TaskScheduler::new(store.clone(), events.clone(), prefix));
        let locks = Arc::new(NamespaceLockManager::new(
            store.clone(),
            events.clone(),
            prefix,
            cas_retry_attempts,
        ));
        let buckets = Arc::new(TokenBucketManager::new(
            store.clone(),
            events.clone(),
            prefix,
            &config.rate_limit,
            cas_retry_attempts,
        ));

        let created = locks
            .initialize_namespaces(&config.namespace.names())
            .await
            .context("初始化命名空间池失败")?;
        info!("命名空间池就绪, 新建 {} 个锁记录", created);

        let registry = Arc::new(HandlerRegistry::new());
        let callbacks = Arc::new(CallbackDispatcher::new(events));
        let worker_id = resolve_worker_id(&config);
        let worker = Arc::new(
            WorkerService::builder(worker_id, scheduler.clone(), registry.clone(), callbacks.clone())
                .concurrency(config.worker.concurrency)
                .pop_timeout(Duration::from_secs(config.scheduler.pop_timeout_seconds))
                .build(),
        );

        let app = Self {
            config,
            store,
            scheduler,
            locks,
            buckets,
            registry,
            callbacks,
            worker,
        };
        app.register_default_handlers().await;
        Ok(app)
    }

    /// 为每种任务类型注册等待集群回调的处理器
    ///
    /// 受限流的类型外层包裹令牌桶, 故障注入任务外层再包裹命名空间租用。
    async fn register_default_handlers(&self) {
        let job_timeout = Duration::from_secs(self.config.worker.job_timeout_seconds);
        let defer_delay = Duration::from_secs(self.config.scheduler.delay_retry_minutes * 60);
        let lease = Duration::from_secs(self.config.namespace.lease_seconds);

        for task_type in TaskType::ALL {
            let mut handler: Arc<dyn TaskHandler> =
                Arc::new(ClusterJobHandler::new(task_type, job_timeout));
            if service_for_task(task_type).is_some() {
                handler = Arc::new(RateLimitedHandler::new(
                    handler,
                    self.buckets.clone(),
                    defer_delay,
                ));
            }
            if task_type == TaskType::FaultInjection {
                handler = Arc::new(NamespaceScopedHandler::new(
                    handler,
                    self.locks.clone(),
                    lease,
                    defer_delay,
                ));
            }
            self.registry.register(handler).await;
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn locks(&self) -> &Arc<NamespaceLockManager> {
        &self.locks
    }

    pub fn buckets(&self) -> &Arc<TokenBucketManager> {
        &self.buckets
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn worker(&self) -> &Arc<WorkerService> {
        &self.worker
    }

    /// 交给外部 Kubernetes watcher 的回调入口
    pub fn cluster_callback(&self) -> Arc<dyn ClusterCallback> {
        self.callbacks.clone()
    }

    /// 运行后台循环和 worker 池直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(worker_id = %self.worker.worker_id(), "启动调度服务");

        let mut handles: Vec<JoinHandle<()>> = vec![
            tokio::spawn(run_delayed_loop(
                self.scheduler.clone(),
                self.config.scheduler.delayed_scan_interval_seconds,
                shutdown_rx.resubscribe(),
            )),
            tokio::spawn(run_reconcile_loop(
                self.scheduler.clone(),
                self.config.scheduler.reconcile_interval_seconds,
                shutdown_rx.resubscribe(),
            )),
        ];

        if self.config.worker.enabled {
            handles.extend(self.worker.start(shutdown_rx.resubscribe()));
        } else {
            info!("Worker 已禁用, 仅运行延迟队列扫描和索引修复");
        }

        let _ = shutdown_rx.recv().await;
        info!("应用收到关闭信号, 等待后台任务退出");

        let timeout = Duration::from_secs(self.config.worker.shutdown_timeout_seconds);
        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("后台任务异常退出: {}", e);
                    }
                }
                info!("所有后台任务已退出");
            }
            Err(_) => {
                let running = self.worker.running_tasks().await;
                warn!(
                    "等待后台任务退出超时({}秒), 仍在运行的任务: {:?}",
                    timeout.as_secs(),
                    running
                );
            }
        }

        Ok(())
    }
}

/// 配置中未指定时使用主机名
fn resolve_worker_id(config: &AppConfig) -> String {
    if !config.worker.worker_id.is_empty() {
        return config.worker.worker_id.clone();
    }
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "chaos-worker".to_string())
}

/// 运行延迟队列扫描循环
async fn run_delayed_loop(
    scheduler: Arc<TaskScheduler>,
    interval_seconds: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = scheduler.process_delayed_tasks(Utc::now()).await {
                    error!("延迟队列扫描失败: {}", e);
                }
            }
            _ = shutdown_rx.recv() => {
                info!("延迟队列扫描循环收到关闭信号");
                break;
            }
        }
    }
}

/// 运行任务索引修复循环
async fn run_reconcile_loop(
    scheduler: Arc<TaskScheduler>,
    interval_seconds: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = scheduler.reconcile_index().await {
                    error!("任务索引修复失败: {}", e);
                }
            }
            _ = shutdown_rx.recv() => {
                info!("索引修复循环收到关闭信号");
                break;
            }
        }
    }
}
