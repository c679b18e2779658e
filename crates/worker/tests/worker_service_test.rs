#[cfg(test)]
mod worker_service_tests {
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use mockall::mock;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    use chaos_core::models::{labels, QueueLocation, RetryPolicy, Task, TaskStatus, TaskType};
    use chaos_core::traits::{
        ClusterCallback, HandlerOutcome, NoopEventPublisher, TaskContext, TaskHandler,
    };
    use chaos_core::{SchedulerError, SchedulerResult};
    use chaos_dispatcher::TaskScheduler;
    use chaos_infrastructure::InMemoryCoordinationStore;
    use chaos_worker::{CallbackDispatcher, ClusterJobHandler, HandlerRegistry, WorkerService};

    mock! {
        pub Handler {}

        #[async_trait]
        impl TaskHandler for Handler {
            fn task_type(&self) -> TaskType;
            async fn handle(&self, ctx: TaskContext) -> SchedulerResult<HandlerOutcome>;
        }
    }

    struct Fixture {
        store: Arc<InMemoryCoordinationStore>,
        scheduler: Arc<TaskScheduler>,
        registry: Arc<HandlerRegistry>,
        callbacks: Arc<CallbackDispatcher>,
        worker: Arc<WorkerService>,
    }

    fn fixture(concurrency: usize) -> Fixture {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let events = Arc::new(NoopEventPublisher);
        let scheduler = Arc::new(TaskScheduler::new(store.clone(), events.clone(), "chaos"));
        let registry = Arc::new(HandlerRegistry::new());
        let callbacks = Arc::new(CallbackDispatcher::new(events));
        let worker = Arc::new(
            WorkerService::builder("worker-test", scheduler.clone(), registry.clone(), callbacks.clone())
                .concurrency(concurrency)
                .pop_timeout(Duration::from_millis(20))
                .finalize_backoff(Duration::from_millis(10))
                .build(),
        );
        Fixture {
            store,
            scheduler,
            registry,
            callbacks,
            worker,
        }
    }

    async fn wait_until_running(worker: &WorkerService, task_id: &str) {
        for _ in 0..200 {
            if worker.running_tasks().await.iter().any(|id| id == task_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {task_id} never started");
    }

    struct Fixed(TaskType, HandlerOutcome);

    #[async_trait]
    impl TaskHandler for Fixed {
        fn task_type(&self) -> TaskType {
            self.0
        }

        async fn handle(&self, _ctx: TaskContext) -> SchedulerResult<HandlerOutcome> {
            Ok(self.1)
        }
    }

    /// 处理过程中存储断开, 一段时间后恢复
    struct StoreOutageDuringRun {
        store: Arc<InMemoryCoordinationStore>,
        outage: Duration,
    }

    #[async_trait]
    impl TaskHandler for StoreOutageDuringRun {
        fn task_type(&self) -> TaskType {
            TaskType::BuildDataset
        }

        async fn handle(&self, _ctx: TaskContext) -> SchedulerResult<HandlerOutcome> {
            self.store.set_unavailable(true);
            let store = self.store.clone();
            let outage = self.outage;
            tokio::spawn(async move {
                tokio::time::sleep(outage).await;
                store.set_unavailable(false);
            });
            Err(SchedulerError::handler_failure("cluster unreachable"))
        }
    }

    /// id 为 `p1` 的任务直接 panic, 其余任务正常完成
    struct PanicsOnFirst;

    #[async_trait]
    impl TaskHandler for PanicsOnFirst {
        fn task_type(&self) -> TaskType {
            TaskType::CollectResult
        }

        async fn handle(&self, ctx: TaskContext) -> SchedulerResult<HandlerOutcome> {
            if ctx.task.id == "p1" {
                panic!("result bucket missing");
            }
            Ok(HandlerOutcome::Completed)
        }
    }

    #[tokio::test]
    async fn test_always_failing_handler_runs_exactly_max_attempts() {
        let f = fixture(1);
        let mut handler = MockHandler::new();
        handler.expect_task_type().return_const(TaskType::BuildDataset);
        handler
            .expect_handle()
            .times(3)
            .returning(|_| Err(SchedulerError::handler_failure("boom")));
        f.registry.register(Arc::new(handler)).await;

        let task = Task::new(TaskType::BuildDataset, json!({}))
            .with_id("flaky")
            .with_retry_policy(RetryPolicy::new(3, 1));
        f.scheduler.submit_task(task).await.unwrap();

        let far = Utc::now() + ChronoDuration::days(1);
        for _ in 0..3 {
            f.scheduler.process_delayed_tasks(far).await.unwrap();
            let status = f.worker.run_once().await.unwrap();
            assert_eq!(status, Some(TaskStatus::Error));
        }

        f.scheduler.process_delayed_tasks(far).await.unwrap();
        assert_eq!(f.worker.run_once().await.unwrap(), None);

        let record = f.scheduler.get_task_status("flaky").await.unwrap();
        assert_eq!(record.status, TaskStatus::Error);
        assert_eq!(record.attempt_count, 3);
        assert_eq!(record.message.as_deref(), Some("boom"));
        assert_eq!(f.scheduler.queue().location("flaky").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_deferred_task_does_not_consume_attempt() {
        let f = fixture(1);
        f.registry
            .register(Arc::new(Fixed(
                TaskType::RunAlgorithm,
                HandlerOutcome::Deferred(Duration::from_secs(300)),
            )))
            .await;
        f.scheduler
            .submit_task(Task::new(TaskType::RunAlgorithm, json!({})).with_id("algo"))
            .await
            .unwrap();

        assert_eq!(f.worker.run_once().await.unwrap(), Some(TaskStatus::Scheduled));
        let delayed = f.scheduler.queue().list_delayed().await.unwrap();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].0.attempt_count, 0);
        assert_eq!(
            f.scheduler.queue().location("algo").await.unwrap(),
            Some(QueueLocation::Delayed)
        );
    }

    #[tokio::test]
    async fn test_missing_handler_fails_task() {
        let f = fixture(1);
        f.scheduler
            .submit_task(
                Task::new(TaskType::CollectResult, json!({}))
                    .with_id("orphan")
                    .with_retry_policy(RetryPolicy::new(1, 1)),
            )
            .await
            .unwrap();

        assert_eq!(f.worker.run_once().await.unwrap(), Some(TaskStatus::Error));
        let record = f.scheduler.get_task_status("orphan").await.unwrap();
        assert_eq!(record.status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_callback_completes_running_task() {
        let f = fixture(1);
        f.registry
            .register(Arc::new(ClusterJobHandler::new(
                TaskType::BuildImage,
                Duration::from_secs(10),
            )))
            .await;
        f.scheduler
            .submit_task(Task::new(TaskType::BuildImage, json!({})).with_id("build-1"))
            .await
            .unwrap();

        let worker = f.worker.clone();
        let run = tokio::spawn(async move { worker.run_once().await });
        wait_until_running(&f.worker, "build-1").await;

        let job_labels = HashMap::from([(labels::TASK_ID.to_string(), "build-1".to_string())]);
        f.callbacks.on_job_added(&job_labels).await;
        f.callbacks.on_job_succeeded(&job_labels).await;

        let status = run.await.unwrap().unwrap();
        assert_eq!(status, Some(TaskStatus::Completed));
        assert!(f.worker.running_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_running_task_is_finalized_as_cancelled() {
        let f = fixture(1);
        f.registry
            .register(Arc::new(ClusterJobHandler::new(
                TaskType::FaultInjection,
                Duration::from_secs(10),
            )))
            .await;
        f.scheduler
            .submit_task(Task::new(TaskType::FaultInjection, json!({})).with_id("chaos-1"))
            .await
            .unwrap();

        let worker = f.worker.clone();
        let run = tokio::spawn(async move { worker.run_once().await });
        wait_until_running(&f.worker, "chaos-1").await;

        // 已经离开队列的任务不能通过队列取消
        assert!(f.scheduler.cancel_task("chaos-1").await.unwrap_err().is_not_found());
        assert!(f.worker.cancel_running("chaos-1").await);
        assert!(!f.worker.cancel_running("chaos-2").await);

        let status = run.await.unwrap().unwrap();
        assert_eq!(status, Some(TaskStatus::Cancelled));
        let record = f.scheduler.get_task_status("chaos-1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops_on_shutdown() {
        let f = fixture(2);
        f.registry
            .register(Arc::new(Fixed(TaskType::CollectResult, HandlerOutcome::Completed)))
            .await;
        for i in 0..5 {
            f.scheduler
                .submit_task(Task::new(TaskType::CollectResult, json!({})).with_id(format!("c{i}")))
                .await
                .unwrap();
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handles = f.worker.start(shutdown_rx);

        for _ in 0..200 {
            let mut done = 0;
            for i in 0..5 {
                if let Ok(record) = f.scheduler.get_task_status(&format!("c{i}")).await {
                    if record.status == TaskStatus::Completed {
                        done += 1;
                    }
                }
            }
            if done == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.scheduler.queue_stats().await.unwrap().ready, 0);

        shutdown_tx.send(()).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
        for i in 0..5 {
            let record = f.scheduler.get_task_status(&format!("c{i}")).await.unwrap();
            assert_eq!(record.status, TaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_failed_task_survives_store_outage_after_pop() {
        let f = fixture(1);
        f.registry
            .register(Arc::new(StoreOutageDuringRun {
                store: f.store.clone(),
                outage: Duration::from_millis(80),
            }))
            .await;
        f.scheduler
            .submit_task(
                Task::new(TaskType::BuildDataset, json!({}))
                    .with_id("dataset-1")
                    .with_retry_policy(RetryPolicy::new(3, 1)),
            )
            .await
            .unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), f.worker.run_once())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, Some(TaskStatus::Error));

        // 重试写入成功后任务回到延迟队列, 不会丢失
        let stats = f.scheduler.queue_stats().await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.indexed, 1);
        assert_eq!(
            f.scheduler.queue().location("dataset-1").await.unwrap(),
            Some(QueueLocation::Delayed)
        );
        let record = f.scheduler.get_task_status("dataset-1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Error);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.message.as_deref(), Some("cluster unreachable"));
    }

    #[tokio::test]
    async fn test_handler_panic_fails_task_and_keeps_slot_alive() {
        let f = fixture(1);
        f.registry.register(Arc::new(PanicsOnFirst)).await;
        f.scheduler
            .submit_task(
                Task::new(TaskType::CollectResult, json!({}))
                    .with_id("p1")
                    .with_retry_policy(RetryPolicy::new(1, 1)),
            )
            .await
            .unwrap();
        f.scheduler
            .submit_task(Task::new(TaskType::CollectResult, json!({})).with_id("p2"))
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handles = f.worker.start(shutdown_rx);

        let mut finished = false;
        for _ in 0..200 {
            if let Ok(record) = f.scheduler.get_task_status("p2").await {
                if record.status == TaskStatus::Completed {
                    finished = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(finished, "second task was never consumed");

        let record = f.scheduler.get_task_status("p1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Error);
        assert!(record
            .message
            .as_deref()
            .is_some_and(|m| m.contains("result bucket missing")));
        assert!(f.worker.running_tasks().await.is_empty());

        shutdown_tx.send(()).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
