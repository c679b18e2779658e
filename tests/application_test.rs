#[cfg(test)]
mod application_tests {
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use chaos_core::config::AppConfig;
    use chaos_core::models::{labels, NamespaceLockStatus, Task, TaskStatus, TaskType};
    use chaos_core::traits::CoordinationStore;
    use chaos_infrastructure::InMemoryCoordinationStore;
    use chaos_scheduler::app::Application;
    use chaos_scheduler::shutdown::ShutdownManager;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.worker.worker_id = "it-worker".to_string();
        config.worker.concurrency = 2;
        config.worker.shutdown_timeout_seconds = 5;
        config.namespace.count = 2;
        config
    }

    async fn wait_for_status(app: &Application, task_id: &str, status: TaskStatus) {
        for _ in 0..300 {
            if let Ok(record) = app.scheduler().get_task_status(task_id).await {
                if record.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached {status:?}");
    }

    async fn wait_until_running(app: &Application, task_id: &str) {
        for _ in 0..300 {
            if app.worker().running_tasks().await.iter().any(|id| id == task_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never started");
    }

    async fn wait_for_held_locks(app: &Application, expected: usize) -> Vec<NamespaceLockStatus> {
        for _ in 0..300 {
            let locks = app.locks().inspect_locks(chrono::Utc::now()).await.unwrap();
            if locks.iter().filter(|l| l.held).count() == expected {
                return locks;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {expected} held namespaces");
    }

    fn job_labels(task_id: &str) -> HashMap<String, String> {
        HashMap::from([
            (labels::TASK_ID.to_string(), task_id.to_string()),
            (labels::TASK_TYPE.to_string(), "fault_injection".to_string()),
        ])
    }

    #[tokio::test]
    async fn test_wiring_seeds_namespaces_and_handlers() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let app = Application::with_store(test_config(), store).await.unwrap();

        let locks = app.locks().inspect_locks(chrono::Utc::now()).await.unwrap();
        let names: Vec<_> = locks.iter().map(|l| l.namespace.as_str()).collect();
        assert_eq!(names, vec!["ns-0", "ns-1"]);
        assert!(locks.iter().all(|l| !l.held));
        assert_eq!(app.registry().task_types().await.len(), TaskType::ALL.len());
        assert_eq!(app.worker().worker_id(), "it-worker");
    }

    #[tokio::test]
    async fn test_application_from_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[namespace]\nprefix = \"chaos-ns\"\ncount = 3\n\n[worker]\nworker_id = \"file-worker\"\nenabled = false"
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let config = AppConfig::load(Some(&path)).unwrap();

        let store = Arc::new(InMemoryCoordinationStore::new());
        let app = Application::with_store(config, store).await.unwrap();
        assert_eq!(
            app.locks().namespaces().await.unwrap(),
            vec!["chaos-ns-0", "chaos-ns-1", "chaos-ns-2"]
        );
        assert_eq!(app.worker().worker_id(), "file-worker");
        assert!(!app.config().worker.enabled);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = test_config();
        config.rate_limit.max_concurrent_builds = 0;
        let store = Arc::new(InMemoryCoordinationStore::new());
        assert!(Application::with_store(config, store).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fault_injection_end_to_end() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let app = Arc::new(Application::with_store(test_config(), store.clone()).await.unwrap());
        let shutdown = ShutdownManager::new();

        let runner = {
            let app = app.clone();
            let shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move { app.run(shutdown_rx).await })
        };

        let receipt = app
            .scheduler()
            .submit_task(
                Task::new(TaskType::FaultInjection, json!({"fault": "network-delay"}))
                    .with_id("chaos-e2e"),
            )
            .await
            .unwrap();
        wait_until_running(&app, "chaos-e2e").await;

        // 运行期间占用一个命名空间
        let locks = wait_for_held_locks(&app, 1).await;
        let held: Vec<_> = locks.iter().filter(|l| l.held).collect();
        assert_eq!(held[0].namespace, "ns-0");
        assert_eq!(held[0].holder_trace_id, receipt.trace_id);
        assert_eq!(
            app.scheduler().get_task_status("chaos-e2e").await.unwrap().status,
            TaskStatus::Running
        );

        let callback = app.cluster_callback();
        callback.on_job_added(&job_labels("chaos-e2e")).await;
        callback
            .on_crd_condition_changed("ns-0", "network-delay-1", &job_labels("chaos-e2e"))
            .await;
        wait_for_status(&app, "chaos-e2e", TaskStatus::Completed).await;

        wait_for_held_locks(&app, 0).await;
        let stream_len = store
            .stream_len(&app.config().scheduler.event_stream_key)
            .await
            .unwrap();
        assert!(stream_len >= 5);

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(10), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_job_is_retried_then_cancelled_while_delayed() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let app = Arc::new(Application::with_store(test_config(), store).await.unwrap());
        let shutdown = ShutdownManager::new();
        let runner = {
            let app = app.clone();
            let shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move { app.run(shutdown_rx).await })
        };

        app.scheduler()
            .submit_task(Task::new(TaskType::CollectResult, json!({})).with_id("collect-1"))
            .await
            .unwrap();
        wait_until_running(&app, "collect-1").await;

        app.cluster_callback()
            .on_job_failed(&job_labels("collect-1"), "BackoffLimitExceeded")
            .await;
        wait_for_status(&app, "collect-1", TaskStatus::Error).await;

        // 默认退避 30 秒, 任务仍在延迟队列中
        let stats = app.scheduler().queue_stats().await.unwrap();
        assert_eq!(stats.delayed, 1);
        app.scheduler().cancel_task("collect-1").await.unwrap();
        let record = app.scheduler().get_task_status("collect-1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert_eq!(app.scheduler().queue_stats().await.unwrap().indexed, 0);

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(10), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
