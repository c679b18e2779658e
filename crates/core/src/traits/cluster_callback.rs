use async_trait::async_trait;
use std::collections::HashMap;

/// 集群协调器回调接口
///
/// 由调度器实现, 外部的 Kubernetes watcher 在 Job 和自定义资源状态变化时调用。
/// 标签中的 `task_id`/`trace_id` 用于关联到正在运行的任务。
#[async_trait]
pub trait ClusterCallback: Send + Sync {
    async fn on_job_added(&self, labels: &HashMap<String, String>);

    async fn on_job_succeeded(&self, labels: &HashMap<String, String>);

    async fn on_job_failed(&self, labels: &HashMap<String, String>, reason: &str);

    async fn on_crd_condition_changed(
        &self,
        namespace: &str,
        name: &str,
        labels: &HashMap<String, String>,
    );
}
