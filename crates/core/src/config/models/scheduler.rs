use serde::{Deserialize, Serialize};

/// 任务队列与调度循环配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 所有队列键的前缀
    pub key_prefix: String,
    pub delayed_scan_interval_seconds: u64,
    pub reconcile_interval_seconds: u64,
    /// worker 单次阻塞弹出的超时时间, 同时决定其响应关闭信号的速度
    pub pop_timeout_seconds: u64,
    pub cas_retry_attempts: u32,
    /// 处理器延后执行时的默认等待时间
    pub delay_retry_minutes: u64,
    pub event_stream_key: String,
    pub event_stream_max_len: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            key_prefix: "chaos".to_string(),
            delayed_scan_interval_seconds: 5,
            reconcile_interval_seconds: 60,
            pop_timeout_seconds: 1,
            cas_retry_attempts: 16,
            delay_retry_minutes: 5,
            event_stream_key: "chaos:trace_events".to_string(),
            event_stream_max_len: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.key_prefix.is_empty() {
            return Err(anyhow::anyhow!("队列键前缀不能为空"));
        }

        if self.delayed_scan_interval_seconds == 0 {
            return Err(anyhow::anyhow!("延迟队列扫描间隔必须大于0"));
        }

        if self.reconcile_interval_seconds == 0 {
            return Err(anyhow::anyhow!("索引修复间隔必须大于0"));
        }

        if self.pop_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("阻塞弹出超时时间必须大于0"));
        }

        if self.cas_retry_attempts == 0 {
            return Err(anyhow::anyhow!("乐观事务重试次数必须大于0"));
        }

        if self.event_stream_key.is_empty() {
            return Err(anyhow::anyhow!("事件流键名不能为空"));
        }

        Ok(())
    }
}

/// Worker 池配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// 为空时使用主机名
    pub worker_id: String,
    /// 并发执行槽数量, 每个长时间运行的任务占用一个
    pub concurrency: usize,
    pub shutdown_timeout_seconds: u64,
    /// 等待集群回调确认任务结束的最长时间
    pub job_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: String::new(),
            concurrency: 4,
            shutdown_timeout_seconds: 30,
            job_timeout_seconds: 3600,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enabled && self.concurrency == 0 {
            return Err(anyhow::anyhow!("Worker并发数必须大于0"));
        }

        if self.shutdown_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("关闭超时时间必须大于0"));
        }

        if self.job_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("任务回调等待时间必须大于0"));
        }

        Ok(())
    }
}
