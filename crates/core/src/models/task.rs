use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{SchedulerError, SchedulerResult};

/// 任务类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    FaultInjection,
    BuildImage,
    BuildDataset,
    RunAlgorithm,
    CollectResult,
    RestartService,
    CronJob,
}

impl TaskType {
    pub const ALL: [TaskType; 7] = [
        TaskType::FaultInjection,
        TaskType::BuildImage,
        TaskType::BuildDataset,
        TaskType::RunAlgorithm,
        TaskType::CollectResult,
        TaskType::RestartService,
        TaskType::CronJob,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::FaultInjection => "fault_injection",
            TaskType::BuildImage => "build_image",
            TaskType::BuildDataset => "build_dataset",
            TaskType::RunAlgorithm => "run_algorithm",
            TaskType::CollectResult => "collect_result",
            TaskType::RestartService => "restart_service",
            TaskType::CronJob => "cron_job",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fault_injection" => Ok(TaskType::FaultInjection),
            "build_image" => Ok(TaskType::BuildImage),
            "build_dataset" => Ok(TaskType::BuildDataset),
            "run_algorithm" => Ok(TaskType::RunAlgorithm),
            "collect_result" => Ok(TaskType::CollectResult),
            "restart_service" => Ok(TaskType::RestartService),
            "cron_job" => Ok(TaskType::CronJob),
            other => Err(SchedulerError::invalid_task(format!(
                "未知的任务类型: {other}"
            ))),
        }
    }
}

/// 任务状态
///
/// ```text
/// Pending → {Scheduled | Running} → {Completed | Error | Cancelled | Rescheduled(→Pending)}
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Scheduled,
    Running,
    Completed,
    Error,
    Cancelled,
    Rescheduled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Rescheduled => "rescheduled",
        }
    }

    /// 只有 Pending/Scheduled 状态的任务可以被 CancelTask 取消
    pub fn is_cancellable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Scheduled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 重试策略
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_seconds() -> u64 {
    30
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_seconds: default_backoff_seconds(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_seconds: u64) -> Self {
        Self {
            max_attempts,
            backoff_seconds,
        }
    }

    /// 至少执行一次
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// 任务定义
///
/// 队列中保存的是完整的任务 JSON, 因此 worker 取出条目后即可得到执行所需的全部信息。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub immediate: bool,
    /// Unix 时间戳(秒)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub project_id: String,
}

impl Task {
    /// 创建一个立即执行的任务, id 由 uuid 生成
    pub fn new(task_type: TaskType, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type,
            immediate: true,
            execute_time: None,
            cron_expr: None,
            payload,
            retry_policy: RetryPolicy::default(),
            attempt_count: 0,
            status: TaskStatus::Pending,
            trace_id: String::new(),
            group_id: String::new(),
            project_id: String::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_execute_time(mut self, execute_time: DateTime<Utc>) -> Self {
        self.immediate = false;
        self.execute_time = Some(execute_time.timestamp());
        self
    }

    pub fn with_cron(mut self, cron_expr: impl Into<String>) -> Self {
        self.immediate = false;
        self.cron_expr = Some(cron_expr.into());
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self.project_id = project_id.into();
        self
    }

    pub fn is_recurring(&self) -> bool {
        self.cron_expr
            .as_deref()
            .map(|expr| !expr.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn execute_at(&self) -> Option<DateTime<Utc>> {
        self.execute_time
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
    }

    /// 是否还有剩余的重试次数(attempt_count 已包含本次执行)
    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.retry_policy.effective_max_attempts()
    }

    /// 序列化为队列条目
    pub fn to_entry(&self) -> SchedulerResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 从队列条目反序列化, 失败时返回 `MalformedEntry`
    pub fn from_entry(raw: &str) -> SchedulerResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SchedulerError::MalformedEntry(format!("{e}: {}", truncate(raw, 128))))
    }
}

fn truncate(raw: &str, max: usize) -> &str {
    match raw.char_indices().nth(max) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}

/// 任务在队列中的位置标签, 由任务索引记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLocation {
    Ready,
    Delayed,
}

impl QueueLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueLocation::Ready => "ready",
            QueueLocation::Delayed => "delayed",
        }
    }
}

impl fmt::Display for QueueLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueLocation {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(QueueLocation::Ready),
            "delayed" => Ok(QueueLocation::Delayed),
            other => Err(SchedulerError::Internal(format!(
                "未知的任务索引标签: {other}"
            ))),
        }
    }
}

/// SubmitTask 的返回值
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub task_id: String,
    pub trace_id: String,
}

/// 任务状态记录, 任务离开索引后仍可查询
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatusRecord {
    pub task_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub trace_id: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskStatusRecord {
    pub fn from_task(task: &Task, now: DateTime<Utc>, message: Option<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type,
            status: task.status,
            attempt_count: task.attempt_count,
            trace_id: task.trace_id.clone(),
            updated_at: now,
            message,
        }
    }
}

/// 队列统计
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: u64,
    pub delayed: u64,
    pub indexed: u64,
    pub dead_letter: u64,
}
