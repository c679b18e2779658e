use chrono::{DateTime, Utc};
use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error, Clone)]
pub enum SchedulerError {
    #[error("无效的任务: {0}")]
    InvalidTask(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("命名空间未找到: {namespace}")]
    NamespaceNotFound { namespace: String },

    #[error("令牌桶未找到: {service}")]
    TokenBucketNotFound { service: String },

    #[error("namespace {namespace} is locked by {holder} until {until}")]
    LockHeld {
        namespace: String,
        holder: String,
        until: DateTime<Utc>,
    },

    #[error("乐观事务冲突次数过多: {key}")]
    LockContended { key: String },

    #[error("命名空间 {namespace} 当前由 {owner} 持有, {holder} 无权释放")]
    NotOwner {
        namespace: String,
        holder: String,
        owner: String,
    },

    #[error("任务处理失败: {0}")]
    HandlerFailure(String),

    #[error("队列条目格式错误: {0}")]
    MalformedEntry(String),

    #[error("协调存储错误: {0}")]
    Store(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    pub fn invalid_task<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTask(msg.into())
    }

    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }

    pub fn namespace_not_found<S: Into<String>>(namespace: S) -> Self {
        Self::NamespaceNotFound {
            namespace: namespace.into(),
        }
    }

    pub fn handler_failure<S: Into<String>>(msg: S) -> Self {
        Self::HandlerFailure(msg.into())
    }

    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::TaskNotFound { .. }
                | SchedulerError::NamespaceNotFound { .. }
                | SchedulerError::TokenBucketNotFound { .. }
        )
    }

    /// 预期内的资源竞争, 调用方可以重试或换一个命名空间
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            SchedulerError::LockHeld { .. } | SchedulerError::LockContended { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::LockContended { .. }
                | SchedulerError::HandlerFailure(_)
                | SchedulerError::Store(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
