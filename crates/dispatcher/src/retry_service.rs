use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use chaos_core::models::{RetryPolicy, Task};

/// 处理器失败后的重试决策
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// 在指定时间重新放入延迟队列
    Retry { execute_at: DateTime<Utc> },
    /// 重试次数用尽, 以 Error 终结
    Exhausted,
}

/// 线性退避的重试服务
///
/// `attempt_count` 由 worker 在每次执行前递增, 因此这里看到的是已经执行过的次数。
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskRetryService;

impl TaskRetryService {
    pub fn new() -> Self {
        Self
    }

    pub fn decide(&self, task: &Task, now: DateTime<Utc>) -> RetryDecision {
        if task.can_retry() {
            let execute_at =
                self.calculate_next_retry_time(&task.retry_policy, task.attempt_count, now);
            debug!(
                task_id = %task.id,
                attempt = task.attempt_count,
                max_attempts = task.retry_policy.effective_max_attempts(),
                "任务将于 {} 重试",
                execute_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            RetryDecision::Retry { execute_at }
        } else {
            RetryDecision::Exhausted
        }
    }

    /// 计算下次重试时间: now + backoff_seconds * attempt_count
    pub fn calculate_next_retry_time(
        &self,
        policy: &RetryPolicy,
        attempt_count: u32,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let delay = policy
            .backoff_seconds
            .saturating_mul(u64::from(attempt_count))
            .min(i64::MAX as u64);
        now + Duration::seconds(delay as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaos_core::models::TaskType;
    use serde_json::json;

    #[test]
    fn test_calculate_next_retry_time_is_linear() {
        let service = TaskRetryService::new();
        let policy = RetryPolicy::new(5, 30);
        let now = Utc::now();

        assert_eq!(service.calculate_next_retry_time(&policy, 1, now) - now, Duration::seconds(30));
        assert_eq!(service.calculate_next_retry_time(&policy, 2, now) - now, Duration::seconds(60));
        assert_eq!(service.calculate_next_retry_time(&policy, 4, now) - now, Duration::seconds(120));
    }

    #[test]
    fn test_decide() {
        let service = TaskRetryService::new();
        let now = Utc::now();
        let mut task = Task::new(TaskType::BuildImage, json!({}))
            .with_retry_policy(RetryPolicy::new(3, 10));

        task.attempt_count = 2;
        assert_eq!(
            service.decide(&task, now),
            RetryDecision::Retry {
                execute_at: now + Duration::seconds(20)
            }
        );

        task.attempt_count = 3;
        assert_eq!(service.decide(&task, now), RetryDecision::Exhausted);
    }
}
