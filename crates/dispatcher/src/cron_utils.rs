use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use tracing::debug;

use chaos_core::{SchedulerError, SchedulerResult};

/// CRON表达式解析和调度工具
///
/// 同时接受 6 字段(带秒)和常见的 5 字段表达式, 后者按第 0 秒触发。
pub struct CronScheduler {
    schedule: Schedule,
}

fn normalize(cron_expr: &str) -> String {
    let trimmed = cron_expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> SchedulerResult<Self> {
        let schedule =
            Schedule::from_str(&normalize(cron_expr)).map_err(|e| SchedulerError::InvalidCron {
                expr: cron_expr.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self { schedule })
    }

    /// 获取严格晚于 `from` 的下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = self.schedule.after(&from).next();
        if let Some(next) = next {
            debug!(
                "下次执行时间: {}, 基准时间: {}",
                next.format("%Y-%m-%d %H:%M:%S UTC"),
                from.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_expression_gets_seconds() {
        let scheduler = CronScheduler::new("*/5 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 2, 30).unwrap();
        let next = scheduler.next_execution_time(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 12, 5, 0).unwrap());
    }

    #[test]
    fn test_next_execution_is_strictly_after_base() {
        let scheduler = CronScheduler::new("0 0 * * * *").unwrap();
        let on_the_hour = Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap();
        let next = scheduler.next_execution_time(on_the_hour).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 14, 0, 0).unwrap());
    }
}
