#[cfg(test)]
mod cron_utils_tests {
    use chaos_dispatcher::cron_utils::*;

    use chrono::{TimeZone, Timelike, Utc};

    #[test]
    fn test_cron_scheduler_creation() {
        let scheduler = CronScheduler::new("0 0 0 * * *");
        assert!(scheduler.is_ok());
        let scheduler = CronScheduler::new("invalid");
        assert!(scheduler.is_err());
    }

    #[test]
    fn test_next_execution_time() {
        let scheduler = CronScheduler::new("0 0 0 * * *").unwrap();

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let next = scheduler.next_execution_time(now).unwrap();

        assert_eq!(next.hour(), 0);
        assert_eq!(next.minute(), 0);
        assert_eq!(next.second(), 0);
        assert!(next > now);
    }

    #[test]
    fn test_expression_validation() {
        assert!(CronScheduler::new("0 0 0 * * *").is_ok());
        assert!(CronScheduler::new("0 */5 * * * *").is_ok());
        assert!(CronScheduler::new("30 2 * * *").is_ok());
        assert!(CronScheduler::new("invalid").is_err());
        assert!(CronScheduler::new("0 0 0 32 * *").is_err());
        assert!(CronScheduler::new("").is_err());
    }
}
