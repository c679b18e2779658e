use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// 安装 Prometheus 导出器并注册指标说明
pub fn init_metrics(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus导出器失败")?;

    describe_counter!("scheduler_tasks_submitted_total", "已提交的任务数");
    describe_counter!("scheduler_tasks_promoted_total", "从延迟队列移入就绪队列的任务数");
    describe_counter!("scheduler_tasks_completed_total", "执行成功的任务数");
    describe_counter!("scheduler_tasks_retried_total", "失败后重新调度的任务数");
    describe_counter!("scheduler_tasks_failed_total", "重试次数用尽的任务数");
    describe_counter!("scheduler_tasks_cancelled_total", "被取消的任务数");
    describe_counter!("scheduler_tasks_dead_lettered_total", "转入死信列表的队列条目数");
    describe_counter!("resource_lock_acquired_total", "命名空间锁获取次数");
    describe_counter!("resource_lock_contention_total", "命名空间锁乐观事务冲突次数");
    describe_counter!("resource_token_acquired_total", "令牌获取次数");
    describe_counter!("resource_token_rejected_total", "令牌桶已满的拒绝次数");
    describe_gauge!("worker_running_tasks", "本进程正在执行的任务数");
    describe_histogram!("worker_handler_duration_seconds", "处理器执行耗时(秒)");

    info!("Prometheus 指标导出器已启动: http://{}/metrics", addr);
    Ok(())
}
