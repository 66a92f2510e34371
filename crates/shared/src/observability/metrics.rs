//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl MetricsHandle {
    /// 停止指标 HTTP 服务器
    pub fn shutdown(self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册积分同步相关指标的描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "accrual_lookups_total",
        "Total number of accrual service lookups by outcome"
    );
    metrics::describe_histogram!(
        "accrual_lookup_duration_seconds",
        "Accrual service lookup duration in seconds"
    );
    metrics::describe_counter!(
        "accrual_transitions_total",
        "Total number of order state transitions by result"
    );
    metrics::describe_counter!(
        "accrual_credited_points_total",
        "Total points credited to user balances"
    );
    metrics::describe_counter!(
        "accrual_rate_limit_pauses_total",
        "Total number of global pauses caused by rate limiting"
    );
    metrics::describe_gauge!(
        "accrual_rate_limit_pause_seconds",
        "Length of the most recent rate limit pause"
    );
    metrics::describe_counter!(
        "accrual_jobs_dispatched_total",
        "Total number of jobs handed to workers"
    );
    metrics::describe_gauge!(
        "worker_last_run_timestamp",
        "Unix timestamp of the last dispatcher cycle"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次外部积分查询
#[inline]
pub fn record_accrual_lookup(outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "accrual_lookups_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "accrual_lookup_duration_seconds",
        "outcome" => outcome.to_string()
    )
    .record(duration_secs);
}

/// 记录订单状态迁移结果
#[inline]
pub fn record_transition(result: &str) {
    metrics::counter!(
        "accrual_transitions_total",
        "result" => result.to_string()
    )
    .increment(1);
}

/// 记录入账积分
#[inline]
pub fn record_accrual_credit(points: f64) {
    // counter 只接受整数，按分累加
    let cents = (points * 100.0).round().max(0.0) as u64;
    metrics::counter!("accrual_credited_points_total").increment(cents);
}

/// 记录限流导致的全局暂停
#[inline]
pub fn record_rate_limit_pause(pause_secs: f64) {
    metrics::counter!("accrual_rate_limit_pauses_total").increment(1);
    metrics::gauge!("accrual_rate_limit_pause_seconds").set(pause_secs);
}

/// 记录派发给 Worker 的任务数
#[inline]
pub fn record_jobs_dispatched(count: usize) {
    metrics::counter!("accrual_jobs_dispatched_total").increment(count as u64);
}

/// 记录 Worker 最近一次运行时间
#[inline]
pub fn set_worker_last_run(worker: &str) {
    metrics::gauge!(
        "worker_last_run_timestamp",
        "worker" => worker.to_string()
    )
    .set(chrono::Utc::now().timestamp() as f64);
}
