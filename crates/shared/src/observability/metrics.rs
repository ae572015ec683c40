//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 未安装 recorder 时所有记录函数都是空操作，库代码可以无条件调用。

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use super::ObservabilityConfig;

/// Metrics 资源守卫
pub struct MetricsHandle {
    pub addr: SocketAddr,
}

/// 初始化 Prometheus 指标导出
///
/// 在指定端口暴露 `/metrics` 端点，HTTP 监听由导出器在当前 tokio 运行时上启动。
pub fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    register_common_metrics(&config.service_name);
    info!("Metrics exporter listening on {}", addr);

    Ok(MetricsHandle { addr })
}

/// 注册通用指标描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "segment_rule_builds_total",
        "Total number of expression tree builds"
    );
    metrics::describe_histogram!(
        "segment_rule_build_duration_seconds",
        "Expression tree build duration in seconds"
    );

    metrics::describe_counter!(
        "segment_cart_evaluations_total",
        "Total number of in-memory candidate evaluations"
    );

    metrics::describe_counter!(
        "segment_pushdown_queries_total",
        "Total number of query-pushdown segment queries"
    );
    metrics::describe_histogram!(
        "segment_pushdown_query_duration_seconds",
        "Query-pushdown segment query duration in seconds"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录表达式树构建
#[inline]
pub fn record_rule_build(scope: &str, status: &str, duration_secs: f64) {
    metrics::counter!(
        "segment_rule_builds_total",
        "scope" => scope.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "segment_rule_build_duration_seconds",
        "scope" => scope.to_string()
    )
    .record(duration_secs);
}

/// 记录内存评估
#[inline]
pub fn record_candidate_evaluation(scope: &str, matched: bool) {
    metrics::counter!(
        "segment_cart_evaluations_total",
        "scope" => scope.to_string(),
        "matched" => matched.to_string()
    )
    .increment(1);
}

/// 记录下推查询
#[inline]
pub fn record_pushdown_query(status: &str, duration_secs: f64) {
    metrics::counter!(
        "segment_pushdown_queries_total",
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!("segment_pushdown_query_duration_seconds").record(duration_secs);
}
