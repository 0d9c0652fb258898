//! 调度与协调指标

use std::net::SocketAddr;

use anyhow::Result;
use keeper_core::ExecutionStatus;
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// 指标收集器
///
/// 未安装全局recorder时所有记录都是空操作。
#[derive(Clone)]
pub struct MetricsCollector {
    reconcile_passes_total: Counter,
    reconcile_duration: Histogram,
    inferred_completions_total: Counter,
    cron_fired_total: Counter,
    incomplete_executions: Gauge,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            reconcile_passes_total: counter!("keeper_reconcile_passes_total"),
            reconcile_duration: histogram!("keeper_reconcile_duration_seconds"),
            inferred_completions_total: counter!("keeper_inferred_completions_total"),
            cron_fired_total: counter!("keeper_cron_fired_total"),
            incomplete_executions: gauge!("keeper_incomplete_executions"),
        }
    }

    /// 记录一次下发结果，`outcome` 为 `ok` / `rejected` / `unreachable` / `error`
    pub fn record_dispatch(&self, outcome: &'static str) {
        counter!("keeper_dispatches_total", "outcome" => outcome).increment(1);
    }

    pub fn record_reconcile_pass(&self, duration_seconds: f64, incomplete: usize) {
        self.reconcile_passes_total.increment(1);
        self.reconcile_duration.record(duration_seconds);
        self.incomplete_executions.set(incomplete as f64);
    }

    pub fn record_transition(&self, to: ExecutionStatus) {
        counter!("keeper_status_transitions_total", "to" => to.as_str()).increment(1);
    }

    pub fn record_inferred_completion(&self) {
        self.inferred_completions_total.increment(1);
    }

    pub fn record_agent_unreachable(&self, host: &str) {
        counter!("keeper_agent_unreachable_total", "host" => host.to_string()).increment(1);
    }

    pub fn record_cron_fired(&self) {
        self.cron_fired_total.increment(1);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// 安装Prometheus导出器并在 `bind` 上提供 `/metrics`，需要在tokio运行时内调用
pub fn init_prometheus_exporter(bind: &str) -> Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| anyhow::anyhow!("无效的Prometheus监听地址 {}: {}", bind, e))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus导出器失败: {}", e))?;

    info!("Prometheus指标导出器已启动: {}", addr);
    Ok(())
}
