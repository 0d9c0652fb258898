//! 可观测性：领域事件的结构化日志、`metrics` 指标与可选的Prometheus导出器

pub mod metrics_collector;
pub mod structured_logger;

pub use metrics_collector::{init_prometheus_exporter, MetricsCollector};
pub use structured_logger::StructuredLogger;
