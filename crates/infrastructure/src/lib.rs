//! # Keeper Infrastructure
//!
//! 基础设施实现：SQLite任务记录存储、Scrapyd兼容的HTTP Agent客户端与多主机Agent池、
//! 结构化日志与指标收集。

pub mod agent;
pub mod database;
pub mod observability;

pub use agent::{HttpAgentPool, ScrapydAgent};
pub use database::{
    DatabaseManager, SqliteJobExecutionRepository, SqliteJobInstanceRepository,
    SqliteProjectRepository, SqliteSpiderRepository,
};
pub use observability::{MetricsCollector, StructuredLogger};
