//! # Keeper Dispatcher
//!
//! 调度协调引擎：
//!
//! - [`JobDispatcher`] 把任务实例下发到Agent并创建PENDING执行记录
//! - [`CronScheduler`] 按分钟匹配已启用的周期任务并触发下发
//! - [`Reconciler`] 周期性拉取Agent状态并只进不退地合并到存储
//! - [`StatsAggregator`] 状态分组、每小时直方图、爬虫运行时长
//! - [`SpiderSynchronizer`] 刷新每个项目的爬虫目录
//! - [`JobService`] 面向操作员的项目与任务管理
//!
//! 所有组件通过显式传入的 [`KeeperContext`] 共享存储与Agent池。

pub mod context;
pub mod cron_scheduler;
pub mod dispatcher;
pub mod job_service;
pub mod reconciler;
pub mod runner;
pub mod spider_sync;
pub mod stats;

pub use context::KeeperContext;
pub use cron_scheduler::{CronScheduler, CronTickReport, MAX_CATCH_UP_MINUTES};
pub use dispatcher::JobDispatcher;
pub use job_service::{JobService, JobSubmission};
pub use reconciler::{ReconcileReport, Reconciler};
pub use runner::{run_periodic, PeriodicService};
pub use spider_sync::{SpiderSyncOutcome, SpiderSynchronizer};
pub use stats::{readable_duration, StatsAggregator};
