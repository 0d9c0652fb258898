//! # 数据模型
//!
//! 爬虫任务调度系统的核心数据结构：项目、爬虫目录、任务实例（定义）与任务执行（运行）。
//!
//! ## 关系
//!
//! ```text
//! Project 1 ──> N JobInstance 1 ──> N JobExecution
//!         1 ──> N SpiderInstance
//! ```
//!
//! `JobExecution.job_instance_id` 只是弱引用：删除任务实例不会级联删除历史执行记录，
//! 查询时找不到实例会得到空的实例描述。
//!
//! ## 执行状态流转
//!
//! ```text
//! PENDING ──> RUNNING ──> FINISHED
//!    │           └──────> CANCELED
//!    ├──────────────────> FINISHED
//!    └──────────────────> CANCELED
//! ```
//!
//! FINISHED 与 CANCELED 为终态，不允许任何回退。

pub mod job_execution;
pub mod job_instance;
pub mod project;
pub mod spider;
pub mod stats;

pub use job_execution::*;
pub use job_instance::*;
pub use project::*;
pub use spider::*;
pub use stats::*;
