//! # 仓储接口
//!
//! 任务记录存储的数据访问抽象。所有组件只通过这些接口读写存储，
//! 存储是执行状态的唯一事实来源，组件不在单次处理之外缓存执行状态。
//!
//! ## 接口
//!
//! - [`ProjectRepository`] - 项目及其级联删除
//! - [`JobInstanceRepository`] - 任务实例（定义）的增删改查
//! - [`JobExecutionRepository`] - 执行记录，包含只进不退的条件更新
//! - [`SpiderRepository`] - 按项目同步的爬虫目录
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use keeper_core::traits::JobExecutionRepository;
//!
//! async fn pending_count(repo: &dyn JobExecutionRepository) -> KeeperResult<usize> {
//!     let incomplete = repo.list_incomplete().await?;
//!     Ok(incomplete
//!         .iter()
//!         .filter(|e| e.running_status == ExecutionStatus::Pending)
//!         .count())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::KeeperResult;
use crate::models::{
    ExecutionStatus, ExecutionUpdate, JobExecution, JobInstance, Project, SpiderInstance,
};

/// 项目仓储接口
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    /// 创建项目，返回带数据库ID的实体
    async fn create(&self, project: &Project) -> KeeperResult<Project>;

    async fn get_by_id(&self, id: i64) -> KeeperResult<Option<Project>>;

    async fn get_by_name(&self, name: &str) -> KeeperResult<Option<Project>>;

    async fn list(&self) -> KeeperResult<Vec<Project>>;

    /// 删除项目
    ///
    /// 在同一个事务内级联删除该项目的任务实例、执行记录和爬虫目录。
    /// 项目不存在时返回 `ProjectNotFound`。
    async fn delete(&self, id: i64) -> KeeperResult<()>;
}

/// 任务实例仓储接口
///
/// 任务实例只由操作员修改，协调器从不写入。
#[async_trait]
pub trait JobInstanceRepository: Send + Sync {
    async fn create(&self, instance: &JobInstance) -> KeeperResult<JobInstance>;

    async fn get_by_id(&self, id: i64) -> KeeperResult<Option<JobInstance>>;

    async fn update(&self, instance: &JobInstance) -> KeeperResult<()>;

    async fn set_enabled(&self, id: i64, enabled: bool) -> KeeperResult<()>;

    /// 删除任务实例
    ///
    /// 不会删除历史执行记录，执行记录对实例的引用只是弱引用。
    async fn delete(&self, id: i64) -> KeeperResult<()>;

    async fn list_by_project(&self, project_id: i64) -> KeeperResult<Vec<JobInstance>>;

    async fn list_periodic(&self, project_id: i64) -> KeeperResult<Vec<JobInstance>>;

    /// 所有项目中已启用的周期任务，供CRON调度器加载
    async fn list_enabled_periodic(&self) -> KeeperResult<Vec<JobInstance>>;
}

/// 执行记录的时间信息与所属爬虫，用于运行统计
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionTiming {
    pub spider_name: String,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub inferred_completion: bool,
}

/// 执行记录仓储接口
///
/// # 状态约束
///
/// 状态写入只允许前进（PENDING → RUNNING → FINISHED/CANCELED）。
/// [`JobExecutionRepository::apply_update`] 在存储层以条件更新实现：
/// 只有当前状态属于目标状态的前驱（或与目标相同且非终态）时才会写入，
/// 因此并发的协调轮次和取消请求不会把记录改回旧状态。
#[async_trait]
pub trait JobExecutionRepository: Send + Sync {
    /// 创建执行记录（单个事务内完成）
    async fn create(&self, execution: &JobExecution) -> KeeperResult<JobExecution>;

    async fn get_by_id(&self, id: i64) -> KeeperResult<Option<JobExecution>>;

    /// 状态为 PENDING 或 RUNNING 的执行记录
    async fn list_incomplete(&self) -> KeeperResult<Vec<JobExecution>>;

    /// 某个任务实例下未完成的执行记录
    async fn list_incomplete_by_instance(
        &self,
        job_instance_id: i64,
    ) -> KeeperResult<Vec<JobExecution>>;

    /// 条件更新执行记录
    ///
    /// # 返回值
    ///
    /// 记录被修改时返回 `true`；当前状态不允许该转换（例如已是终态）时返回 `false`。
    /// 更新目标为 PENDING 时返回 `IllegalTransition`。
    async fn apply_update(&self, id: i64, update: &ExecutionUpdate) -> KeeperResult<bool>;

    /// 按状态查询项目下的执行记录，按最近修改时间倒序
    async fn list_by_status(
        &self,
        project_id: i64,
        statuses: &[ExecutionStatus],
        limit: i64,
    ) -> KeeperResult<Vec<JobExecution>>;

    /// 项目下在 `since` 之后创建的执行记录
    async fn list_created_since(
        &self,
        project_id: i64,
        since: DateTime<Utc>,
    ) -> KeeperResult<Vec<JobExecution>>;

    /// 项目下仍能关联到任务实例的执行记录时间信息
    async fn list_timings(&self, project_id: i64) -> KeeperResult<Vec<ExecutionTiming>>;
}

/// 爬虫目录仓储接口
#[async_trait]
pub trait SpiderRepository: Send + Sync {
    async fn create(&self, spider: &SpiderInstance) -> KeeperResult<SpiderInstance>;

    async fn delete(&self, id: i64) -> KeeperResult<()>;

    async fn list_by_project(&self, project_id: i64) -> KeeperResult<Vec<SpiderInstance>>;
}
