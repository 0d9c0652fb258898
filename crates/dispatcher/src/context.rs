use std::sync::Arc;

use keeper_core::{
    AgentPool, AppConfig, JobExecutionRepository, JobInstanceRepository, ProjectRepository,
    SpiderRepository,
};
use keeper_infrastructure::{DatabaseManager, MetricsCollector};

/// 进程级共享的组件上下文
///
/// 在启动时构造一次，显式传入每个组件；关闭时由持有者释放存储连接。
/// 组件之间不共享执行状态缓存，存储是唯一事实来源。
#[derive(Clone)]
pub struct KeeperContext {
    pub projects: Arc<dyn ProjectRepository>,
    pub job_instances: Arc<dyn JobInstanceRepository>,
    pub job_executions: Arc<dyn JobExecutionRepository>,
    pub spiders: Arc<dyn SpiderRepository>,
    pub agents: Arc<dyn AgentPool>,
    pub config: Arc<AppConfig>,
    pub metrics: Arc<MetricsCollector>,
}

impl KeeperContext {
    pub fn new(
        projects: Arc<dyn ProjectRepository>,
        job_instances: Arc<dyn JobInstanceRepository>,
        job_executions: Arc<dyn JobExecutionRepository>,
        spiders: Arc<dyn SpiderRepository>,
        agents: Arc<dyn AgentPool>,
        config: AppConfig,
    ) -> Self {
        Self {
            projects,
            job_instances,
            job_executions,
            spiders,
            agents,
            config: Arc::new(config),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    /// 使用SQLite仓储构造上下文
    pub fn from_database(
        database: &DatabaseManager,
        agents: Arc<dyn AgentPool>,
        config: AppConfig,
    ) -> Self {
        Self::new(
            database.project_repository(),
            database.job_instance_repository(),
            database.job_execution_repository(),
            database.spider_repository(),
            agents,
            config,
        )
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }
}
