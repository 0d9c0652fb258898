use std::sync::Arc;

use anyhow::{Context, Result};
use keeper_core::{AgentPool, AppConfig};
use keeper_dispatcher::{
    run_periodic, CronScheduler, JobDispatcher, JobService, KeeperContext, PeriodicService,
    Reconciler, SpiderSynchronizer,
};
use keeper_infrastructure::{DatabaseManager, HttpAgentPool};
use tracing::info;

use crate::shutdown::ShutdownManager;

/// 主应用程序
///
/// 持有存储连接和组件上下文，负责启动和停止周期任务。
pub struct Application {
    database: DatabaseManager,
    context: KeeperContext,
}

impl Application {
    /// 连接存储并创建HTTP Agent池
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序");

        let database = DatabaseManager::new(&config.database)
            .await
            .context("连接数据库失败")?;
        let agents = HttpAgentPool::new(&config.agents).context("创建Agent池失败")?;
        info!("Agent池包含 {} 个主机: {:?}", config.agents.servers.len(), config.agents.servers);

        Ok(Self::from_parts(database, Arc::new(agents), config))
    }

    pub fn from_parts(
        database: DatabaseManager,
        agents: Arc<dyn AgentPool>,
        config: AppConfig,
    ) -> Self {
        let context = KeeperContext::from_database(&database, agents, config);
        Self { database, context }
    }

    pub fn context(&self) -> &KeeperContext {
        &self.context
    }

    pub fn job_service(&self) -> JobService {
        JobService::new(self.context.clone(), JobDispatcher::new(self.context.clone()))
    }

    /// 配置中启用的周期任务
    pub fn services(&self) -> Vec<Arc<dyn PeriodicService>> {
        let config = &self.context.config;
        let mut services: Vec<Arc<dyn PeriodicService>> = Vec::new();

        if config.scheduler.enabled {
            services.push(Arc::new(CronScheduler::new(
                self.context.clone(),
                JobDispatcher::new(self.context.clone()),
            )));
        }
        if config.reconciler.enabled {
            services.push(Arc::new(Reconciler::new(self.context.clone())));
        }
        if config.spider_sync.enabled {
            services.push(Arc::new(SpiderSynchronizer::new(self.context.clone())));
        }
        services
    }

    /// 为每个启用的周期任务启动一个tokio任务，并登记到关闭协调器
    pub async fn start(&self, shutdown: &ShutdownManager) -> usize {
        let services = self.services();
        let count = services.len();
        for service in services {
            let name = service.name();
            let handle = tokio::spawn(run_periodic(service, shutdown.subscribe()));
            shutdown.track(name, handle).await;
        }
        info!("已启动 {} 个周期任务", count);
        count
    }

    /// 关闭存储连接，应在周期任务退出之后调用
    pub async fn close(&self) {
        self.database.close().await;
    }
}
