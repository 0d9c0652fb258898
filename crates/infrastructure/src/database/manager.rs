use std::sync::Arc;
use std::time::Duration;

use keeper_core::{
    DatabaseConfig, JobExecutionRepository, JobInstanceRepository, KeeperError, KeeperResult,
    ProjectRepository, SpiderRepository,
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use super::sqlite::{
    SqliteJobExecutionRepository, SqliteJobInstanceRepository, SqliteProjectRepository,
    SqliteSpiderRepository,
};

/// 任务记录存储的连接池与仓储工厂
///
/// 进程启动时打开，关闭时调用 [`DatabaseManager::close`]。
#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 连接数据库并运行迁移
    pub async fn new(config: &DatabaseConfig) -> KeeperResult<Self> {
        info!("连接数据库: {}", config.url);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect(&config.url)
            .await
            .map_err(KeeperError::Database)?;

        let manager = Self { pool };
        manager.migrate().await?;
        info!("数据库连接成功");
        Ok(manager)
    }

    /// 内存数据库，只使用一个永不回收的连接，保证所有查询看到同一个库
    pub async fn in_memory() -> KeeperResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(KeeperError::Database)?;

        let manager = Self { pool };
        manager.migrate().await?;
        Ok(manager)
    }

    async fn migrate(&self) -> KeeperResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| KeeperError::DatabaseOperation(format!("运行数据库迁移失败: {e}")))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> KeeperResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(KeeperError::Database)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接已关闭");
    }

    pub fn project_repository(&self) -> Arc<dyn ProjectRepository> {
        Arc::new(SqliteProjectRepository::new(self.pool.clone()))
    }

    pub fn job_instance_repository(&self) -> Arc<dyn JobInstanceRepository> {
        Arc::new(SqliteJobInstanceRepository::new(self.pool.clone()))
    }

    pub fn job_execution_repository(&self) -> Arc<dyn JobExecutionRepository> {
        Arc::new(SqliteJobExecutionRepository::new(self.pool.clone()))
    }

    pub fn spider_repository(&self) -> Arc<dyn SpiderRepository> {
        Arc::new(SqliteSpiderRepository::new(self.pool.clone()))
    }
}
