use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use keeper_core::{KeeperResult, Project, SpiderInstance};
use keeper_infrastructure::StructuredLogger;
use tracing::{debug, info};

use crate::context::KeeperContext;
use crate::runner::PeriodicService;

/// 单个项目的同步结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpiderSyncOutcome {
    pub added: usize,
    pub removed: usize,
}

/// 按Agent上部署的爬虫刷新每个项目的爬虫目录
pub struct SpiderSynchronizer {
    ctx: KeeperContext,
}

impl SpiderSynchronizer {
    pub fn new(ctx: KeeperContext) -> Self {
        Self { ctx }
    }

    /// 同步单个项目
    ///
    /// Agent池不可达时返回错误，目录保持不变。
    pub async fn sync_project(&self, project: &Project) -> KeeperResult<SpiderSyncOutcome> {
        let deployed: HashSet<String> = self
            .ctx
            .agents
            .list_spiders(&project.project_name)
            .await?
            .into_iter()
            .collect();
        let existing = self.ctx.spiders.list_by_project(project.id).await?;

        let mut outcome = SpiderSyncOutcome::default();
        let known: HashSet<&str> = existing.iter().map(|s| s.spider_name.as_str()).collect();
        for name in &deployed {
            if !known.contains(name.as_str()) {
                self.ctx
                    .spiders
                    .create(&SpiderInstance::new(project.id, name.as_str()))
                    .await?;
                outcome.added += 1;
            }
        }
        for spider in &existing {
            if !deployed.contains(&spider.spider_name) {
                self.ctx.spiders.delete(spider.id).await?;
                outcome.removed += 1;
            }
        }

        if outcome != SpiderSyncOutcome::default() {
            info!(
                "项目 {} 爬虫目录已更新: 新增 {}，移除 {}",
                project.project_name, outcome.added, outcome.removed
            );
        }
        Ok(outcome)
    }

    /// 同步所有项目，单个项目失败不影响其他项目
    pub async fn sync_all(&self) -> KeeperResult<usize> {
        let projects = self.ctx.projects.list().await?;
        let mut synced = 0;
        for project in &projects {
            match self.sync_project(project).await {
                Ok(_) => synced += 1,
                Err(e) if e.is_transient() => {
                    debug!("项目 {} 爬虫同步跳过: {}", project.project_name, e);
                }
                Err(e) => StructuredLogger::log_loop_error("spider_sync", "sync_project", &e),
            }
        }
        Ok(synced)
    }
}

#[async_trait]
impl PeriodicService for SpiderSynchronizer {
    fn name(&self) -> &'static str {
        "spider_sync"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.ctx.config.spider_sync.interval_seconds)
    }

    async fn run_once(&self) -> KeeperResult<()> {
        self.sync_all().await.map(|_| ())
    }
}
