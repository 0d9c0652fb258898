use chrono::Utc;
use keeper_core::{
    ExecutionUpdate, ExecutionView, JobExecution, JobInstance, KeeperError, KeeperResult,
    NewJobInstance, Project,
};
use tracing::{debug, info, instrument, warn};

use crate::context::KeeperContext;
use crate::dispatcher::JobDispatcher;
use crate::stats::StatsAggregator;

/// 提交任务实例的结果，一次性任务会立即下发
#[derive(Debug, Clone, PartialEq)]
pub struct JobSubmission {
    pub job_instance: JobInstance,
    pub execution: Option<JobExecution>,
}

/// 面向操作员的项目与任务管理
///
/// 大部分操作直接转发给存储，不涉及协调逻辑。
pub struct JobService {
    ctx: KeeperContext,
    dispatcher: JobDispatcher,
    stats: StatsAggregator,
}

impl JobService {
    pub fn new(ctx: KeeperContext, dispatcher: JobDispatcher) -> Self {
        let stats = StatsAggregator::new(ctx.clone());
        Self {
            ctx,
            dispatcher,
            stats,
        }
    }

    /// 创建项目，同名项目已存在时直接返回
    pub async fn create_project(&self, name: &str) -> KeeperResult<Project> {
        let name = name.trim();
        if name.is_empty() {
            return Err(KeeperError::InvalidArgument("项目名称不能为空".to_string()));
        }
        if let Some(existing) = self.ctx.projects.get_by_name(name).await? {
            return Ok(existing);
        }
        let project = self.ctx.projects.create(&Project::new(name)).await?;
        info!("创建项目: {} (ID: {})", project.project_name, project.id);
        Ok(project)
    }

    pub async fn list_projects(&self) -> KeeperResult<Vec<Project>> {
        self.ctx.projects.list().await
    }

    /// 删除项目及其任务实例、执行记录和爬虫目录
    ///
    /// 从Agent移除爬虫代码是尽力而为，失败只记录日志。
    #[instrument(skip(self))]
    pub async fn delete_project(&self, project_id: i64) -> KeeperResult<()> {
        let project = self.project(project_id).await?;
        if let Err(e) = self.ctx.agents.delete_project(&project.project_name).await {
            warn!("从Agent删除项目 {} 失败: {}", project.project_name, e);
        }
        self.ctx.projects.delete(project.id).await?;
        info!("删除项目: {} (ID: {})", project.project_name, project.id);
        Ok(())
    }

    /// 创建任务实例
    ///
    /// 周期任务只保存；一次性任务保存后立即下发。下发失败时实例仍然保留，
    /// 可以通过 [`run_now`](Self::run_now) 重新下发。
    #[instrument(skip(self, request), fields(project.id = request.project_id))]
    pub async fn create_job_instance(&self, request: NewJobInstance) -> KeeperResult<JobSubmission> {
        self.project(request.project_id).await?;
        let instance = request.into_job_instance()?;
        let created = self.ctx.job_instances.create(&instance).await?;
        info!(
            "创建任务实例: {} (ID: {}, 类型: {})",
            created.spider_name, created.id, created.run_type
        );

        let execution = if created.is_periodic() {
            None
        } else {
            Some(self.dispatcher.dispatch(created.id).await?)
        };
        Ok(JobSubmission {
            job_instance: created,
            execution,
        })
    }

    /// 更新任务实例，保存前重新校验参数与CRON字段
    pub async fn update_job_instance(&self, instance: &JobInstance) -> KeeperResult<()> {
        instance.validate()?;
        self.ctx.job_instances.update(instance).await
    }

    pub async fn set_enabled(&self, job_instance_id: i64, enabled: bool) -> KeeperResult<()> {
        self.ctx
            .job_instances
            .set_enabled(job_instance_id, enabled)
            .await
    }

    /// 切换启用状态，返回切换后的状态
    pub async fn toggle_enabled(&self, job_instance_id: i64) -> KeeperResult<bool> {
        let instance = self.job_instance(job_instance_id).await?;
        let enabled = !instance.enabled;
        self.ctx
            .job_instances
            .set_enabled(job_instance_id, enabled)
            .await?;
        Ok(enabled)
    }

    /// 删除任务实例，历史执行记录保留
    pub async fn delete_job_instance(&self, job_instance_id: i64) -> KeeperResult<()> {
        self.ctx.job_instances.delete(job_instance_id).await
    }

    pub async fn list_job_instances(&self, project_id: i64) -> KeeperResult<Vec<JobInstance>> {
        self.ctx.job_instances.list_by_project(project_id).await
    }

    pub async fn list_periodic(&self, project_id: i64) -> KeeperResult<Vec<JobInstance>> {
        self.ctx.job_instances.list_periodic(project_id).await
    }

    /// 立即运行一次
    pub async fn run_now(&self, job_instance_id: i64) -> KeeperResult<JobExecution> {
        self.dispatcher.dispatch(job_instance_id).await
    }

    /// 取消执行
    ///
    /// 先请求Agent取消，成功后在本地标记为CANCELED。已是终态的执行直接返回。
    #[instrument(skip(self))]
    pub async fn cancel_execution(&self, execution_id: i64) -> KeeperResult<JobExecution> {
        let execution = self.execution(execution_id).await?;
        if !execution.is_incomplete() {
            return Ok(execution);
        }
        let project = self.project(execution.project_id).await?;
        self.ctx
            .agents
            .cancel(
                &project.project_name,
                &execution.agent_run_id,
                execution.running_on.as_deref(),
            )
            .await?;

        let updated = self
            .ctx
            .job_executions
            .apply_update(execution.id, &ExecutionUpdate::canceled(Utc::now()))
            .await?;
        if updated {
            info!("执行 {} 已取消", execution.id);
        }
        self.execution(execution_id).await
    }

    /// 获取执行日志，按行返回
    ///
    /// 任务实例已删除时从Agent的运行列表中取爬虫名称。
    pub async fn fetch_log(&self, execution_id: i64) -> KeeperResult<Vec<String>> {
        let execution = self.execution(execution_id).await?;
        let project = self.project(execution.project_id).await?;
        let spider_name = match self
            .ctx
            .job_instances
            .get_by_id(execution.job_instance_id)
            .await?
        {
            Some(instance) => instance.spider_name,
            None => self.remote_spider_name(&project, &execution).await?,
        };
        let text = self
            .ctx
            .agents
            .fetch_log(
                &project.project_name,
                &spider_name,
                &execution.agent_run_id,
                execution.running_on.as_deref(),
            )
            .await?;
        Ok(text.lines().map(str::to_string).collect())
    }

    /// 执行记录附带任务实例描述，实例已删除时描述为空
    pub async fn describe_execution(&self, execution: JobExecution) -> KeeperResult<ExecutionView> {
        self.stats.describe(execution).await
    }

    /// 在Agent的运行列表中查找执行对应的爬虫名称，已知主机优先
    async fn remote_spider_name(
        &self,
        project: &Project,
        execution: &JobExecution,
    ) -> KeeperResult<String> {
        let mut hosts = self.ctx.agents.hosts();
        if let Some(host) = execution.running_on.as_deref() {
            if let Some(pos) = hosts.iter().position(|h| h.as_str() == host) {
                let known = hosts.remove(pos);
                hosts.insert(0, known);
            }
        }
        for host in &hosts {
            match self.ctx.agents.list_jobs(host, &project.project_name).await {
                Ok(jobs) => {
                    let spider = jobs
                        .into_iter()
                        .find(|job| job.run_id == execution.agent_run_id)
                        .and_then(|job| job.spider_name);
                    if let Some(spider) = spider {
                        return Ok(spider);
                    }
                }
                Err(e) => debug!("查询主机 {} 的运行列表失败: {}", host, e),
            }
        }
        Err(KeeperError::JobInstanceNotFound {
            id: execution.job_instance_id,
        })
    }

    async fn project(&self, project_id: i64) -> KeeperResult<Project> {
        self.ctx
            .projects
            .get_by_id(project_id)
            .await?
            .ok_or(KeeperError::ProjectNotFound { id: project_id })
    }

    async fn job_instance(&self, job_instance_id: i64) -> KeeperResult<JobInstance> {
        self.ctx
            .job_instances
            .get_by_id(job_instance_id)
            .await?
            .ok_or(KeeperError::JobInstanceNotFound {
                id: job_instance_id,
            })
    }

    async fn execution(&self, execution_id: i64) -> KeeperResult<JobExecution> {
        self.ctx
            .job_executions
            .get_by_id(execution_id)
            .await?
            .ok_or(KeeperError::JobExecutionNotFound { id: execution_id })
    }
}
