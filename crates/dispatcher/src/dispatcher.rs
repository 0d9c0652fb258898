use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use keeper_core::{
    DispatchTicket, JobExecution, JobInstance, KeeperError, KeeperResult, Project,
    SpiderArguments,
};
use keeper_infrastructure::StructuredLogger;
use tracing::{debug, error, instrument};

use crate::context::KeeperContext;

/// 任务下发器
///
/// 把任务实例转换为Agent上的一次运行，并在启动成功后创建PENDING执行记录。
/// Agent调用失败时不会留下任何执行记录。重试失败的下发可能在Agent上启动两次运行，
/// 下发本身不保证幂等。
#[derive(Clone)]
pub struct JobDispatcher {
    ctx: KeeperContext,
}

impl JobDispatcher {
    pub fn new(ctx: KeeperContext) -> Self {
        Self { ctx }
    }

    /// 下发一次任务实例
    ///
    /// 每次都从存储重新读取实例，因此调用前被删除或禁用的实例会被拒绝。
    #[instrument(skip(self), fields(job_instance.id = job_instance_id))]
    pub async fn dispatch(&self, job_instance_id: i64) -> KeeperResult<JobExecution> {
        let (instance, project) = self.load_dispatchable(job_instance_id).await?;
        let arguments = instance.arguments()?;
        self.start_once(&instance, &project, &arguments).await
    }

    /// 按优先级同时下发多个副本
    ///
    /// 副本数由 [`JobPriority::replica_count`](keeper_core::JobPriority::replica_count) 决定，
    /// 固定了Agent的实例只下发一次。每个副本都是一次独立的 [`dispatch`](Self::dispatch)。
    /// 至少一个副本成功时返回成功的执行记录，全部失败时返回最后一个错误。
    #[instrument(skip(self), fields(job_instance.id = job_instance_id))]
    pub async fn dispatch_replicas(&self, job_instance_id: i64) -> KeeperResult<Vec<JobExecution>> {
        let (instance, project) = self.load_dispatchable(job_instance_id).await?;
        let arguments = instance.arguments()?;
        let replicas = if arguments.daemon().is_some() {
            1
        } else {
            instance
                .priority
                .replica_count(self.ctx.agents.hosts().len())
        };
        debug!("任务实例 {} 下发 {} 个副本", instance.id, replicas);

        let results = join_all(
            (0..replicas).map(|_| self.start_once(&instance, &project, &arguments)),
        )
        .await;

        let mut executions = Vec::with_capacity(replicas);
        let mut last_error = None;
        for result in results {
            match result {
                Ok(execution) => executions.push(execution),
                Err(e) => last_error = Some(e),
            }
        }
        match (executions.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(executions),
        }
    }

    async fn load_dispatchable(&self, job_instance_id: i64) -> KeeperResult<(JobInstance, Project)> {
        let instance = self
            .ctx
            .job_instances
            .get_by_id(job_instance_id)
            .await?
            .ok_or(KeeperError::JobInstanceNotFound {
                id: job_instance_id,
            })?;
        let project = self
            .ctx
            .projects
            .get_by_id(instance.project_id)
            .await?
            .ok_or(KeeperError::ProjectNotFound {
                id: instance.project_id,
            })?;
        if !instance.enabled {
            return Err(KeeperError::JobInstanceDisabled { id: instance.id });
        }
        Ok((instance, project))
    }

    async fn start_once(
        &self,
        instance: &JobInstance,
        project: &Project,
        arguments: &SpiderArguments,
    ) -> KeeperResult<JobExecution> {
        let ticket = match self
            .start_with_timeout(&project.project_name, &instance.spider_name, arguments)
            .await
        {
            Ok(ticket) => ticket,
            Err(e) => {
                let outcome = if e.is_transient() { "unreachable" } else { "rejected" };
                self.ctx.metrics.record_dispatch(outcome);
                StructuredLogger::log_dispatch_rejected(instance.id, &e);
                return Err(e);
            }
        };

        let execution = JobExecution::pending(
            project.id,
            instance.id,
            ticket.agent_run_id,
            Some(ticket.host),
            Utc::now(),
        );
        let created = match self.ctx.job_executions.create(&execution).await {
            Ok(created) => created,
            Err(e) => {
                error!(
                    "Agent已启动运行 {} 但执行记录写入失败: {}",
                    execution.agent_run_id, e
                );
                return Err(e);
            }
        };

        self.ctx.metrics.record_dispatch("ok");
        StructuredLogger::log_execution_dispatched(&created, &instance.spider_name);
        Ok(created)
    }

    /// 启动请求的超时上限，超时视为Agent不可达
    async fn start_with_timeout(
        &self,
        project: &str,
        spider: &str,
        arguments: &SpiderArguments,
    ) -> KeeperResult<DispatchTicket> {
        let limit = Duration::from_secs(self.ctx.config.agents.request_timeout_seconds);
        match tokio::time::timeout(limit, self.ctx.agents.start(project, spider, arguments)).await
        {
            Ok(result) => result,
            Err(_) => Err(KeeperError::agent_unreachable(
                arguments.daemon().unwrap_or("agent-pool"),
                format!("启动请求超时 ({}s)", limit.as_secs()),
            )),
        }
    }
}
