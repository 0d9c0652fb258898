//! 测试数据构建器

use chrono::{DateTime, Duration, Utc};
use keeper_core::{
    CronFields, ExecutionStatus, JobExecution, JobInstance, JobPriority, JobRunType,
};

/// 任务实例构建器，默认是项目1下名为 `test_spider` 的一次性任务
pub struct JobInstanceBuilder {
    instance: JobInstance,
}

impl JobInstanceBuilder {
    pub fn new() -> Self {
        Self {
            instance: JobInstance::new(1, "test_spider", JobRunType::Onetime),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.instance.id = id;
        self
    }

    pub fn with_project(mut self, project_id: i64) -> Self {
        self.instance.project_id = project_id;
        self
    }

    pub fn with_spider(mut self, spider_name: &str) -> Self {
        self.instance.spider_name = spider_name.to_string();
        self
    }

    pub fn with_arguments(mut self, arguments: &str) -> Self {
        self.instance.spider_arguments = arguments.to_string();
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.instance.priority = priority;
        self
    }

    /// 周期任务，CRON表达式按 `分 时 日 月 周` 顺序给出
    pub fn periodic(mut self, expr: &str) -> Self {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        self.instance.run_type = JobRunType::Periodic;
        self.instance.cron = CronFields {
            minute: parts.first().copied().unwrap_or("0").to_string(),
            hour: parts.get(1).copied().unwrap_or("*").to_string(),
            day_of_month: parts.get(2).copied().unwrap_or("*").to_string(),
            month: parts.get(3).copied().unwrap_or("*").to_string(),
            day_of_week: parts.get(4).copied().unwrap_or("*").to_string(),
        };
        self
    }

    pub fn with_cron(mut self, cron: CronFields) -> Self {
        self.instance.cron = cron;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.instance.enabled = false;
        self
    }

    pub fn with_tags(mut self, tags: &str) -> Self {
        self.instance.tags = Some(tags.to_string());
        self
    }

    pub fn build(self) -> JobInstance {
        self.instance
    }
}

impl Default for JobInstanceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 执行记录构建器，默认是刚创建的PENDING记录
pub struct JobExecutionBuilder {
    execution: JobExecution,
}

impl JobExecutionBuilder {
    pub fn new() -> Self {
        Self {
            execution: JobExecution::pending(1, 1, "run-1", None, Utc::now()),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.execution.id = id;
        self
    }

    pub fn with_project(mut self, project_id: i64) -> Self {
        self.execution.project_id = project_id;
        self
    }

    pub fn with_job_instance(mut self, job_instance_id: i64) -> Self {
        self.execution.job_instance_id = job_instance_id;
        self
    }

    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.execution.agent_run_id = run_id.to_string();
        self
    }

    pub fn running_on(mut self, host: &str) -> Self {
        self.execution.running_on = Some(host.to_string());
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.execution.created_at = created_at;
        self.execution.updated_at = created_at;
        self
    }

    /// 创建时间为当前时间之前 `seconds` 秒
    pub fn aged(self, seconds: i64) -> Self {
        self.created_at(Utc::now() - Duration::seconds(seconds))
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.execution.running_status = status;
        self
    }

    pub fn started_at(mut self, start_time: DateTime<Utc>) -> Self {
        self.execution.start_time = Some(start_time);
        self
    }

    pub fn ended_at(mut self, end_time: DateTime<Utc>) -> Self {
        self.execution.end_time = Some(end_time);
        self
    }

    pub fn inferred(mut self) -> Self {
        self.execution.inferred_completion = true;
        self
    }

    pub fn updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.execution.updated_at = updated_at;
        self
    }

    pub fn build(self) -> JobExecution {
        self.execution
    }
}

impl Default for JobExecutionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
