use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use keeper_core::cron::start_of_hour;
use keeper_core::{
    ExecutionStatus, ExecutionTiming, ExecutionView, HourlyBucket, JobExecution,
    JobInstanceSummary, KeeperResult, SpiderInstance, SpiderRuntimeMap,
    StatusBoard,
};

use crate::context::KeeperContext;

/// 直方图覆盖的小时数（含当前未结束的小时）
pub const HISTOGRAM_HOURS: i64 = 24;

/// 只读的统计投影
pub struct StatsAggregator {
    ctx: KeeperContext,
}

impl StatsAggregator {
    pub fn new(ctx: KeeperContext) -> Self {
        Self { ctx }
    }

    /// 按状态分组的执行记录，每组按最近修改时间倒序并截断到配置的上限
    pub async fn list_by_status(&self, project_id: i64) -> KeeperResult<StatusBoard> {
        let limit = self.ctx.config.stats.status_list_limit;
        let repo = &self.ctx.job_executions;

        let pending = repo
            .list_by_status(project_id, &[ExecutionStatus::Pending], limit)
            .await?;
        let running = repo
            .list_by_status(project_id, &[ExecutionStatus::Running], limit)
            .await?;
        let completed = repo
            .list_by_status(project_id, &ExecutionStatus::COMPLETED, limit)
            .await?;

        let mut summaries = HashMap::new();
        Ok(StatusBoard {
            pending: self.describe_all(pending, &mut summaries).await?,
            running: self.describe_all(running, &mut summaries).await?,
            completed: self.describe_all(completed, &mut summaries).await?,
        })
    }

    /// 执行记录附带实例摘要，实例已删除时为空摘要
    pub async fn describe(&self, execution: JobExecution) -> KeeperResult<ExecutionView> {
        let job_instance = self
            .ctx
            .job_instances
            .get_by_id(execution.job_instance_id)
            .await?
            .map(|instance| JobInstanceSummary::from(&instance))
            .unwrap_or_default();
        Ok(ExecutionView {
            execution,
            job_instance,
        })
    }

    async fn describe_all(
        &self,
        executions: Vec<JobExecution>,
        summaries: &mut HashMap<i64, JobInstanceSummary>,
    ) -> KeeperResult<Vec<ExecutionView>> {
        let mut views = Vec::with_capacity(executions.len());
        for execution in executions {
            let id = execution.job_instance_id;
            if !summaries.contains_key(&id) {
                let summary = self
                    .ctx
                    .job_instances
                    .get_by_id(id)
                    .await?
                    .map(|instance| JobInstanceSummary::from(&instance))
                    .unwrap_or_default();
                summaries.insert(id, summary);
            }
            let job_instance = summaries.get(&id).cloned().unwrap_or_default();
            views.push(ExecutionView {
                execution,
                job_instance,
            });
        }
        Ok(views)
    }

    /// 最近24小时每小时创建的执行数，从旧到新
    pub async fn hourly_histogram(&self, project_id: i64) -> KeeperResult<Vec<HourlyBucket>> {
        self.hourly_histogram_at(project_id, Utc::now()).await
    }

    pub async fn hourly_histogram_at(
        &self,
        project_id: i64,
        now: DateTime<Utc>,
    ) -> KeeperResult<Vec<HourlyBucket>> {
        let first = histogram_start(now);
        let executions = self
            .ctx
            .job_executions
            .list_created_since(project_id, first)
            .await?;
        Ok(bucket_by_hour(executions.iter().map(|e| e.created_at), now))
    }

    /// 每个爬虫的最近运行时间与平均运行时长
    ///
    /// 目录中从未运行过的爬虫也会出现，两项均为空。
    pub async fn per_spider_runtime(&self, project_id: i64) -> KeeperResult<SpiderRuntimeMap> {
        let timings = self.ctx.job_executions.list_timings(project_id).await?;
        let catalogue = self.ctx.spiders.list_by_project(project_id).await?;
        Ok(summarize_runtimes(&timings, &catalogue))
    }
}

fn histogram_start(now: DateTime<Utc>) -> DateTime<Utc> {
    start_of_hour(now) - Duration::hours(HISTOGRAM_HOURS - 1)
}

/// 把创建时间分到24个整点桶中，窗口外的时间被忽略
pub fn bucket_by_hour(
    created: impl IntoIterator<Item = DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Vec<HourlyBucket> {
    let first = histogram_start(now);
    let mut buckets: Vec<HourlyBucket> = (0..HISTOGRAM_HOURS)
        .map(|offset| HourlyBucket {
            hour: first + Duration::hours(offset),
            count: 0,
        })
        .collect();

    for time in created {
        let offset = (start_of_hour(time) - first).num_hours();
        if (0..HISTOGRAM_HOURS).contains(&offset) {
            buckets[offset as usize].count += 1;
        }
    }
    buckets
}

/// 汇总运行时长
///
/// 最近运行时间取最新的创建时间；平均时长只统计同时有开始和结束时间、
/// 且不是推断完成的执行。
pub fn summarize_runtimes(
    timings: &[ExecutionTiming],
    catalogue: &[SpiderInstance],
) -> SpiderRuntimeMap {
    let mut totals: HashMap<&str, (f64, u32)> = HashMap::new();
    let mut runtimes = SpiderRuntimeMap::new();

    for spider in catalogue {
        runtimes.entry(spider.spider_name.clone()).or_default();
    }

    for timing in timings {
        let entry = runtimes.entry(timing.spider_name.clone()).or_default();
        if entry.last_run_time.map_or(true, |last| timing.created_at > last) {
            entry.last_run_time = Some(timing.created_at);
        }
        if timing.inferred_completion {
            continue;
        }
        if let (Some(start), Some(end)) = (timing.start_time, timing.end_time) {
            let total = totals.entry(timing.spider_name.as_str()).or_insert((0.0, 0));
            total.0 += (end - start).num_milliseconds() as f64 / 1000.0;
            total.1 += 1;
        }
    }

    for (name, (sum, count)) in totals {
        if let Some(runtime) = runtimes.get_mut(name) {
            runtime.average_run_seconds = Some(sum / f64::from(count));
        }
    }
    runtimes
}

/// 面向操作员的时长显示
pub fn readable_duration(seconds: Option<f64>) -> String {
    let total = match seconds {
        Some(s) if s >= 1.0 => s as u64,
        _ => return "-".to_string(),
    };
    if total < 60 {
        format!("{total} s")
    } else if total < 3600 {
        format!("{} m", total / 60)
    } else {
        format!("{} h {} m", total / 3600, (total % 3600) / 60)
    }
}
