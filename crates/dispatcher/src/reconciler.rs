//! 执行状态协调器
//!
//! 每一轮从存储加载未完成（PENDING/RUNNING）的执行记录，向Agent池拉取各主机上
//! 相关项目的运行列表，再把Agent上报的状态合并回存储：
//!
//! | Agent上报 | 本地处理 |
//! |---|---|
//! | RUNNING | 前进到RUNNING，补齐开始时间和主机 |
//! | FINISHED / CANCELED | 写入终态和结束时间，重复上报不产生修改 |
//! | 未出现，记录未超过宽限期 | 保持不变 |
//! | 未出现，记录已超过宽限期 | 标记为FINISHED并设置推断完成标记 |
//!
//! 不可达的Agent只会让它名下的执行记录在本轮被跳过，不影响其他Agent。
//! 记录所在主机已不在配置中时按主机未知处理，在所有已配置主机中查找。
//! 所有写入都通过存储层的条件更新完成，状态永远不会回退。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use keeper_core::{
    ExecutionUpdate, JobExecution, KeeperError, KeeperResult, RemoteJob, RemoteJobStatus,
};
use keeper_infrastructure::StructuredLogger;
use tracing::{debug, instrument, warn};

use crate::context::KeeperContext;
use crate::runner::PeriodicService;

/// 一轮协调的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// 本轮加载的未完成执行数
    pub incomplete: usize,
    /// 实际写入了修改的执行数
    pub updated: usize,
    /// 其中被推断为完成的执行数
    pub inferred: usize,
    /// 本轮无法访问的Agent主机
    pub unreachable_hosts: Vec<String>,
    /// 执行记录引用、但已不在配置中的主机
    pub retired_hosts: Vec<String>,
    /// 写入失败的执行数
    pub failed: usize,
}

/// 某个项目在各主机上的运行列表
#[derive(Debug, Default)]
struct Listings {
    /// (主机, 项目ID) -> 运行列表
    reports: HashMap<(String, i64), Vec<RemoteJob>>,
    hosts: Vec<String>,
}

impl Listings {
    fn reached(&self, host: &str, project_id: i64) -> bool {
        self.reports
            .contains_key(&(host.to_string(), project_id))
    }

    /// 记录所在的已配置主机，主机未知或已移除时为 `None`
    fn configured_host<'a>(&self, execution: &'a JobExecution) -> Option<&'a str> {
        execution
            .running_on
            .as_deref()
            .filter(|host| self.hosts.iter().any(|h| h.as_str() == *host))
    }

    /// 查找运行记录，主机未知时在所有主机中查找
    fn find(&self, execution: &JobExecution) -> Option<(String, &RemoteJob)> {
        let project_id = execution.project_id;
        let search = |host: &str| {
            self.reports
                .get(&(host.to_string(), project_id))
                .and_then(|jobs| jobs.iter().find(|j| j.run_id == execution.agent_run_id))
                .map(|job| (host.to_string(), job))
        };
        match self.configured_host(execution) {
            Some(host) => search(host),
            None => self.hosts.iter().find_map(|host| search(host)),
        }
    }

    /// 能否确认Agent已经没有这条运行记录
    fn confirms_absence(&self, execution: &JobExecution) -> bool {
        match self.configured_host(execution) {
            Some(host) => self.reached(host, execution.project_id),
            None => {
                !self.hosts.is_empty()
                    && self
                        .hosts
                        .iter()
                        .all(|host| self.reached(host, execution.project_id))
            }
        }
    }
}

/// 执行状态协调器
pub struct Reconciler {
    ctx: KeeperContext,
}

impl Reconciler {
    pub fn new(ctx: KeeperContext) -> Self {
        Self { ctx }
    }

    /// 执行一轮协调
    ///
    /// 只有加载未完成执行记录失败时返回错误；单条记录的写入失败计入
    /// [`ReconcileReport::failed`]，不会中止本轮。
    #[instrument(skip(self))]
    pub async fn reconcile_once(&self) -> KeeperResult<ReconcileReport> {
        self.reconcile_at(Utc::now()).await
    }

    /// 以 `now` 作为当前时间执行一轮协调
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> KeeperResult<ReconcileReport> {
        let started = Instant::now();
        let incomplete = self.ctx.job_executions.list_incomplete().await?;
        let mut report = ReconcileReport {
            incomplete: incomplete.len(),
            ..Default::default()
        };
        if incomplete.is_empty() {
            self.finish(&report, started);
            return Ok(report);
        }

        let project_ids: BTreeSet<i64> = incomplete.iter().map(|e| e.project_id).collect();
        let listings = self.collect_listings(&project_ids, &mut report).await?;
        report.retired_hosts = retired_hosts(&incomplete, &listings);
        if !report.retired_hosts.is_empty() {
            warn!(
                "{} 个主机已不在Agent配置中，其执行记录改为在所有主机中查找: {:?}",
                report.retired_hosts.len(),
                report.retired_hosts
            );
        }
        let grace = chrono::Duration::seconds(self.ctx.config.reconciler.grace_seconds as i64);

        for execution in &incomplete {
            let Some(update) = plan_update(execution, &listings, now, grace) else {
                continue;
            };

            let mut projected = execution.clone();
            match projected.apply(&update) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(KeeperError::IllegalTransition { from, to }) => {
                    debug!(
                        "忽略执行 {} 的过期上报: {} -> {}",
                        execution.id, from, to
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }

            match self.ctx.job_executions.apply_update(execution.id, &update).await {
                Ok(true) => {
                    report.updated += 1;
                    if update.status != execution.running_status {
                        StructuredLogger::log_status_transition(
                            execution.id,
                            &execution.agent_run_id,
                            execution.running_status,
                            update.status,
                        );
                        self.ctx.metrics.record_transition(update.status);
                    }
                    if update.inferred_completion {
                        report.inferred += 1;
                        StructuredLogger::log_inferred_completion(
                            execution.id,
                            &execution.agent_run_id,
                            execution.age(now).num_seconds(),
                        );
                        self.ctx.metrics.record_inferred_completion();
                    }
                }
                Ok(false) => {
                    debug!("执行 {} 已被并发修改，本轮不再更新", execution.id);
                }
                Err(e) => {
                    StructuredLogger::log_loop_error("reconciler", "apply_update", &e);
                    report.failed += 1;
                }
            }
        }

        self.finish(&report, started);
        Ok(report)
    }

    /// 拉取每个主机上相关项目的运行列表
    ///
    /// 任一项目查询失败的主机都记为不可达。
    async fn collect_listings(
        &self,
        project_ids: &BTreeSet<i64>,
        report: &mut ReconcileReport,
    ) -> KeeperResult<Listings> {
        let mut projects = Vec::with_capacity(project_ids.len());
        for id in project_ids {
            match self.ctx.projects.get_by_id(*id).await? {
                Some(project) => projects.push((project.id, project.project_name)),
                None => debug!("项目 {} 已不存在，跳过其执行记录", id),
            }
        }

        let hosts = self.ctx.agents.hosts();
        let queries = hosts.iter().flat_map(|host| {
            projects.iter().map(move |(project_id, project_name)| async move {
                let result = self.ctx.agents.list_jobs(host, project_name).await;
                (host.clone(), *project_id, result)
            })
        });
        let results = join_all(queries).await;

        let mut listings = Listings {
            hosts: hosts.clone(),
            ..Default::default()
        };
        let mut unreachable: HashSet<String> = HashSet::new();
        for (host, project_id, result) in results {
            match result {
                Ok(jobs) => {
                    listings.reports.insert((host, project_id), jobs);
                }
                Err(e) => {
                    if unreachable.insert(host.clone()) {
                        StructuredLogger::log_agent_unreachable(&host, "list_jobs", &e);
                        self.ctx.metrics.record_agent_unreachable(&host);
                    }
                }
            }
        }
        listings
            .reports
            .retain(|(host, _), _| !unreachable.contains(host));

        report.unreachable_hosts = hosts
            .into_iter()
            .filter(|h| unreachable.contains(h))
            .collect();
        Ok(listings)
    }

    fn finish(&self, report: &ReconcileReport, started: Instant) {
        let elapsed = started.elapsed();
        self.ctx
            .metrics
            .record_reconcile_pass(elapsed.as_secs_f64(), report.incomplete);
        StructuredLogger::log_reconcile_pass(
            report.incomplete,
            report.updated,
            report.inferred,
            &report.unreachable_hosts,
            elapsed.as_millis() as u64,
        );
    }
}

fn retired_hosts(incomplete: &[JobExecution], listings: &Listings) -> Vec<String> {
    incomplete
        .iter()
        .filter_map(|e| e.running_on.as_deref())
        .filter(|host| !listings.hosts.iter().any(|h| h.as_str() == *host))
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// 根据Agent上报计算一条执行记录需要的更新
fn plan_update(
    execution: &JobExecution,
    listings: &Listings,
    now: DateTime<Utc>,
    grace: chrono::Duration,
) -> Option<ExecutionUpdate> {
    match listings.find(execution) {
        Some((host, remote)) => match remote.status {
            // Agent尚未开始运行，等待下一轮
            RemoteJobStatus::Pending => None,
            RemoteJobStatus::Running => Some(ExecutionUpdate::running(
                Some(remote.start_time.unwrap_or(now)),
                Some(host),
            )),
            RemoteJobStatus::Finished | RemoteJobStatus::Canceled => {
                Some(ExecutionUpdate::terminal(
                    remote.status.to_execution_status(),
                    remote.start_time,
                    remote.end_time.unwrap_or(now),
                    Some(host),
                ))
            }
        },
        None if execution.age(now) > grace && listings.confirms_absence(execution) => {
            Some(ExecutionUpdate::inferred_finished(now))
        }
        None => None,
    }
}

#[async_trait]
impl PeriodicService for Reconciler {
    fn name(&self) -> &'static str {
        "reconciler"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.ctx.config.reconciler.interval_seconds)
    }

    async fn run_once(&self) -> KeeperResult<()> {
        self.reconcile_once().await.map(|_| ())
    }
}
