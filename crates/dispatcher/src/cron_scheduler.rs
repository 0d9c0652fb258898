use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use keeper_core::cron::truncate_to_minute;
use keeper_core::{CronExpression, KeeperResult};
use keeper_infrastructure::StructuredLogger;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::context::KeeperContext;
use crate::dispatcher::JobDispatcher;
use crate::runner::PeriodicService;

/// 两次tick间隔过长时最多向前补算的分钟数（含当前分钟）
pub const MAX_CATCH_UP_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
struct CronEntry {
    job_instance_id: i64,
    spider_name: String,
    expression: CronExpression,
}

/// 一次tick的处理结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CronTickReport {
    /// 本次tick对应的整分钟
    pub tick: Option<DateTime<Utc>>,
    /// 本次评估的最早分钟，上一次tick之后错过的分钟也在评估范围内
    pub window_start: Option<DateTime<Utc>>,
    pub due: Vec<i64>,
    pub dispatched: usize,
    pub failed: usize,
    /// 因已有未完成执行而跳过（仅在 `skip_if_running` 开启时）
    pub skipped_running: usize,
}

/// CRON调度器
///
/// 定期从存储重新加载已启用的周期任务并缓存编译后的表达式，
/// 每个tick评估上一次tick之后到当前分钟为止的所有分钟，错过的分钟不会丢失；
/// 同一实例在一次tick中最多触发一次，同一分钟也不会触发两次。
/// 到期实例的下发并发执行，单个实例的失败或慢调用不影响其他实例。
pub struct CronScheduler {
    ctx: KeeperContext,
    dispatcher: JobDispatcher,
    entries: RwLock<Vec<CronEntry>>,
    last_fired: Mutex<HashMap<i64, DateTime<Utc>>>,
    last_evaluated: Mutex<Option<DateTime<Utc>>>,
    last_reload: Mutex<Option<Instant>>,
}

impl CronScheduler {
    pub fn new(ctx: KeeperContext, dispatcher: JobDispatcher) -> Self {
        Self {
            ctx,
            dispatcher,
            entries: RwLock::new(Vec::new()),
            last_fired: Mutex::new(HashMap::new()),
            last_evaluated: Mutex::new(None),
            last_reload: Mutex::new(None),
        }
    }

    /// 重新加载已启用的周期任务，返回缓存的实例数量
    ///
    /// 存储中表达式无效的实例记录日志后跳过。
    pub async fn reload(&self) -> KeeperResult<usize> {
        let instances = self.ctx.job_instances.list_enabled_periodic().await?;
        let mut entries = Vec::with_capacity(instances.len());
        for instance in instances {
            match instance.cron_expression() {
                Ok(expression) => entries.push(CronEntry {
                    job_instance_id: instance.id,
                    spider_name: instance.spider_name,
                    expression,
                }),
                Err(e) => warn!("任务实例 {} 的CRON表达式无效，已跳过: {}", instance.id, e),
            }
        }

        let loaded = entries.len();
        {
            let mut last_fired = self.last_fired.lock().await;
            last_fired.retain(|id, _| entries.iter().any(|e| e.job_instance_id == *id));
        }
        *self.entries.write().await = entries;
        *self.last_reload.lock().await = Some(Instant::now());
        debug!("已加载 {} 个周期任务实例", loaded);
        Ok(loaded)
    }

    /// 当前缓存的任务实例ID
    pub async fn loaded_instances(&self) -> Vec<i64> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| e.job_instance_id)
            .collect()
    }

    async fn reload_if_stale(&self) -> KeeperResult<()> {
        let reload_every = Duration::from_secs(self.ctx.config.scheduler.reload_seconds);
        let stale = match *self.last_reload.lock().await {
            Some(at) => at.elapsed() >= reload_every,
            None => true,
        };
        if stale {
            self.reload().await?;
        }
        Ok(())
    }

    /// 确定本次tick的评估起点并推进已评估的分钟
    ///
    /// 首次tick或时钟回拨时只评估当前分钟；间隔超过 [`MAX_CATCH_UP_MINUTES`] 时只补算最近的部分。
    async fn evaluation_window(&self, minute: DateTime<Utc>) -> DateTime<Utc> {
        let mut last_evaluated = self.last_evaluated.lock().await;
        let start = match *last_evaluated {
            Some(previous) if previous < minute => {
                let next = previous + chrono::Duration::minutes(1);
                let earliest = minute - chrono::Duration::minutes(MAX_CATCH_UP_MINUTES - 1);
                if next < earliest {
                    warn!(
                        "距上次CRON tick已超过 {} 分钟，{} 至 {} 之间的触发被跳过",
                        MAX_CATCH_UP_MINUTES, next, earliest
                    );
                }
                next.max(earliest)
            }
            _ => minute,
        };
        if last_evaluated.map_or(true, |previous| previous < minute) {
            *last_evaluated = Some(minute);
        }
        start
    }

    /// 处理 `now` 所在分钟的tick，并补算上一次tick之后错过的分钟
    pub async fn tick(&self, now: DateTime<Utc>) -> CronTickReport {
        let minute = truncate_to_minute(now);
        let window_start = self.evaluation_window(minute).await;
        let mut report = CronTickReport {
            tick: Some(minute),
            window_start: Some(window_start),
            ..Default::default()
        };

        let matched: Vec<(i64, String, DateTime<Utc>)> = self
            .entries
            .read()
            .await
            .iter()
            .filter_map(|e| {
                e.expression
                    .latest_match(window_start, minute)
                    .map(|at| (e.job_instance_id, e.spider_name.clone(), at))
            })
            .collect();

        let due: Vec<(i64, String, DateTime<Utc>)> = {
            let mut last_fired = self.last_fired.lock().await;
            matched
                .into_iter()
                .filter(|(id, _, at)| {
                    if last_fired.get(id).is_some_and(|fired| fired >= at) {
                        return false;
                    }
                    last_fired.insert(*id, *at);
                    true
                })
                .collect()
        };
        report.due = due.iter().map(|(id, _, _)| *id).collect();

        let mut to_dispatch = Vec::with_capacity(due.len());
        for (job_instance_id, spider_name, fired_at) in due {
            if fired_at < minute {
                debug!("任务实例 {} 补触发错过的分钟 {}", job_instance_id, fired_at);
            }
            if self.ctx.config.scheduler.skip_if_running {
                match self
                    .ctx
                    .job_executions
                    .list_incomplete_by_instance(job_instance_id)
                    .await
                {
                    Ok(running) if !running.is_empty() => {
                        debug!(
                            "任务实例 {} 仍有 {} 个未完成的执行，跳过本次触发",
                            job_instance_id,
                            running.len()
                        );
                        report.skipped_running += 1;
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        StructuredLogger::log_loop_error("cron_scheduler", "check_running", &e);
                        report.failed += 1;
                        continue;
                    }
                }
            }
            StructuredLogger::log_cron_fired(job_instance_id, &spider_name, &fired_at.to_rfc3339());
            self.ctx.metrics.record_cron_fired();
            to_dispatch.push(job_instance_id);
        }

        let results = join_all(to_dispatch.iter().map(|id| self.dispatcher.dispatch(*id))).await;
        for result in results {
            match result {
                Ok(_) => report.dispatched += 1,
                Err(e) => {
                    if e.is_store_error() {
                        StructuredLogger::log_loop_error("cron_scheduler", "dispatch", &e);
                    }
                    report.failed += 1;
                }
            }
        }

        if !report.due.is_empty() {
            info!(
                "CRON tick {}: 到期 {}，下发成功 {}，失败 {}，跳过 {}",
                minute,
                report.due.len(),
                report.dispatched,
                report.failed,
                report.skipped_running
            );
        }
        report
    }
}

#[async_trait]
impl PeriodicService for CronScheduler {
    fn name(&self) -> &'static str {
        "cron_scheduler"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.ctx.config.scheduler.tick_seconds)
    }

    /// 重新加载失败时沿用上一次的缓存继续tick
    async fn run_once(&self) -> KeeperResult<()> {
        if let Err(e) = self.reload_if_stale().await {
            StructuredLogger::log_loop_error(self.name(), "reload", &e);
        }
        self.tick(Utc::now()).await;
        Ok(())
    }
}
