mod common;

use chrono::{Duration, Utc};
use common::Harness;
use keeper_core::{AppConfig, ExecutionStatus, JobInstanceRepository, SpiderInstance, SpiderRepository};
use keeper_dispatcher::StatsAggregator;
use keeper_testing_utils::{JobExecutionBuilder, JobInstanceBuilder};

#[tokio::test]
async fn test_list_by_status_groups_and_limits() {
    let mut config = AppConfig::default();
    config.stats.status_list_limit = 2;
    let h = Harness::with_config(config);
    let project = h.project("news").await;
    let instance = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .with_spider("news-spider")
                .with_tags("daily")
                .build(),
        )
        .await;
    let base = Utc::now() - Duration::hours(2);

    let statuses = [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Finished,
        ExecutionStatus::Canceled,
        ExecutionStatus::Finished,
    ];
    let mut ids = Vec::new();
    for (i, status) in statuses.into_iter().enumerate() {
        let execution = h.store.insert_execution(
            JobExecutionBuilder::new()
                .with_project(project.id)
                .with_job_instance(instance.id)
                .with_run_id(&format!("run-{i}"))
                .with_status(status)
                .updated_at(base + Duration::minutes(i as i64))
                .build(),
        );
        ids.push(execution.id);
    }
    let stats = StatsAggregator::new(h.ctx.clone());

    let board = stats.list_by_status(project.id).await.unwrap();

    assert_eq!(board.pending.len(), 1);
    assert_eq!(board.running.len(), 1);
    // 三条已完成记录截断为最近修改的两条
    let completed: Vec<i64> = board.completed.iter().map(|v| v.execution.id).collect();
    assert_eq!(completed, vec![ids[4], ids[3]]);
    let summary = &board.pending[0].job_instance;
    assert_eq!(summary.spider_name.as_deref(), Some("news-spider"));
    assert_eq!(summary.tags, vec!["daily"]);
}

#[tokio::test]
async fn test_deleted_instance_yields_empty_summary() {
    let h = Harness::new();
    let project = h.project("news").await;
    let instance = h
        .instance(JobInstanceBuilder::new().with_project(project.id).build())
        .await;
    let execution = h.store.insert_execution(
        JobExecutionBuilder::new()
            .with_project(project.id)
            .with_job_instance(instance.id)
            .build(),
    );
    h.store.job_instances().delete(instance.id).await.unwrap();
    let stats = StatsAggregator::new(h.ctx.clone());

    let board = stats.list_by_status(project.id).await.unwrap();
    assert_eq!(board.pending.len(), 1);
    assert!(board.pending[0].job_instance.is_empty());

    let view = stats.describe(execution.clone()).await.unwrap();
    assert_eq!(view.execution, execution);
    assert!(view.job_instance.is_empty());
}

#[tokio::test]
async fn test_hourly_histogram() {
    let h = Harness::new();
    let project = h.project("news").await;
    let other = h.project("sports").await;
    let now = Utc::now();
    for (project_id, hours_ago) in [
        (project.id, 1),
        (project.id, 1),
        (project.id, 3),
        (project.id, 30),
        (other.id, 1),
    ] {
        h.store.insert_execution(
            JobExecutionBuilder::new()
                .with_project(project_id)
                .created_at(now - Duration::hours(hours_ago))
                .build(),
        );
    }
    let stats = StatsAggregator::new(h.ctx.clone());

    let buckets = stats.hourly_histogram_at(project.id, now).await.unwrap();

    assert_eq!(buckets.len(), 24);
    assert_eq!(buckets[22].count, 2);
    assert_eq!(buckets[20].count, 1);
    let zero_buckets = buckets.iter().filter(|b| b.count == 0).count();
    assert_eq!(zero_buckets, 22);
    assert!(buckets.windows(2).all(|w| w[0].hour < w[1].hour));
}

#[tokio::test]
async fn test_per_spider_runtime() {
    let h = Harness::new();
    let project = h.project("news").await;
    let news = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .with_spider("news-spider")
                .build(),
        )
        .await;
    h.store
        .spiders()
        .create(&SpiderInstance::new(project.id, "idle-spider"))
        .await
        .unwrap();

    let t0 = Utc::now() - Duration::hours(5);
    for (offset, seconds) in [(0, 60), (60, 180)] {
        let start = t0 + Duration::minutes(offset);
        h.store.insert_execution(
            JobExecutionBuilder::new()
                .with_project(project.id)
                .with_job_instance(news.id)
                .created_at(start)
                .with_status(ExecutionStatus::Finished)
                .started_at(start)
                .ended_at(start + Duration::seconds(seconds))
                .build(),
        );
    }
    let latest = t0 + Duration::minutes(120);
    h.store.insert_execution(
        JobExecutionBuilder::new()
            .with_project(project.id)
            .with_job_instance(news.id)
            .created_at(latest)
            .build(),
    );
    let stats = StatsAggregator::new(h.ctx.clone());

    let runtimes = stats.per_spider_runtime(project.id).await.unwrap();

    let news_runtime = &runtimes["news-spider"];
    assert_eq!(news_runtime.last_run_time, Some(latest));
    assert_eq!(news_runtime.average_run_seconds, Some(120.0));
    let idle = &runtimes["idle-spider"];
    assert!(idle.last_run_time.is_none());
    assert!(idle.average_run_seconds.is_none());
}
