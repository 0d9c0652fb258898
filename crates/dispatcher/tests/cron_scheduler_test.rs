mod common;

use std::time::Instant;

use chrono::{Duration, TimeZone, Utc};
use common::{Harness, HOST_A};
use keeper_core::{AppConfig, ExecutionStatus, JobInstanceRepository};
use keeper_dispatcher::{CronScheduler, JobDispatcher, MAX_CATCH_UP_MINUTES};
use keeper_testing_utils::{JobExecutionBuilder, JobInstanceBuilder};

fn scheduler(h: &Harness) -> CronScheduler {
    CronScheduler::new(h.ctx.clone(), JobDispatcher::new(h.ctx.clone()))
}

#[tokio::test]
async fn test_reload_loads_enabled_periodic_only() {
    let h = Harness::new();
    let project = h.project("news").await;
    let hourly = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .periodic("0 * * * *")
                .build(),
        )
        .await;
    h.instance(
        JobInstanceBuilder::new()
            .with_project(project.id)
            .periodic("0 * * * *")
            .disabled()
            .build(),
    )
    .await;
    h.instance(JobInstanceBuilder::new().with_project(project.id).build())
        .await;
    h.instance(
        JobInstanceBuilder::new()
            .with_project(project.id)
            .periodic("99 * * * *")
            .build(),
    )
    .await;
    let scheduler = scheduler(&h);

    assert_eq!(scheduler.reload().await.unwrap(), 1);
    assert_eq!(scheduler.loaded_instances().await, vec![hourly.id]);
}

#[tokio::test]
async fn test_tick_fires_matching_minute_once() {
    let h = Harness::new();
    let project = h.project("news").await;
    let hourly = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .periodic("0 * * * *")
                .build(),
        )
        .await;
    let scheduler = scheduler(&h);
    scheduler.reload().await.unwrap();

    let top_of_hour = Utc.with_ymd_and_hms(2024, 5, 7, 14, 0, 12).unwrap();
    let report = scheduler.tick(top_of_hour).await;
    assert_eq!(report.due, vec![hourly.id]);
    assert_eq!(report.dispatched, 1);
    assert_eq!(
        report.tick,
        Some(Utc.with_ymd_and_hms(2024, 5, 7, 14, 0, 0).unwrap())
    );

    // 同一分钟内的第二次tick不会重复触发
    let report = scheduler.tick(top_of_hour + Duration::seconds(30)).await;
    assert!(report.due.is_empty());

    let report = scheduler
        .tick(Utc.with_ymd_and_hms(2024, 5, 7, 14, 1, 0).unwrap())
        .await;
    assert!(report.due.is_empty());

    let report = scheduler
        .tick(Utc.with_ymd_and_hms(2024, 5, 7, 15, 0, 3).unwrap())
        .await;
    assert_eq!(report.due, vec![hourly.id]);

    assert_eq!(h.store.execution_count(), 2);
}

#[tokio::test]
async fn test_monthly_instance_fires_on_its_day_only() {
    let h = Harness::new();
    let project = h.project("news").await;
    let monthly = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .periodic("30 9 1 * *")
                .build(),
        )
        .await;
    let scheduler = scheduler(&h);
    scheduler.reload().await.unwrap();

    let first_of_month = Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap();
    assert_eq!(scheduler.tick(first_of_month).await.due, vec![monthly.id]);

    let not_first = Utc.with_ymd_and_hms(2024, 6, 2, 9, 30, 0).unwrap();
    assert!(scheduler.tick(not_first).await.due.is_empty());
    assert_eq!(h.store.execution_count(), 1);
}

#[tokio::test]
async fn test_minute_between_late_ticks_is_not_lost() {
    let h = Harness::new();
    let project = h.project("news").await;
    let instance = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .periodic("1 * * * *")
                .build(),
        )
        .await;
    let scheduler = scheduler(&h);
    scheduler.reload().await.unwrap();

    // 两次tick分别落在12:00末尾和12:02开头，12:01没有单独的tick
    let early = Utc.with_ymd_and_hms(2024, 5, 7, 12, 0, 59).unwrap() + Duration::milliseconds(998);
    let report = scheduler.tick(early).await;
    assert!(report.due.is_empty());

    let late = Utc.with_ymd_and_hms(2024, 5, 7, 12, 2, 0).unwrap() + Duration::milliseconds(3);
    let report = scheduler.tick(late).await;
    assert_eq!(
        report.window_start,
        Some(Utc.with_ymd_and_hms(2024, 5, 7, 12, 1, 0).unwrap())
    );
    assert_eq!(report.due, vec![instance.id]);
    assert_eq!(report.dispatched, 1);

    // 已补触发的分钟不会再次触发
    let report = scheduler
        .tick(Utc.with_ymd_and_hms(2024, 5, 7, 12, 3, 0).unwrap())
        .await;
    assert!(report.due.is_empty());
    assert_eq!(h.store.execution_count(), 1);
}

#[tokio::test]
async fn test_missed_minutes_coalesce_into_one_dispatch() {
    let h = Harness::new();
    let project = h.project("news").await;
    let every_minute = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .periodic("* * * * *")
                .build(),
        )
        .await;
    let scheduler = scheduler(&h);
    scheduler.reload().await.unwrap();

    let t0 = Utc.with_ymd_and_hms(2024, 5, 7, 12, 0, 0).unwrap();
    assert_eq!(scheduler.tick(t0).await.dispatched, 1);

    let report = scheduler.tick(t0 + Duration::minutes(5)).await;
    assert_eq!(report.due, vec![every_minute.id]);
    assert_eq!(report.dispatched, 1);
    assert_eq!(h.store.execution_count(), 2);
}

#[tokio::test]
async fn test_catch_up_is_capped() {
    let h = Harness::new();
    let project = h.project("news").await;
    let half_past = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .periodic("30 * * * *")
                .build(),
        )
        .await;
    let scheduler = scheduler(&h);
    scheduler.reload().await.unwrap();

    let t0 = Utc.with_ymd_and_hms(2024, 5, 7, 12, 0, 0).unwrap();
    assert!(scheduler.tick(t0).await.due.is_empty());

    let t1 = Utc.with_ymd_and_hms(2024, 5, 7, 15, 0, 0).unwrap();
    let report = scheduler.tick(t1).await;
    assert_eq!(
        report.window_start,
        Some(t1 - Duration::minutes(MAX_CATCH_UP_MINUTES - 1))
    );
    // 12:30和13:30超出补算范围，只补14:30一次
    assert_eq!(report.due, vec![half_past.id]);
    assert_eq!(h.store.execution_count(), 1);
}

#[tokio::test]
async fn test_failed_dispatch_does_not_abort_tick() {
    let h = Harness::new();
    let project = h.project("news").await;
    let pinned = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .with_arguments(&format!("daemon={HOST_A}"))
                .periodic("*/5 * * * *")
                .build(),
        )
        .await;
    let other = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .with_arguments("daemon=http://agent-b:6800")
                .periodic("*/5 * * * *")
                .build(),
        )
        .await;
    h.agents.set_rejecting(HOST_A, true);
    let scheduler = scheduler(&h);
    scheduler.reload().await.unwrap();

    let report = scheduler
        .tick(Utc.with_ymd_and_hms(2024, 5, 7, 14, 5, 0).unwrap())
        .await;

    assert_eq!(report.due, vec![pinned.id, other.id]);
    assert_eq!(report.failed, 1);
    assert_eq!(report.dispatched, 1);
    assert_eq!(h.store.execution_count(), 1);
}

#[tokio::test]
async fn test_slow_dispatches_run_concurrently() {
    let h = Harness::new();
    let project = h.project("news").await;
    for _ in 0..3 {
        h.instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .periodic("* * * * *")
                .build(),
        )
        .await;
    }
    h.agents.set_start_delay(std::time::Duration::from_millis(300));
    let scheduler = scheduler(&h);
    scheduler.reload().await.unwrap();

    let started = Instant::now();
    let report = scheduler.tick(Utc::now()).await;

    assert_eq!(report.dispatched, 3);
    assert!(started.elapsed() < std::time::Duration::from_millis(800));
}

#[tokio::test]
async fn test_overlapping_runs_allowed_by_default() {
    let h = Harness::new();
    let project = h.project("news").await;
    let instance = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .periodic("* * * * *")
                .build(),
        )
        .await;
    h.store.insert_execution(
        JobExecutionBuilder::new()
            .with_project(project.id)
            .with_job_instance(instance.id)
            .with_status(ExecutionStatus::Running)
            .build(),
    );
    let scheduler = scheduler(&h);
    scheduler.reload().await.unwrap();

    let report = scheduler.tick(Utc::now()).await;

    assert_eq!(report.dispatched, 1);
    assert_eq!(report.skipped_running, 0);
}

#[tokio::test]
async fn test_skip_if_running_policy() {
    let mut config = AppConfig::default();
    config.scheduler.skip_if_running = true;
    let h = Harness::with_config(config);
    let project = h.project("news").await;
    let busy = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .periodic("* * * * *")
                .build(),
        )
        .await;
    h.instance(
        JobInstanceBuilder::new()
            .with_project(project.id)
            .periodic("* * * * *")
            .build(),
    )
    .await;
    h.store.insert_execution(
        JobExecutionBuilder::new()
            .with_project(project.id)
            .with_job_instance(busy.id)
            .build(),
    );
    let scheduler = scheduler(&h);
    scheduler.reload().await.unwrap();

    let report = scheduler.tick(Utc::now()).await;

    assert_eq!(report.due.len(), 2);
    assert_eq!(report.skipped_running, 1);
    assert_eq!(report.dispatched, 1);
}

#[tokio::test]
async fn test_disabled_after_reload_is_not_dispatched() {
    let h = Harness::new();
    let project = h.project("news").await;
    let instance = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .periodic("* * * * *")
                .build(),
        )
        .await;
    let scheduler = scheduler(&h);
    scheduler.reload().await.unwrap();
    h.store
        .job_instances()
        .set_enabled(instance.id, false)
        .await
        .unwrap();

    let report = scheduler.tick(Utc::now()).await;

    assert_eq!(report.due, vec![instance.id]);
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.failed, 1);
    assert!(h.agents.start_calls().is_empty());

    scheduler.reload().await.unwrap();
    assert!(scheduler.loaded_instances().await.is_empty());
}
