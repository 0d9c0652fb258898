mod common;

use std::time::Duration;

use common::{Harness, HOST_A, HOST_B};
use keeper_core::{ExecutionStatus, JobPriority, KeeperError};
use keeper_dispatcher::JobDispatcher;
use keeper_testing_utils::JobInstanceBuilder;

#[tokio::test]
async fn test_dispatch_creates_pending_execution() {
    let h = Harness::new();
    let project = h.project("news").await;
    let instance = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .with_spider("news-spider")
                .with_arguments("city=nyc")
                .build(),
        )
        .await;
    let dispatcher = JobDispatcher::new(h.ctx.clone());

    let execution = dispatcher.dispatch(instance.id).await.unwrap();

    assert_eq!(execution.running_status, ExecutionStatus::Pending);
    assert!(!execution.agent_run_id.is_empty());
    assert_eq!(execution.running_on.as_deref(), Some(HOST_A));
    assert_eq!(execution.job_instance_id, instance.id);
    assert_eq!(execution.project_id, project.id);
    assert!(execution.start_time.is_none());

    let calls = h.agents.start_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].project, "news");
    assert_eq!(calls[0].spider, "news-spider");
    assert_eq!(calls[0].arguments, "city=nyc");
    assert_eq!(h.store.execution_count(), 1);
}

#[tokio::test]
async fn test_dispatch_round_robins_hosts() {
    let h = Harness::new();
    let project = h.project("news").await;
    let instance = h
        .instance(JobInstanceBuilder::new().with_project(project.id).build())
        .await;
    let dispatcher = JobDispatcher::new(h.ctx.clone());

    let first = dispatcher.dispatch(instance.id).await.unwrap();
    let second = dispatcher.dispatch(instance.id).await.unwrap();

    assert_eq!(first.running_on.as_deref(), Some(HOST_A));
    assert_eq!(second.running_on.as_deref(), Some(HOST_B));
    assert_ne!(first.agent_run_id, second.agent_run_id);
    assert_eq!(h.store.execution_count(), 2);
}

#[tokio::test]
async fn test_pinned_daemon_is_passed_verbatim() {
    let h = Harness::new();
    let project = h.project("news").await;
    let instance = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .with_arguments(&format!("page=1,daemon={HOST_B}"))
                .build(),
        )
        .await;
    let dispatcher = JobDispatcher::new(h.ctx.clone());

    for _ in 0..2 {
        let execution = dispatcher.dispatch(instance.id).await.unwrap();
        assert_eq!(execution.running_on.as_deref(), Some(HOST_B));
    }
    assert_eq!(
        h.agents.start_calls()[0].arguments,
        format!("page=1,daemon={HOST_B}")
    );
}

#[tokio::test]
async fn test_rejected_dispatch_creates_no_execution() {
    let h = Harness::new();
    let project = h.project("news").await;
    let instance = h
        .instance(JobInstanceBuilder::new().with_project(project.id).build())
        .await;
    h.agents.set_rejecting(HOST_A, true);
    let dispatcher = JobDispatcher::new(h.ctx.clone());

    let err = dispatcher.dispatch(instance.id).await.unwrap_err();

    assert!(matches!(err, KeeperError::DispatchRejected { .. }));
    assert_eq!(h.store.execution_count(), 0);
}

#[tokio::test]
async fn test_unreachable_dispatch_creates_no_execution() {
    let h = Harness::new();
    let project = h.project("news").await;
    let instance = h
        .instance(JobInstanceBuilder::new().with_project(project.id).build())
        .await;
    h.agents.set_unreachable(HOST_A, true);
    let dispatcher = JobDispatcher::new(h.ctx.clone());

    let err = dispatcher.dispatch(instance.id).await.unwrap_err();

    assert!(err.is_transient());
    assert_eq!(h.store.execution_count(), 0);
}

#[tokio::test]
async fn test_hung_agent_times_out() {
    let h = Harness::new();
    let project = h.project("news").await;
    let instance = h
        .instance(JobInstanceBuilder::new().with_project(project.id).build())
        .await;
    h.agents.set_start_delay(Duration::from_secs(5));
    let dispatcher = JobDispatcher::new(h.ctx.clone());

    let started = std::time::Instant::now();
    let err = dispatcher.dispatch(instance.id).await.unwrap_err();

    assert!(matches!(err, KeeperError::AgentUnreachable { .. }));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(h.store.execution_count(), 0);
}

#[tokio::test]
async fn test_dispatch_validates_instance() {
    let h = Harness::new();
    let project = h.project("news").await;
    let disabled = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .disabled()
                .build(),
        )
        .await;
    let orphan = h
        .instance(JobInstanceBuilder::new().with_project(project.id + 100).build())
        .await;
    let dispatcher = JobDispatcher::new(h.ctx.clone());

    assert!(matches!(
        dispatcher.dispatch(9999).await,
        Err(KeeperError::JobInstanceNotFound { id: 9999 })
    ));
    assert!(matches!(
        dispatcher.dispatch(disabled.id).await,
        Err(KeeperError::JobInstanceDisabled { .. })
    ));
    assert!(matches!(
        dispatcher.dispatch(orphan.id).await,
        Err(KeeperError::ProjectNotFound { .. })
    ));
    assert!(h.agents.start_calls().is_empty());
}

#[tokio::test]
async fn test_store_failure_after_start_is_reported() {
    let h = Harness::new();
    let project = h.project("news").await;
    let instance = h
        .instance(JobInstanceBuilder::new().with_project(project.id).build())
        .await;
    h.store.set_fail_writes(true);
    let dispatcher = JobDispatcher::new(h.ctx.clone());

    let err = dispatcher.dispatch(instance.id).await.unwrap_err();

    assert!(err.is_store_error());
    assert_eq!(h.agents.start_calls().len(), 1);
    assert_eq!(h.store.execution_count(), 0);
}

#[tokio::test]
async fn test_dispatch_replicas_by_priority() {
    let h = Harness::new();
    let project = h.project("news").await;
    let normal = h
        .instance(JobInstanceBuilder::new().with_project(project.id).build())
        .await;
    let highest = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .with_priority(JobPriority::Highest)
                .build(),
        )
        .await;
    let pinned = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .with_priority(JobPriority::Highest)
                .with_arguments(&format!("daemon={HOST_A}"))
                .build(),
        )
        .await;
    let dispatcher = JobDispatcher::new(h.ctx.clone());

    assert_eq!(dispatcher.dispatch_replicas(normal.id).await.unwrap().len(), 1);

    let replicas = dispatcher.dispatch_replicas(highest.id).await.unwrap();
    assert_eq!(replicas.len(), 2);
    let mut hosts: Vec<_> = replicas
        .iter()
        .map(|e| e.running_on.clone().unwrap())
        .collect();
    hosts.sort();
    assert_eq!(hosts, vec![HOST_A.to_string(), HOST_B.to_string()]);

    assert_eq!(dispatcher.dispatch_replicas(pinned.id).await.unwrap().len(), 1);
    assert_eq!(h.store.execution_count(), 4);
}

#[tokio::test]
async fn test_dispatch_replicas_keeps_partial_success() {
    let h = Harness::new();
    let project = h.project("news").await;
    let highest = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .with_priority(JobPriority::Highest)
                .build(),
        )
        .await;
    h.agents.set_unreachable(HOST_B, true);
    let dispatcher = JobDispatcher::new(h.ctx.clone());

    let replicas = dispatcher.dispatch_replicas(highest.id).await.unwrap();
    assert_eq!(replicas.len(), 1);
    assert_eq!(replicas[0].running_on.as_deref(), Some(HOST_A));

    h.agents.set_unreachable(HOST_A, true);
    assert!(dispatcher.dispatch_replicas(highest.id).await.is_err());
    assert_eq!(h.store.execution_count(), 1);
}
