mod common;

use common::{Harness, HOST_A, HOST_B};
use keeper_core::{
    CronFields, ExecutionStatus, JobExecutionRepository, JobInstanceRepository, JobRunType,
    KeeperError, NewJobInstance, RemoteJob, RemoteJobStatus, SpiderInstance, SpiderRepository,
};
use keeper_dispatcher::{JobDispatcher, JobService};
use keeper_testing_utils::{JobExecutionBuilder, JobInstanceBuilder};

fn service(h: &Harness) -> JobService {
    JobService::new(h.ctx.clone(), JobDispatcher::new(h.ctx.clone()))
}

#[tokio::test]
async fn test_create_project_is_idempotent() {
    let h = Harness::new();
    let service = service(&h);

    let first = service.create_project("news").await.unwrap();
    let second = service.create_project(" news ").await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(service.list_projects().await.unwrap().len(), 1);
    assert!(matches!(
        service.create_project("  ").await,
        Err(KeeperError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_delete_project_cascades() {
    let h = Harness::new();
    let service = service(&h);
    let project = service.create_project("news").await.unwrap();
    let keep = service.create_project("sports").await.unwrap();
    let instance = h
        .instance(JobInstanceBuilder::new().with_project(project.id).build())
        .await;
    h.store.insert_execution(
        JobExecutionBuilder::new()
            .with_project(project.id)
            .with_job_instance(instance.id)
            .build(),
    );
    h.store.insert_execution(JobExecutionBuilder::new().with_project(keep.id).build());
    h.store
        .spiders()
        .create(&SpiderInstance::new(project.id, "news-spider"))
        .await
        .unwrap();

    service.delete_project(project.id).await.unwrap();

    assert_eq!(h.agents.deleted_projects(), vec!["news".to_string()]);
    assert_eq!(service.list_projects().await.unwrap(), vec![keep.clone()]);
    assert!(h.store.all_job_instances().is_empty());
    assert_eq!(h.store.execution_count(), 1);
    assert!(h.store.spiders().list_by_project(project.id).await.unwrap().is_empty());
    assert!(matches!(
        service.delete_project(project.id).await,
        Err(KeeperError::ProjectNotFound { .. })
    ));
}

#[tokio::test]
async fn test_create_onetime_instance_dispatches_immediately() {
    let h = Harness::new();
    let service = service(&h);
    let project = service.create_project("news").await.unwrap();

    let submission = service
        .create_job_instance(NewJobInstance {
            project_id: project.id,
            spider_name: "news-spider".to_string(),
            spider_arguments: "city=nyc".to_string(),
            run_type: Some(JobRunType::Onetime),
            daemon: Some(HOST_B.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(submission.job_instance.enabled);
    assert_eq!(
        submission.job_instance.spider_arguments,
        format!("city=nyc,daemon={HOST_B}")
    );
    let execution = submission.execution.unwrap();
    assert_eq!(execution.running_status, ExecutionStatus::Pending);
    assert_eq!(execution.running_on.as_deref(), Some(HOST_B));
}

#[tokio::test]
async fn test_create_periodic_instance_is_only_stored() {
    let h = Harness::new();
    let service = service(&h);
    let project = service.create_project("news").await.unwrap();

    let submission = service
        .create_job_instance(NewJobInstance {
            project_id: project.id,
            spider_name: "news-spider".to_string(),
            run_type: Some(JobRunType::Periodic),
            cron: Some(CronFields::from_parts(Some("15"), Some("*/2"), None, None, None)),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(submission.execution.is_none());
    assert_eq!(submission.job_instance.cron.to_string(), "15 */2 * * *");
    assert!(h.agents.start_calls().is_empty());
    assert_eq!(service.list_periodic(project.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_cron_is_rejected_before_persistence() {
    let h = Harness::new();
    let service = service(&h);
    let project = service.create_project("news").await.unwrap();

    let err = service
        .create_job_instance(NewJobInstance {
            project_id: project.id,
            spider_name: "news-spider".to_string(),
            run_type: Some(JobRunType::Periodic),
            cron_expression: Some("0 25 * * *".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, KeeperError::InvalidCron { .. }));
    assert!(h.store.all_job_instances().is_empty());

    let missing_project = service
        .create_job_instance(NewJobInstance {
            project_id: 404,
            spider_name: "news-spider".to_string(),
            run_type: Some(JobRunType::Onetime),
            ..Default::default()
        })
        .await;
    assert!(matches!(missing_project, Err(KeeperError::ProjectNotFound { id: 404 })));
}

#[tokio::test]
async fn test_update_revalidates_cron() {
    let h = Harness::new();
    let service = service(&h);
    let project = service.create_project("news").await.unwrap();
    let mut instance = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .periodic("0 * * * *")
                .build(),
        )
        .await;

    instance.cron.minute = "61".to_string();
    assert!(matches!(
        service.update_job_instance(&instance).await,
        Err(KeeperError::InvalidCron { .. })
    ));

    instance.cron.minute = "5".to_string();
    service.update_job_instance(&instance).await.unwrap();
    let stored = h.store.job_instances().get_by_id(instance.id).await.unwrap().unwrap();
    assert_eq!(stored.cron.minute, "5");
}

#[tokio::test]
async fn test_toggle_and_delete_instance_keeps_history() {
    let h = Harness::new();
    let service = service(&h);
    let project = service.create_project("news").await.unwrap();
    let instance = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .periodic("0 * * * *")
                .build(),
        )
        .await;

    assert!(!service.toggle_enabled(instance.id).await.unwrap());
    assert!(matches!(
        service.run_now(instance.id).await,
        Err(KeeperError::JobInstanceDisabled { .. })
    ));
    assert!(service.toggle_enabled(instance.id).await.unwrap());
    let execution = service.run_now(instance.id).await.unwrap();

    service.delete_job_instance(instance.id).await.unwrap();

    assert!(service.list_job_instances(project.id).await.unwrap().is_empty());
    let kept = h.store.job_executions().get_by_id(execution.id).await.unwrap();
    assert!(kept.is_some());
    let view = service.describe_execution(kept.unwrap()).await.unwrap();
    assert!(view.job_instance.is_empty());
}

#[tokio::test]
async fn test_cancel_execution() {
    let h = Harness::new();
    let service = service(&h);
    let project = service.create_project("news").await.unwrap();
    let instance = h
        .instance(JobInstanceBuilder::new().with_project(project.id).build())
        .await;
    let execution = service.run_now(instance.id).await.unwrap();

    let canceled = service.cancel_execution(execution.id).await.unwrap();

    assert_eq!(canceled.running_status, ExecutionStatus::Canceled);
    assert!(canceled.end_time.is_some());
    assert_eq!(
        h.agents.cancel_calls(),
        vec![(
            "news".to_string(),
            execution.agent_run_id.clone(),
            Some(HOST_A.to_string())
        )]
    );

    // 已是终态时不再请求Agent
    let again = service.cancel_execution(execution.id).await.unwrap();
    assert_eq!(again, canceled);
    assert_eq!(h.agents.cancel_calls().len(), 1);
}

#[tokio::test]
async fn test_cancel_with_unreachable_agent_keeps_state() {
    let h = Harness::new();
    let service = service(&h);
    let project = service.create_project("news").await.unwrap();
    let instance = h
        .instance(JobInstanceBuilder::new().with_project(project.id).build())
        .await;
    let execution = service.run_now(instance.id).await.unwrap();
    h.agents.set_unreachable(HOST_A, true);

    let err = service.cancel_execution(execution.id).await.unwrap_err();

    assert!(err.is_transient());
    let stored = h.store.job_executions().get_by_id(execution.id).await.unwrap().unwrap();
    assert_eq!(stored.running_status, ExecutionStatus::Pending);
}

#[tokio::test]
async fn test_fetch_log_lines() {
    let h = Harness::new();
    let service = service(&h);
    let project = service.create_project("news").await.unwrap();
    let instance = h
        .instance(JobInstanceBuilder::new().with_project(project.id).build())
        .await;
    let execution = service.run_now(instance.id).await.unwrap();
    h.agents
        .set_log(&execution.agent_run_id, "INFO start\nINFO done\n");

    let lines = service.fetch_log(execution.id).await.unwrap();

    assert_eq!(lines, vec!["INFO start", "INFO done"]);
    assert!(matches!(
        service.fetch_log(9999).await,
        Err(KeeperError::JobExecutionNotFound { id: 9999 })
    ));
}

#[tokio::test]
async fn test_fetch_log_after_instance_deleted() {
    let h = Harness::new();
    let service = service(&h);
    let project = service.create_project("news").await.unwrap();
    let instance = h
        .instance(
            JobInstanceBuilder::new()
                .with_project(project.id)
                .with_spider("news-spider")
                .build(),
        )
        .await;
    let execution = service.run_now(instance.id).await.unwrap();
    let host = execution.running_on.clone().unwrap();
    service.delete_job_instance(instance.id).await.unwrap();
    h.agents.set_log(&execution.agent_run_id, "INFO done\n");
    h.agents.set_listing(
        &host,
        vec![RemoteJob {
            run_id: execution.agent_run_id.clone(),
            spider_name: Some("news-spider".to_string()),
            status: RemoteJobStatus::Finished,
            start_time: None,
            end_time: None,
        }],
    );

    let lines = service.fetch_log(execution.id).await.unwrap();

    assert_eq!(lines, vec!["INFO done"]);
    assert_eq!(
        h.agents.log_calls(),
        vec![(
            "news".to_string(),
            "news-spider".to_string(),
            execution.agent_run_id.clone()
        )]
    );
}

#[tokio::test]
async fn test_fetch_log_without_instance_or_listing() {
    let h = Harness::new();
    let service = service(&h);
    let project = service.create_project("news").await.unwrap();
    let instance = h
        .instance(JobInstanceBuilder::new().with_project(project.id).build())
        .await;
    let execution = service.run_now(instance.id).await.unwrap();
    service.delete_job_instance(instance.id).await.unwrap();

    assert!(matches!(
        service.fetch_log(execution.id).await,
        Err(KeeperError::JobInstanceNotFound { id }) if id == instance.id
    ));
    assert!(h.agents.log_calls().is_empty());
}
