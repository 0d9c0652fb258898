use std::sync::Arc;
use std::time::Duration;

use keeper_core::{
    AppConfig, ExecutionStatus, JobExecutionRepository, JobRunType, NewJobInstance, RemoteJob,
    RemoteJobStatus,
};
use keeper_dispatcher::Reconciler;
use keeper_infrastructure::DatabaseManager;
use keeper_testing_utils::MockAgentPool;
use spider_keeper::{Application, ShutdownManager};

const HOST: &str = "http://agent-a:6800";

async fn application(config: AppConfig) -> (Application, MockAgentPool) {
    let database = DatabaseManager::in_memory().await.unwrap();
    let agents = MockAgentPool::new(&[HOST]);
    let app = Application::from_parts(database, Arc::new(agents.clone()), config);
    (app, agents)
}

#[tokio::test]
async fn test_enabled_loops_follow_config() {
    let (app, _) = application(AppConfig::default()).await;
    let names: Vec<&str> = app.services().iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["cron_scheduler", "reconciler", "spider_sync"]);

    let mut config = AppConfig::default();
    config.reconciler.enabled = false;
    config.spider_sync.enabled = false;
    let (app, _) = application(config).await;
    let names: Vec<&str> = app.services().iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["cron_scheduler"]);
}

#[tokio::test]
async fn test_loops_stop_on_shutdown() {
    let (app, _) = application(AppConfig::default()).await;
    let shutdown = ShutdownManager::new();

    assert_eq!(app.start(&shutdown).await, 3);
    assert_eq!(shutdown.task_count().await, 3);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(shutdown.shutdown(Duration::from_secs(5)).await);
    app.close().await;
}

#[tokio::test]
async fn test_onetime_job_lifecycle_on_sqlite() {
    let (app, agents) = application(AppConfig::default()).await;
    let service = app.job_service();

    let project = service.create_project("news").await.unwrap();
    let submission = service
        .create_job_instance(NewJobInstance {
            project_id: project.id,
            spider_name: "news-spider".to_string(),
            run_type: Some(JobRunType::Onetime),
            ..Default::default()
        })
        .await
        .unwrap();
    let execution = submission.execution.unwrap();
    assert_eq!(execution.running_on.as_deref(), Some(HOST));

    agents.set_listing(
        HOST,
        vec![RemoteJob {
            run_id: execution.agent_run_id.clone(),
            spider_name: Some("news-spider".to_string()),
            status: RemoteJobStatus::Finished,
            start_time: None,
            end_time: None,
        }],
    );
    let report = Reconciler::new(app.context().clone())
        .reconcile_once()
        .await
        .unwrap();
    assert_eq!(report.updated, 1);

    let stored = app
        .context()
        .job_executions
        .get_by_id(execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.running_status, ExecutionStatus::Finished);
    assert!(stored.end_time.is_some());
    assert!(!stored.inferred_completion);
}
