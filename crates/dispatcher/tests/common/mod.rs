#![allow(dead_code)]

use std::sync::Arc;

use keeper_core::{AppConfig, JobInstance, JobInstanceRepository, Project, ProjectRepository};
use keeper_dispatcher::KeeperContext;
use keeper_testing_utils::{InMemoryStore, MockAgentPool};

pub const HOST_A: &str = "http://agent-a:6800";
pub const HOST_B: &str = "http://agent-b:6800";

/// 内存存储 + 可编排Agent池组成的测试环境
pub struct Harness {
    pub store: InMemoryStore,
    pub agents: MockAgentPool,
    pub ctx: KeeperContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    pub fn with_config(mut config: AppConfig) -> Self {
        config.agents.servers = vec![HOST_A.to_string(), HOST_B.to_string()];
        config.agents.request_timeout_seconds = 1;
        let store = InMemoryStore::new();
        let agents = MockAgentPool::new(&[HOST_A, HOST_B]);
        let ctx = KeeperContext::new(
            Arc::new(store.projects()),
            Arc::new(store.job_instances()),
            Arc::new(store.job_executions()),
            Arc::new(store.spiders()),
            Arc::new(agents.clone()),
            config,
        );
        Self { store, agents, ctx }
    }

    pub async fn project(&self, name: &str) -> Project {
        self.store
            .projects()
            .create(&Project::new(name))
            .await
            .unwrap()
    }

    pub async fn instance(&self, instance: JobInstance) -> JobInstance {
        self.store.job_instances().create(&instance).await.unwrap()
    }
}
