use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use keeper_core::{
    AgentPool, AgentsConfig, DispatchTicket, KeeperError, KeeperResult, RemoteJob,
    SpiderArguments,
};
use tracing::{debug, warn};

use super::scrapyd::ScrapydAgent;

/// 由配置的多个Scrapyd Agent组成的Agent池
///
/// 未指定 `daemon` 参数时按轮询选择主机。
pub struct HttpAgentPool {
    agents: Vec<ScrapydAgent>,
    counter: AtomicUsize,
}

impl HttpAgentPool {
    pub fn new(config: &AgentsConfig) -> KeeperResult<Self> {
        let agents = config
            .servers
            .iter()
            .map(|server| ScrapydAgent::new(server.as_str(), config))
            .collect::<KeeperResult<Vec<_>>>()?;
        Ok(Self {
            agents,
            counter: AtomicUsize::new(0),
        })
    }

    fn agent(&self, host: &str) -> Option<&ScrapydAgent> {
        let host = host.trim_end_matches('/');
        self.agents.iter().find(|agent| agent.server() == host)
    }

    fn select(&self, arguments: &SpiderArguments) -> KeeperResult<&ScrapydAgent> {
        if let Some(daemon) = arguments.daemon() {
            return self
                .agent(daemon)
                .ok_or_else(|| KeeperError::dispatch_rejected(daemon, "未配置的Agent"));
        }
        if self.agents.is_empty() {
            return Err(KeeperError::NoAgentAvailable);
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.agents.len();
        debug!(
            "轮询选择Agent: {} (索引: {}/{})",
            self.agents[index].server(),
            index,
            self.agents.len()
        );
        Ok(&self.agents[index])
    }
}

#[async_trait]
impl AgentPool for HttpAgentPool {
    fn hosts(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.server().to_string()).collect()
    }

    async fn start(
        &self,
        project: &str,
        spider: &str,
        arguments: &SpiderArguments,
    ) -> KeeperResult<DispatchTicket> {
        let agent = self.select(arguments)?;
        let agent_run_id = agent.schedule(project, spider, arguments).await?;
        Ok(DispatchTicket {
            agent_run_id,
            host: agent.server().to_string(),
        })
    }

    /// 主机已知时只发给该主机，否则发给所有Agent，任意一个成功即视为成功
    async fn cancel(&self, project: &str, run_id: &str, host: Option<&str>) -> KeeperResult<()> {
        if let Some(host) = host {
            let agent = self
                .agent(host)
                .ok_or_else(|| KeeperError::dispatch_rejected(host, "未配置的Agent"))?;
            return agent.cancel(project, run_id).await;
        }

        let results = join_all(self.agents.iter().map(|a| a.cancel(project, run_id))).await;
        first_success(results.into_iter())
    }

    async fn list_jobs(&self, host: &str, project: &str) -> KeeperResult<Vec<RemoteJob>> {
        match self.agent(host) {
            Some(agent) => agent.list_jobs(project).await,
            None => Err(KeeperError::agent_unreachable(host, "未配置的Agent")),
        }
    }

    async fn fetch_log(
        &self,
        project: &str,
        spider: &str,
        run_id: &str,
        host: Option<&str>,
    ) -> KeeperResult<String> {
        if let Some(agent) = host.and_then(|h| self.agent(h)) {
            return agent.fetch_log(project, spider, run_id).await;
        }
        let mut answered = false;
        let mut last_error = KeeperError::NoAgentAvailable;
        for agent in &self.agents {
            match agent.fetch_log(project, spider, run_id).await {
                Ok(text) if !text.is_empty() => return Ok(text),
                Ok(_) => answered = true,
                Err(e) => last_error = e,
            }
        }
        if answered {
            Ok(String::new())
        } else {
            Err(last_error)
        }
    }

    /// 依次询问各Agent，返回第一个成功的结果
    async fn list_spiders(&self, project: &str) -> KeeperResult<Vec<String>> {
        let mut last_error = KeeperError::NoAgentAvailable;
        for agent in &self.agents {
            match agent.list_spiders(project).await {
                Ok(spiders) => return Ok(spiders),
                Err(e) => {
                    warn!("获取爬虫列表失败: {}", e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn delete_project(&self, project: &str) -> KeeperResult<()> {
        let results = join_all(self.agents.iter().map(|a| a.delete_project(project))).await;
        for result in &results {
            if let Err(e) = result {
                warn!("从Agent删除项目 {} 失败: {}", project, e);
            }
        }
        first_success(results.into_iter())
    }
}

fn first_success(results: impl Iterator<Item = KeeperResult<()>>) -> KeeperResult<()> {
    let mut last_error = KeeperError::NoAgentAvailable;
    for result in results {
        match result {
            Ok(()) => return Ok(()),
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}
