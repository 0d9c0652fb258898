//! 仓储接口与Agent池的内存实现
//!
//! 四个仓储共享同一份 [`InMemoryStore`] 状态，因此项目删除可以像SQLite实现一样
//! 级联到任务实例、执行记录和爬虫目录。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keeper_core::{
    AgentPool, DispatchTicket, ExecutionStatus, ExecutionTiming, ExecutionUpdate, JobExecution,
    JobExecutionRepository, JobInstance, JobInstanceRepository, JobRunType, KeeperError,
    KeeperResult, Project, ProjectRepository, RemoteJob, SpiderArguments, SpiderInstance,
    SpiderRepository,
};

#[derive(Debug, Default)]
struct StoreState {
    projects: BTreeMap<i64, Project>,
    instances: BTreeMap<i64, JobInstance>,
    executions: BTreeMap<i64, JobExecution>,
    spiders: BTreeMap<i64, SpiderInstance>,
    next_id: i64,
    fail_writes: bool,
}

impl StoreState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_writable(&self) -> KeeperResult<()> {
        if self.fail_writes {
            return Err(KeeperError::DatabaseOperation("模拟的存储写入失败".to_string()));
        }
        Ok(())
    }
}

/// 内存中的任务记录存储
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn projects(&self) -> InMemoryProjectRepository {
        InMemoryProjectRepository {
            state: self.state.clone(),
        }
    }

    pub fn job_instances(&self) -> InMemoryJobInstanceRepository {
        InMemoryJobInstanceRepository {
            state: self.state.clone(),
        }
    }

    pub fn job_executions(&self) -> InMemoryJobExecutionRepository {
        InMemoryJobExecutionRepository {
            state: self.state.clone(),
        }
    }

    pub fn spiders(&self) -> InMemorySpiderRepository {
        InMemorySpiderRepository {
            state: self.state.clone(),
        }
    }

    /// 之后的所有写操作都返回 `DatabaseOperation` 错误
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    /// 直接插入执行记录，保留给定的ID和时间，用于构造历史数据
    pub fn insert_execution(&self, execution: JobExecution) -> JobExecution {
        let mut state = self.state.lock().unwrap();
        let mut execution = execution;
        if execution.id == 0 {
            execution.id = state.next_id();
        } else {
            state.next_id = state.next_id.max(execution.id);
        }
        state.executions.insert(execution.id, execution.clone());
        execution
    }

    pub fn all_executions(&self) -> Vec<JobExecution> {
        self.state
            .lock()
            .unwrap()
            .executions
            .values()
            .cloned()
            .collect()
    }

    pub fn execution_count(&self) -> usize {
        self.state.lock().unwrap().executions.len()
    }

    pub fn all_job_instances(&self) -> Vec<JobInstance> {
        self.state
            .lock()
            .unwrap()
            .instances
            .values()
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryProjectRepository {
    state: Arc<Mutex<StoreState>>,
}

#[async_trait]
impl ProjectRepository for InMemoryProjectRepository {
    async fn create(&self, project: &Project) -> KeeperResult<Project> {
        let mut state = self.state.lock().unwrap();
        state.check_writable()?;
        if state
            .projects
            .values()
            .any(|p| p.project_name == project.project_name)
        {
            return Err(KeeperError::DatabaseOperation(format!(
                "项目名称已存在: {}",
                project.project_name
            )));
        }
        let mut created = project.clone();
        created.id = state.next_id();
        state.projects.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> KeeperResult<Option<Project>> {
        Ok(self.state.lock().unwrap().projects.get(&id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> KeeperResult<Option<Project>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .projects
            .values()
            .find(|p| p.project_name == name)
            .cloned())
    }

    async fn list(&self) -> KeeperResult<Vec<Project>> {
        Ok(self.state.lock().unwrap().projects.values().cloned().collect())
    }

    async fn delete(&self, id: i64) -> KeeperResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_writable()?;
        if state.projects.remove(&id).is_none() {
            return Err(KeeperError::ProjectNotFound { id });
        }
        state.instances.retain(|_, i| i.project_id != id);
        state.executions.retain(|_, e| e.project_id != id);
        state.spiders.retain(|_, s| s.project_id != id);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryJobInstanceRepository {
    state: Arc<Mutex<StoreState>>,
}

#[async_trait]
impl JobInstanceRepository for InMemoryJobInstanceRepository {
    async fn create(&self, instance: &JobInstance) -> KeeperResult<JobInstance> {
        let mut state = self.state.lock().unwrap();
        state.check_writable()?;
        let mut created = instance.clone();
        created.id = state.next_id();
        state.instances.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> KeeperResult<Option<JobInstance>> {
        Ok(self.state.lock().unwrap().instances.get(&id).cloned())
    }

    async fn update(&self, instance: &JobInstance) -> KeeperResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_writable()?;
        match state.instances.get_mut(&instance.id) {
            Some(stored) => {
                *stored = instance.clone();
                stored.updated_at = Utc::now();
                Ok(())
            }
            None => Err(KeeperError::JobInstanceNotFound { id: instance.id }),
        }
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> KeeperResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_writable()?;
        match state.instances.get_mut(&id) {
            Some(stored) => {
                stored.enabled = enabled;
                stored.updated_at = Utc::now();
                Ok(())
            }
            None => Err(KeeperError::JobInstanceNotFound { id }),
        }
    }

    async fn delete(&self, id: i64) -> KeeperResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_writable()?;
        state
            .instances
            .remove(&id)
            .map(|_| ())
            .ok_or(KeeperError::JobInstanceNotFound { id })
    }

    async fn list_by_project(&self, project_id: i64) -> KeeperResult<Vec<JobInstance>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .values()
            .filter(|i| i.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn list_periodic(&self, project_id: i64) -> KeeperResult<Vec<JobInstance>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .values()
            .filter(|i| i.project_id == project_id && i.run_type == JobRunType::Periodic)
            .cloned()
            .collect())
    }

    async fn list_enabled_periodic(&self) -> KeeperResult<Vec<JobInstance>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .values()
            .filter(|i| i.enabled && i.run_type == JobRunType::Periodic)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryJobExecutionRepository {
    state: Arc<Mutex<StoreState>>,
}

#[async_trait]
impl JobExecutionRepository for InMemoryJobExecutionRepository {
    async fn create(&self, execution: &JobExecution) -> KeeperResult<JobExecution> {
        let mut state = self.state.lock().unwrap();
        state.check_writable()?;
        let mut created = execution.clone();
        created.id = state.next_id();
        state.executions.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> KeeperResult<Option<JobExecution>> {
        Ok(self.state.lock().unwrap().executions.get(&id).cloned())
    }

    async fn list_incomplete(&self) -> KeeperResult<Vec<JobExecution>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .executions
            .values()
            .filter(|e| e.is_incomplete())
            .cloned()
            .collect())
    }

    async fn list_incomplete_by_instance(
        &self,
        job_instance_id: i64,
    ) -> KeeperResult<Vec<JobExecution>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .executions
            .values()
            .filter(|e| e.job_instance_id == job_instance_id && e.is_incomplete())
            .cloned()
            .collect())
    }

    async fn apply_update(&self, id: i64, update: &ExecutionUpdate) -> KeeperResult<bool> {
        if update.status == ExecutionStatus::Pending {
            return Err(KeeperError::IllegalTransition {
                from: ExecutionStatus::Pending,
                to: ExecutionStatus::Pending,
            });
        }
        let mut state = self.state.lock().unwrap();
        state.check_writable()?;
        let Some(execution) = state.executions.get_mut(&id) else {
            return Err(KeeperError::JobExecutionNotFound { id });
        };
        let current = execution.running_status;
        let allowed = update.status.predecessors().contains(&current)
            || (current == update.status && !current.is_terminal());
        if !allowed {
            return Ok(false);
        }
        let changed = execution.apply(update)?;
        if changed {
            execution.updated_at = Utc::now();
        }
        Ok(changed)
    }

    async fn list_by_status(
        &self,
        project_id: i64,
        statuses: &[ExecutionStatus],
        limit: i64,
    ) -> KeeperResult<Vec<JobExecution>> {
        let state = self.state.lock().unwrap();
        let mut matched: Vec<JobExecution> = state
            .executions
            .values()
            .filter(|e| e.project_id == project_id && statuses.contains(&e.running_status))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        matched.truncate(limit.max(0) as usize);
        Ok(matched)
    }

    async fn list_created_since(
        &self,
        project_id: i64,
        since: DateTime<Utc>,
    ) -> KeeperResult<Vec<JobExecution>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .executions
            .values()
            .filter(|e| e.project_id == project_id && e.created_at >= since)
            .cloned()
            .collect())
    }

    async fn list_timings(&self, project_id: i64) -> KeeperResult<Vec<ExecutionTiming>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .executions
            .values()
            .filter(|e| e.project_id == project_id)
            .filter_map(|e| {
                state.instances.get(&e.job_instance_id).map(|i| ExecutionTiming {
                    spider_name: i.spider_name.clone(),
                    created_at: e.created_at,
                    start_time: e.start_time,
                    end_time: e.end_time,
                    inferred_completion: e.inferred_completion,
                })
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct InMemorySpiderRepository {
    state: Arc<Mutex<StoreState>>,
}

#[async_trait]
impl SpiderRepository for InMemorySpiderRepository {
    async fn create(&self, spider: &SpiderInstance) -> KeeperResult<SpiderInstance> {
        let mut state = self.state.lock().unwrap();
        state.check_writable()?;
        let mut created = spider.clone();
        created.id = state.next_id();
        state.spiders.insert(created.id, created.clone());
        Ok(created)
    }

    async fn delete(&self, id: i64) -> KeeperResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_writable()?;
        state.spiders.remove(&id);
        Ok(())
    }

    async fn list_by_project(&self, project_id: i64) -> KeeperResult<Vec<SpiderInstance>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .spiders
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect())
    }
}

/// 一次启动请求的记录
#[derive(Debug, Clone, PartialEq)]
pub struct StartCall {
    pub project: String,
    pub spider: String,
    pub arguments: String,
    pub host: String,
}

#[derive(Debug, Default)]
struct AgentState {
    listings: HashMap<String, Vec<RemoteJob>>,
    unreachable: HashSet<String>,
    rejecting: HashSet<String>,
    spiders: HashMap<String, Vec<String>>,
    logs: HashMap<String, String>,
    start_calls: Vec<StartCall>,
    cancel_calls: Vec<(String, String, Option<String>)>,
    list_calls: Vec<(String, String)>,
    log_calls: Vec<(String, String, String)>,
    deleted_projects: Vec<String>,
    start_delay: Option<Duration>,
}

/// 可编排的Agent池
///
/// 启动请求按轮询选择主机，参数中有 `daemon=<host>` 时只使用该主机。
/// 返回的运行标识是随机的UUID。
#[derive(Debug, Clone)]
pub struct MockAgentPool {
    hosts: Vec<String>,
    cursor: Arc<AtomicUsize>,
    state: Arc<Mutex<AgentState>>,
}

impl MockAgentPool {
    pub fn new(hosts: &[&str]) -> Self {
        Self {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            cursor: Arc::new(AtomicUsize::new(0)),
            state: Arc::new(Mutex::new(AgentState::default())),
        }
    }

    /// 设置某个主机的运行列表
    pub fn set_listing(&self, host: &str, jobs: Vec<RemoteJob>) {
        self.state
            .lock()
            .unwrap()
            .listings
            .insert(host.to_string(), jobs);
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut state = self.state.lock().unwrap();
        if unreachable {
            state.unreachable.insert(host.to_string());
        } else {
            state.unreachable.remove(host);
        }
    }

    pub fn set_rejecting(&self, host: &str, rejecting: bool) {
        let mut state = self.state.lock().unwrap();
        if rejecting {
            state.rejecting.insert(host.to_string());
        } else {
            state.rejecting.remove(host);
        }
    }

    pub fn set_spiders(&self, project: &str, spiders: &[&str]) {
        self.state.lock().unwrap().spiders.insert(
            project.to_string(),
            spiders.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn set_log(&self, run_id: &str, text: &str) {
        self.state
            .lock()
            .unwrap()
            .logs
            .insert(run_id.to_string(), text.to_string());
    }

    /// 每次启动请求在返回前等待的时间
    pub fn set_start_delay(&self, delay: Duration) {
        self.state.lock().unwrap().start_delay = Some(delay);
    }

    pub fn start_calls(&self) -> Vec<StartCall> {
        self.state.lock().unwrap().start_calls.clone()
    }

    pub fn cancel_calls(&self) -> Vec<(String, String, Option<String>)> {
        self.state.lock().unwrap().cancel_calls.clone()
    }

    pub fn list_calls(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().list_calls.clone()
    }

    /// 日志请求：(项目, 爬虫, 运行标识)
    pub fn log_calls(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().log_calls.clone()
    }

    pub fn deleted_projects(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_projects.clone()
    }

    fn select_host(&self, arguments: &SpiderArguments) -> KeeperResult<String> {
        if let Some(daemon) = arguments.daemon() {
            return if self.hosts.iter().any(|h| h == daemon) {
                Ok(daemon.to_string())
            } else {
                Err(KeeperError::dispatch_rejected(daemon, "未配置的Agent"))
            };
        }
        if self.hosts.is_empty() {
            return Err(KeeperError::NoAgentAvailable);
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst) % self.hosts.len();
        Ok(self.hosts[index].clone())
    }

    fn check_reachable(&self, host: &str) -> KeeperResult<()> {
        if self.state.lock().unwrap().unreachable.contains(host) {
            return Err(KeeperError::agent_unreachable(host, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl AgentPool for MockAgentPool {
    fn hosts(&self) -> Vec<String> {
        self.hosts.clone()
    }

    async fn start(
        &self,
        project: &str,
        spider: &str,
        arguments: &SpiderArguments,
    ) -> KeeperResult<DispatchTicket> {
        let host = self.select_host(arguments)?;
        let delay = self.state.lock().unwrap().start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable(&host)?;

        let mut state = self.state.lock().unwrap();
        state.start_calls.push(StartCall {
            project: project.to_string(),
            spider: spider.to_string(),
            arguments: arguments.to_string(),
            host: host.clone(),
        });
        if state.rejecting.contains(&host) {
            return Err(KeeperError::dispatch_rejected(&host, "spider not found"));
        }
        Ok(DispatchTicket {
            agent_run_id: uuid::Uuid::new_v4().simple().to_string(),
            host,
        })
    }

    async fn cancel(&self, project: &str, run_id: &str, host: Option<&str>) -> KeeperResult<()> {
        if let Some(host) = host {
            self.check_reachable(host)?;
        }
        self.state.lock().unwrap().cancel_calls.push((
            project.to_string(),
            run_id.to_string(),
            host.map(str::to_string),
        ));
        Ok(())
    }

    async fn list_jobs(&self, host: &str, project: &str) -> KeeperResult<Vec<RemoteJob>> {
        self.check_reachable(host)?;
        let mut state = self.state.lock().unwrap();
        state
            .list_calls
            .push((host.to_string(), project.to_string()));
        Ok(state.listings.get(host).cloned().unwrap_or_default())
    }

    async fn fetch_log(
        &self,
        project: &str,
        spider: &str,
        run_id: &str,
        host: Option<&str>,
    ) -> KeeperResult<String> {
        if let Some(host) = host {
            self.check_reachable(host)?;
        }
        let mut state = self.state.lock().unwrap();
        state
            .log_calls
            .push((project.to_string(), spider.to_string(), run_id.to_string()));
        Ok(state.logs.get(run_id).cloned().unwrap_or_default())
    }

    async fn list_spiders(&self, project: &str) -> KeeperResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        if !self.hosts.is_empty() && self.hosts.iter().all(|h| state.unreachable.contains(h)) {
            return Err(KeeperError::agent_unreachable(&self.hosts[0], "connection refused"));
        }
        Ok(state.spiders.get(project).cloned().unwrap_or_default())
    }

    async fn delete_project(&self, project: &str) -> KeeperResult<()> {
        self.state
            .lock()
            .unwrap()
            .deleted_projects
            .push(project.to_string());
        Ok(())
    }
}
