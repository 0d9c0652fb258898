use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::KeeperResult;
use crate::models::{ExecutionStatus, SpiderArguments};

/// Agent上报的运行状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteJobStatus {
    Pending,
    Running,
    Finished,
    Canceled,
}

impl RemoteJobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RemoteJobStatus::Finished | RemoteJobStatus::Canceled)
    }

    pub fn to_execution_status(self) -> ExecutionStatus {
        match self {
            RemoteJobStatus::Pending => ExecutionStatus::Pending,
            RemoteJobStatus::Running => ExecutionStatus::Running,
            RemoteJobStatus::Finished => ExecutionStatus::Finished,
            RemoteJobStatus::Canceled => ExecutionStatus::Canceled,
        }
    }
}

/// Agent列表中的一条运行记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteJob {
    pub run_id: String,
    pub spider_name: Option<String>,
    pub status: RemoteJobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// 启动成功后Agent返回的运行标识及所在主机
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchTicket {
    pub agent_run_id: String,
    pub host: String,
}

/// 远程执行Agent池
///
/// 所有调用都涉及网络I/O，实现必须为每次调用设置有限的超时，
/// 超时与连接失败统一返回 `AgentUnreachable`，Agent明确拒绝返回 `DispatchRejected`。
#[async_trait]
pub trait AgentPool: Send + Sync {
    /// 已配置的Agent主机
    fn hosts(&self) -> Vec<String>;

    /// 启动爬虫
    ///
    /// 参数中包含 `daemon=<host>` 时只在该主机启动，否则由Agent池自行选择。
    async fn start(
        &self,
        project: &str,
        spider: &str,
        arguments: &SpiderArguments,
    ) -> KeeperResult<DispatchTicket>;

    /// 取消运行，主机未知时向所有Agent发送
    async fn cancel(&self, project: &str, run_id: &str, host: Option<&str>) -> KeeperResult<()>;

    /// 查询单个Agent上项目的运行列表
    async fn list_jobs(&self, host: &str, project: &str) -> KeeperResult<Vec<RemoteJob>>;

    async fn fetch_log(
        &self,
        project: &str,
        spider: &str,
        run_id: &str,
        host: Option<&str>,
    ) -> KeeperResult<String>;

    /// 项目已部署的爬虫名称
    async fn list_spiders(&self, project: &str) -> KeeperResult<Vec<String>>;

    /// 从所有Agent移除项目的爬虫代码
    async fn delete_project(&self, project: &str) -> KeeperResult<()>;
}
