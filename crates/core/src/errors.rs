use thiserror::Error;

use crate::models::ExecutionStatus;

/// 调度协调引擎错误类型定义
#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("项目未找到: {id}")]
    ProjectNotFound { id: i64 },

    #[error("任务实例未找到: {id}")]
    JobInstanceNotFound { id: i64 },

    #[error("任务执行记录未找到: {id}")]
    JobExecutionNotFound { id: i64 },

    #[error("任务实例已禁用: {id}")]
    JobInstanceDisabled { id: i64 },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("无效的参数: {0}")]
    InvalidArgument(String),

    #[error("Agent不可达: {host} - {message}")]
    AgentUnreachable { host: String, message: String },

    #[error("Agent拒绝执行: {host} - {message}")]
    DispatchRejected { host: String, message: String },

    #[error("没有可用的Agent")]
    NoAgentAvailable,

    #[error("非法的状态转换: {from} -> {to}")]
    IllegalTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl KeeperError {
    pub fn agent_unreachable(host: impl Into<String>, message: impl ToString) -> Self {
        Self::AgentUnreachable {
            host: host.into(),
            message: message.to_string(),
        }
    }

    pub fn dispatch_rejected(host: impl Into<String>, message: impl ToString) -> Self {
        Self::DispatchRejected {
            host: host.into(),
            message: message.to_string(),
        }
    }

    /// 瞬时错误，由下一轮周期任务自动重试
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AgentUnreachable { .. })
    }

    /// 存储层错误，仅中止当前工作单元
    pub fn is_store_error(&self) -> bool {
        matches!(self, Self::Database(_) | Self::DatabaseOperation(_))
    }
}

impl From<serde_json::Error> for KeeperError {
    fn from(err: serde_json::Error) -> Self {
        KeeperError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type KeeperResult<T> = std::result::Result<T, KeeperError>;
