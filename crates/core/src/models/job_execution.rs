use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{KeeperError, KeeperResult};

/// 执行状态，严格单向：PENDING → RUNNING → {FINISHED, CANCELED}
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "CANCELED")]
    Canceled,
}

impl ExecutionStatus {
    pub const INCOMPLETE: [ExecutionStatus; 2] = [ExecutionStatus::Pending, ExecutionStatus::Running];
    pub const COMPLETED: [ExecutionStatus; 2] = [ExecutionStatus::Finished, ExecutionStatus::Canceled];

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Finished => "FINISHED",
            ExecutionStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Finished | ExecutionStatus::Canceled)
    }

    fn rank(self) -> u8 {
        match self {
            ExecutionStatus::Pending => 0,
            ExecutionStatus::Running => 1,
            ExecutionStatus::Finished | ExecutionStatus::Canceled => 2,
        }
    }

    /// 是否允许从当前状态前进到 `next`
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// 执行状态转换，拒绝回退和离开终态
    pub fn transition(self, next: ExecutionStatus) -> KeeperResult<ExecutionStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(KeeperError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }

    /// 可以前进到 `self` 的所有前驱状态
    pub fn predecessors(self) -> &'static [ExecutionStatus] {
        match self {
            ExecutionStatus::Pending => &[],
            ExecutionStatus::Running => &[ExecutionStatus::Pending],
            ExecutionStatus::Finished | ExecutionStatus::Canceled => &ExecutionStatus::INCOMPLETE,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "FINISHED" => Ok(ExecutionStatus::Finished),
            "CANCELED" => Ok(ExecutionStatus::Canceled),
            other => Err(KeeperError::Serialization(format!(
                "无效的执行状态: {other}"
            ))),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for ExecutionStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for ExecutionStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        s.parse::<ExecutionStatus>()
            .map_err(|e| e.to_string().into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for ExecutionStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 任务实例的一次运行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobExecution {
    pub id: i64,
    pub project_id: i64,
    /// 弱引用，实例可能已被删除
    pub job_instance_id: i64,
    /// Agent分配的运行标识，用于和Agent上报的状态关联
    pub agent_run_id: String,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub running_status: ExecutionStatus,
    pub running_on: Option<String>,
    /// 终态由协调器推断（Agent丢失了运行记录），而非Agent明确上报
    pub inferred_completion: bool,
    pub updated_at: DateTime<Utc>,
}

impl JobExecution {
    /// 下发成功后创建的PENDING执行记录
    pub fn pending(
        project_id: i64,
        job_instance_id: i64,
        agent_run_id: impl Into<String>,
        running_on: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0, // 将由数据库生成
            project_id,
            job_instance_id,
            agent_run_id: agent_run_id.into(),
            created_at,
            start_time: None,
            end_time: None,
            running_status: ExecutionStatus::Pending,
            running_on,
            inferred_completion: false,
            updated_at: created_at,
        }
    }

    pub fn is_incomplete(&self) -> bool {
        !self.running_status.is_terminal()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// 运行时长（秒），需要开始和结束时间
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    /// 在内存中应用更新，返回是否有字段变化
    pub fn apply(&mut self, update: &ExecutionUpdate) -> KeeperResult<bool> {
        let mut changed = false;
        if update.status != self.running_status {
            self.running_status = self.running_status.transition(update.status)?;
            changed = true;
        } else if self.running_status.is_terminal() {
            return Ok(false);
        }
        if self.start_time.is_none() && update.start_time.is_some() {
            self.start_time = update.start_time;
            changed = true;
        }
        if update.end_time.is_some() && self.end_time != update.end_time {
            self.end_time = update.end_time;
            changed = true;
        }
        if update.running_on.is_some() && self.running_on != update.running_on {
            self.running_on = update.running_on.clone();
            changed = true;
        }
        if update.inferred_completion && !self.inferred_completion {
            self.inferred_completion = true;
            changed = true;
        }
        Ok(changed)
    }
}

/// 协调器或取消请求对一条执行记录的更新
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionUpdate {
    pub status: ExecutionStatus,
    /// 仅在原值为空时写入
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub running_on: Option<String>,
    pub inferred_completion: bool,
}

impl ExecutionUpdate {
    pub fn running(start_time: Option<DateTime<Utc>>, running_on: Option<String>) -> Self {
        Self {
            status: ExecutionStatus::Running,
            start_time,
            end_time: None,
            running_on,
            inferred_completion: false,
        }
    }

    pub fn terminal(
        status: ExecutionStatus,
        start_time: Option<DateTime<Utc>>,
        end_time: DateTime<Utc>,
        running_on: Option<String>,
    ) -> Self {
        Self {
            status,
            start_time,
            end_time: Some(end_time),
            running_on,
            inferred_completion: false,
        }
    }

    pub fn inferred_finished(end_time: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Finished,
            start_time: None,
            end_time: Some(end_time),
            running_on: None,
            inferred_completion: true,
        }
    }

    pub fn canceled(end_time: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Canceled,
            start_time: None,
            end_time: Some(end_time),
            running_on: None,
            inferred_completion: false,
        }
    }
}
