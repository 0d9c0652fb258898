use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobExecution, JobInstance, JobPriority, JobRunType};

/// 执行记录附带的任务实例摘要，实例不存在时为空
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobInstanceSummary {
    pub job_instance_id: Option<i64>,
    pub spider_name: Option<String>,
    pub spider_arguments: Option<String>,
    pub priority: Option<JobPriority>,
    pub run_type: Option<JobRunType>,
    pub tags: Vec<String>,
}

impl JobInstanceSummary {
    pub fn is_empty(&self) -> bool {
        self.job_instance_id.is_none()
    }
}

impl From<&JobInstance> for JobInstanceSummary {
    fn from(instance: &JobInstance) -> Self {
        Self {
            job_instance_id: Some(instance.id),
            spider_name: Some(instance.spider_name.clone()),
            spider_arguments: Some(instance.spider_arguments.clone()),
            priority: Some(instance.priority),
            run_type: Some(instance.run_type),
            tags: instance.tag_list(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionView {
    pub execution: JobExecution,
    pub job_instance: JobInstanceSummary,
}

/// 按状态分组的执行记录（仪表盘）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusBoard {
    #[serde(rename = "PENDING")]
    pub pending: Vec<ExecutionView>,
    #[serde(rename = "RUNNING")]
    pub running: Vec<ExecutionView>,
    /// FINISHED 与 CANCELED 合并
    #[serde(rename = "COMPLETED")]
    pub completed: Vec<ExecutionView>,
}

/// 每小时执行数统计桶
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HourlyBucket {
    /// 整点时间
    pub hour: DateTime<Utc>,
    pub count: u64,
}

/// 单个爬虫的运行统计
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpiderRuntime {
    pub last_run_time: Option<DateTime<Utc>>,
    pub average_run_seconds: Option<f64>,
}

pub type SpiderRuntimeMap = BTreeMap<String, SpiderRuntime>;
