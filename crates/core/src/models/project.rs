use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 项目，任务实例与执行记录的命名空间
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub project_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(project_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 将由数据库生成
            project_name: project_name.into(),
            created_at: now,
            updated_at: now,
        }
    }
}
