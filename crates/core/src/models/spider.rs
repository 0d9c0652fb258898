use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 部署在Agent上的爬虫（按项目同步的目录）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpiderInstance {
    pub id: i64,
    pub project_id: i64,
    pub spider_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SpiderInstance {
    pub fn new(project_id: i64, spider_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            project_id,
            spider_name: spider_name.into(),
            created_at: now,
            updated_at: now,
        }
    }
}
