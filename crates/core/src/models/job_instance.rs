use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cron::CronExpression;
use crate::errors::{KeeperError, KeeperResult};

/// 固定到指定Agent的参数名
pub const DAEMON_ARGUMENT: &str = "daemon";

/// 任务优先级，LOW < NORMAL < HIGH < HIGHEST
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobPriority {
    #[serde(rename = "LOW")]
    Low,
    #[default]
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "HIGHEST")]
    Highest,
}

impl JobPriority {
    /// 持久化使用的整数编码（-1..=2）
    pub fn as_i32(self) -> i32 {
        match self {
            JobPriority::Low => -1,
            JobPriority::Normal => 0,
            JobPriority::High => 1,
            JobPriority::Highest => 2,
        }
    }

    pub fn from_i32(value: i32) -> KeeperResult<Self> {
        match value {
            -1 => Ok(JobPriority::Low),
            0 => Ok(JobPriority::Normal),
            1 => Ok(JobPriority::High),
            2 => Ok(JobPriority::Highest),
            other => Err(KeeperError::InvalidArgument(format!(
                "无效的任务优先级: {other}"
            ))),
        }
    }

    /// 按优先级计算同时下发的副本数量
    ///
    /// HIGH 使用一半的Agent，HIGHEST 使用全部Agent，至少为1。
    pub fn replica_count(self, agent_count: usize) -> usize {
        let count = match self {
            JobPriority::Low | JobPriority::Normal => 1,
            JobPriority::High => agent_count / 2,
            JobPriority::Highest => agent_count,
        };
        count.max(1)
    }
}

/// 任务运行类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobRunType {
    #[serde(rename = "onetime")]
    Onetime,
    #[serde(rename = "periodic")]
    Periodic,
}

impl JobRunType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobRunType::Onetime => "onetime",
            JobRunType::Periodic => "periodic",
        }
    }
}

impl fmt::Display for JobRunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobRunType {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "onetime" => Ok(JobRunType::Onetime),
            "periodic" => Ok(JobRunType::Periodic),
            other => Err(KeeperError::InvalidArgument(format!(
                "无效的运行类型: {other}"
            ))),
        }
    }
}

/// 五个CRON字段（分、时、日、周、月）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CronFields {
    pub minute: String,
    pub hour: String,
    pub day_of_month: String,
    pub day_of_week: String,
    pub month: String,
}

impl Default for CronFields {
    fn default() -> Self {
        Self {
            minute: "0".to_string(),
            hour: "*".to_string(),
            day_of_month: "*".to_string(),
            day_of_week: "*".to_string(),
            month: "*".to_string(),
        }
    }
}

impl CronFields {
    /// 由表单字段构造，空值回落到默认值
    pub fn from_parts(
        minute: Option<&str>,
        hour: Option<&str>,
        day_of_month: Option<&str>,
        day_of_week: Option<&str>,
        month: Option<&str>,
    ) -> Self {
        let pick = |value: Option<&str>, default: &str| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
                .to_string()
        };
        Self {
            minute: pick(minute, "0"),
            hour: pick(hour, "*"),
            day_of_month: pick(day_of_month, "*"),
            day_of_week: pick(day_of_week, "*"),
            month: pick(month, "*"),
        }
    }

    /// 解析并校验五个字段
    pub fn compile(&self) -> KeeperResult<CronExpression> {
        CronExpression::from_fields(self)
    }
}

impl fmt::Display for CronFields {
    /// 按crontab顺序输出：分 时 日 月 周
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month, self.day_of_week
        )
    }
}

/// 爬虫参数，逗号分隔的 `key=value` 列表
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiderArguments {
    pairs: Vec<(String, String)>,
}

impl SpiderArguments {
    pub fn parse(raw: &str) -> KeeperResult<Self> {
        let mut pairs = Vec::new();
        for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let Some((key, value)) = token.split_once('=') else {
                return Err(KeeperError::InvalidArgument(format!(
                    "爬虫参数必须为 key=value 形式: {token}"
                )));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(KeeperError::InvalidArgument(format!(
                    "爬虫参数名不能为空: {token}"
                )));
            }
            pairs.push((key.to_string(), value.trim().to_string()));
        }
        Ok(Self { pairs })
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// 显式固定的Agent
    pub fn daemon(&self) -> Option<&str> {
        self.get(DAEMON_ARGUMENT)
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl fmt::Display for SpiderArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

/// 任务实例（爬虫任务定义）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobInstance {
    pub id: i64,
    pub project_id: i64,
    pub spider_name: String,
    pub spider_arguments: String,
    pub priority: JobPriority,
    pub run_type: JobRunType,
    pub cron: CronFields,
    pub enabled: bool,
    pub tags: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobInstance {
    pub fn new(project_id: i64, spider_name: impl Into<String>, run_type: JobRunType) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 将由数据库生成
            project_id,
            spider_name: spider_name.into(),
            spider_arguments: String::new(),
            priority: JobPriority::Normal,
            run_type,
            cron: CronFields::default(),
            enabled: true,
            tags: None,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_periodic(&self) -> bool {
        self.run_type == JobRunType::Periodic
    }

    pub fn arguments(&self) -> KeeperResult<SpiderArguments> {
        SpiderArguments::parse(&self.spider_arguments)
    }

    pub fn cron_expression(&self) -> KeeperResult<CronExpression> {
        self.cron.compile()
    }

    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .map(|tags| {
                tags.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 持久化前的校验：参数格式，周期任务的CRON字段
    pub fn validate(&self) -> KeeperResult<()> {
        if self.spider_name.trim().is_empty() {
            return Err(KeeperError::InvalidArgument("爬虫名称不能为空".to_string()));
        }
        self.arguments()?;
        if self.is_periodic() {
            self.cron_expression()?;
        }
        Ok(())
    }

    /// 启用标记的存储编码：0 表示启用，-1 表示禁用
    pub fn enabled_sentinel(&self) -> i32 {
        if self.enabled {
            0
        } else {
            -1
        }
    }

    pub fn enabled_from_sentinel(value: i32) -> bool {
        value == 0
    }
}

/// 操作员提交的新任务实例
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJobInstance {
    pub project_id: i64,
    pub spider_name: String,
    pub spider_arguments: String,
    pub priority: JobPriority,
    pub run_type: Option<JobRunType>,
    /// 显式指定的Agent，`None` 或 `"auto"` 表示由Agent池自行选择
    pub daemon: Option<String>,
    pub cron: Option<CronFields>,
    /// 完整的CRON表达式，存在时覆盖 `cron` 字段
    pub cron_expression: Option<String>,
    pub tags: Option<String>,
    pub description: Option<String>,
}

impl NewJobInstance {
    /// 转换为待持久化的任务实例并完成校验
    pub fn into_job_instance(self) -> KeeperResult<JobInstance> {
        let run_type = self.run_type.ok_or_else(|| {
            KeeperError::InvalidArgument("必须指定运行类型".to_string())
        })?;
        let mut instance = JobInstance::new(self.project_id, self.spider_name, run_type);
        instance.priority = self.priority;
        instance.tags = self.tags.filter(|t| !t.trim().is_empty());
        instance.description = self.description.filter(|d| !d.trim().is_empty());

        let mut arguments = SpiderArguments::parse(&self.spider_arguments)?;
        if let Some(daemon) = self
            .daemon
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty() && *d != "auto")
        {
            arguments.push(DAEMON_ARGUMENT, daemon);
        }
        instance.spider_arguments = arguments.to_string();

        if run_type == JobRunType::Periodic {
            instance.cron = match self.cron_expression.as_deref().map(str::trim) {
                Some(expr) if !expr.is_empty() => CronExpression::parse(expr)?.fields().clone(),
                _ => self.cron.unwrap_or_default(),
            };
        }

        instance.validate()?;
        Ok(instance)
    }
}
