//! # 配置
//!
//! 加载顺序：
//! 1. 内置默认值
//! 2. 配置文件（TOML），`-c/--config` 指定或按默认路径查找
//! 3. 环境变量覆盖（前缀 `SPIDERKEEPER__`，层级分隔符 `__`）
//!
//! 例如 `SPIDERKEEPER__RECONCILER__GRACE_SECONDS=120` 覆盖 `reconciler.grace_seconds`。

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["config/spiderkeeper.toml", "spiderkeeper.toml"];

/// 系统配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub agents: AgentsConfig,
    pub scheduler: SchedulerConfig,
    pub reconciler: ReconcilerConfig,
    pub spider_sync: SpiderSyncConfig,
    pub stats: StatsConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// # 参数
    ///
    /// * `config_path` - 配置文件路径，为 `None` 时依次尝试默认路径，都不存在则只使用默认值
    ///
    /// # 错误
    ///
    /// 指定的文件不存在、解析失败或校验失败时返回错误。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Self::with_defaults(ConfigBuilder::builder())?;

        match config_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(anyhow::anyhow!("配置文件不存在: {}", path));
                }
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => {
                if let Some(path) = DEFAULT_CONFIG_PATHS
                    .iter()
                    .find(|path| Path::new(path).exists())
                {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SPIDERKEEPER")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("agents.servers")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let defaults = AppConfig::default();
        Ok(builder
            .set_default("database.url", defaults.database.url)?
            .set_default("database.max_connections", defaults.database.max_connections)?
            .set_default(
                "database.connection_timeout_seconds",
                defaults.database.connection_timeout_seconds,
            )?
            .set_default("agents.servers", defaults.agents.servers)?
            .set_default(
                "agents.request_timeout_seconds",
                defaults.agents.request_timeout_seconds,
            )?
            .set_default("scheduler.enabled", defaults.scheduler.enabled)?
            .set_default("scheduler.tick_seconds", defaults.scheduler.tick_seconds)?
            .set_default("scheduler.reload_seconds", defaults.scheduler.reload_seconds)?
            .set_default("scheduler.skip_if_running", defaults.scheduler.skip_if_running)?
            .set_default("reconciler.enabled", defaults.reconciler.enabled)?
            .set_default(
                "reconciler.interval_seconds",
                defaults.reconciler.interval_seconds,
            )?
            .set_default("reconciler.grace_seconds", defaults.reconciler.grace_seconds)?
            .set_default("spider_sync.enabled", defaults.spider_sync.enabled)?
            .set_default(
                "spider_sync.interval_seconds",
                defaults.spider_sync.interval_seconds,
            )?
            .set_default("stats.status_list_limit", defaults.stats.status_list_limit)?
            .set_default("observability.log_level", defaults.observability.log_level)?)
    }

    /// 从TOML字符串加载配置，未出现的字段使用默认值
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.agents.validate().context("Agent配置验证失败")?;
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.reconciler.validate().context("协调器配置验证失败")?;
        self.spider_sync.validate().context("爬虫同步配置验证失败")?;
        self.stats.validate().context("统计配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        Ok(())
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connection_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://spiderkeeper.db?mode=rwc".to_string(),
            max_connections: 5,
            connection_timeout_seconds: 30,
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(anyhow::anyhow!("数据库URL不能为空"));
        }
        if !self.url.starts_with("sqlite:") {
            return Err(anyhow::anyhow!("数据库URL必须是SQLite格式: {}", self.url));
        }
        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }
        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }
        Ok(())
    }
}

/// 远程Agent配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Agent地址，例如 `http://10.0.0.2:6800`
    pub servers: Vec<String>,
    /// 每次Agent调用的超时，同时作用于HTTP客户端和外层 `tokio::time::timeout`
    pub request_timeout_seconds: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            servers: vec!["http://localhost:6800".to_string()],
            request_timeout_seconds: 15,
            username: None,
            password: None,
        }
    }
}

impl AgentsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(anyhow::anyhow!("至少需要配置一个Agent地址"));
        }
        for server in &self.servers {
            if !server.starts_with("http://") && !server.starts_with("https://") {
                return Err(anyhow::anyhow!("Agent地址必须以http://或https://开头: {}", server));
            }
        }
        if !(1..=60).contains(&self.request_timeout_seconds) {
            return Err(anyhow::anyhow!(
                "Agent请求超时必须在1到60秒之间: {}",
                self.request_timeout_seconds
            ));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(anyhow::anyhow!("用户名和密码必须同时配置"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_seconds: u64,
    /// 重新加载周期任务的间隔
    pub reload_seconds: u64,
    /// 同一实例仍有未完成的执行时跳过本次触发
    pub skip_if_running: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_seconds: 60,
            reload_seconds: 30,
            skip_if_running: false,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_seconds == 0 || self.tick_seconds > 60 {
            return Err(anyhow::anyhow!(
                "调度间隔必须在1到60秒之间: {}",
                self.tick_seconds
            ));
        }
        if self.reload_seconds == 0 {
            return Err(anyhow::anyhow!("周期任务重载间隔必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// 执行记录在Agent列表中缺失多久后才推断为已完成
    pub grace_seconds: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 5,
            grace_seconds: 60,
        }
    }
}

impl ReconcilerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_seconds == 0 {
            return Err(anyhow::anyhow!("协调间隔必须大于0"));
        }
        if self.grace_seconds == 0 {
            return Err(anyhow::anyhow!("宽限时间必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpiderSyncConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
}

impl Default for SpiderSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 10,
        }
    }
}

impl SpiderSyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_seconds == 0 {
            return Err(anyhow::anyhow!("爬虫同步间隔必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// 仪表盘每个状态分组的最大条数
    pub status_list_limit: i64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            status_list_limit: 100,
        }
    }
}

impl StatsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.status_list_limit <= 0 {
            return Err(anyhow::anyhow!("状态列表上限必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// Prometheus指标监听地址，例如 `0.0.0.0:9090`，不配置则不启动导出器
    pub prometheus_bind: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            prometheus_bind: None,
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.log_level,
                valid_levels
            ));
        }
        if let Some(bind) = &self.prometheus_bind {
            bind.parse::<std::net::SocketAddr>()
                .with_context(|| format!("无效的Prometheus监听地址: {bind}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reconciler.grace_seconds, 60);
        assert_eq!(config.stats.status_list_limit, 100);
        assert!(!config.scheduler.skip_if_running);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [agents]
            servers = ["http://10.0.0.2:6800", "http://10.0.0.3:6800"]

            [reconciler]
            grace_seconds = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.agents.servers.len(), 2);
        assert_eq!(config.agents.request_timeout_seconds, 15);
        assert_eq!(config.reconciler.grace_seconds, 120);
        assert_eq!(config.reconciler.interval_seconds, 5);
        assert_eq!(config.database.max_connections, 5);
    }

    #[test]
    fn test_agent_timeout_bounds() {
        let mut agents = AgentsConfig::default();
        agents.request_timeout_seconds = 0;
        assert!(agents.validate().is_err());
        agents.request_timeout_seconds = 61;
        assert!(agents.validate().is_err());
        agents.request_timeout_seconds = 30;
        assert!(agents.validate().is_ok());
    }

    #[test]
    fn test_credentials_must_be_paired() {
        let agents = AgentsConfig {
            username: Some("admin".to_string()),
            ..AgentsConfig::default()
        };
        assert!(agents.validate().is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AppConfig::from_toml("[database]\nurl = \"postgres://localhost/db\"").is_err());
        assert!(AppConfig::from_toml("[observability]\nlog_level = \"loud\"").is_err());
        assert!(AppConfig::from_toml("[observability]\nprometheus_bind = \"nowhere\"").is_err());
        assert!(AppConfig::from_toml("[scheduler]\ntick_seconds = 0").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[scheduler]\nskip_if_running = true\n\n[stats]\nstatus_list_limit = 20"
        )
        .unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert!(config.scheduler.skip_if_running);
        assert_eq!(config.stats.status_list_limit, 20);
        assert_eq!(config.agents.servers, vec!["http://localhost:6800".to_string()]);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/spiderkeeper.toml")).is_err());
    }

    #[test]
    fn test_toml_round_trip_keeps_values() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.agents.servers, config.agents.servers);
        assert_eq!(parsed.database.url, config.database.url);
    }
}
