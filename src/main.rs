use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use keeper_core::AppConfig;
use keeper_infrastructure::observability::init_prometheus_exporter;
use spider_keeper::{Application, ShutdownManager};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("spiderkeeper")
        .version(env!("CARGO_PKG_VERSION"))
        .about("爬虫任务调度与执行状态协调系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，不指定时依次查找 config/spiderkeeper.toml 和 spiderkeeper.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件中的 observability.log_level")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let log_format = matches
        .get_one::<String>("log-format")
        .map(String::as_str)
        .unwrap_or("pretty");

    let config = match config_path {
        Some(path) => AppConfig::load(Some(path))
            .with_context(|| format!("加载配置文件失败: {path}"))?,
        None => AppConfig::load(None).context("加载配置失败")?,
    };
    let log_level = matches
        .get_one::<String>("log-level")
        .cloned()
        .unwrap_or_else(|| config.observability.log_level.clone());

    init_logging(&log_level, log_format)?;

    info!("启动SpiderKeeper");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    if let Some(bind) = &config.observability.prometheus_bind {
        init_prometheus_exporter(bind)?;
    }

    let app = Application::new(config).await?;
    let shutdown_manager = ShutdownManager::new();
    app.start(&shutdown_manager).await;

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");

    if shutdown_manager.shutdown(SHUTDOWN_TIMEOUT).await {
        info!("所有周期任务已停止");
    }
    app.close().await;

    info!("SpiderKeeper已退出");
    Ok(())
}

/// 初始化日志系统，`RUST_LOG` 优先于命令行和配置中的级别
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 等待Ctrl+C或SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
