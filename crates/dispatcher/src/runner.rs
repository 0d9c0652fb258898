use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keeper_core::KeeperResult;
use keeper_infrastructure::StructuredLogger;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// 按固定间隔执行的后台服务
#[async_trait]
pub trait PeriodicService: Send + Sync {
    /// 组件名称，用于日志
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// 执行一轮工作
    ///
    /// 返回的错误只终止这一轮，循环会在下一个间隔继续。
    async fn run_once(&self) -> KeeperResult<()>;
}

/// 运行周期服务直到收到关闭信号
///
/// 第一轮立即执行。上一轮耗时超过间隔时跳过错过的tick，而不是连续补跑。
pub async fn run_periodic(service: Arc<dyn PeriodicService>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(service.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        "启动周期任务 {}，间隔 {}s",
        service.name(),
        service.interval().as_secs()
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = service.run_once().await {
                    StructuredLogger::log_loop_error(service.name(), "run_once", &e);
                }
            }
            _ = shutdown.recv() => {
                info!("收到关闭信号，停止周期任务 {}", service.name());
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_core::KeeperError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingService {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicService for CountingService {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(20)
        }

        async fn run_once(&self) -> KeeperResult<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run % 2 == 0 {
                Err(KeeperError::DatabaseOperation("模拟失败".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_loop_survives_errors_and_stops_on_shutdown() {
        let service = Arc::new(CountingService {
            runs: AtomicUsize::new(0),
        });
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_periodic(service.clone(), rx));

        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(service.runs.load(Ordering::SeqCst) >= 3);
    }
}
