use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 周期任务的关闭协调器
///
/// 登记每个后台任务的句柄，`shutdown` 广播一次关闭信号后在限定时间内等待它们退出。
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    triggered: AtomicBool,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            triggered: AtomicBool::new(false),
        }
    }

    /// 订阅关闭信号，关闭之后订阅得到的接收器立即触发
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        if self.is_shutdown() {
            let (tx, rx) = broadcast::channel(1);
            let _ = tx.send(());
            return rx;
        }
        self.shutdown_tx.subscribe()
    }

    /// 登记需要在关闭时等待的任务
    pub async fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        debug!("登记后台任务: {}", name);
        self.tasks.lock().await.push((name, handle));
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// 广播关闭信号并等待已登记的任务退出
    ///
    /// 超时未退出的任务被放弃。返回是否所有任务都在超时前退出；重复调用直接返回 `true`。
    pub async fn shutdown(&self, wait: Duration) -> bool {
        if self.triggered.swap(true, Ordering::SeqCst) {
            debug!("关闭已经触发过");
            return true;
        }

        let receivers = self.shutdown_tx.send(()).unwrap_or(0);
        info!("关闭信号已发送给 {} 个订阅者", receivers);

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();

        match tokio::time::timeout(wait, join_all(handles)).await {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    if let Err(e) = result {
                        error!("后台任务 {} 异常退出: {}", name, e);
                    }
                }
                true
            }
            Err(_) => {
                warn!(
                    "等待后台任务退出超时 ({}s): {:?}",
                    wait.as_secs(),
                    names
                );
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_tracked_tasks_exit_on_signal() {
        let manager = ShutdownManager::new();
        for name in ["first", "second"] {
            let mut rx = manager.subscribe();
            manager
                .track(name, tokio::spawn(async move {
                    let _ = rx.recv().await;
                }))
                .await;
        }
        assert_eq!(manager.task_count().await, 2);

        assert!(manager.shutdown(Duration::from_secs(1)).await);
        assert!(manager.is_shutdown());
        assert_eq!(manager.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_stuck_task_times_out() {
        let manager = ShutdownManager::new();
        manager
            .track("stuck", tokio::spawn(std::future::pending::<()>()))
            .await;

        assert!(!manager.shutdown(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown() {
        let manager = ShutdownManager::new();
        assert!(manager.shutdown(Duration::from_millis(10)).await);
        assert!(manager.shutdown(Duration::from_millis(10)).await);

        let mut rx = manager.subscribe();
        let result = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
