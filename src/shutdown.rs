use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// 关闭信号广播
///
/// 关闭后再订阅的接收器会立即收到信号，保证晚启动的组件也能退出。
#[derive(Clone)]
pub struct ShutdownManager {
    sender: Arc<RwLock<Option<broadcast::Sender<()>>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            sender: Arc::new(RwLock::new(Some(sender))),
        }
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<()> {
        match self.sender.read().await.as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(1);
                let _ = sender.send(());
                receiver
            }
        }
    }

    /// 重复调用是无操作
    pub async fn shutdown(&self) {
        let Some(sender) = self.sender.write().await.take() else {
            debug!("关闭信号已经发送过");
            return;
        };
        debug!("发送关闭信号给 {} 个订阅者", sender.receiver_count());
        let _ = sender.send(());
        info!("关闭信号已发送");
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
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_all_subscribers_receive_signal() {
        let manager = ShutdownManager::new();
        let mut first = manager.subscribe().await;
        let mut second = manager.clone().subscribe().await;

        manager.shutdown().await;

        assert!(timeout(Duration::from_millis(100), first.recv()).await.is_ok());
        assert!(timeout(Duration::from_millis(100), second.recv()).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown_fires_immediately() {
        let manager = ShutdownManager::new();
        manager.shutdown().await;
        manager.shutdown().await;

        let mut late = manager.subscribe().await;
        let received = timeout(Duration::from_millis(100), late.recv()).await;
        assert!(matches!(received, Ok(Ok(()))));
    }
}
