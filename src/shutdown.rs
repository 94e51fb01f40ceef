use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

/// 优雅关闭信号
///
/// 进程内所有长期循环订阅同一个广播通道；触发后订阅者各自退出。
/// 触发是幂等的，触发之后的订阅会立即收到信号。
pub struct ShutdownSignal {
    tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 订阅关闭信号。已触发时返回一个立即可收的接收器。
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        if self.triggered.load(Ordering::SeqCst) {
            let (tx, rx) = broadcast::channel(1);
            let _ = tx.send(());
            return rx;
        }
        self.tx.subscribe()
    }

    /// 触发关闭。重复触发是无操作。
    pub fn trigger(&self) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            debug!("关闭信号已触发过，忽略重复触发");
            return;
        }
        let subscribers = self.tx.receiver_count();
        info!("发送关闭信号给 {subscribers} 个订阅者");
        let _ = self.tx.send(());
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
