//! 处理器注册表
//!
//! 任务名称到应用代码的映射，归属于单个调度器实例，
//! 不使用任何全局可变状态。同名处理器可以被不同记录
//! 并发调用，但同一条存活记录绝不会被并发派发。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use taskherd_core::SchedulerResult;

/// 任务处理器抽象，由清扫引擎按注册名称派发
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, params: serde_json::Value) -> SchedulerResult<()>;
}

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = SchedulerResult<()>> + Send>>;
type HandlerFn = Box<dyn Fn(serde_json::Value) -> BoxedHandlerFuture + Send + Sync>;

/// 闭包到处理器的适配
struct FnHandler {
    f: HandlerFn,
}

#[async_trait]
impl TaskHandler for FnHandler {
    async fn run(&self, params: serde_json::Value) -> SchedulerResult<()> {
        (self.f)(params).await
    }
}

pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, name: &str, handler: Arc<dyn TaskHandler>) {
        let mut handlers = self.handlers.write().await;
        if handlers.insert(name.to_string(), handler).is_some() {
            warn!("处理器 '{name}' 被重复注册，旧实现已被覆盖");
        }
    }

    pub async fn register_fn<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SchedulerResult<()>> + Send + 'static,
    {
        let boxed: HandlerFn = Box::new(move |params| Box::pin(f(params)));
        self.register(name, Arc::new(FnHandler { f: boxed })).await;
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(name).cloned()
    }

    pub async fn registered_names(&self) -> Vec<String> {
        self.handlers.read().await.keys().cloned().collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
