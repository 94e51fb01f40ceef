//! 调度器门面
//!
//! 把认领、清扫、启动引导三个引擎组装成一个节点的完整生命周期，
//! 并对外提供任务登记与处理器注册接口。多个节点共享同一个存储
//! 即构成集群，节点之间没有任何直接通信。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use taskherd_core::{SchedulerConfig, SchedulerResult};
use taskherd_domain::{NewTaskRecord, TaskFilter, TaskPatch, TaskStore};

use crate::bootstrap::{Bootstrap, BootstrapReport};
use crate::claim::ClaimEngine;
use crate::registry::{HandlerRegistry, TaskHandler};
use crate::sweep::SweepEngine;

/// 任务登记请求
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub name: String,
    pub params: Value,
    pub scheduled_at: DateTime<Utc>,
    pub repeat_interval: Option<Duration>,
    pub unique_key: Option<String>,
}

impl ScheduleRequest {
    pub fn new(name: impl Into<String>, params: Value, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            params,
            scheduled_at,
            repeat_interval: None,
            unique_key: None,
        }
    }

    /// 按固定间隔重复执行
    pub fn repeating(mut self, interval: Duration) -> Self {
        self.repeat_interval = Some(interval);
        self
    }

    /// 设置去重键：登记时先删除同键的既有记录再插入
    pub fn with_unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }
}

pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    config: SchedulerConfig,
    node_id: String,
    claim: Arc<ClaimEngine>,
    sweep: Arc<SweepEngine>,
    bootstrap: Bootstrap,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn TaskStore>, config: SchedulerConfig) -> Self {
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(generate_node_id);
        let registry = Arc::new(HandlerRegistry::new());

        let claim = Arc::new(ClaimEngine::new(Arc::clone(&store), node_id.clone()));
        let sweep = Arc::new(SweepEngine::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            node_id.clone(),
            Duration::seconds(config.check_interval_seconds as i64),
        ));
        let bootstrap = Bootstrap::new(
            Arc::clone(&store),
            node_id.clone(),
            Duration::seconds(config.recapture_delay_seconds as i64),
            Duration::seconds(config.expiry_delay_seconds as i64),
        );

        Self {
            store,
            registry,
            config,
            node_id,
            claim,
            sweep,
            bootstrap,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// 注册任务处理器，name 对应任务记录的 name 字段
    pub async fn register_handler(&self, name: &str, handler: Arc<dyn TaskHandler>) {
        self.registry.register(name, handler).await;
    }

    /// 用异步闭包注册任务处理器
    pub async fn register_handler_fn<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = SchedulerResult<()>> + Send + 'static,
    {
        self.registry.register_fn(name, f).await;
    }

    /// 登记一个任务，返回新记录的 ID。
    ///
    /// 新记录由本节点直接持有（owner 为本节点、captured_at 为当前时刻），
    /// 不经过认领周期即可在下个清扫周期被选中。
    ///
    /// 带去重键时先删除同键的既有记录再插入：同一逻辑任务的重复登记
    /// 只保留最后一次的计划。删除与插入不是原子对，并发登记同键任务
    /// 可能短暂留下两条记录。
    pub async fn schedule_task(&self, request: ScheduleRequest) -> SchedulerResult<i64> {
        let now = Utc::now();

        if let Some(key) = &request.unique_key {
            let replaced = self
                .store
                .delete_many(&TaskFilter::by_unique_key(key))
                .await?;
            if replaced > 0 {
                debug!("去重键 '{key}' 替换了 {replaced} 条既有记录");
            }
        }

        let mut record = NewTaskRecord::new(&request.name, request.params, request.scheduled_at)
            .owned_by(&self.node_id, now);
        if let Some(interval) = request.repeat_interval {
            record = record.repeating(interval);
        }
        if let Some(key) = &request.unique_key {
            record = record.with_unique_key(key);
        }

        let id = self.store.insert_one(&record).await?;
        info!(
            "节点 {} 登记任务 '{}' (ID: {}, 计划时间: {})",
            self.node_id, request.name, id, request.scheduled_at
        );
        Ok(id)
    }

    /// 运行节点生命周期：启动引导、认领与清扫循环，直到收到关闭信号。
    /// 关闭时等两个循环退出后释放本节点持有的全部记录。
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        let report = self.bootstrap.run().await?;
        info!(
            "节点 {} 启动引导完成: 清除 {} 条, 回收 {} 条, 耗时 {}ms",
            self.node_id, report.purged, report.recaptured, report.duration_ms
        );

        let claim_loop = {
            let claim = Arc::clone(&self.claim);
            let mut rx = shutdown_rx.resubscribe();
            let period = std::time::Duration::from_secs(self.config.claim_interval_seconds);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = claim.claim_unowned().await {
                                error!("认领周期出错: {e}");
                            }
                        }
                        _ = rx.recv() => break,
                    }
                }
            })
        };

        let sweep_loop = {
            let sweep = Arc::clone(&self.sweep);
            let mut rx = shutdown_rx.resubscribe();
            let period = std::time::Duration::from_secs(self.config.check_interval_seconds);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            // 派发句柄即弃，任务在各自的 spawn 中自行收尾
                            if let Err(e) = sweep.sweep_once(Utc::now()).await {
                                error!("清扫周期出错: {e}");
                            }
                        }
                        _ = rx.recv() => break,
                    }
                }
            })
        };

        let _ = shutdown_rx.recv().await;
        info!("节点 {} 收到关闭信号，停止周期引擎", self.node_id);

        let _ = claim_loop.await;
        let _ = sweep_loop.await;

        let released = self.release_owned().await?;
        info!("节点 {} 已退出，释放 {} 条任务记录", self.node_id, released);
        Ok(())
    }

    /// 释放本节点持有的全部记录（owner 清空），供其他节点认领。
    /// 正在执行中的任务记录同样被释放，其执行结果之后照常收尾。
    pub async fn release_owned(&self) -> SchedulerResult<u64> {
        let released = self
            .store
            .update_many(
                &TaskFilter::owned_by(&self.node_id),
                &TaskPatch::release(),
            )
            .await?;
        if released > 0 {
            warn!("节点 {} 释放了 {} 条仍持有的记录", self.node_id, released);
        }
        Ok(released)
    }

    /// 手动执行一次认领周期（测试与嵌入场景用）
    pub async fn claim_once(&self) -> SchedulerResult<u64> {
        self.claim.claim_unowned().await
    }

    /// 手动执行一次清扫周期，等待本轮派发的任务全部收尾
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let handles = self.sweep.sweep_once(now).await?;
        let count = handles.len();
        for handle in handles {
            let _ = handle.await;
        }
        Ok(count)
    }

    /// 手动执行一次启动引导
    pub async fn bootstrap_once(&self) -> SchedulerResult<BootstrapReport> {
        self.bootstrap.run().await
    }
}

/// 生成节点标识：主机名加随机后缀，同机多进程也不会撞名
fn generate_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}
