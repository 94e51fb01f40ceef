//! 启动引导
//!
//! 节点启动时、周期引擎开始之前执行一次：先无条件清除计划时间
//! 过老的记录，再强制回收认领时间戳缺失或过旧的记录——不论其
//! 当前 owner 是谁，包括本进程重启前的自己。
//!
//! 回收只在启动时做一次，运行期间不重复。运行中途崩溃的节点
//! 留下的记录会一直挂在旧 owner 名下，直到任一节点下次重启。

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use taskherd_core::SchedulerResult;
use taskherd_domain::{TaskFilter, TaskPatch, TaskStore};

pub struct Bootstrap {
    store: Arc<dyn TaskStore>,
    node_id: String,
    recapture_delay: Duration,
    expiry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub purged: u64,
    pub recaptured: u64,
    pub duration_ms: u64,
}

impl Bootstrap {
    pub fn new(
        store: Arc<dyn TaskStore>,
        node_id: String,
        recapture_delay: Duration,
        expiry_delay: Duration,
    ) -> Self {
        Self {
            store,
            node_id,
            recapture_delay,
            expiry_delay,
        }
    }

    /// 过期清除：删除所有计划时间早于保留期的记录，
    /// 不看 owner、running、repeat 状态。这是卡死记录的唯一兜底。
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let cutoff = now - self.expiry_delay;
        let purged = self
            .store
            .delete_many(&TaskFilter::expired_before(cutoff))
            .await?;

        if purged > 0 {
            warn!("清除了 {purged} 条计划时间早于 {cutoff} 的过期任务记录");
        } else {
            debug!("没有需要清除的过期记录");
        }
        Ok(purged)
    }

    /// 失主回收：把 captured_at 缺失或早于阈值的记录强制收归本节点，
    /// 并刷新 captured_at。旧 owner 是谁无关紧要——认领时间够老
    /// 就推定其已死亡或卡死。
    pub async fn recapture_stale(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let cutoff = now - self.recapture_delay;
        let recaptured = self
            .store
            .update_many(
                &TaskFilter::captured_before_or_missing(cutoff),
                &TaskPatch::claim(&self.node_id, now),
            )
            .await?;

        if recaptured > 0 {
            info!(
                "节点 {} 回收了 {} 条失主任务记录 (认领时间早于 {})",
                self.node_id, recaptured, cutoff
            );
        } else {
            debug!("节点 {} 没有需要回收的失主记录", self.node_id);
        }
        Ok(recaptured)
    }

    /// 完整的启动序列：清除过期记录，再回收失主记录
    pub async fn run(&self) -> SchedulerResult<BootstrapReport> {
        let start = Instant::now();
        let now = Utc::now();

        let purged = self.purge_expired(now).await?;
        let recaptured = self.recapture_stale(now).await?;

        Ok(BootstrapReport {
            purged,
            recaptured,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}
