//! 认领引擎
//!
//! 周期性地把存储中无主的任务记录一次性收归本节点。
//! 认领是基于集合的单条原子更新：每个节点只更新查询时
//! owner 为空的记录，并发认领由存储的语句原子性串行化，
//! 同一条记录绝不会被两个节点同时认领。

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use taskherd_core::SchedulerResult;
use taskherd_domain::{TaskFilter, TaskPatch, TaskStore};

pub struct ClaimEngine {
    store: Arc<dyn TaskStore>,
    node_id: String,
}

impl ClaimEngine {
    pub fn new(store: Arc<dyn TaskStore>, node_id: String) -> Self {
        Self { store, node_id }
    }

    /// 执行一次认领，返回收归的记录数。匹配零条是空操作。
    /// 只做存储变更，不派发任何任务。
    pub async fn claim_unowned(&self) -> SchedulerResult<u64> {
        let now = Utc::now();
        let claimed = self
            .store
            .update_many(&TaskFilter::unowned(), &TaskPatch::claim(&self.node_id, now))
            .await?;

        if claimed > 0 {
            info!("节点 {} 认领了 {} 条无主任务记录", self.node_id, claimed);
        } else {
            debug!("节点 {} 本轮没有可认领的记录", self.node_id);
        }
        Ok(claimed)
    }
}
