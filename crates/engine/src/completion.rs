//! 收尾与重排
//!
//! 每条被派发的记录在处理器落定后恰好收尾一次：
//! 一次性任务成功即删除，失败则复位 running 等待下个清扫周期重试；
//! 重复任务无论成败都删除旧记录并按固定间隔插入下一次出现。

use tracing::{debug, error, warn};

use taskherd_core::SchedulerResult;
use taskherd_domain::{TaskPatch, TaskRecord, TaskStore};

/// 收尾一条已派发的记录。
/// 收尾期间的存储错误只记录日志，绝不向清扫循环传播。
pub async fn finalize(
    store: &dyn TaskStore,
    node_id: &str,
    task: &TaskRecord,
    outcome: SchedulerResult<()>,
) {
    let failed = match &outcome {
        Ok(()) => {
            debug!("{} 执行成功", task.entity_description());
            false
        }
        Err(e) if e.is_handler_failure() => {
            warn!("{} 执行失败: {e}", task.entity_description());
            true
        }
        Err(e) => {
            error!("{} 执行出错: {e}", task.entity_description());
            true
        }
    };

    if let Some(next) = task.next_occurrence(node_id) {
        // 重复任务无论成败都推进到下一次出现。
        // 删除与重插不是一个原子对，两步之间崩溃会永久丢失该周期任务。
        if let Err(e) = store.delete_one(task.id).await {
            error!("{} 收尾删除失败: {e}", task.entity_description());
            return;
        }
        match store.insert_one(&next).await {
            Ok(new_id) => debug!(
                "{} 已重排至 {} (新ID: {})",
                task.entity_description(),
                next.scheduled_at,
                new_id
            ),
            Err(e) => error!(
                "{} 重排插入失败，该重复任务已丢失: {e}",
                task.entity_description()
            ),
        }
    } else if failed {
        // 一次性任务失败后保留记录并复位 running，
        // 之后每个清扫周期都会重试，直到成功或被过期清除
        if let Err(e) = store.update_one(task.id, &TaskPatch::set_running(false)).await {
            error!("{} 复位运行标记失败: {e}", task.entity_description());
        }
    } else if let Err(e) = store.delete_one(task.id).await {
        error!("{} 收尾删除失败: {e}", task.entity_description());
    }
}
