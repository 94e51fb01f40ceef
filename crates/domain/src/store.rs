//! 存储端口
//!
//! 调度核心对共享记录存储的全部依赖。每个方法都对应一次
//! 原子的存储操作；跨节点的协调完全建立在这些原子性之上，
//! 核心自身不持有任何进程间锁。

use async_trait::async_trait;

use taskherd_core::SchedulerResult;

use crate::entities::{NewTaskRecord, TaskFilter, TaskPatch, TaskRecord};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 返回匹配筛选器的全部记录
    async fn find_matching(&self, filter: &TaskFilter) -> SchedulerResult<Vec<TaskRecord>>;

    /// 原子地更新所有匹配记录，返回受影响的行数。
    /// 匹配零条是正常的空操作，不是错误。
    async fn update_many(&self, filter: &TaskFilter, patch: &TaskPatch) -> SchedulerResult<u64>;

    /// 按ID更新单条记录，返回是否命中
    async fn update_one(&self, id: i64, patch: &TaskPatch) -> SchedulerResult<bool>;

    /// 插入新记录并返回存储分配的ID
    async fn insert_one(&self, task: &NewTaskRecord) -> SchedulerResult<i64>;

    /// 删除所有匹配记录，返回删除条数
    async fn delete_many(&self, filter: &TaskFilter) -> SchedulerResult<u64>;

    /// 按ID删除单条记录，返回是否命中
    async fn delete_one(&self, id: i64) -> SchedulerResult<bool>;
}
