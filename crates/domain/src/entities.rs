use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 持久化的调度任务记录，多个节点通过共享存储协同其状态流转
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    /// 注册处理器的名称
    pub name: String,
    /// 原样传递给处理器的载荷
    pub params: serde_json::Value,
    /// 到达该时间后任务可被执行
    pub scheduled_at: DateTime<Utc>,
    /// 为空表示无主，等待任一节点认领
    pub owner: Option<String>,
    /// 已派发给处理器且尚未收尾
    pub running: bool,
    /// 非空表示完成后按该间隔重复
    pub repeat_interval_ms: Option<i64>,
    /// 去重键，插入同键任务前旧记录先被删除
    pub unique_key: Option<String>,
    /// owner 最近一次被（重新）指派的时间
    pub captured_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn is_unclaimed(&self) -> bool {
        self.owner.is_none()
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat_interval_ms.is_some()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    /// 重复任务收尾后生成下一次出现的新记录。
    /// 计划时间从本次应执行时间推进固定间隔，不随处理器耗时漂移。
    /// 新记录归属指定节点，capturedAt 留空待下一轮认领/回收时刷新。
    pub fn next_occurrence(&self, owner: &str) -> Option<NewTaskRecord> {
        let interval_ms = self.repeat_interval_ms?;
        Some(NewTaskRecord {
            name: self.name.clone(),
            params: self.params.clone(),
            scheduled_at: self.scheduled_at + Duration::milliseconds(interval_ms),
            owner: Some(owner.to_string()),
            running: false,
            repeat_interval_ms: self.repeat_interval_ms,
            unique_key: self.unique_key.clone(),
            captured_at: None,
        })
    }

    pub fn entity_description(&self) -> String {
        format!("任务 '{}' (ID: {})", self.name, self.id)
    }
}

/// 任务记录的插入形式，ID 由存储生成
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTaskRecord {
    pub name: String,
    pub params: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub owner: Option<String>,
    pub running: bool,
    pub repeat_interval_ms: Option<i64>,
    pub unique_key: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl NewTaskRecord {
    pub fn new(name: &str, params: serde_json::Value, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            params,
            scheduled_at,
            owner: None,
            running: false,
            repeat_interval_ms: None,
            unique_key: None,
            captured_at: None,
        }
    }

    pub fn owned_by(mut self, node_id: &str, captured_at: DateTime<Utc>) -> Self {
        self.owner = Some(node_id.to_string());
        self.captured_at = Some(captured_at);
        self
    }

    pub fn repeating(mut self, every: Duration) -> Self {
        self.repeat_interval_ms = Some(every.num_milliseconds());
        self
    }

    pub fn with_unique_key(mut self, key: &str) -> Self {
        self.unique_key = Some(key.to_string());
        self
    }
}

/// owner 字段的筛选条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerFilter {
    /// owner 为空
    Unowned,
    /// owner 等于指定节点
    OwnedBy(String),
}

/// 任务记录筛选器，所有条件按 AND 组合；空筛选器匹配全部记录
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// 按ID集合筛选；空集合不匹配任何记录
    pub ids: Option<Vec<i64>>,
    pub owner: Option<OwnerFilter>,
    pub running: Option<bool>,
    /// scheduled_at <= t，用于清扫窗口的到期判定
    pub due_before: Option<DateTime<Utc>>,
    /// scheduled_at < t，用于过期清除
    pub expired_before: Option<DateTime<Utc>>,
    /// captured_at 为空或早于 t，用于失主回收
    pub captured_before_or_missing: Option<DateTime<Utc>>,
    pub unique_key: Option<String>,
}

impl TaskFilter {
    pub fn unowned() -> Self {
        Self {
            owner: Some(OwnerFilter::Unowned),
            ..Default::default()
        }
    }

    pub fn owned_by(node_id: &str) -> Self {
        Self {
            owner: Some(OwnerFilter::OwnedBy(node_id.to_string())),
            ..Default::default()
        }
    }

    pub fn by_ids(ids: Vec<i64>) -> Self {
        Self {
            ids: Some(ids),
            ..Default::default()
        }
    }

    pub fn by_unique_key(key: &str) -> Self {
        Self {
            unique_key: Some(key.to_string()),
            ..Default::default()
        }
    }

    pub fn expired_before(cutoff: DateTime<Utc>) -> Self {
        Self {
            expired_before: Some(cutoff),
            ..Default::default()
        }
    }

    pub fn captured_before_or_missing(cutoff: DateTime<Utc>) -> Self {
        Self {
            captured_before_or_missing: Some(cutoff),
            ..Default::default()
        }
    }

    pub fn due_before(mut self, horizon: DateTime<Utc>) -> Self {
        self.due_before = Some(horizon);
        self
    }

    pub fn running(mut self, running: bool) -> Self {
        self.running = Some(running);
        self
    }
}

/// 任务记录补丁，只更新显式给出的字段；
/// 外层 Option 表示是否更新，内层 Option 表示写入空值
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub owner: Option<Option<String>>,
    pub running: Option<bool>,
    pub captured_at: Option<Option<DateTime<Utc>>>,
}

impl TaskPatch {
    /// 认领/回收：指派 owner 并刷新 captured_at
    pub fn claim(node_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            owner: Some(Some(node_id.to_string())),
            captured_at: Some(Some(at)),
            running: None,
        }
    }

    /// 优雅关闭时交还所有权，captured_at 不动
    pub fn release() -> Self {
        Self {
            owner: Some(None),
            running: None,
            captured_at: None,
        }
    }

    pub fn set_running(running: bool) -> Self {
        Self {
            running: Some(running),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.owner.is_none() && self.running.is_none() && self.captured_at.is_none()
    }
}
