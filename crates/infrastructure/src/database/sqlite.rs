//! SQLite任务存储
//!
//! 嵌入式部署形态：单文件数据库即共享存储。所有筛选更新都编译为
//! 单条SQL语句，由SQLite的语句级原子性充当跨节点协调的基础。

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use taskherd_core::{SchedulerError, SchedulerResult};
use taskherd_domain::{
    NewTaskRecord, OwnerFilter, TaskFilter, TaskPatch, TaskRecord, TaskStore,
};

const SELECT_COLUMNS: &str = "SELECT id, name, params, scheduled_at, owner, running, \
     repeat_interval_ms, unique_key, captured_at FROM tasks WHERE 1 = 1";

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 创建嵌入式SQLite任务存储，自动建库建表
    pub async fn new_embedded(database_url: &str) -> SchedulerResult<Self> {
        debug!("Creating embedded SQLite task store at: {database_url}");

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect_with(connect_options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// 内存库，仅用于测试。
    /// 限制为单连接：内存库的每个新连接都是一个独立的空库。
    pub async fn new_in_memory() -> SchedulerResult<Self> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// 建表与索引。owner 索引是认领/清扫筛选的性能前提。
    pub async fn migrate(&self) -> SchedulerResult<()> {
        debug!("Running SQLite task store migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                params TEXT NOT NULL DEFAULT '{}',
                scheduled_at DATETIME NOT NULL,
                owner TEXT,
                running INTEGER NOT NULL DEFAULT 0,
                repeat_interval_ms INTEGER,
                unique_key TEXT,
                captured_at DATETIME
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_scheduled_at ON tasks(scheduled_at)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_unique_key ON tasks(unique_key)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_captured_at ON tasks(captured_at)",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        debug!("Successfully completed SQLite task store migrations");
        Ok(())
    }

    fn row_to_task(row: &SqliteRow) -> SchedulerResult<TaskRecord> {
        let params_text: String = row.try_get("params")?;
        let params = serde_json::from_str(&params_text)
            .map_err(|e| SchedulerError::Serialization(format!("解析任务参数失败: {e}")))?;

        Ok(TaskRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            params,
            scheduled_at: row.try_get("scheduled_at")?,
            owner: row.try_get("owner")?,
            running: row.try_get("running")?,
            repeat_interval_ms: row.try_get("repeat_interval_ms")?,
            unique_key: row.try_get("unique_key")?,
            captured_at: row.try_get("captured_at")?,
        })
    }

    fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &TaskFilter) {
        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                qb.push(" AND 0 = 1");
            } else {
                qb.push(" AND id IN (");
                let mut sep = qb.separated(", ");
                for id in ids {
                    sep.push_bind(*id);
                }
                sep.push_unseparated(")");
            }
        }
        match &filter.owner {
            Some(OwnerFilter::Unowned) => {
                qb.push(" AND owner IS NULL");
            }
            Some(OwnerFilter::OwnedBy(node_id)) => {
                qb.push(" AND owner = ").push_bind(node_id.clone());
            }
            None => {}
        }
        if let Some(running) = filter.running {
            qb.push(" AND running = ").push_bind(running);
        }
        if let Some(horizon) = filter.due_before {
            qb.push(" AND scheduled_at <= ").push_bind(horizon);
        }
        if let Some(cutoff) = filter.expired_before {
            qb.push(" AND scheduled_at < ").push_bind(cutoff);
        }
        if let Some(cutoff) = filter.captured_before_or_missing {
            qb.push(" AND (captured_at IS NULL OR captured_at < ")
                .push_bind(cutoff)
                .push(")");
        }
        if let Some(key) = &filter.unique_key {
            qb.push(" AND unique_key = ").push_bind(key.clone());
        }
    }

    fn push_patch(qb: &mut QueryBuilder<'_, Sqlite>, patch: &TaskPatch) {
        let mut sep = qb.separated(", ");
        if let Some(owner) = &patch.owner {
            sep.push("owner = ");
            sep.push_bind_unseparated(owner.clone());
        }
        if let Some(running) = patch.running {
            sep.push("running = ");
            sep.push_bind_unseparated(running);
        }
        if let Some(captured_at) = patch.captured_at {
            sep.push("captured_at = ");
            sep.push_bind_unseparated(captured_at);
        }
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn find_matching(&self, filter: &TaskFilter) -> SchedulerResult<Vec<TaskRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        Self::push_filter(&mut qb, filter);
        qb.push(" ORDER BY scheduled_at ASC, id ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn update_many(&self, filter: &TaskFilter, patch: &TaskPatch) -> SchedulerResult<u64> {
        if patch.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tasks SET ");
        Self::push_patch(&mut qb, patch);
        qb.push(" WHERE 1 = 1");
        Self::push_filter(&mut qb, filter);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn update_one(&self, id: i64, patch: &TaskPatch) -> SchedulerResult<bool> {
        if patch.is_empty() {
            return Ok(false);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tasks SET ");
        Self::push_patch(&mut qb, patch);
        qb.push(" WHERE id = ").push_bind(id);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_one(&self, task: &NewTaskRecord) -> SchedulerResult<i64> {
        let params_text = serde_json::to_string(&task.params)
            .map_err(|e| SchedulerError::Serialization(format!("序列化任务参数失败: {e}")))?;

        let result = sqlx::query(
            r#"
            INSERT INTO tasks
                (name, params, scheduled_at, owner, running, repeat_interval_ms, unique_key, captured_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.name)
        .bind(params_text)
        .bind(task.scheduled_at)
        .bind(&task.owner)
        .bind(task.running)
        .bind(task.repeat_interval_ms)
        .bind(&task.unique_key)
        .bind(task.captured_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn delete_many(&self, filter: &TaskFilter) -> SchedulerResult<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM tasks WHERE 1 = 1");
        Self::push_filter(&mut qb, filter);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete_one(&self, id: i64) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn sample_task(name: &str) -> NewTaskRecord {
        NewTaskRecord::new(name, json!({"n": 1}), Utc::now())
    }

    #[tokio::test]
    async fn test_insert_and_find_roundtrip() {
        let store = SqliteTaskStore::new_in_memory().await.unwrap();
        let now = Utc::now();
        let task = NewTaskRecord::new("report", json!({"kind": "daily"}), now)
            .owned_by("node-a", now)
            .repeating(Duration::seconds(30))
            .with_unique_key("daily-report");

        let id = store.insert_one(&task).await.unwrap();
        assert!(id > 0);

        let found = store.find_matching(&TaskFilter::default()).await.unwrap();
        assert_eq!(found.len(), 1);
        let record = &found[0];
        assert_eq!(record.id, id);
        assert_eq!(record.name, "report");
        assert_eq!(record.params, json!({"kind": "daily"}));
        assert_eq!(record.owner.as_deref(), Some("node-a"));
        assert!(!record.running);
        assert_eq!(record.repeat_interval_ms, Some(30_000));
        assert_eq!(record.unique_key.as_deref(), Some("daily-report"));
        assert!(record.captured_at.is_some());
    }

    #[tokio::test]
    async fn test_update_many_claims_only_unowned() {
        let store = SqliteTaskStore::new_in_memory().await.unwrap();
        let now = Utc::now();

        let unowned = store.insert_one(&sample_task("a")).await.unwrap();
        let owned = store
            .insert_one(&sample_task("b").owned_by("node-x", now))
            .await
            .unwrap();

        let claimed = store
            .update_many(&TaskFilter::unowned(), &TaskPatch::claim("node-y", now))
            .await
            .unwrap();
        assert_eq!(claimed, 1);

        let records = store.find_matching(&TaskFilter::default()).await.unwrap();
        let by_id = |id: i64| records.iter().find(|r| r.id == id).unwrap();
        assert_eq!(by_id(unowned).owner.as_deref(), Some("node-y"));
        assert!(by_id(unowned).captured_at.is_some());
        assert_eq!(by_id(owned).owner.as_deref(), Some("node-x"));
    }

    #[tokio::test]
    async fn test_ids_filter_batch_update_and_empty_set() {
        let store = SqliteTaskStore::new_in_memory().await.unwrap();
        let id1 = store.insert_one(&sample_task("a")).await.unwrap();
        let id2 = store.insert_one(&sample_task("b")).await.unwrap();
        let id3 = store.insert_one(&sample_task("c")).await.unwrap();

        let updated = store
            .update_many(
                &TaskFilter::by_ids(vec![id1, id3]),
                &TaskPatch::set_running(true),
            )
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let running = store
            .find_matching(&TaskFilter::default().running(true))
            .await
            .unwrap();
        let running_ids: Vec<i64> = running.iter().map(|r| r.id).collect();
        assert!(running_ids.contains(&id1));
        assert!(running_ids.contains(&id3));
        assert!(!running_ids.contains(&id2));

        // 空ID集合不匹配任何记录
        let updated = store
            .update_many(&TaskFilter::by_ids(vec![]), &TaskPatch::set_running(false))
            .await
            .unwrap();
        assert_eq!(updated, 0);
    }

    #[tokio::test]
    async fn test_owner_and_due_window_filter() {
        let store = SqliteTaskStore::new_in_memory().await.unwrap();
        let now = Utc::now();

        let due = store
            .insert_one(
                &NewTaskRecord::new("due", json!({}), now - Duration::seconds(5))
                    .owned_by("node-a", now),
            )
            .await
            .unwrap();
        let near_future = store
            .insert_one(
                &NewTaskRecord::new("soon", json!({}), now + Duration::seconds(8))
                    .owned_by("node-a", now),
            )
            .await
            .unwrap();
        // 窗口之外
        store
            .insert_one(
                &NewTaskRecord::new("later", json!({}), now + Duration::seconds(600))
                    .owned_by("node-a", now),
            )
            .await
            .unwrap();
        // 别的节点
        store
            .insert_one(
                &NewTaskRecord::new("other", json!({}), now - Duration::seconds(5))
                    .owned_by("node-b", now),
            )
            .await
            .unwrap();

        let filter = TaskFilter::owned_by("node-a")
            .due_before(now + Duration::seconds(10))
            .running(false);
        let selected = store.find_matching(&filter).await.unwrap();
        let ids: Vec<i64> = selected.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![due, near_future]);
    }

    #[tokio::test]
    async fn test_unique_key_delete_many() {
        let store = SqliteTaskStore::new_in_memory().await.unwrap();
        store
            .insert_one(&sample_task("a").with_unique_key("k"))
            .await
            .unwrap();
        store
            .insert_one(&sample_task("b").with_unique_key("k"))
            .await
            .unwrap();
        store
            .insert_one(&sample_task("c").with_unique_key("other"))
            .await
            .unwrap();

        let removed = store
            .delete_many(&TaskFilter::by_unique_key("k"))
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let rest = store.find_matching(&TaskFilter::default()).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].unique_key.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_expired_before_is_strict() {
        let store = SqliteTaskStore::new_in_memory().await.unwrap();
        let cutoff = Utc::now();

        let old = store
            .insert_one(&NewTaskRecord::new(
                "old",
                json!({}),
                cutoff - Duration::seconds(1),
            ))
            .await
            .unwrap();
        let boundary = store
            .insert_one(&NewTaskRecord::new("boundary", json!({}), cutoff))
            .await
            .unwrap();

        let removed = store
            .delete_many(&TaskFilter::expired_before(cutoff))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let rest = store.find_matching(&TaskFilter::default()).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, boundary);
        assert_ne!(rest[0].id, old);
    }

    #[tokio::test]
    async fn test_captured_before_or_missing_filter() {
        let store = SqliteTaskStore::new_in_memory().await.unwrap();
        let now = Utc::now();
        let cutoff = now - Duration::seconds(120);

        let never_captured = store.insert_one(&sample_task("never")).await.unwrap();
        let stale = store
            .insert_one(&sample_task("stale").owned_by("node-x", cutoff - Duration::seconds(1)))
            .await
            .unwrap();
        let fresh = store
            .insert_one(&sample_task("fresh").owned_by("node-x", now))
            .await
            .unwrap();

        let recaptured = store
            .update_many(
                &TaskFilter::captured_before_or_missing(cutoff),
                &TaskPatch::claim("node-y", now),
            )
            .await
            .unwrap();
        assert_eq!(recaptured, 2);

        let records = store.find_matching(&TaskFilter::default()).await.unwrap();
        let by_id = |id: i64| records.iter().find(|r| r.id == id).unwrap();
        assert_eq!(by_id(never_captured).owner.as_deref(), Some("node-y"));
        assert_eq!(by_id(stale).owner.as_deref(), Some("node-y"));
        assert_eq!(by_id(fresh).owner.as_deref(), Some("node-x"));
    }

    #[tokio::test]
    async fn test_release_sets_owner_null_and_keeps_captured_at() {
        let store = SqliteTaskStore::new_in_memory().await.unwrap();
        let now = Utc::now();
        let id = store
            .insert_one(&sample_task("a").owned_by("node-a", now))
            .await
            .unwrap();

        let released = store
            .update_many(&TaskFilter::owned_by("node-a"), &TaskPatch::release())
            .await
            .unwrap();
        assert_eq!(released, 1);

        let records = store.find_matching(&TaskFilter::by_ids(vec![id])).await.unwrap();
        assert!(records[0].owner.is_none());
        assert!(records[0].captured_at.is_some());
    }

    #[tokio::test]
    async fn test_update_one_and_delete_one() {
        let store = SqliteTaskStore::new_in_memory().await.unwrap();
        let id = store.insert_one(&sample_task("a")).await.unwrap();

        assert!(store
            .update_one(id, &TaskPatch::set_running(true))
            .await
            .unwrap());
        assert!(!store
            .update_one(id + 100, &TaskPatch::set_running(true))
            .await
            .unwrap());

        assert!(store.delete_one(id).await.unwrap());
        assert!(!store.delete_one(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_patch_is_noop() {
        let store = SqliteTaskStore::new_in_memory().await.unwrap();
        store.insert_one(&sample_task("a")).await.unwrap();

        let updated = store
            .update_many(&TaskFilter::default(), &TaskPatch::default())
            .await
            .unwrap();
        assert_eq!(updated, 0);
    }
}
