//! PostgreSQL任务存储
//!
//! 多节点部署形态：所有节点连接同一个库，语句级原子性
//! 保证并发认领/回收互不重叠。

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use taskherd_core::SchedulerResult;
use taskherd_domain::{
    NewTaskRecord, OwnerFilter, TaskFilter, TaskPatch, TaskRecord, TaskStore,
};

const SELECT_COLUMNS: &str = "SELECT id, name, params, scheduled_at, owner, running, \
     repeat_interval_ms, unique_key, captured_at FROM tasks WHERE 1 = 1";

pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 建表与索引。owner 索引是认领/清扫筛选的性能前提。
    pub async fn migrate(&self) -> SchedulerResult<()> {
        debug!("Running PostgreSQL task store migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                params JSONB NOT NULL DEFAULT '{}',
                scheduled_at TIMESTAMPTZ NOT NULL,
                owner TEXT,
                running BOOLEAN NOT NULL DEFAULT FALSE,
                repeat_interval_ms BIGINT,
                unique_key TEXT,
                captured_at TIMESTAMPTZ
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

        debug!("Successfully completed PostgreSQL task store migrations");
        Ok(())
    }

    fn row_to_task(row: &PgRow) -> SchedulerResult<TaskRecord> {
        Ok(TaskRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            params: row.try_get("params")?,
            scheduled_at: row.try_get("scheduled_at")?,
            owner: row.try_get("owner")?,
            running: row.try_get("running")?,
            repeat_interval_ms: row.try_get("repeat_interval_ms")?,
            unique_key: row.try_get("unique_key")?,
            captured_at: row.try_get("captured_at")?,
        })
    }

    fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &TaskFilter) {
        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                qb.push(" AND FALSE");
            } else {
                qb.push(" AND id = ANY(").push_bind(ids.clone()).push(")");
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

    fn push_patch(qb: &mut QueryBuilder<'_, Postgres>, patch: &TaskPatch) {
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
impl TaskStore for PostgresTaskStore {
    async fn find_matching(&self, filter: &TaskFilter) -> SchedulerResult<Vec<TaskRecord>> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        Self::push_filter(&mut qb, filter);
        qb.push(" ORDER BY scheduled_at ASC, id ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn update_many(&self, filter: &TaskFilter, patch: &TaskPatch) -> SchedulerResult<u64> {
        if patch.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE tasks SET ");
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
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE tasks SET ");
        Self::push_patch(&mut qb, patch);
        qb.push(" WHERE id = ").push_bind(id);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_one(&self, task: &NewTaskRecord) -> SchedulerResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO tasks
                (name, params, scheduled_at, owner, running, repeat_interval_ms, unique_key, captured_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(&task.name)
        .bind(&task.params)
        .bind(task.scheduled_at)
        .bind(&task.owner)
        .bind(task.running)
        .bind(task.repeat_interval_ms)
        .bind(&task.unique_key)
        .bind(task.captured_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn delete_many(&self, filter: &TaskFilter) -> SchedulerResult<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM tasks WHERE 1 = 1");
        Self::push_filter(&mut qb, filter);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete_one(&self, id: i64) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
