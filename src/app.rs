use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tokio::sync::broadcast;
use tracing::info;

use taskherd_core::AppConfig;
use taskherd_domain::TaskStore;
use taskherd_engine::{HttpHandler, ShellHandler, TaskScheduler};
use taskherd_infrastructure::{PostgresTaskStore, SqliteTaskStore};

/// 应用实例：存储、调度器与内置处理器的组装
pub struct Application {
    scheduler: Arc<TaskScheduler>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let store = create_store(&config).await?;
        let scheduler = Arc::new(TaskScheduler::new(store, config.scheduler.clone()));

        // 二进制入口默认注册的处理器；库用法由调用方自行注册
        scheduler
            .register_handler("shell", Arc::new(ShellHandler))
            .await;
        scheduler
            .register_handler("http", Arc::new(HttpHandler::new()))
            .await;

        info!("应用初始化完成，节点标识: {}", scheduler.node_id());
        Ok(Self { scheduler })
    }

    pub fn scheduler(&self) -> Arc<TaskScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.scheduler
            .run(shutdown_rx)
            .await
            .context("调度器运行失败")
    }
}

/// 按URL前缀选择存储后端并完成建表
async fn create_store(config: &AppConfig) -> Result<Arc<dyn TaskStore>> {
    let db = &config.database;
    if db.is_sqlite() {
        info!("使用SQLite任务存储: {}", db.url);
        let connect_options = SqliteConnectOptions::from_str(&db.url)
            .with_context(|| format!("解析SQLite连接URL失败: {}", db.url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(db.max_connections)
            .min_connections(db.min_connections)
            .connect_with(connect_options)
            .await
            .context("连接SQLite数据库失败")?;
        let store = SqliteTaskStore::new(pool);
        store.migrate().await.context("SQLite建表失败")?;
        Ok(Arc::new(store))
    } else {
        info!("使用PostgreSQL任务存储");
        let pool = PgPoolOptions::new()
            .max_connections(db.max_connections)
            .min_connections(db.min_connections)
            .connect(&db.url)
            .await
            .context("连接PostgreSQL数据库失败")?;
        let store = PostgresTaskStore::new(pool);
        store.migrate().await.context("PostgreSQL建表失败")?;
        Ok(Arc::new(store))
    }
}
