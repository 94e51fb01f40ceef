//! 清扫执行引擎
//!
//! 周期性选出本节点名下、窗口内到期且未在运行的记录，先整批
//! 置为 running 再逐条并发派发。选取窗口为「现在起一个清扫周期」，
//! 这样清扫节奏慢也不会饿死临近到期的任务；整批置位挡住了本引擎
//! 下一个周期对同一批记录的重复选取。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use taskherd_core::{SchedulerError, SchedulerResult};
use taskherd_domain::{TaskFilter, TaskPatch, TaskRecord, TaskStore};

use crate::completion;
use crate::registry::HandlerRegistry;

pub struct SweepEngine {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    node_id: String,
    check_interval: Duration,
}

impl SweepEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        node_id: String,
        check_interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            node_id,
            check_interval,
        }
    }

    /// 执行一次清扫，返回本轮派发任务的句柄。
    /// 派发互相独立、并发执行、无数量上限，清扫循环不等待它们完成。
    pub async fn sweep_once(
        &self,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<JoinHandle<()>>> {
        let horizon = now + self.check_interval;
        let filter = TaskFilter::owned_by(&self.node_id)
            .due_before(horizon)
            .running(false);

        let due = self.store.find_matching(&filter).await?;
        if due.is_empty() {
            debug!("节点 {} 本轮清扫没有到期任务", self.node_id);
            return Ok(Vec::new());
        }

        // 先整批标记 running 再派发
        let ids: Vec<i64> = due.iter().map(|task| task.id).collect();
        self.store
            .update_many(&TaskFilter::by_ids(ids), &TaskPatch::set_running(true))
            .await?;

        info!("节点 {} 本轮清扫派发 {} 个任务", self.node_id, due.len());

        let handles = due.into_iter().map(|task| self.dispatch(task)).collect();
        Ok(handles)
    }

    /// 派发单条记录：解析处理器、执行、交给收尾逻辑。
    /// 未注册处理器按处理器失败对待，记录同样会被收尾。
    fn dispatch(&self, task: TaskRecord) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let node_id = self.node_id.clone();

        tokio::spawn(async move {
            debug!("{} 开始执行", task.entity_description());
            let outcome = match registry.get(&task.name).await {
                Some(handler) => handler.run(task.params.clone()).await,
                None => Err(SchedulerError::HandlerNotFound {
                    name: task.name.clone(),
                }),
            };
            completion::finalize(store.as_ref(), &node_id, &task, outcome).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::join_all;
    use serde_json::json;
    use taskherd_domain::NewTaskRecord;
    use taskherd_infrastructure::SqliteTaskStore;

    struct Fixture {
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        engine: SweepEngine,
    }

    async fn fixture(node_id: &str) -> Fixture {
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new_in_memory().await.unwrap());
        let registry = Arc::new(HandlerRegistry::new());
        let engine = SweepEngine::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            node_id.to_string(),
            Duration::seconds(10),
        );
        Fixture {
            store,
            registry,
            engine,
        }
    }

    #[tokio::test]
    async fn test_sweep_executes_due_task_and_deletes_on_success() {
        let fx = fixture("node-a").await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        fx.registry
            .register_fn("job", move |_| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        let now = Utc::now();
        fx.store
            .insert_one(&NewTaskRecord::new("job", json!({}), now).owned_by("node-a", now))
            .await
            .unwrap();

        let handles = fx.engine.sweep_once(now).await.unwrap();
        assert_eq!(handles.len(), 1);
        join_all(handles).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(fx
            .store
            .find_matching(&TaskFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_sweep_selects_only_window_and_own_records() {
        let fx = fixture("node-a").await;
        fx.registry.register_fn("job", |_| async { Ok(()) }).await;

        let now = Utc::now();
        // 窗口内（10秒检查周期，8秒后到期）
        fx.store
            .insert_one(
                &NewTaskRecord::new("job", json!({}), now + Duration::seconds(8))
                    .owned_by("node-a", now),
            )
            .await
            .unwrap();
        // 窗口外
        let later = fx
            .store
            .insert_one(
                &NewTaskRecord::new("job", json!({}), now + Duration::seconds(60))
                    .owned_by("node-a", now),
            )
            .await
            .unwrap();
        // 别的节点的到期任务
        let foreign = fx
            .store
            .insert_one(
                &NewTaskRecord::new("job", json!({}), now - Duration::seconds(1))
                    .owned_by("node-b", now),
            )
            .await
            .unwrap();
        // 无主记录不在清扫范围内
        let unowned = fx
            .store
            .insert_one(&NewTaskRecord::new("job", json!({}), now))
            .await
            .unwrap();

        let handles = fx.engine.sweep_once(now).await.unwrap();
        assert_eq!(handles.len(), 1);
        join_all(handles).await;

        let rest = fx.store.find_matching(&TaskFilter::default()).await.unwrap();
        let ids: Vec<i64> = rest.iter().map(|r| r.id).collect();
        assert_eq!(rest.len(), 3);
        assert!(ids.contains(&later));
        assert!(ids.contains(&foreign));
        assert!(ids.contains(&unowned));
    }

    #[tokio::test]
    async fn test_sweep_marks_running_before_dispatch_settles() {
        let fx = fixture("node-a").await;
        // 处理器长时间不落定，模拟执行中的任务
        fx.registry
            .register_fn("slow", |_| async {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        let now = Utc::now();
        fx.store
            .insert_one(&NewTaskRecord::new("slow", json!({}), now).owned_by("node-a", now))
            .await
            .unwrap();

        let handles = fx.engine.sweep_once(now).await.unwrap();
        assert_eq!(handles.len(), 1);

        // 记录已整批置为 running，下一轮清扫不会重复选中
        let records = fx.store.find_matching(&TaskFilter::default()).await.unwrap();
        assert!(records[0].running);
        let handles = fx.engine.sweep_once(now).await.unwrap();
        assert!(handles.is_empty());
    }

    #[tokio::test]
    async fn test_missing_handler_is_treated_as_failure() {
        let fx = fixture("node-a").await;
        let now = Utc::now();
        fx.store
            .insert_one(
                &NewTaskRecord::new("unregistered", json!({}), now).owned_by("node-a", now),
            )
            .await
            .unwrap();

        let handles = fx.engine.sweep_once(now).await.unwrap();
        join_all(handles).await;

        // 一次性任务失败后保留，等待下个周期重试
        let rest = fx.store.find_matching(&TaskFilter::default()).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(!rest[0].running);
        assert_eq!(rest[0].owner.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn test_failed_one_shot_is_retried_next_sweep() {
        let fx = fixture("node-a").await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        fx.registry
            .register_fn("flaky", move |_| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    // 第一次失败，之后成功
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(taskherd_core::SchedulerError::HandlerExecution(
                            "transient".to_string(),
                        ))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        let now = Utc::now();
        fx.store
            .insert_one(&NewTaskRecord::new("flaky", json!({}), now).owned_by("node-a", now))
            .await
            .unwrap();

        join_all(fx.engine.sweep_once(now).await.unwrap()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            fx.store
                .find_matching(&TaskFilter::default())
                .await
                .unwrap()
                .len(),
            1
        );

        join_all(fx.engine.sweep_once(now).await.unwrap()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(fx
            .store
            .find_matching(&TaskFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_repeating_task_advances_exactly_one_interval() {
        let fx = fixture("node-a").await;
        fx.registry.register_fn("tick", |_| async { Ok(()) }).await;

        let now = Utc::now();
        let original = NewTaskRecord::new("tick", json!({}), now)
            .owned_by("node-a", now)
            .repeating(Duration::milliseconds(1000));
        let original_id = fx.store.insert_one(&original).await.unwrap();
        let stored = fx
            .store
            .find_matching(&TaskFilter::by_ids(vec![original_id]))
            .await
            .unwrap()
            .remove(0);

        join_all(fx.engine.sweep_once(now).await.unwrap()).await;

        let rest = fx.store.find_matching(&TaskFilter::default()).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_ne!(rest[0].id, original_id);
        assert_eq!(
            rest[0].scheduled_at,
            stored.scheduled_at + Duration::milliseconds(1000)
        );
        assert_eq!(rest[0].owner.as_deref(), Some("node-a"));
        assert!(!rest[0].running);
    }

    #[tokio::test]
    async fn test_dispatches_run_concurrently() {
        let fx = fixture("node-a").await;
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let peak_clone = Arc::clone(&peak);
        let active_clone = Arc::clone(&active);
        fx.registry
            .register_fn("parallel", move |_| {
                let peak = Arc::clone(&peak_clone);
                let active = Arc::clone(&active_clone);
                async move {
                    let current = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        let now = Utc::now();
        for _ in 0..4 {
            fx.store
                .insert_one(
                    &NewTaskRecord::new("parallel", json!({}), now).owned_by("node-a", now),
                )
                .await
                .unwrap();
        }

        join_all(fx.engine.sweep_once(now).await.unwrap()).await;
        assert!(peak.load(Ordering::SeqCst) > 1);
    }
}
