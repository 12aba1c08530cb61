//! 会话事件分发：连接事件在分发循环内串行处理，群事件按群 ID 分给各自的工作协程，
//! 同一个群的事件按到达顺序合并，不同群之间并发。

use crate::group::{AttributeChange, EventReconciler, MembershipChange};
use crate::model::GroupId;
use crate::session::LifecycleManager;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionOpened { user_id: Option<String> },
    ConnectionClosed { code: Option<u16>, reason: Option<String> },
    ParticipantsChanged(MembershipChange),
    GroupUpdated(AttributeChange),
}

enum GroupTask {
    Participants(MembershipChange),
    Update(AttributeChange),
    Flush(oneshot::Sender<()>),
}

/// 工作协程空闲多久后退出
pub const DEFAULT_WORKER_IDLE: Duration = Duration::from_secs(60);

struct Worker {
    /// 区分同一个群先后创建的工作协程
    generation: u64,
    tx: mpsc::UnboundedSender<GroupTask>,
}

pub struct EventDispatcher {
    lifecycle: Arc<LifecycleManager>,
    reconciler: Arc<EventReconciler>,
    /// 群 ID -> 工作协程；空闲超时的协程会把自己摘掉
    workers: Arc<DashMap<GroupId, Worker>>,
    next_generation: AtomicU64,
    worker_idle: Duration,
}

impl EventDispatcher {
    pub fn new(lifecycle: Arc<LifecycleManager>, reconciler: Arc<EventReconciler>) -> Self {
        Self {
            lifecycle,
            reconciler,
            workers: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            worker_idle: DEFAULT_WORKER_IDLE,
        }
    }

    pub fn with_worker_idle(mut self, idle: Duration) -> Self {
        self.worker_idle = idle;
        self
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// 消费事件流直到发送端全部关闭，退出前等待已排队的群事件处理完
    pub async fn run(&self, mut events: mpsc::Receiver<SessionEvent>) {
        info!(session_id = %self.lifecycle.session_id(), "📡 开始分发会话事件");
        while let Some(event) = events.recv().await {
            self.dispatch(event).await;
        }
        self.flush().await;
        info!(session_id = %self.lifecycle.session_id(), "会话事件流已结束");
    }

    pub async fn dispatch(&self, event: SessionEvent) {
        match event {
            SessionEvent::ConnectionOpened { user_id } => {
                if let Some(count) = self.lifecycle.on_open(user_id).await {
                    info!(session_id = %self.lifecycle.session_id(), count, "群元数据预取完成");
                }
            }
            SessionEvent::ConnectionClosed { code, reason } => {
                debug!(session_id = %self.lifecycle.session_id(), code = ?code, reason = ?reason, "收到连接关闭事件");
                self.lifecycle.on_close(code).await;
            }
            SessionEvent::ParticipantsChanged(change) => {
                if change.id.is_empty() {
                    // 没有群 ID 的事件不占用工作协程，直接交给合并器报错
                    let _ = self.reconciler.on_participants_changed(change).await;
                    return;
                }
                self.enqueue(change.id.clone(), GroupTask::Participants(change));
            }
            SessionEvent::GroupUpdated(change) => {
                if change.id.is_empty() {
                    let _ = self.reconciler.on_group_updated(change).await;
                    return;
                }
                self.enqueue(change.id.clone(), GroupTask::Update(change));
            }
        }
    }

    /// 等待当前已排队的群事件全部处理完
    pub async fn flush(&self) {
        let senders: Vec<_> = self.workers.iter().map(|w| w.tx.clone()).collect();
        let mut pending = Vec::with_capacity(senders.len());
        for sender in senders {
            let (tx, rx) = oneshot::channel();
            if sender.send(GroupTask::Flush(tx)).is_ok() {
                pending.push(rx);
            }
        }
        for rx in pending {
            let _ = rx.await;
        }
    }

    // 投递在表项锁内完成，与工作协程的"队列为空才摘除"互斥，同一个群不会同时有两个协程在跑
    fn enqueue(&self, id: GroupId, task: GroupTask) {
        let mut worker = self
            .workers
            .entry(id.clone())
            .or_insert_with(|| self.spawn_worker(id.clone()));
        if let Err(mpsc::error::SendError(task)) = worker.tx.send(task) {
            warn!(group_id = %id, "群事件工作协程已退出，重新创建");
            *worker = self.spawn_worker(id.clone());
            if worker.tx.send(task).is_err() {
                warn!(group_id = %id, "群事件投递失败，丢弃");
            }
        }
    }

    fn spawn_worker(&self, id: GroupId) -> Worker {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let reconciler = self.reconciler.clone();
        let workers = self.workers.clone();
        let idle = self.worker_idle;
        debug!(group_id = %id, generation, "创建群事件工作协程");
        tokio::spawn(async move {
            loop {
                let task = match tokio::time::timeout(idle, rx.recv()).await {
                    Ok(Some(task)) => task,
                    Ok(None) => break,
                    Err(_) => {
                        let removed = workers
                            .remove_if(&id, |_, w| w.generation == generation && rx.is_empty())
                            .is_some();
                        if removed {
                            break;
                        }
                        continue;
                    }
                };
                match task {
                    GroupTask::Participants(change) => {
                        let _ = reconciler.on_participants_changed(change).await;
                    }
                    GroupTask::Update(change) => {
                        let _ = reconciler.on_group_updated(change).await;
                    }
                    GroupTask::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!(group_id = %id, generation, "群事件工作协程退出");
        });
        Worker { generation, tx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{FetchCoordinator, MembershipAction, MetadataStore};
    use crate::model::{GroupPatch, MemberId};
    use crate::session::{ConnectionState, SessionId, reason};
    use crate::testing::{FakeConnector, FakeCredentials, FakeFetcher};
    use serde_json::json;

    type Parts = (Arc<EventDispatcher>, Arc<MetadataStore>, Arc<FakeCredentials>);

    fn dispatcher(fetcher: Arc<FakeFetcher>) -> Parts {
        dispatcher_with_idle(fetcher, DEFAULT_WORKER_IDLE)
    }

    fn dispatcher_with_idle(fetcher: Arc<FakeFetcher>, idle: Duration) -> Parts {
        let store = Arc::new(MetadataStore::new());
        let coordinator = Arc::new(FetchCoordinator::new(store.clone(), fetcher));
        let credentials = Arc::new(FakeCredentials::default());
        let lifecycle = Arc::new(LifecycleManager::new(
            SessionId::from("bot-1"),
            coordinator.clone(),
            Arc::new(FakeConnector::default()),
            credentials.clone(),
        ));
        let reconciler = Arc::new(EventReconciler::new(coordinator));
        let dispatcher = EventDispatcher::new(lifecycle, reconciler).with_worker_idle(idle);
        (Arc::new(dispatcher), store, credentials)
    }

    fn ids(store: &MetadataStore, id: &str) -> Vec<MemberId> {
        store
            .get(id)
            .map(|g| g.participants.iter().map(|p| p.id).collect())
            .unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn preserves_per_group_order() {
        let fetcher = Arc::new(FakeFetcher::default().with_delay(Duration::from_millis(50)));
        let (d, store, _) = dispatcher(fetcher);

        let events = [
            MembershipChange::new("g1", MembershipAction::Add, ["a"]),
            MembershipChange::new("g2", MembershipAction::Add, ["x"]),
            MembershipChange::new("g1", MembershipAction::Remove, ["a"]),
            MembershipChange::new("g1", MembershipAction::Add, ["b"]),
            MembershipChange::new("g1", MembershipAction::Promote, ["b"]),
        ];
        for change in events {
            d.dispatch(SessionEvent::ParticipantsChanged(change)).await;
        }
        d.flush().await;

        assert_eq!(d.worker_count(), 2);
        assert_eq!(ids(&store, "g1"), vec![MemberId::from("b")]);
        assert!(store.get("g1").unwrap().participants.role_of("b").unwrap().is_admin());
        assert_eq!(ids(&store, "g2"), vec![MemberId::from("x")]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_are_released() {
        let (d, store, _) = dispatcher(Arc::new(FakeFetcher::default()));

        for i in 0..50 {
            let change = MembershipChange::new(format!("g{i}"), MembershipAction::Add, ["a"]);
            d.dispatch(SessionEvent::ParticipantsChanged(change)).await;
        }
        d.flush().await;
        assert_eq!(d.worker_count(), 50);

        tokio::time::sleep(DEFAULT_WORKER_IDLE + Duration::from_secs(1)).await;
        assert_eq!(d.worker_count(), 0);
        assert_eq!(store.len(), 50);

        // 摘除后再来的事件由新协程接着处理
        let change = MembershipChange::new("g1", MembershipAction::Add, ["b"]);
        d.dispatch(SessionEvent::ParticipantsChanged(change)).await;
        d.flush().await;
        assert_eq!(d.worker_count(), 1);
        assert_eq!(ids(&store, "g1"), vec![MemberId::from("a"), MemberId::from("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_worker_is_kept() {
        let (d, _, _) = dispatcher_with_idle(Arc::new(FakeFetcher::default()), Duration::from_secs(10));

        for _ in 0..3 {
            let change = MembershipChange::new("g1", MembershipAction::Add, ["a"]);
            d.dispatch(SessionEvent::ParticipantsChanged(change)).await;
            tokio::time::sleep(Duration::from_secs(6)).await;
            assert_eq!(d.worker_count(), 1);
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(d.worker_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn group_update_is_routed_to_reconciler() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.fail("g1");
        let (d, store, _) = dispatcher(fetcher);

        d.dispatch(SessionEvent::GroupUpdated(AttributeChange {
            id: GroupId::from("g1"),
            fields: GroupPatch::subject("Renamed"),
        }))
        .await;
        d.flush().await;

        assert_eq!(store.get("g1").unwrap().subject, "Renamed");
    }

    #[tokio::test(start_paused = true)]
    async fn run_drives_lifecycle_and_drains_on_close() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.insert("g1", json!({ "subject": "Team", "participants": ["a"] }));
        let (d, store, credentials) = dispatcher(fetcher);
        d.lifecycle().connect().await;

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn({
            let d = d.clone();
            async move { d.run(rx).await }
        });

        tx.send(SessionEvent::ConnectionOpened { user_id: None }).await.unwrap();
        tx.send(SessionEvent::ParticipantsChanged(MembershipChange::new(
            "g1",
            MembershipAction::Add,
            ["b"],
        )))
        .await
        .unwrap();
        tx.send(SessionEvent::ConnectionClosed {
            code: Some(reason::LOGGED_OUT),
            reason: Some("logged out".into()),
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(ids(&store, "g1"), vec![MemberId::from("a"), MemberId::from("b")]);
        assert_eq!(d.lifecycle().state(), ConnectionState::Disconnected);
        assert!(d.lifecycle().is_stopped());
        assert_eq!(credentials.destroyed(), 1);
    }

    #[tokio::test]
    async fn empty_group_id_bypasses_workers() {
        let (d, store, _) = dispatcher(Arc::new(FakeFetcher::default()));
        d.dispatch(SessionEvent::ParticipantsChanged(MembershipChange::new(
            "",
            MembershipAction::Add,
            ["a"],
        )))
        .await;
        assert_eq!(d.worker_count(), 0);
        assert!(store.is_empty());
    }
}
