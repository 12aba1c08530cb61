//! 读穿透拉取：缓存未命中时向后端拉取，同一个群同一时刻只发一次请求

use crate::error::FetchError;
use crate::group::store::{Lookup, MetadataStore, SharedFetch};
use crate::model::{CachedGroup, GroupId, RawGroup};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 外部群元数据来源（由传输层实现）
#[async_trait]
pub trait GroupFetcher: Send + Sync {
    /// 拉取单个群的权威元数据
    async fn fetch_one(&self, id: &GroupId) -> Result<RawGroup, FetchError>;

    /// 一次性拉取当前连接参与的所有群
    async fn fetch_all(&self) -> Result<HashMap<GroupId, RawGroup>, FetchError>;
}

pub struct FetchCoordinator {
    store: Arc<MetadataStore>,
    fetcher: Arc<dyn GroupFetcher>,
}

impl FetchCoordinator {
    pub fn new(store: Arc<MetadataStore>, fetcher: Arc<dyn GroupFetcher>) -> Self {
        Self { store, fetcher }
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// 先查缓存；未命中时加入或发起该群唯一的外部拉取
    pub async fn fetch(&self, id: &GroupId) -> Result<CachedGroup, FetchError> {
        self.load(id, true).await
    }

    /// 跳过缓存强制拉取，但仍与进行中的拉取去重
    pub async fn refresh(&self, id: &GroupId) -> Result<CachedGroup, FetchError> {
        self.load(id, false).await
    }

    async fn load(&self, id: &GroupId, use_cache: bool) -> Result<CachedGroup, FetchError> {
        let lookup = self
            .store
            .lookup_or_register(id, use_cache, |token| self.start_fetch(id.clone(), token));
        match lookup {
            Lookup::Cached(group) => Ok(group),
            Lookup::Pending(pending) => pending.await,
        }
    }

    /// 外部拉取放在独立任务里执行：即使所有调用方都被取消，结果也会落入缓存
    fn start_fetch(&self, id: GroupId, token: u64) -> SharedFetch {
        let store = self.store.clone();
        let fetcher = self.fetcher.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            let id = task_id;
            debug!(group_id = %id, "开始拉取群元数据");
            match fetcher.fetch_one(&id).await {
                Ok(raw) => {
                    let mut group = CachedGroup::from(raw);
                    group.id = id.clone();
                    if !store.complete_inflight(&id, token, Some(group.clone())) {
                        debug!(group_id = %id, "拉取期间缓存已被作废，结果不写入");
                    }
                    Ok(group)
                }
                Err(e) => {
                    warn!(group_id = %id, error = %e, "拉取群元数据失败");
                    store.complete_inflight(&id, token, None);
                    Err(e)
                }
            }
        });

        let store = self.store.clone();
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(group_id = %id, error = %e, "拉取任务异常退出");
                    store.complete_inflight(&id, token, None);
                    Err(FetchError::Aborted(e.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// 一次性预取当前连接的所有群，返回写入条数；失败只记日志并返回 0
    pub async fn bulk_prefetch(&self) -> usize {
        let all = match self.fetcher.fetch_all().await {
            Ok(all) => all,
            Err(e) => {
                error!(error = %e, "群元数据预取失败");
                return 0;
            }
        };
        let mut count = 0;
        for (id, raw) in all {
            if id.is_empty() {
                continue;
            }
            self.store.set(id, raw);
            count += 1;
        }
        info!(count, "群元数据预取完成，已缓存 {} 个群", count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeFetcher;
    use futures::future::join_all;
    use serde_json::json;
    use std::time::Duration;

    fn coordinator(fetcher: &Arc<FakeFetcher>) -> FetchCoordinator {
        FetchCoordinator::new(Arc::new(MetadataStore::new()), fetcher.clone())
    }

    #[tokio::test]
    async fn cache_hit_skips_backend() {
        let fetcher = Arc::new(FakeFetcher::default());
        let coord = coordinator(&fetcher);
        coord
            .store()
            .set(GroupId::from("g1"), CachedGroup::empty(GroupId::from("g1")));

        coord.fetch(&GroupId::from("g1")).await.unwrap();
        assert_eq!(fetcher.one_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_request() {
        let fetcher = Arc::new(FakeFetcher::default().with_delay(Duration::from_millis(20)));
        fetcher.insert("g1", json!({ "subject": "Team", "participants": ["a", "b"] }));
        let coord = coordinator(&fetcher);
        let id = GroupId::from("g1");

        let results = join_all((0..16).map(|_| coord.fetch(&id))).await;

        assert_eq!(fetcher.one_calls(), 1);
        let first = results[0].clone().unwrap();
        assert_eq!(first.subject, "Team");
        assert!(results.iter().all(|r| r.as_ref() == Ok(&first)));
        assert_eq!(coord.store().get("g1"), Some(first));
        assert!(!coord.store().has_inflight("g1"));
    }

    #[tokio::test]
    async fn concurrent_failures_share_one_error() {
        let fetcher = Arc::new(FakeFetcher::default().with_delay(Duration::from_millis(20)));
        fetcher.fail("g1");
        let coord = coordinator(&fetcher);
        let id = GroupId::from("g1");

        let results = join_all((0..8).map(|_| coord.fetch(&id))).await;

        assert_eq!(fetcher.one_calls(), 1);
        let err = results[0].clone().unwrap_err();
        assert!(results.iter().all(|r| r.as_ref().err() == Some(&err)));
        assert!(coord.store().get("g1").is_none());
        assert!(!coord.store().has_inflight("g1"));

        // 失败后可以再次发起
        fetcher.recover("g1");
        fetcher.insert("g1", json!({ "subject": "Back" }));
        assert_eq!(coord.fetch(&id).await.unwrap().subject, "Back");
        assert_eq!(fetcher.one_calls(), 2);
    }

    #[tokio::test]
    async fn failure_for_one_group_leaves_others_alone() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.insert("b", json!({ "subject": "B", "participants": ["x"] }));
        fetcher.fail("a");
        let coord = coordinator(&fetcher);

        let b = coord.fetch(&GroupId::from("b")).await.unwrap();
        assert!(coord.fetch(&GroupId::from("a")).await.is_err());

        assert_eq!(coord.store().get("b"), Some(b));
    }

    #[tokio::test]
    async fn refresh_bypasses_cache() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.insert("g1", json!({ "subject": "Remote" }));
        let coord = coordinator(&fetcher);
        coord.store().merge(GroupId::from("g1"), crate::model::GroupPatch::subject("Local"));

        let g = coord.refresh(&GroupId::from("g1")).await.unwrap();
        assert_eq!(g.subject, "Remote");
        assert_eq!(coord.store().get("g1").unwrap().subject, "Remote");
        assert_eq!(fetcher.one_calls(), 1);
    }

    #[tokio::test]
    async fn delete_during_fetch_discards_result() {
        let fetcher = Arc::new(FakeFetcher::default().with_delay(Duration::from_millis(30)));
        fetcher.insert("g1", json!({ "subject": "Late" }));
        let coord = Arc::new(coordinator(&fetcher));

        let c = coord.clone();
        let pending = tokio::spawn(async move { c.fetch(&GroupId::from("g1")).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        coord.store().delete("g1");

        let got = pending.await.unwrap().unwrap();
        assert_eq!(got.subject, "Late");
        assert!(coord.store().get("g1").is_none());
    }

    #[tokio::test]
    async fn bulk_prefetch_populates_store() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.insert("g1", json!({ "subject": "Team", "participants": [] }));
        let coord = coordinator(&fetcher);

        assert_eq!(coord.bulk_prefetch().await, 1);
        assert_eq!(coord.store().len(), 1);
        assert_eq!(coord.store().get("g1").unwrap().subject, "Team");
        assert_eq!(fetcher.all_calls(), 1);
        assert_eq!(fetcher.one_calls(), 0);
    }

    #[tokio::test]
    async fn bulk_prefetch_failure_returns_zero() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.insert("g1", json!({ "subject": "Team" }));
        fetcher.fail_all(true);
        let coord = coordinator(&fetcher);
        coord
            .store()
            .set(GroupId::from("keep"), CachedGroup::empty(GroupId::from("keep")));

        assert_eq!(coord.bulk_prefetch().await, 0);
        assert!(coord.store().contains("keep"));
        assert_eq!(coord.store().len(), 1);
    }
}
