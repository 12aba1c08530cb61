//! 群元数据缓存：群 ID -> 花名册 + 属性，外加进行中的拉取表
//!
//! 缓存与 inflight 表放在同一把读写锁下，所有操作都是同步、原子的，
//! 不会在锁内 `.await`，读者永远看不到合并到一半的成员列表。

use crate::error::FetchError;
use crate::model::{CachedGroup, GroupId, GroupPatch};
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// 同一次外部拉取的共享结果，所有并发调用方 await 同一个 future
pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<CachedGroup, FetchError>>>;

struct InflightEntry {
    /// 区分同一个群先后发起的不同拉取
    token: u64,
    pending: SharedFetch,
}

#[derive(Default)]
struct StoreInner {
    groups: HashMap<GroupId, CachedGroup>,
    inflight: HashMap<GroupId, InflightEntry>,
}

/// 查询缓存或加入进行中的拉取
pub(crate) enum Lookup {
    Cached(CachedGroup),
    Pending(SharedFetch),
}

#[derive(Default)]
pub struct MetadataStore {
    inner: RwLock<StoreInner>,
    next_token: AtomicU64,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    // 锁中毒时继续使用内部数据：每个操作内部不会留下半完成状态
    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 纯查询，无副作用
    pub fn get(&self, id: &str) -> Option<CachedGroup> {
        self.read().groups.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().groups.contains_key(id)
    }

    /// 整条覆盖；记录的 `id` 以 key 为准
    pub fn set(&self, id: GroupId, group: impl Into<CachedGroup>) {
        let mut group = group.into();
        group.id = id.clone();
        self.write().groups.insert(id, group);
    }

    /// 部分合并；群不存在时以补丁内容新建
    pub fn merge(&self, id: GroupId, patch: GroupPatch) {
        let mut inner = self.write();
        let group = inner
            .groups
            .entry(id.clone())
            .or_insert_with(|| CachedGroup::empty(id));
        group.apply_patch(patch);
    }

    /// 在锁内读-改-写；群不存在时先用 `seed` 生成初始记录
    pub fn update_with<S, F, R>(&self, id: GroupId, seed: S, f: F) -> R
    where
        S: FnOnce() -> CachedGroup,
        F: FnOnce(&mut CachedGroup) -> R,
    {
        let mut inner = self.write();
        let group = inner.groups.entry(id.clone()).or_insert_with(|| {
            let mut g = seed();
            g.id = id;
            g
        });
        f(group)
    }

    /// 删除记录并清掉该群进行中的拉取，返回记录是否存在
    pub fn delete(&self, id: &str) -> bool {
        let mut inner = self.write();
        let dropped_inflight = inner.inflight.remove(id).is_some();
        let existed = inner.groups.remove(id).is_some();
        if dropped_inflight {
            debug!(group_id = %id, "删除缓存时清理进行中的拉取");
        }
        existed
    }

    /// 调用时刻的快照
    pub fn list_ids(&self) -> Vec<GroupId> {
        self.read().groups.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().groups.is_empty()
    }

    /// 清空所有记录与进行中的拉取
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.groups.clear();
        inner.inflight.clear();
    }

    pub fn has_inflight(&self, id: &str) -> bool {
        self.read().inflight.contains_key(id)
    }

    /// 检查缓存与 inflight 表，都没有时调用 `start` 发起拉取并登记。
    ///
    /// 整个判断在一把写锁内完成，保证同一个群最多只有一个外部拉取。
    pub(crate) fn lookup_or_register<F>(&self, id: &GroupId, use_cache: bool, start: F) -> Lookup
    where
        F: FnOnce(u64) -> SharedFetch,
    {
        let mut inner = self.write();
        if use_cache {
            if let Some(group) = inner.groups.get(id) {
                return Lookup::Cached(group.clone());
            }
        }
        if let Some(entry) = inner.inflight.get(id) {
            return Lookup::Pending(entry.pending.clone());
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let pending = start(token);
        inner.inflight.insert(
            id.clone(),
            InflightEntry {
                token,
                pending: pending.clone(),
            },
        );
        Lookup::Pending(pending)
    }

    /// 拉取结束：成功时写入缓存，然后移除 inflight 记录。
    ///
    /// 如果登记已被 `delete`/`clear` 清掉（token 对不上），结果不写入缓存，返回 `false`。
    pub(crate) fn complete_inflight(
        &self,
        id: &GroupId,
        token: u64,
        result: Option<CachedGroup>,
    ) -> bool {
        let mut inner = self.write();
        let current = inner
            .inflight
            .get(id)
            .is_some_and(|entry| entry.token == token);
        if !current {
            return false;
        }
        if let Some(mut group) = result {
            group.id = id.clone();
            inner.groups.insert(id.clone(), group);
        }
        inner.inflight.remove(id);
        true
    }
}
