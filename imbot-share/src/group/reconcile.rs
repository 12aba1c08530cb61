//! 增量事件合并：成员变动、群属性变动
//!
//! 成员变动直接在缓存上改花名册，不做整群重拉；属性变动先合并再尝试一次权威刷新。
//! 合并出错时只作废该群的缓存，下次读取会重新拉取。

use crate::error::ReconcileError;
use crate::group::fetch::FetchCoordinator;
use crate::group::store::MetadataStore;
use crate::model::{CachedGroup, GroupId, GroupPatch, MemberId, RawParticipant, Role, Roster};
use dashmap::DashMap;
use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// 默认连续刷新失败多少次后作废缓存
pub const DEFAULT_MAX_REFRESH_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipAction {
    Add,
    Remove,
    Promote,
    Demote,
}

/// 群成员变动事件
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MembershipChange {
    pub id: GroupId,
    #[serde(deserialize_with = "member_ids")]
    pub participants: Vec<MemberId>,
    pub action: MembershipAction,
}

impl MembershipChange {
    pub fn new<I, M>(id: impl Into<GroupId>, action: MembershipAction, members: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<MemberId>,
    {
        Self {
            id: id.into(),
            participants: members.into_iter().map(Into::into).collect(),
            action,
        }
    }
}

// 成员既可能是字符串也可能是对象；取不到 ID 的保留为空 ID，交给合并时校验
fn member_ids<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<MemberId>, D::Error> {
    let raw = Vec::<RawParticipant>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|p| p.member_id().unwrap_or_default())
        .collect())
}

/// 群属性变动事件（改名、改简介、禁言开关等）
#[derive(Debug, Clone, Deserialize)]
pub struct AttributeChange {
    pub id: GroupId,
    #[serde(flatten)]
    pub fields: GroupPatch,
}

/// 把成员变动应用到花名册
///
/// - Add：不在群里的以普通成员加入，已在的不变
/// - Remove：无论原角色直接移除
/// - Promote / Demote：设置角色，不在群里的以对应角色加入
pub fn apply_membership(roster: &mut Roster, action: MembershipAction, members: &[MemberId]) {
    for id in members {
        match action {
            MembershipAction::Add => {
                roster.insert_if_absent(id.clone(), Role::None);
            }
            MembershipAction::Remove => {
                roster.remove(id.as_str());
            }
            MembershipAction::Promote => roster.set_role(id.clone(), Role::Admin),
            MembershipAction::Demote => roster.set_role(id.clone(), Role::None),
        }
    }
}

pub struct EventReconciler {
    coordinator: Arc<FetchCoordinator>,
    max_refresh_failures: u32,
    /// 群 ID -> 连续刷新失败次数
    refresh_failures: DashMap<GroupId, u32>,
}

impl EventReconciler {
    pub fn new(coordinator: Arc<FetchCoordinator>) -> Self {
        Self {
            coordinator,
            max_refresh_failures: DEFAULT_MAX_REFRESH_FAILURES,
            refresh_failures: DashMap::new(),
        }
    }

    /// 0 表示刷新失败从不作废缓存
    pub fn with_max_refresh_failures(mut self, max: u32) -> Self {
        self.max_refresh_failures = max;
        self
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        self.coordinator.store()
    }

    /// 成员变动；出错时作废该群缓存并返回错误
    pub async fn on_participants_changed(
        &self,
        change: MembershipChange,
    ) -> Result<(), ReconcileError> {
        let id = change.id.clone();
        match self.reconcile_membership(change).await {
            Ok(size) => {
                debug!(group_id = %id, size, "成员变动已合并");
                Ok(())
            }
            Err(e) => {
                error!(group_id = %id, error = %e, "成员变动合并失败，作废该群缓存");
                if !id.is_empty() {
                    self.store().delete(id.as_str());
                }
                Err(e)
            }
        }
    }

    async fn reconcile_membership(&self, change: MembershipChange) -> Result<usize, ReconcileError> {
        let MembershipChange {
            id,
            participants,
            action,
        } = change;
        if id.is_empty() {
            return Err(ReconcileError::EmptyGroupId);
        }
        if participants.iter().any(MemberId::is_empty) {
            return Err(ReconcileError::EmptyMemberId { group: id });
        }

        // 缓存没有时先拉一次；拉取失败就从空花名册开始，事件不丢
        let mut seed = None;
        if !self.store().contains(id.as_str()) {
            match self.coordinator.fetch(&id).await {
                Ok(group) => seed = Some(group),
                Err(e) => {
                    warn!(group_id = %id, error = %e, "成员变动前拉取群元数据失败，使用空花名册");
                }
            }
        }

        let seed_id = id.clone();
        let size = self.store().update_with(
            id,
            move || seed.unwrap_or_else(|| CachedGroup::empty(seed_id)),
            |group| {
                apply_membership(&mut group.participants, action, &participants);
                group.participants.len()
            },
        );
        Ok(size)
    }

    /// 属性变动：先合并让读者立刻看到新值，再尝试一次权威刷新；刷新失败不回滚
    pub async fn on_group_updated(&self, change: AttributeChange) -> Result<(), ReconcileError> {
        let AttributeChange { id, fields } = change;
        if id.is_empty() {
            error!("群属性变动缺少群 ID，忽略");
            return Err(ReconcileError::EmptyGroupId);
        }
        self.store().merge(id.clone(), fields);

        match self.coordinator.refresh(&id).await {
            Ok(_) => {
                self.refresh_failures.remove(&id);
            }
            Err(e) => {
                let failures = {
                    let mut n = self.refresh_failures.entry(id.clone()).or_insert(0);
                    *n += 1;
                    *n
                };
                warn!(group_id = %id, error = %e, failures, "刷新群元数据失败，保留合并后的数据");
                if self.max_refresh_failures > 0 && failures >= self.max_refresh_failures {
                    warn!(group_id = %id, failures, "连续刷新失败，作废该群缓存");
                    self.refresh_failures.remove(&id);
                    self.store().delete(id.as_str());
                }
            }
        }
        Ok(())
    }
}
