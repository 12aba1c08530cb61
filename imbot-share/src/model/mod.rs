//! 群元数据模型：群 ID、成员、花名册与部分更新
//!
//! 后端返回的成员列表格式并不统一（纯字符串 / 部分对象），这里统一收敛为
//! `Participant`，并保证花名册内同一成员 ID 只出现一次。

use indexmap::IndexMap;
use serde::de::Deserializer;
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

pub(crate) use string_id;

string_id!(
    /// 群 ID（例如 `1203630...@g.us`），分配后不可变
    GroupId
);

string_id!(
    /// 成员 ID
    MemberId
);

/// 成员角色
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    None,
    Admin,
}

impl Role {
    /// 后端的 admin 字段：`"admin"` / `"superadmin"` 视为管理员，其余（含 null）为普通成员
    pub fn from_admin_field(admin: Option<&str>) -> Self {
        match admin.map(|s| s.trim().to_ascii_lowercase()) {
            Some(s) if s == "admin" || s == "superadmin" => Role::Admin,
            _ => Role::None,
        }
    }

    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// 群成员；身份只看 `id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: MemberId,
    #[serde(default)]
    pub role: Role,
}

impl Participant {
    pub fn new(id: impl Into<MemberId>, role: Role) -> Self {
        Self { id: id.into(), role }
    }
}

impl PartialEq for Participant {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Participant {}

impl std::hash::Hash for Participant {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// 成员部分更新：`role` 为 `None` 表示本次更新不涉及角色
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantPatch {
    pub id: MemberId,
    pub role: Option<Role>,
}

impl<'de> Deserialize<'de> for ParticipantPatch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawParticipant::deserialize(deserializer)?;
        raw.into_patch()
            .ok_or_else(|| serde::de::Error::custom("participant without id"))
    }
}

/// 花名册：按成员 ID 去重、保持插入顺序
///
/// 不存在的成员表示"当前不在群里"，而不是"未知"。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    members: IndexMap<MemberId, Role>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    pub fn role_of(&self, id: &str) -> Option<Role> {
        self.members.get(id).copied()
    }

    /// 插入或覆盖成员（同 ID 保留原位置，角色以新值为准）
    pub fn upsert(&mut self, participant: Participant) {
        self.members.insert(participant.id, participant.role);
    }

    /// 仅在成员不存在时插入，返回是否插入
    pub fn insert_if_absent(&mut self, id: MemberId, role: Role) -> bool {
        if self.members.contains_key(&id) {
            return false;
        }
        self.members.insert(id, role);
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.members.shift_remove(id).is_some()
    }

    /// 设置角色；成员不存在时以该角色插入
    pub fn set_role(&mut self, id: MemberId, role: Role) {
        self.members.insert(id, role);
    }

    /// 按 ID 合并：已存在的成员只覆盖补丁里带了的字段，新成员直接加入
    pub fn apply_patch(&mut self, patch: ParticipantPatch) {
        match self.members.get_mut(&patch.id) {
            Some(role) => {
                if let Some(r) = patch.role {
                    *role = r;
                }
            }
            None => {
                self.members.insert(patch.id, patch.role.unwrap_or_default());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Participant> + '_ {
        self.members
            .iter()
            .map(|(id, role)| Participant::new(id.clone(), *role))
    }
}

impl FromIterator<Participant> for Roster {
    /// 重复 ID 折叠为一条，后出现的值生效
    fn from_iter<T: IntoIterator<Item = Participant>>(iter: T) -> Self {
        let mut roster = Roster::new();
        for p in iter {
            roster.upsert(p);
        }
        roster
    }
}

impl Serialize for Roster {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.members.len()))?;
        for p in self.iter() {
            seq.serialize_element(&p)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Roster {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<Option<RawParticipant>>::deserialize(deserializer)?;
        Ok(normalize_participants(raw))
    }
}

/// 本地缓存的群元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedGroup {
    #[serde(default)]
    pub id: GroupId,
    #[serde(default)]
    pub subject: String,
    #[serde(default, alias = "desc")]
    pub description: String,
    #[serde(default)]
    pub participants: Roster,
    /// 其余属性（owner、creation、announce、restrict 等）原样保留
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl CachedGroup {
    /// 空花名册的占位记录
    pub fn empty(id: GroupId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// 浅合并：非成员字段直接覆盖，成员按 ID 合并
    pub fn apply_patch(&mut self, patch: GroupPatch) {
        if let Some(subject) = patch.subject {
            self.subject = subject;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(participants) = patch.participants {
            for p in participants {
                self.participants.apply_patch(p);
            }
        }
        for (k, v) in patch.attributes {
            self.attributes.insert(k, v);
        }
    }
}

/// 群属性的部分更新（改名、改简介、禁言开关等）
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GroupPatch {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default, alias = "desc")]
    pub description: Option<String>,
    #[serde(default)]
    pub participants: Option<Vec<ParticipantPatch>>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl GroupPatch {
    pub fn subject(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            ..Default::default()
        }
    }
}

/// 后端原始成员：纯 ID 字符串，或字段不全的对象
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawParticipant {
    Id(String),
    Entry(RawParticipantEntry),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawParticipantEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub jid: Option<String>,
    /// 外层 `None`：字段缺失；`Some(None)`：显式 null
    #[serde(default, deserialize_with = "present")]
    pub admin: Option<Option<String>>,
    #[serde(default)]
    pub is_admin: Option<bool>,
    /// 本地序列化格式（`Participant`）里的角色字段
    #[serde(default)]
    pub role: Option<Role>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl RawParticipant {
    pub fn member_id(&self) -> Option<MemberId> {
        let id = match self {
            RawParticipant::Id(id) => Some(id.as_str()),
            RawParticipant::Entry(e) => e.id.as_deref().or(e.jid.as_deref()),
        };
        id.map(str::trim)
            .filter(|s| !s.is_empty())
            .map(MemberId::from)
    }

    /// 条目是否带有角色信息；纯字符串不带
    pub fn role_hint(&self) -> Option<Role> {
        match self {
            RawParticipant::Id(_) => None,
            RawParticipant::Entry(RawParticipantEntry { role: Some(role), .. }) => Some(*role),
            RawParticipant::Entry(e) => match (&e.admin, e.is_admin) {
                (Some(Some(admin)), _) => Some(Role::from_admin_field(Some(admin))),
                (_, Some(true)) => Some(Role::Admin),
                (Some(None), _) | (_, Some(false)) => Some(Role::None),
                (None, None) => None,
            },
        }
    }

    pub fn normalize(self) -> Option<Participant> {
        let id = self.member_id()?;
        Some(Participant::new(id, self.role_hint().unwrap_or_default()))
    }

    pub fn into_patch(self) -> Option<ParticipantPatch> {
        let id = self.member_id()?;
        Some(ParticipantPatch {
            id,
            role: self.role_hint(),
        })
    }
}

impl From<&str> for RawParticipant {
    fn from(id: &str) -> Self {
        RawParticipant::Id(id.to_string())
    }
}

/// 规整成员列表：丢弃空条目和无 ID 条目，同 ID 只保留最后一条
pub fn normalize_participants<I>(raw: I) -> Roster
where
    I: IntoIterator<Item = Option<RawParticipant>>,
{
    raw.into_iter()
        .flatten()
        .filter_map(RawParticipant::normalize)
        .collect()
}

/// 外部拉取接口返回的原始群元数据
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawGroup {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default, alias = "desc")]
    pub description: Option<String>,
    #[serde(default)]
    pub participants: Vec<Option<RawParticipant>>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl From<RawGroup> for CachedGroup {
    fn from(raw: RawGroup) -> Self {
        CachedGroup {
            id: raw.id.map(GroupId::from).unwrap_or_default(),
            subject: raw.subject.unwrap_or_default(),
            description: raw.description.unwrap_or_default(),
            participants: normalize_participants(raw.participants),
            attributes: raw.attributes,
        }
    }
}
