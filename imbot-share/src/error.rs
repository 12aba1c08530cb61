//! 错误类型：拉取失败、事件合并失败、连接生命周期异常
//!
//! 这些错误都不允许让进程崩溃：拉取失败只影响调用方，合并失败只作废单个群的缓存，
//! 生命周期异常回到 Disconnected 并按"仅重试"策略处理。

use crate::model::GroupId;
use thiserror::Error;

/// 外部拉取失败；需要 `Clone`，因为同一次拉取的结果会分发给所有等待者
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("后端请求失败: {0}")]
    Backend(String),
    #[error("后端返回状态码 {status}: {body}")]
    Status { status: u16, body: String },
    #[error("响应解析失败: {0}")]
    Decode(String),
    #[error("群不存在: {0}")]
    NotFound(GroupId),
    #[error("拉取任务中断: {0}")]
    Aborted(String),
}

/// 事件无法合并进缓存
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("事件缺少群 ID")]
    EmptyGroupId,
    #[error("群 {group} 的成员变更包含空成员 ID")]
    EmptyMemberId { group: GroupId },
}

/// 状态迁移过程中的意外错误
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("建立连接失败: {0}")]
    Connect(String),
    #[error("删除会话凭证失败: {0}")]
    Credentials(String),
}
