//! 长连接会话：生命周期状态机与断线策略

mod lifecycle;
mod policy;

pub use lifecycle::{ConnectionState, LifecycleManager, SessionHandle};
pub use policy::{DEFAULT_RETRY_DELAY, DisconnectAction, ReconnectPolicy, reason};

use crate::model::string_id;
use async_trait::async_trait;

string_id!(
    /// 逻辑会话 ID（凭证目录名）
    SessionId
);

/// 传输层连接器：发起一次连接尝试，结果通过连接事件回报
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, session: &SessionId) -> anyhow::Result<()>;
}

/// 会话凭证存储；删除必须幂等
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn destroy(&self, session: &SessionId) -> anyhow::Result<()>;
}
