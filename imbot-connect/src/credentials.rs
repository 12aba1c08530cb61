//! 会话凭证存储：本地凭证目录、Redis 会话 key，以及把多个存储串起来的链

use crate::config::RedisConfig;
use crate::constants::{SESSION_CACHE_PREFIX, USER_CACHE_PREFIX};
use anyhow::Context;
use async_trait::async_trait;
use imbot_share::{CredentialStore, SessionId};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// 删除 `{sessions_dir}/{session_id}`
pub struct FsCredentialStore {
    root: PathBuf,
}

impl FsCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.root.join(session.as_str())
    }
}

#[async_trait]
impl CredentialStore for FsCredentialStore {
    async fn destroy(&self, session: &SessionId) -> anyhow::Result<()> {
        let dir = self.session_dir(session);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(session_id = %session, path = %dir.display(), "已删除本地会话目录");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("删除会话目录失败: {}", dir.display())),
        }
    }
}

/// Redis 异步连接类型别名（避免直接引用 redis::aio）
pub type RedisConnection = redis::aio::MultiplexedConnection;

/// 删除 `IM-SESSION-{id}` 和 `IM-USER-{id}` 登录标记
pub struct RedisCredentialStore {
    conn: RedisConnection,
}

impl RedisCredentialStore {
    pub async fn connect(cfg: &RedisConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(cfg.url())
            .with_context(|| format!("Redis 客户端创建失败 ({}:{})", cfg.host, cfg.port))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| format!("Redis 连接失败 ({}:{})，请检查 Redis 服务是否已启动", cfg.host, cfg.port))?;
        Ok(Self { conn })
    }

    fn keys(session: &SessionId) -> [String; 2] {
        [
            format!("{}{}", SESSION_CACHE_PREFIX, session),
            format!("{}{}", USER_CACHE_PREFIX, session),
        ]
    }
}

#[async_trait]
impl CredentialStore for RedisCredentialStore {
    async fn destroy(&self, session: &SessionId) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(Self::keys(session).as_slice())
            .query_async(&mut conn)
            .await
            .context("删除 Redis 会话失败")?;
        info!(session_id = %session, removed, "已删除 Redis 会话");
        Ok(())
    }
}

/// 依次执行所有存储的删除；单个失败只记录日志，不影响其余存储
#[derive(Default)]
pub struct CredentialChain {
    stores: Vec<(&'static str, Arc<dyn CredentialStore>)>,
}

impl CredentialChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, store: Arc<dyn CredentialStore>) -> Self {
        self.stores.push((name, store));
        self
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }
}

#[async_trait]
impl CredentialStore for CredentialChain {
    async fn destroy(&self, session: &SessionId) -> anyhow::Result<()> {
        for (name, store) in &self.stores {
            if let Err(e) = store.destroy(session).await {
                warn!(session_id = %session, store = *name, error = %e, "凭证删除失败，继续下一个存储");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("imbot-connect-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn fs_store_removes_session_dir_and_is_idempotent() {
        let root = temp_root();
        let store = FsCredentialStore::new(&root);
        let session = SessionId::from("bot-1");
        let dir = store.session_dir(&session);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("creds.json"), b"{}").await.unwrap();
        tokio::fs::create_dir_all(root.join("bot-2")).await.unwrap();

        store.destroy(&session).await.unwrap();
        assert!(!dir.exists());
        assert!(root.join("bot-2").exists());

        store.destroy(&session).await.unwrap();
        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[test]
    fn redis_keys() {
        let [session, user] = RedisCredentialStore::keys(&SessionId::from("bot-1"));
        assert_eq!(session, "IM-SESSION-bot-1");
        assert_eq!(user, "IM-USER-bot-1");
    }

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CredentialStore for Counting {
        async fn destroy(&self, _session: &SessionId) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("store offline");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn chain_runs_every_store_despite_failures() {
        let failing = Arc::new(Counting { calls: AtomicUsize::new(0), fail: true });
        let healthy = Arc::new(Counting { calls: AtomicUsize::new(0), fail: false });
        let chain = CredentialChain::new()
            .with("failing", failing.clone())
            .with("healthy", healthy.clone());

        chain.destroy(&SessionId::from("bot-1")).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
    }
}
