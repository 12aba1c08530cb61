//! 连接生命周期：Disconnected -> Connecting -> Connected -> Disconnected | Connecting
//!
//! 重连定时器由状态机自己持有（JoinHandle + 代号），进入 Connecting / Connected
//! 或安排新的重连时，旧定时器会被确定性地取消。

use crate::error::LifecycleError;
use crate::group::FetchCoordinator;
use crate::session::policy::{DisconnectAction, ReconnectPolicy, reason};
use crate::session::{Connector, CredentialStore, SessionId};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 连接建立后的会话句柄，仅在 Connected 状态下有效
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: SessionId,
    /// 登录账号自身的 ID
    pub user_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(SessionHandle),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}

struct RetryTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct LifecycleInner {
    state: ConnectionState,
    /// 永久停止标记：只有显式 connect() 能清除
    stopped: bool,
    retry: Option<RetryTimer>,
    next_generation: u64,
}

pub struct LifecycleManager {
    session_id: SessionId,
    policy: ReconnectPolicy,
    coordinator: Arc<FetchCoordinator>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    /// 永久停止时是否清空群缓存（默认跨重连保留）
    clear_cache_on_stop: bool,
    inner: Mutex<LifecycleInner>,
}

impl LifecycleManager {
    pub fn new(
        session_id: SessionId,
        coordinator: Arc<FetchCoordinator>,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            session_id,
            policy: ReconnectPolicy::default(),
            coordinator,
            connector,
            credentials,
            clear_cache_on_stop: false,
            inner: Mutex::new(LifecycleInner {
                state: ConnectionState::Disconnected,
                stopped: false,
                retry: None,
                next_generation: 0,
            }),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clear_cache_on_stop(mut self, clear: bool) -> Self {
        self.clear_cache_on_stop = clear;
        self
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state.clone()
    }

    pub fn session_handle(&self) -> Option<SessionHandle> {
        match &self.lock().state {
            ConnectionState::Connected(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub fn has_pending_retry(&self) -> bool {
        self.lock().retry.is_some()
    }

    /// 外部发起连接。已在连接中或已连接时为空操作，返回 `false`；
    /// 连接器拒绝时回到 Disconnected 并按默认延迟安排重连。
    pub async fn connect(self: &Arc<Self>) -> bool {
        {
            let mut inner = self.lock();
            inner.stopped = false;
            if !self.begin_connecting(&mut inner) {
                return false;
            }
        }
        self.open().await
    }

    /// 显式停止：取消重连，不动凭证
    pub fn stop(&self) {
        let mut inner = self.lock();
        Self::cancel_retry(&mut inner);
        inner.stopped = true;
        inner.state = ConnectionState::Disconnected;
        info!(session_id = %self.session_id, "会话已停止");
    }

    /// 连接已建立：进入 Connected 并做一次群元数据预取，返回预取条数。
    /// 已处于 Connected 或会话已停止时忽略，返回 `None`。
    pub async fn on_open(self: &Arc<Self>, user_id: Option<String>) -> Option<usize> {
        {
            let mut inner = self.lock();
            if inner.stopped {
                warn!(session_id = %self.session_id, "会话已停止，忽略连接建立信号");
                return None;
            }
            match inner.state {
                ConnectionState::Connected(_) => {
                    debug!(session_id = %self.session_id, "重复的连接建立信号，忽略");
                    return None;
                }
                ConnectionState::Disconnected => {
                    warn!(session_id = %self.session_id, "未发起连接却收到连接建立信号");
                }
                ConnectionState::Connecting => {}
            }
            Self::cancel_retry(&mut inner);
            inner.state = ConnectionState::Connected(SessionHandle {
                session_id: self.session_id.clone(),
                user_id: user_id.clone(),
                connected_at: Utc::now(),
            });
        }
        info!(session_id = %self.session_id, user_id = ?user_id, "✅ 连接已建立");
        Some(self.coordinator.bulk_prefetch().await)
    }

    /// 连接已关闭：按状态码决定删凭证 / 重连 / 停止。会话已停止时忽略，返回 `None`。
    pub async fn on_close(self: &Arc<Self>, code: Option<u16>) -> Option<DisconnectAction> {
        let action = self.policy.classify(code);
        {
            let mut inner = self.lock();
            inner.state = ConnectionState::Disconnected;
            Self::cancel_retry(&mut inner);
            if inner.stopped {
                debug!(session_id = %self.session_id, code = ?code, "会话已停止，忽略断开信号");
                return None;
            }
            if action == DisconnectAction::DeleteAndStop {
                inner.stopped = true;
            }
        }

        let why = code.map(reason::describe).unwrap_or("未知原因");
        match action {
            DisconnectAction::DeleteAndStop => {
                warn!(session_id = %self.session_id, code = ?code, "❌ 连接关闭（{}），删除会话并停止重连", why);
            }
            DisconnectAction::DeleteAndRetry(delay) => {
                warn!(session_id = %self.session_id, code = ?code, delay_ms = delay.as_millis() as u64, "❌ 连接关闭（{}），删除会话后重连", why);
            }
            DisconnectAction::RetryOnly(delay) => {
                info!(session_id = %self.session_id, code = ?code, delay_ms = delay.as_millis() as u64, "连接关闭（{}），稍后重连", why);
            }
        }

        if action.deletes_credentials() {
            self.destroy_credentials().await;
        }

        match action.retry_delay() {
            Some(delay) => {
                // 删凭证期间可能已有新的 connect()，只在仍然断开时安排重连
                let mut inner = self.lock();
                if !inner.stopped && inner.state == ConnectionState::Disconnected {
                    self.schedule_retry(&mut inner, delay);
                }
            }
            None => {
                if self.clear_cache_on_stop {
                    info!(session_id = %self.session_id, "会话永久停止，清空群缓存");
                    self.coordinator.store().clear();
                }
            }
        }
        Some(action)
    }

    async fn destroy_credentials(&self) {
        info!(session_id = %self.session_id, "🗑️ 删除会话凭证");
        if let Err(e) = self.credentials.destroy(&self.session_id).await {
            let err = LifecycleError::Credentials(e.to_string());
            error!(session_id = %self.session_id, error = %err, "删除会话凭证失败");
        }
    }

    /// Disconnected -> Connecting；重复调用返回 `false`
    fn begin_connecting(&self, inner: &mut LifecycleInner) -> bool {
        match inner.state {
            ConnectionState::Connecting => {
                info!(session_id = %self.session_id, "⏳ 正在连接，跳过重复调用");
                false
            }
            ConnectionState::Connected(_) => {
                info!(session_id = %self.session_id, "✓ 已连接，跳过重复调用");
                false
            }
            ConnectionState::Disconnected => {
                Self::cancel_retry(inner);
                inner.state = ConnectionState::Connecting;
                true
            }
        }
    }

    async fn open(self: &Arc<Self>) -> bool {
        info!(session_id = %self.session_id, "🔄 开始建立连接");
        match self.connector.open(&self.session_id).await {
            Ok(()) => true,
            Err(e) => {
                self.recover(LifecycleError::Connect(e.to_string()));
                false
            }
        }
    }

    /// 迁移中出错：回到 Disconnected，按"仅重试"处理
    fn recover(self: &Arc<Self>, err: LifecycleError) {
        error!(session_id = %self.session_id, error = %err, "连接状态迁移失败");
        let mut inner = self.lock();
        // 期间已经收到连接事件的，以事件为准
        if inner.state != ConnectionState::Connecting {
            return;
        }
        inner.state = ConnectionState::Disconnected;
        if !inner.stopped {
            let delay = self.policy.default_delay();
            self.schedule_retry(&mut inner, delay);
        }
    }

    fn schedule_retry(self: &Arc<Self>, inner: &mut LifecycleInner, delay: Duration) {
        Self::cancel_retry(inner);
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let this: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(this) = this.upgrade() {
                this.fire_retry(generation).await;
            }
        });
        inner.retry = Some(RetryTimer { generation, handle });
        info!(session_id = %self.session_id, delay_ms = delay.as_millis() as u64, "已安排重连");
    }

    async fn fire_retry(self: &Arc<Self>, generation: u64) {
        {
            let mut inner = self.lock();
            if inner.retry.as_ref().map(|t| t.generation) != Some(generation) {
                return;
            }
            // 只摘下自己的句柄，不能 abort 正在运行的自身
            inner.retry = None;
            if inner.stopped || !self.begin_connecting(&mut inner) {
                return;
            }
        }
        self.open().await;
    }

    fn cancel_retry(inner: &mut LifecycleInner) {
        if let Some(timer) = inner.retry.take() {
            timer.handle.abort();
        }
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        Self::cancel_retry(inner);
    }
}
