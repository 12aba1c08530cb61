//! 断线原因 -> 处理策略（删凭证 / 延迟重连 / 永久停止）

use std::collections::HashMap;
use std::time::Duration;

/// 断线状态码，与后端的 DisconnectReason 一致
pub mod reason {
    pub const CONNECTION_LOST: u16 = 408;
    /// 与 CONNECTION_LOST 同码
    pub const TIMED_OUT: u16 = 408;
    pub const LOGGED_OUT: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const MULTIDEVICE_MISMATCH: u16 = 411;
    pub const CONNECTION_CLOSED: u16 = 428;
    pub const CONNECTION_REPLACED: u16 = 440;
    pub const BAD_SESSION: u16 = 500;
    pub const UNAVAILABLE_SERVICE: u16 = 503;
    pub const RESTART_REQUIRED: u16 = 515;

    /// 保留的"删凭证并停止"状态码；即使规则表里没有也按停止处理
    pub const STOP_CODES: [u16; 3] = [LOGGED_OUT, FORBIDDEN, CONNECTION_REPLACED];

    pub fn describe(code: u16) -> &'static str {
        match code {
            LOGGED_OUT => "设备已登出",
            FORBIDDEN => "连接被禁止（账号可能被封）",
            CONNECTION_REPLACED => "连接被其他会话替换",
            BAD_SESSION => "会话损坏",
            CONNECTION_CLOSED => "连接已关闭",
            CONNECTION_LOST => "连接丢失/超时",
            MULTIDEVICE_MISMATCH => "多设备不匹配",
            RESTART_REQUIRED => "需要重启连接",
            UNAVAILABLE_SERVICE => "服务不可用",
            _ => "未知原因",
        }
    }
}

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectAction {
    /// 凭证永久失效：删除凭证，不再重连
    DeleteAndStop,
    /// 会话损坏但可恢复：删除凭证后延迟重连
    DeleteAndRetry(Duration),
    /// 临时故障：保留凭证，延迟重连
    RetryOnly(Duration),
}

impl DisconnectAction {
    pub fn deletes_credentials(&self) -> bool {
        matches!(
            self,
            DisconnectAction::DeleteAndStop | DisconnectAction::DeleteAndRetry(_)
        )
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            DisconnectAction::DeleteAndStop => None,
            DisconnectAction::DeleteAndRetry(d) | DisconnectAction::RetryOnly(d) => Some(*d),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    rules: HashMap<u16, DisconnectAction>,
    default_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        use reason::*;
        let secs = Duration::from_secs;
        Self::empty(DEFAULT_RETRY_DELAY)
            .with_rule(LOGGED_OUT, DisconnectAction::DeleteAndStop)
            .with_rule(FORBIDDEN, DisconnectAction::DeleteAndStop)
            .with_rule(CONNECTION_REPLACED, DisconnectAction::DeleteAndStop)
            .with_rule(BAD_SESSION, DisconnectAction::DeleteAndRetry(secs(3)))
            .with_rule(CONNECTION_CLOSED, DisconnectAction::RetryOnly(secs(2)))
            .with_rule(CONNECTION_LOST, DisconnectAction::RetryOnly(secs(3)))
            .with_rule(RESTART_REQUIRED, DisconnectAction::RetryOnly(secs(3)))
            .with_rule(MULTIDEVICE_MISMATCH, DisconnectAction::RetryOnly(secs(5)))
            .with_rule(UNAVAILABLE_SERVICE, DisconnectAction::RetryOnly(secs(10)))
    }
}

impl ReconnectPolicy {
    /// 没有任何规则的策略，只剩保留停止码和默认延迟
    pub fn empty(default_delay: Duration) -> Self {
        Self {
            rules: HashMap::new(),
            default_delay,
        }
    }

    pub fn with_rule(mut self, code: u16, action: DisconnectAction) -> Self {
        self.rules.insert(code, action);
        self
    }

    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// 保留停止码之外的状态码才能被规则覆盖
    pub fn is_overridable(&self, code: u16) -> bool {
        !reason::STOP_CODES.contains(&code)
    }

    pub fn default_delay(&self) -> Duration {
        self.default_delay
    }

    pub fn classify(&self, code: Option<u16>) -> DisconnectAction {
        let Some(code) = code else {
            return DisconnectAction::RetryOnly(self.default_delay);
        };
        // 保留停止码不可被规则表覆盖，否则会拿失效凭证无限重连
        if reason::STOP_CODES.contains(&code) {
            return DisconnectAction::DeleteAndStop;
        }
        self.rules
            .get(&code)
            .copied()
            .unwrap_or(DisconnectAction::RetryOnly(self.default_delay))
    }
}
