//! 事件信封：RabbitMQ 上收发的 JSON 结构，按 code 解出会话事件

use crate::constants::code;
use imbot_share::{AttributeChange, MembershipChange, SessionEvent, SessionId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 传输层上送的事件
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub code: Option<i32>,
    #[serde(alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// 下发给传输层的指令
#[derive(Debug, Clone, Serialize)]
pub struct Command<'a> {
    pub code: i32,
    pub session_id: &'a str,
    pub request_id: String,
    pub timestamp: i64,
}

impl<'a> Command<'a> {
    pub fn connect(session: &'a SessionId) -> Self {
        Self {
            code: code::CONNECT,
            session_id: session.as_str(),
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("JSON 解析失败: {0}")]
    Json(#[from] serde_json::Error),
    #[error("缺少 code")]
    MissingCode,
    #[error("code={0} 缺少 data")]
    MissingData(i32),
    #[error("未知的事件 code={0}")]
    UnknownCode(i32),
}

#[derive(Debug, Default, Deserialize)]
struct OpenData {
    #[serde(default, alias = "userId", alias = "id")]
    user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CloseData {
    #[serde(default, alias = "statusCode", alias = "status_code")]
    code: Option<u16>,
    #[serde(default)]
    reason: Option<String>,
}

/// 成员/属性变动可能逐条也可能成批下发
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(value: OneOrMany<T>) -> Self {
        match value {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

/// 解析一条消息。不属于本会话的事件返回空列表。
pub fn decode(body: &[u8], session: &SessionId) -> Result<Vec<SessionEvent>, EnvelopeError> {
    let envelope: Envelope = serde_json::from_slice(body)?;
    if let Some(target) = envelope.session_id.as_deref() {
        if target != session.as_str() {
            return Ok(Vec::new());
        }
    }
    let code = envelope.code.ok_or(EnvelopeError::MissingCode)?;
    let data = envelope.data;

    let events = match code {
        code::CONNECTION_OPENED => {
            let open: OpenData = optional(data)?;
            vec![SessionEvent::ConnectionOpened {
                user_id: open.user_id,
            }]
        }
        code::CONNECTION_CLOSED => {
            let close: CloseData = optional(data)?;
            vec![SessionEvent::ConnectionClosed {
                code: close.code,
                reason: close.reason,
            }]
        }
        code::PARTICIPANTS_UPDATE => required::<MembershipChange>(code, data)?
            .into_iter()
            .map(SessionEvent::ParticipantsChanged)
            .collect(),
        code::GROUP_UPDATE => required::<AttributeChange>(code, data)?
            .into_iter()
            .map(SessionEvent::GroupUpdated)
            .collect(),
        other => return Err(EnvelopeError::UnknownCode(other)),
    };
    Ok(events)
}

fn optional<T: DeserializeOwned + Default>(data: Option<Value>) -> Result<T, EnvelopeError> {
    match data {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => Ok(serde_json::from_value(value)?),
    }
}

fn required<T: DeserializeOwned>(code: i32, data: Option<Value>) -> Result<Vec<T>, EnvelopeError> {
    let value = match data {
        None | Some(Value::Null) => return Err(EnvelopeError::MissingData(code)),
        Some(value) => value,
    };
    let items: OneOrMany<T> = serde_json::from_value(value)?;
    Ok(items.into())
}
