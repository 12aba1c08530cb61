//! 业务常量：Redis key 前缀、RabbitMQ 默认值、事件信封 code

/// 登录标记，值为账号信息
pub const USER_CACHE_PREFIX: &str = "IM-USER-";
/// 会话凭证
pub const SESSION_CACHE_PREFIX: &str = "IM-SESSION-";
pub const MQ_ROUTERKEY_PREFIX: &str = "IM-ROUTER-";
/// 传输层按会话上送事件用的 routing key 前缀
pub const MQ_EVENTKEY_PREFIX: &str = "IM-EVENT-";
pub const MQ_CONSUMER_TAG: &str = "imbot-connect-consumer";

/// 事件信封 code
pub mod code {
    pub const CONNECTION_OPENED: i32 = 300;
    pub const CONNECTION_CLOSED: i32 = 301;
    pub const PARTICIPANTS_UPDATE: i32 = 310;
    pub const GROUP_UPDATE: i32 = 311;
    /// 下行：要求传输层建立连接
    pub const CONNECT: i32 = 400;
}
