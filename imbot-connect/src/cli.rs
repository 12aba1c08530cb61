//! 命令行参数定义（使用 clap）

use clap::Parser;
use std::path::PathBuf;

/// imbot-connect 群元数据镜像与连接生命周期守护进程
#[derive(Parser, Debug, Clone)]
#[command(name = "imbot-connect")]
#[command(version)]
#[command(about = "维护群元数据本地镜像，并按断线原因管理会话的重连、删凭证与停止")]
#[command(long_about = None)]
pub struct Cli {

    /// 日志级别（trace, debug, info, warn, error）
    #[arg(short, long, default_value = "info", value_name = "LEVEL", help = "日志级别: trace, debug, info, warn, error")]
    pub log_level: String,

    /// TOML 配置文件（可选），覆盖命令行中的同名配置
    #[arg(short, long, value_name = "FILE", help = "TOML 配置文件路径（可选），文件中的配置优先于命令行")]
    pub config: Option<PathBuf>,

    // ========== Session ==========
    /// 逻辑会话 ID
    #[arg(long, default_value = "default", help = "逻辑会话 ID（凭证目录名），默认: default")]
    pub session_id: String,

    /// 会话凭证根目录
    #[arg(long, default_value = "sessions", help = "会话凭证根目录，默认: sessions")]
    pub sessions_dir: PathBuf,

    // ========== Metadata API ==========
    /// 群元数据 HTTP 接口地址
    #[arg(long, default_value = "http://127.0.0.1:3000", help = "群元数据 HTTP 接口地址，默认: http://127.0.0.1:3000")]
    pub api_base_url: String,

    /// HTTP 请求超时（毫秒）
    #[arg(long, default_value = "10000", help = "HTTP 请求超时（毫秒），默认: 10000")]
    pub api_timeout_ms: u64,

    // ========== Cache ==========
    /// 连续刷新失败多少次后作废缓存（0 表示从不作废）
    #[arg(long, default_value = "3", help = "连续刷新失败多少次后作废该群缓存，0 表示从不作废，默认: 3")]
    pub max_refresh_failures: u32,

    /// 永久停止时是否清空群缓存
    #[arg(long, default_value = "false", help = "会话永久停止时是否清空群缓存，默认: false")]
    pub clear_cache_on_stop: bool,

    /// 群事件工作协程空闲多久后退出（秒）
    #[arg(long, default_value = "60", help = "群事件工作协程空闲多少秒后退出，默认: 60")]
    pub worker_idle_secs: u64,

    // ========== Reconnect ==========
    /// 未配置状态码的默认重连延迟（毫秒）
    #[arg(long, default_value = "3000", help = "未配置状态码的默认重连延迟（毫秒），默认: 3000")]
    pub reconnect_default_delay_ms: u64,

    // ========== Redis ==========
    /// 是否删除 Redis 中的会话凭证
    #[arg(long, default_value = "false", help = "删除凭证时是否同时删除 Redis 中的会话，默认: false")]
    pub redis_enabled: bool,

    /// Redis 主机地址
    #[arg(long, default_value = "127.0.0.1", help = "Redis 主机地址，默认: 127.0.0.1")]
    pub redis_host: String,

    /// Redis 端口
    #[arg(long, default_value = "6379", help = "Redis 端口，默认: 6379")]
    pub redis_port: u16,

    /// Redis 数据库编号
    #[arg(long, default_value = "0", help = "Redis 数据库编号，默认: 0")]
    pub redis_database: u8,

    /// Redis 密码（可选）
    #[arg(long, help = "Redis 密码（可选）")]
    pub redis_password: Option<String>,

    // ========== RabbitMQ ==========
    /// RabbitMQ 主机地址
    #[arg(long, default_value = "127.0.0.1", help = "RabbitMQ 主机地址，默认: 127.0.0.1")]
    pub rabbitmq_host: String,

    /// RabbitMQ 端口
    #[arg(long, default_value = "5672", help = "RabbitMQ 端口，默认: 5672")]
    pub rabbitmq_port: u16,

    /// RabbitMQ 用户名
    #[arg(long, default_value = "guest", help = "RabbitMQ 用户名，默认: guest")]
    pub rabbitmq_username: String,

    /// RabbitMQ 密码
    #[arg(long, default_value = "guest", help = "RabbitMQ 密码，默认: guest")]
    pub rabbitmq_password: String,

    /// RabbitMQ 虚拟主机
    #[arg(long, default_value = "/", help = "RabbitMQ 虚拟主机，默认: /")]
    pub rabbitmq_vhost: String,

    /// RabbitMQ Exchange 名称
    #[arg(long, default_value = "IM-SERVER", help = "RabbitMQ Exchange 名称，默认: IM-SERVER")]
    pub rabbitmq_exchange: String,

    /// RabbitMQ 队列名称（不指定时自动生成）
    #[arg(long, help = "RabbitMQ 事件队列名称。不指定时使用 主机名 + 随机后缀")]
    pub rabbitmq_queue: Option<String>,

    /// RabbitMQ 错误队列名称
    #[arg(long, default_value = "im.error", help = "RabbitMQ 错误队列名称，默认: im.error")]
    pub rabbitmq_error_queue: String,

    /// 连接指令的 routing key（不指定时为 IM-ROUTER-{session_id}）
    #[arg(long, help = "下发连接指令的 routing key，默认: IM-ROUTER-{session_id}")]
    pub rabbitmq_command_key: Option<String>,
}

impl Cli {
    /// 解析命令行参数
    pub fn parse() -> Self {
        Parser::parse()
    }

    /// 获取日志过滤器字符串
    pub fn log_filter(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| self.log_level.clone())
    }
}
