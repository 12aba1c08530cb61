//! imbot-connect：群元数据镜像 + 连接生命周期守护进程
//! - 群元数据：HTTP 接口拉取，本地缓存 + 事件增量合并
//! - 会话事件：RabbitMQ 消费（连接建立/关闭、成员变动、群属性变动）
//! - 连接指令：RabbitMQ 下发给传输层
//! - 会话凭证：本地目录，可选 Redis (IM-SESSION-{id} / IM-USER-{id})

mod cli;
mod config;
mod constants;
mod credentials;
mod envelope;
mod http;
mod mq;

use credentials::{CredentialChain, FsCredentialStore, RedisCredentialStore};
use imbot_share::{
    EventDispatcher, EventReconciler, FetchCoordinator, LifecycleManager, MetadataStore,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// 会话事件通道容量
const EVENT_BUFFER: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    // 初始化日志：RUST_LOG 优先，其次 --log-level
    tracing_subscriber::fmt()
        .with_env_filter(cli.log_filter())
        .init();

    let cfg = config::AppConfig::load(&cli)?;
    let session = cfg.session_id();
    info!(
        "会话配置: session_id={}, 凭证目录={}, 元数据接口={}",
        session,
        cfg.session.sessions_dir.display(),
        cfg.api.base_url
    );

    // 凭证存储：本地目录 + 可选 Redis
    let mut chain = CredentialChain::new().with(
        "fs",
        Arc::new(FsCredentialStore::new(cfg.session.sessions_dir.clone())),
    );
    if cfg.redis.enabled {
        info!("正在连接 Redis: {}:{}", cfg.redis.host, cfg.redis.port);
        let redis = RedisCredentialStore::connect(&cfg.redis).await?;
        info!("Redis 连接成功: {}:{}", cfg.redis.host, cfg.redis.port);
        chain = chain.with("redis", Arc::new(redis));
    }
    info!("凭证存储数量: {}", chain.len());

    let fetcher = http::HttpGroupFetcher::new(&cfg.api.base_url, session.clone(), cfg.api_timeout())?;
    let store = Arc::new(MetadataStore::new());
    let coordinator = Arc::new(FetchCoordinator::new(store, Arc::new(fetcher)));

    let slot = mq::ChannelSlot::default();
    let lifecycle = Arc::new(
        LifecycleManager::new(
            session.clone(),
            coordinator.clone(),
            Arc::new(mq::MqConnector::new(slot.clone(), &cfg.rabbitmq)),
            Arc::new(chain),
        )
        .with_policy(cfg.reconnect_policy())
        .with_clear_cache_on_stop(cfg.cache.clear_cache_on_stop),
    );
    let reconciler = Arc::new(
        EventReconciler::new(coordinator).with_max_refresh_failures(cfg.cache.max_refresh_failures),
    );
    let dispatcher = EventDispatcher::new(lifecycle.clone(), reconciler).with_worker_idle(cfg.worker_idle());

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let rabbitmq = cfg.rabbitmq.clone();
    tokio::spawn({
        let session = session.clone();
        let slot = slot.clone();
        async move {
            let (host, port) = (rabbitmq.host.clone(), rabbitmq.port);
            if let Err(e) = mq::run_consumer(rabbitmq, session, slot, tx).await {
                error!("RabbitMQ 消费者退出 ({}:{}) - {:#}。请检查 RabbitMQ 服务是否已启动", host, port, e);
            }
        }
    });

    // 通道就绪后才发起第一次连接
    tokio::spawn({
        let lifecycle = lifecycle.clone();
        async move {
            slot.wait_ready().await;
            lifecycle.connect().await;
        }
    });

    info!("imbot-connect 已启动");
    tokio::select! {
        _ = dispatcher.run(rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("收到退出信号");
        }
    }
    lifecycle.stop();
    Ok(())
}
