//! RabbitMQ：消费传输层上送的会话事件，并通过同一连接下发连接指令

use crate::config::RabbitMqConfig;
use crate::constants::{MQ_CONSUMER_TAG, MQ_EVENTKEY_PREFIX};
use crate::envelope::{self, Command};
use anyhow::{Context, bail};
use async_trait::async_trait;
use futures::StreamExt;
use imbot_share::{Connector, SessionEvent, SessionId};
use lapin::options::*;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// 最大重试延迟 60 秒
const MAX_RETRY_DELAY_SECS: u64 = 60;

/// 消费者当前使用的 channel，重连后替换，断开时清空
#[derive(Clone)]
pub struct ChannelSlot {
    tx: Arc<watch::Sender<Option<Channel>>>,
}

impl Default for ChannelSlot {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }
}

impl ChannelSlot {
    pub fn current(&self) -> Option<Channel> {
        self.tx.borrow().clone()
    }

    fn set(&self, channel: Option<Channel>) {
        self.tx.send_replace(channel);
    }

    /// 等到第一次有可用 channel
    pub async fn wait_ready(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(Option::is_some).await;
    }
}

enum Flow {
    /// 连接被对端关闭，重连
    Reconnect,
    /// 事件接收方已退出
    Shutdown,
}

/// 自动重连的消费循环；事件接收方关闭后返回
pub async fn run_consumer(
    cfg: RabbitMqConfig,
    session: SessionId,
    slot: ChannelSlot,
    events: mpsc::Sender<SessionEvent>,
) -> anyhow::Result<()> {
    // 常见的 RabbitMQ HTTP 管理端口，重连也不会好
    if cfg.port == 15672 || cfg.port == 15671 {
        bail!(
            "端口配置错误：端口 {} 是 RabbitMQ 管理界面的 HTTP 端口，不是 AMQP 协议端口，请使用 5672（或 5671 for TLS）",
            cfg.port
        );
    }

    let mut retry_count: u32 = 0;
    loop {
        let result = run_consumer_once(&cfg, &session, &slot, &events).await;
        slot.set(None);
        match result {
            Ok(Flow::Shutdown) => {
                info!("事件接收方已关闭，RabbitMQ 消费者退出");
                return Ok(());
            }
            Ok(Flow::Reconnect) => {
                if retry_count > 0 {
                    info!("RabbitMQ 连接已恢复");
                    retry_count = 0;
                }
                warn!("RabbitMQ 消费者退出，5 秒后重连...");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Err(e) => {
                retry_count += 1;
                if retry_count == 1 {
                    error!("RabbitMQ 连接失败: {:#}", e);
                } else {
                    error!("RabbitMQ 重连失败（第 {} 次尝试）: {:#}", retry_count, e);
                }
                let delay_secs = backoff_secs(retry_count);
                warn!("{} 秒后尝试重连 RabbitMQ...", delay_secs);
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            }
        }
        if events.is_closed() {
            return Ok(());
        }
    }
}

/// 指数退避：1, 2, 4 ... 32 秒，不超过 60 秒
fn backoff_secs(retry_count: u32) -> u64 {
    let exp = retry_count.saturating_sub(1).min(5);
    MAX_RETRY_DELAY_SECS.min(2_u64.pow(exp))
}

async fn run_consumer_once(
    cfg: &RabbitMqConfig,
    session: &SessionId,
    slot: &ChannelSlot,
    events: &mpsc::Sender<SessionEvent>,
) -> anyhow::Result<Flow> {
    info!("正在连接 RabbitMQ: {}:{}", cfg.host, cfg.port);
    let conn = Connection::connect(&cfg.amqp_url(), ConnectionProperties::default())
        .await
        .with_context(|| {
            format!(
                "RabbitMQ 连接失败 (主机: {}, 端口: {}, 虚拟主机: {})",
                cfg.host, cfg.port, cfg.virtual_host
            )
        })?;
    info!("✓ RabbitMQ TCP 连接已建立");

    let channel = conn.create_channel().await?;

    info!("声明 RabbitMQ exchange: {} (类型: direct, 持久化)", cfg.exchange);
    channel
        .exchange_declare(
            &cfg.exchange,
            lapin::ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;

    info!("声明 RabbitMQ 队列: {} (独占、自动删除)", cfg.queue);
    channel
        .queue_declare(
            &cfg.queue,
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            let msg = e.to_string();
            if msg.contains("RESOURCE_LOCKED") || msg.contains("405") {
                anyhow::anyhow!("队列 {} 已被其他连接独占使用，请确认没有其他实例使用相同的队列名", cfg.queue)
            } else {
                anyhow::anyhow!("队列 {} 声明失败: {}", cfg.queue, msg)
            }
        })?;

    let event_key = format!("{}{}", MQ_EVENTKEY_PREFIX, session);
    for routing_key in [cfg.queue.as_str(), event_key.as_str()] {
        info!("绑定队列 {} 到 exchange {} (routing_key: {})", cfg.queue, cfg.exchange, routing_key);
        channel
            .queue_bind(
                &cfg.queue,
                &cfg.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    info!("声明 RabbitMQ 错误队列: {}", cfg.error_queue);
    channel
        .queue_declare(
            &cfg.error_queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            &cfg.error_queue,
            &cfg.exchange,
            &cfg.error_queue,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    let mut consumer = channel
        .basic_consume(
            &cfg.queue,
            MQ_CONSUMER_TAG,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    slot.set(Some(channel.clone()));
    info!("RabbitMQ 消费已启动: queue={}", cfg.queue);

    while let Some(delivery) = consumer.next().await {
        let delivery = delivery.context("RabbitMQ 消费接收错误，需要重连")?;
        match envelope::decode(&delivery.data, session) {
            Ok(decoded) => {
                for event in decoded {
                    debug!(session_id = %session, event = ?event, "收到会话事件");
                    if events.send(event).await.is_err() {
                        let _ = delivery
                            .nack(BasicNackOptions { requeue: true, multiple: false })
                            .await;
                        return Ok(Flow::Shutdown);
                    }
                }
                if delivery.ack(BasicAckOptions::default()).await.is_err() {
                    error!("ack 失败");
                }
            }
            Err(e) => {
                let body = String::from_utf8_lossy(&delivery.data);
                error!("处理消息失败: {} body={}", e, body);
                let _ = channel
                    .basic_publish(
                        &cfg.exchange,
                        &cfg.error_queue,
                        BasicPublishOptions::default(),
                        &delivery.data,
                        BasicProperties::default(),
                    )
                    .await;
                let _ = delivery
                    .nack(BasicNackOptions { requeue: false, multiple: false })
                    .await;
            }
        }
    }
    Ok(Flow::Reconnect)
}

/// 通过消费者当前的 channel 下发连接指令
pub struct MqConnector {
    slot: ChannelSlot,
    exchange: String,
    routing_key: String,
}

impl MqConnector {
    pub fn new(slot: ChannelSlot, cfg: &RabbitMqConfig) -> Self {
        Self {
            slot,
            exchange: cfg.exchange.clone(),
            routing_key: cfg.command_routing_key.clone(),
        }
    }
}

#[async_trait]
impl Connector for MqConnector {
    async fn open(&self, session: &SessionId) -> anyhow::Result<()> {
        let channel = self
            .slot
            .current()
            .context("RabbitMQ 通道不可用，无法下发连接指令")?;
        let payload = serde_json::to_vec(&Command::connect(session))?;
        channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await?
            .await?;
        info!(session_id = %session, routing_key = %self.routing_key, "已下发连接指令");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let delays: Vec<u64> = (1..=8).map(backoff_secs).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 32, 32]);
    }

    #[tokio::test]
    async fn connector_fails_without_channel() {
        let cfg = crate::config::AppConfig::from_cli(&<crate::cli::Cli as clap::Parser>::parse_from([
            "imbot-connect",
        ]));
        let connector = MqConnector::new(ChannelSlot::default(), &cfg.rabbitmq);
        assert_eq!(connector.routing_key, "IM-ROUTER-default");
        let err = connector.open(&SessionId::from("default")).await.unwrap_err();
        assert!(err.to_string().contains("通道不可用"));
    }
}
