use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use thiserror::Error;
use tokio::time::timeout;

use crate::class::ClassRegistry;
use crate::error::RouterError;

/// Errors native to the broker transport, kept distinct from `RouterError` so
/// the adapter can log wire-level detail before the router core sees only the
/// three kinds §7 defines (`BrokerDeclareFailed`, `BrokerPublishFailed`,
/// `ConsumerFailed`). Shape grounded in `cleanapp_rustlib::rabbitmq`'s
/// `SubscriberError`.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    ConnectionFailed(String),
    #[error("failed to open channel: {0}")]
    ChannelFailed(String),
    #[error("failed to declare exchange {0}: {1}")]
    ExchangeDeclarationFailed(String, String),
    #[error("failed to declare queue {0}: {1}")]
    QueueDeclarationFailed(String, String),
    #[error("failed to bind queue {0} to exchange {1}: {2}")]
    QueueBindFailed(String, String, String),
    #[error("failed to register consumer on queue {0}: {1}")]
    ConsumerRegistrationFailed(String, String),
    #[error("publish to {0}/{1} failed: {2}")]
    PublishFailed(String, String, String),
    #[error("connect timed out")]
    Timeout,
}

impl From<BrokerError> for RouterError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::PublishFailed(..) => RouterError::BrokerPublishFailed(e.to_string()),
            BrokerError::ConsumerRegistrationFailed(..) => RouterError::ConsumerFailed(e.to_string()),
            _ => RouterError::BrokerDeclareFailed(e.to_string()),
        }
    }
}

/// A delivery handed to a per-queue callback by `ConsumePoll` (§4.2).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    pub delivery_tag: u64,
}

/// What a per-queue callback tells `ConsumePoll` to do with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Ack,
    Nack,
    Requeue,
}

/// One callback per queue, invoked serially on that queue's channel (§5:
/// "per-message callbacks are executed serially on their channel").
#[async_trait]
pub trait QueueCallback: Send + Sync {
    async fn on_delivery(&self, delivery: Delivery) -> AckOutcome;
}

/// The seam `RouterCore` and `DelayScheduler` publish through. Kept narrow
/// and object-safe so tests can swap in an in-memory fake without a live
/// broker (§2.1 ambient test tooling).
#[async_trait]
pub trait BrokerPort: Send + Sync {
    async fn declare_topology(&self, classes: &ClassRegistry) -> Result<(), BrokerError>;
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError>;
}

/// `lapin`-backed implementation: one connection per worker process, one
/// channel reused for all publishes (§5 resource policy).
pub struct LapinBroker {
    channel: Channel,
}

impl LapinBroker {
    pub async fn connect(amqp_url: &str) -> Result<Self, BrokerError> {
        let connection = timeout(
            Duration::from_secs(60),
            Connection::connect(amqp_url, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| BrokerError::Timeout)?
        .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ChannelFailed(e.to_string()))?;

        Ok(Self { channel })
    }

    /// Declares one queue, passive-then-active (§4.2): try a passive check
    /// first, and only declare the exchange/queue for real if that fails.
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        let passive = self
            .channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        if passive.is_ok() {
            return Ok(());
        }

        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: false,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ExchangeDeclarationFailed(exchange.to_string(), e.to_string()))
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let passive = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        if passive.is_ok() {
            return Ok(());
        }

        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: false,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::QueueDeclarationFailed(queue.to_string(), e.to_string()))?;
        Ok(())
    }

    /// Long-lived multiplex consumer over several queues (§4.2
    /// `ConsumePoll`). Ends on shutdown signal, or once any single queue has
    /// delivered `qmax` messages (`None` disables the debug cap).
    pub async fn consume_poll(
        &self,
        callbacks: HashMap<String, Arc<dyn QueueCallback>>,
        qmax: Option<u64>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        let mut consumers = Vec::new();
        for queue in callbacks.keys() {
            let consumer = self
                .channel
                .basic_consume(
                    queue,
                    "",
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::ConsumerRegistrationFailed(queue.clone(), e.to_string()))?;
            consumers.push((queue.clone(), consumer));
        }

        self.channel
            .basic_qos(20, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::ChannelFailed(e.to_string()))?;

        let mut counts: HashMap<String, u64> = HashMap::new();
        let tagged = consumers
            .into_iter()
            .map(|(queue, consumer)| consumer.map(move |d| (queue.clone(), d)));
        let mut merged = futures_util::stream::select_all(tagged);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("broker: shutdown signal received, stopping consume loop");
                        return Ok(());
                    }
                }
                next = merged.next() => {
                    let Some((queue, delivery_res)) = next else {
                        log::warn!("broker: all consumer streams ended");
                        return Ok(());
                    };
                    let delivery = match delivery_res {
                        Ok(d) => d,
                        Err(e) => {
                            log::error!("broker: delivery error on queue {}: {}", queue, e);
                            continue;
                        }
                    };
                    let delivery_tag = delivery.delivery_tag;
                    let msg = Delivery {
                        body: delivery.data.clone(),
                        exchange: delivery.exchange.to_string(),
                        routing_key: delivery.routing_key.to_string(),
                        queue: queue.clone(),
                        delivery_tag,
                    };
                    let outcome = match callbacks.get(&queue) {
                        Some(cb) => cb.on_delivery(msg).await,
                        None => AckOutcome::Nack,
                    };
                    let ack_result = match outcome {
                        AckOutcome::Ack => {
                            self.channel.basic_ack(delivery_tag, BasicAckOptions::default()).await
                        }
                        AckOutcome::Nack => {
                            self.channel
                                .basic_nack(delivery_tag, BasicNackOptions { multiple: false, requeue: false })
                                .await
                        }
                        AckOutcome::Requeue => {
                            self.channel
                                .basic_nack(delivery_tag, BasicNackOptions { multiple: false, requeue: true })
                                .await
                        }
                    };
                    if let Err(e) = ack_result {
                        log::error!("broker: ack/nack failed on queue {}: {}", queue, e);
                    }

                    if let Some(max) = qmax {
                        let count = counts.entry(queue.clone()).or_insert(0);
                        *count += 1;
                        if *count >= max {
                            log::info!("broker: queue {} reached qmax={}, stopping consume loop", queue, max);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BrokerPort for LapinBroker {
    /// For every exchange referenced by any class, passive-then-active
    /// declare; same for every queue, binding with routing key = queue name
    /// unless the class names an explicit `route_key`. Notify classes may
    /// omit queue declaration — they publish into externally-owned queues.
    async fn declare_topology(&self, classes: &ClassRegistry) -> Result<(), BrokerError> {
        let mut declared_exchanges = std::collections::HashSet::new();
        for class in classes.classes() {
            if declared_exchanges.insert(class.exchange.clone()) {
                self.declare_exchange(&class.exchange).await?;
            }

            if class.kind() == crate::class::ClassKind::Notify {
                continue;
            }

            let Some(queue) = class.queue.as_ref() else { continue };
            self.declare_queue(queue).await?;

            let routing_key = class.route_key.clone().unwrap_or_else(|| queue.clone());
            self.channel
                .queue_bind(
                    queue,
                    &class.exchange,
                    &routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BrokerError::QueueBindFailed(queue.clone(), class.exchange.clone(), e.to_string())
                })?;
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| BrokerError::PublishFailed(exchange.to_string(), routing_key.to_string(), e.to_string()))?;
        Ok(())
    }
}
