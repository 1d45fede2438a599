use crate::errors::{SettlementError, SettlementResult};
use crate::models::{OrderStatus, PaymentMethod};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Facts published after a settlement transaction commits.
///
/// Downstream consumers (order e-mails, back-office feeds) react to these;
/// nothing here is ever emitted from inside a transaction body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum SettlementEvent {
    #[serde(rename = "ORDER_CREATED")]
    OrderCreated {
        order_id: String,
        user_id: Option<String>,
        payment_method: PaymentMethod,
        total: i64,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "ORDER_PAID")]
    OrderPaid {
        order_id: String,
        user_id: Option<String>,
        status: OrderStatus,
        total: i64,
        bank_tx_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "WALLET_DEBITED")]
    WalletDebited {
        user_id: String,
        order_id: String,
        amount: i64,
        new_balance: i64,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "WALLET_TOPPED_UP")]
    WalletToppedUp {
        user_id: String,
        bank_tx_id: String,
        amount: i64,
        new_balance: i64,
        timestamp: DateTime<Utc>,
    },

    /// Back-office deposit (positive `amount`) or withdrawal (negative).
    #[serde(rename = "WALLET_ADJUSTED")]
    WalletAdjusted {
        user_id: String,
        admin_id: String,
        ledger_id: String,
        amount: i64,
        new_balance: i64,
        timestamp: DateTime<Utc>,
    },
}

impl SettlementEvent {
    pub fn event_type(&self) -> &str {
        match self {
            SettlementEvent::OrderCreated { .. } => "ORDER_CREATED",
            SettlementEvent::OrderPaid { .. } => "ORDER_PAID",
            SettlementEvent::WalletDebited { .. } => "WALLET_DEBITED",
            SettlementEvent::WalletToppedUp { .. } => "WALLET_TOPPED_UP",
            SettlementEvent::WalletAdjusted { .. } => "WALLET_ADJUSTED",
        }
    }

    /// Partition key: wallet events by user, order events by order.
    pub fn key(&self) -> &str {
        match self {
            SettlementEvent::OrderCreated { order_id, .. } => order_id,
            SettlementEvent::OrderPaid { order_id, .. } => order_id,
            SettlementEvent::WalletDebited { user_id, .. } => user_id,
            SettlementEvent::WalletToppedUp { user_id, .. } => user_id,
            SettlementEvent::WalletAdjusted { user_id, .. } => user_id,
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: SettlementEvent) -> SettlementResult<()>;
}

/// Used when no broker is configured.
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, event: SettlementEvent) -> SettlementResult<()> {
        tracing::debug!(
            event_type = event.event_type(),
            key = %event.key(),
            "No event broker configured, dropping event"
        );
        Ok(())
    }
}

pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
}

impl KafkaProducer {
    pub fn new(brokers: &str, topic: String) -> SettlementResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("compression.type", "snappy")
            .set("linger.ms", "10")
            .create()
            .map_err(|e| SettlementError::Internal(format!("Failed to create producer: {}", e)))?;

        Ok(Self { producer, topic })
    }
}

#[async_trait]
impl EventPublisher for KafkaProducer {
    async fn publish(&self, event: SettlementEvent) -> SettlementResult<()> {
        let key = event.key().to_string();
        let payload = serde_json::to_string(&event).map_err(|e| {
            SettlementError::Internal(format!("Failed to serialize event: {}", e))
        })?;

        tracing::info!(
            event_type = event.event_type(),
            key = %key,
            "Publishing event to Kafka"
        );

        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        match self.producer.send(record, Duration::from_secs(5)).await {
            Ok((partition, offset)) => {
                tracing::debug!(partition = partition, offset = offset, "Event published");
                Ok(())
            }
            Err((e, _)) => Err(SettlementError::Internal(format!(
                "Failed to publish event: {}",
                e
            ))),
        }
    }
}
