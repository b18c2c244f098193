use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::BrokerPort;
use crate::error::{Result, RouterError};
use crate::packet::MessagePacket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    Start,
    Commit,
    Rollback,
}

/// A single message on the DB-updates queue (§4.5). The router never opens a
/// SQL connection itself — a downstream consumer (out of scope here, see
/// SPEC_FULL §4.5) applies these against the schema documented in
/// `reference_schema`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DbMutation {
    Insert {
        db_name: String,
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
        task_start: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        transaction_id: Option<String>,
    },
    Update {
        db_name: String,
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        r#where: Option<Value>,
        task_start: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        transaction_id: Option<String>,
    },
    Delete {
        db_name: String,
        table: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        r#where: Option<Value>,
        task_start: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        transaction_id: Option<String>,
    },
    Transaction {
        transaction_mode: TransactionMode,
        transaction_id: String,
        task_start: i64,
    },
}

impl DbMutation {
    pub fn task_start(&self) -> i64 {
        match self {
            DbMutation::Insert { task_start, .. }
            | DbMutation::Update { task_start, .. }
            | DbMutation::Delete { task_start, .. }
            | DbMutation::Transaction { task_start, .. } => *task_start,
        }
    }
}

/// Deterministic affinity hash: every mutation sharing a `task_start` must
/// land on the same shard (§4.5, property 4), independent of shard count at
/// any single call site as long as `shards` doesn't change mid-flight.
pub fn affinity_shard(task_start: i64, shards: u32) -> u32 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    task_start.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as u32
}

/// Publishes SQL-mutation messages onto a dedicated updates queue, grouped
/// into transactions keyed by `transaction_id`, with affinity so every
/// statement of one transaction lands on the same shard queue (§4.5).
pub struct DbUpdatePublisher {
    broker: Arc<dyn BrokerPort>,
    exchange: String,
    queue_prefix: String,
    shards: u32,
}

impl DbUpdatePublisher {
    pub fn new(broker: Arc<dyn BrokerPort>, exchange: impl Into<String>, queue_prefix: impl Into<String>, shards: u32) -> Self {
        Self { broker, exchange: exchange.into(), queue_prefix: queue_prefix.into(), shards }
    }

    pub async fn publish(&self, mutation: &DbMutation) -> Result<()> {
        let shard = affinity_shard(mutation.task_start(), self.shards);
        let queue = format!("{}_{}", self.queue_prefix, shard);
        let payload = serde_json::to_vec(mutation).map_err(|e| RouterError::JsonEncodeError(e.to_string()))?;
        self.broker
            .publish(&self.exchange, &queue, &payload)
            .await
            .map_err(RouterError::from)
    }

    /// Emits `start`, the caller's own `records`, the request-row/tag upserts
    /// (unless `skip_request`), then `commit` — or, on the first failure,
    /// `rollback` for the same `transaction_id` and the original error
    /// (§4.5, property 3).
    pub async fn publish_db_with_request(
        &self,
        packet: &MessagePacket,
        records: &[DbMutation],
        caller: Option<&str>,
        skip_request: bool,
        transaction_id: Option<String>,
        expires: Option<i64>,
    ) -> Result<()> {
        let record_id = packet
            .settings
            .record_id
            .clone()
            .ok_or(RouterError::OutOfSequence)?;
        let task_start = packet.settings.task_start.ok_or(RouterError::OutOfSequence)?;
        let transaction_id = transaction_id
            .unwrap_or_else(|| format!("{}_{}", record_id, caller.unwrap_or("unknown_caller")));

        let start = DbMutation::Transaction {
            transaction_mode: TransactionMode::Start,
            transaction_id: transaction_id.clone(),
            task_start,
        };
        if let Err(e) = self.publish(&start).await {
            return Err(e);
        }

        if let Err(e) = self.emit_body(packet, records, skip_request, &transaction_id, task_start, &record_id, expires).await {
            let rollback = DbMutation::Transaction {
                transaction_mode: TransactionMode::Rollback,
                transaction_id: transaction_id.clone(),
                task_start,
            };
            if let Err(rollback_err) = self.publish(&rollback).await {
                log::error!(
                    "db_publisher: rollback publish failed for transaction {}: {}",
                    transaction_id, rollback_err
                );
            }
            return Err(e);
        }

        let commit = DbMutation::Transaction {
            transaction_mode: TransactionMode::Commit,
            transaction_id: transaction_id.clone(),
            task_start,
        };
        self.publish(&commit).await
    }

    async fn emit_body(
        &self,
        packet: &MessagePacket,
        records: &[DbMutation],
        skip_request: bool,
        transaction_id: &str,
        task_start: i64,
        record_id: &str,
        expires: Option<i64>,
    ) -> Result<()> {
        for record in records {
            self.publish(record).await?;
        }

        if skip_request {
            return Ok(());
        }

        let settings = &packet.settings;
        let mut columns = vec!["id".to_string()];
        let mut values = vec![Value::String(record_id.to_string())];
        if let Some(status) = &settings.request_status {
            columns.push("state".to_string());
            values.push(Value::String(status.clone()));
        }
        if let Some(sent_time) = settings.sent_time {
            columns.push("sent_time".to_string());
            values.push(Value::Number(sent_time.into()));
        }
        if let Some(fallback_mode) = &settings.fallback_mode {
            columns.push("fallback_mode".to_string());
            values.push(Value::String(fallback_mode.clone()));
        }
        if let Some(system_id) = &settings.system_id {
            columns.push("system_id".to_string());
            values.push(Value::String(system_id.clone()));
        }

        self.publish(&DbMutation::Insert {
            db_name: "sito_messaging".into(),
            table: "request".into(),
            columns,
            values,
            task_start,
            transaction_id: Some(transaction_id.to_string()),
        })
        .await?;

        let expires_flag = expires.map(|e| e > 0).unwrap_or(false);
        let tags: [(&str, Value); 4] = [
            ("_sito_settings", serde_json::to_value(&settings).map_err(|e| RouterError::JsonEncodeError(e.to_string()))?),
            ("_sito_cargo", packet.cargo.clone()),
            ("_sito_history", serde_json::to_value(&settings.history).map_err(|e| RouterError::JsonEncodeError(e.to_string()))?),
            ("_sito_status_detail", settings.request_status_detail.clone().map(Value::String).unwrap_or(Value::Null)),
        ];

        for (tag_name, tag_value) in tags {
            let tag_value_text = match tag_value {
                Value::String(s) => s,
                other => serde_json::to_string(&other).map_err(|e| RouterError::JsonEncodeError(e.to_string()))?,
            };
            self.publish(&DbMutation::Insert {
                db_name: "sito_messaging".into(),
                table: "request_tags".into(),
                columns: vec![
                    "request_id".into(),
                    "tag_name".into(),
                    "tag_value".into(),
                    "expires_flag".into(),
                ],
                values: vec![
                    Value::String(record_id.to_string()),
                    Value::String(tag_name.to_string()),
                    Value::String(tag_value_text),
                    Value::Bool(expires_flag),
                ],
                task_start,
                transaction_id: Some(transaction_id.to_string()),
            })
            .await?;
        }

        if let Some(batch_id) = &settings.batch_id {
            self.publish(&DbMutation::Insert {
                db_name: "sito_messaging".into(),
                table: "request_batch".into(),
                columns: vec!["request_id".into(), "batch_id".into()],
                values: vec![Value::String(record_id.to_string()), Value::String(batch_id.clone())],
                task_start,
                transaction_id: Some(transaction_id.to_string()),
            })
            .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerError;
    use crate::packet::Settings;
    use std::sync::Mutex;

    #[test]
    fn same_task_start_yields_same_shard() {
        let a = affinity_shard(1_700_000_000, 8);
        let b = affinity_shard(1_700_000_000, 8);
        assert_eq!(a, b);
    }

    #[test]
    fn different_task_start_can_diverge() {
        let shards: std::collections::HashSet<u32> =
            (0..50).map(|i| affinity_shard(1_700_000_000 + i, 8)).collect();
        assert!(shards.len() > 1, "expected affinity hash to spread across shards");
    }

    /// Fails every publish whose payload contains one of `fail_on`, otherwise
    /// records it. Used to simulate a mid-transaction broker outage.
    struct FlakyBroker {
        fail_on: &'static str,
        published: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl BrokerPort for FlakyBroker {
        async fn declare_topology(&self, _classes: &crate::class::ClassRegistry) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn publish(&self, _exchange: &str, _routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
            let text = String::from_utf8_lossy(payload).to_string();
            if text.contains(self.fail_on) {
                return Err(BrokerError::PublishFailed("x".into(), "y".into(), "simulated outage".into()));
            }
            self.published.lock().unwrap().push(text);
            Ok(())
        }
    }

    fn packet_with_record(record_id: &str, task_start: i64) -> MessagePacket {
        MessagePacket::new(
            Value::Null,
            Settings {
                record_id: Some(record_id.to_string()),
                task_start: Some(task_start),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn failed_body_publish_emits_rollback_and_no_commit() {
        let broker = Arc::new(FlakyBroker { fail_on: "request_tags", published: Mutex::new(Vec::new()) });
        let publisher = DbUpdatePublisher::new(broker.clone() as Arc<dyn BrokerPort>, "db_updates", "db_update", 4);
        let packet = packet_with_record("rec-1", 1_700_000_000);

        let err = publisher
            .publish_db_with_request(&packet, &[], Some("unit-test"), false, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::BrokerPublishFailed(_)));

        let published = broker.published.lock().unwrap();
        assert!(published.iter().any(|p| p.contains("\"mode\":\"start\"")), "expected a start transaction message");
        assert!(published.iter().any(|p| p.contains("\"mode\":\"rollback\"")), "expected a rollback transaction message");
        assert!(!published.iter().any(|p| p.contains("\"mode\":\"commit\"")), "commit must not be published after a failure");
    }

    #[tokio::test]
    async fn successful_body_publish_emits_commit_and_no_rollback() {
        let broker = Arc::new(FlakyBroker { fail_on: "never_matches", published: Mutex::new(Vec::new()) });
        let publisher = DbUpdatePublisher::new(broker.clone() as Arc<dyn BrokerPort>, "db_updates", "db_update", 4);
        let packet = packet_with_record("rec-2", 1_700_000_001);

        publisher
            .publish_db_with_request(&packet, &[], Some("unit-test"), false, None, None)
            .await
            .unwrap();

        let published = broker.published.lock().unwrap();
        assert!(published.iter().any(|p| p.contains("\"mode\":\"commit\"")));
        assert!(!published.iter().any(|p| p.contains("\"mode\":\"rollback\"")));
    }
}
