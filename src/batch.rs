use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

use crate::delay::{DelayRequest, DelayScheduler};
use crate::error::RouterError;
use crate::external::Clock;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("kv connection failed: {0}")]
    ConnectionFailed(String),
    #[error("kv operation on {0} failed: {1}")]
    OperationFailed(String, String),
}

impl From<KvError> for RouterError {
    fn from(e: KvError) -> Self {
        RouterError::StageError { class: "batch_store".into(), description: e.to_string() }
    }
}

/// The three states a batch's delivery decision can be in (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverCondition {
    Pending,
    Go,
    Abort,
}

impl DeliverCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliverCondition::Pending => "PENDING",
            DeliverCondition::Go => "GO",
            DeliverCondition::Abort => "ABORT",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "GO" => DeliverCondition::Go,
            "ABORT" => DeliverCondition::Abort,
            _ => DeliverCondition::Pending,
        }
    }
}

/// Narrow hash-store seam `BatchStore` drives. Mirrors `BrokerPort`: object
/// safe, one implementation backed by `redis`, swappable for an in-memory
/// fake in tests (§2.1 ambient test tooling).
#[async_trait]
pub trait KvPort: Send + Sync {
    async fn hset_batch(&self, batch_id: &str, fields: &[(&str, String)]) -> std::result::Result<(), KvError>;
    async fn hincr(&self, batch_id: &str, field: &str, delta: i64) -> std::result::Result<i64, KvError>;
    async fn hget(&self, batch_id: &str, field: &str) -> std::result::Result<Option<String>, KvError>;
    async fn expire(&self, batch_id: &str, ttl_seconds: i64) -> std::result::Result<(), KvError>;
}

fn batch_key(batch_id: &str) -> String {
    format!("Sr_{}", batch_id)
}

/// `redis`-backed `KvPort`. No KV-store crate appears anywhere in the
/// retrieval corpus (SPEC_FULL §4.6); `redis` with the tokio-multiplexed
/// connection is the standard async pairing with the rest of this crate's
/// tokio-based stack.
pub struct RedisKvStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisKvStore {
    pub async fn connect(redis_url: &str) -> std::result::Result<Self, KvError> {
        let client = redis::Client::open(redis_url).map_err(|e| KvError::ConnectionFailed(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| KvError::ConnectionFailed(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvPort for RedisKvStore {
    async fn hset_batch(&self, batch_id: &str, fields: &[(&str, String)]) -> std::result::Result<(), KvError> {
        let key = batch_key(batch_id);
        let mut conn = self.conn.clone();
        conn.hset_multiple(&key, fields)
            .await
            .map_err(|e| KvError::OperationFailed(key, e.to_string()))
    }

    async fn hincr(&self, batch_id: &str, field: &str, delta: i64) -> std::result::Result<i64, KvError> {
        let key = batch_key(batch_id);
        let mut conn = self.conn.clone();
        conn.hincr(&key, field, delta)
            .await
            .map_err(|e| KvError::OperationFailed(key, e.to_string()))
    }

    async fn hget(&self, batch_id: &str, field: &str) -> std::result::Result<Option<String>, KvError> {
        let key = batch_key(batch_id);
        let mut conn = self.conn.clone();
        conn.hget(&key, field)
            .await
            .map_err(|e| KvError::OperationFailed(key, e.to_string()))
    }

    async fn expire(&self, batch_id: &str, ttl_seconds: i64) -> std::result::Result<(), KvError> {
        let key = batch_key(batch_id);
        let mut conn = self.conn.clone();
        conn.expire(&key, ttl_seconds)
            .await
            .map_err(|e| KvError::OperationFailed(key, e.to_string()))
    }
}

/// What the caller asked for when opening a batch (§4.6).
#[derive(Debug, Clone)]
pub struct BatchSpec {
    pub batch_id: String,
    pub batch_size: u32,
    pub common_tags: Vec<String>,
    pub requests: Vec<String>,
    pub send_time: i64,
    pub deliver_ttl_seconds: i64,
    pub system_id: Option<String>,
    /// Class-local `min_delay` threshold (§4.4/§4.6): a `send_time` further
    /// out than `batch_start + min_delay` opens the batch as delayed rather
    /// than immediately processing.
    pub min_delay: Option<i64>,
}

/// Tracks batched-request delivery: how many requests have reported good or
/// bad, and whether the batch as a whole is cleared to deliver. A delayed
/// "deliver-or-timeout" (DLR) message is scheduled alongside batch creation so
/// an abandoned batch still resolves (§4.6).
pub struct BatchStore {
    kv: Arc<dyn KvPort>,
    delay: Arc<DelayScheduler>,
    clock: Arc<dyn Clock>,
    dlr_exchange: String,
    dlr_route: String,
}

impl BatchStore {
    pub fn new(
        kv: Arc<dyn KvPort>,
        delay: Arc<DelayScheduler>,
        clock: Arc<dyn Clock>,
        dlr_exchange: impl Into<String>,
        dlr_route: impl Into<String>,
    ) -> Self {
        Self { kv, delay, clock, dlr_exchange: dlr_exchange.into(), dlr_route: dlr_route.into() }
    }

    pub async fn create_batch(&self, spec: BatchSpec) -> crate::error::Result<()> {
        let now = self.clock.now_epoch();
        // S5: a far-future send_time (beyond batch_start + min_delay) opens
        // the batch as delayed rather than in-flight processing.
        let state = match spec.min_delay {
            Some(min_delay) if spec.send_time > now + min_delay => format!("DELAYED:{}", spec.send_time),
            _ => "PROCESSING".to_string(),
        };
        let fields = [
            ("batch_size", spec.batch_size.to_string()),
            ("good_count", "0".to_string()),
            ("bad_count", "0".to_string()),
            ("state", state),
            ("deliver_condition", DeliverCondition::Pending.as_str().to_string()),
            ("common_tags", spec.common_tags.join(",")),
            ("requests", spec.requests.join(",")),
            ("send_time", spec.send_time.to_string()),
            ("batch_start", now.to_string()),
            ("delay_time", spec.deliver_ttl_seconds.to_string()),
            ("system_id", spec.system_id.clone().unwrap_or_default()),
        ];
        self.kv.hset_batch(&spec.batch_id, &fields).await?;

        let ttl = spec.deliver_ttl_seconds.max(60);
        self.kv.expire(&spec.batch_id, ttl).await?;

        self.delay
            .schedule(
                DelayRequest::AfterSeconds(spec.deliver_ttl_seconds),
                &self.dlr_exchange,
                &self.dlr_route,
                spec.batch_id.clone().into_bytes(),
                None,
            )
            .await?;
        Ok(())
    }

    /// Increments `good_count` or `bad_count` by one and reports both totals
    /// back so the caller can decide whether the batch is now complete.
    pub async fn record_result(&self, batch_id: &str, good: bool) -> crate::error::Result<(i64, i64)> {
        let field = if good { "good_count" } else { "bad_count" };
        let updated = self.kv.hincr(batch_id, field, 1).await?;
        let other_field = if good { "bad_count" } else { "good_count" };
        let other = self
            .kv
            .hget(batch_id, other_field)
            .await?
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        if good {
            Ok((updated, other))
        } else {
            Ok((other, updated))
        }
    }

    pub async fn deliver_condition(&self, batch_id: &str) -> crate::error::Result<DeliverCondition> {
        let raw = self.kv.hget(batch_id, "deliver_condition").await?;
        Ok(raw.map(|s| DeliverCondition::parse(&s)).unwrap_or(DeliverCondition::Pending))
    }

    pub async fn set_deliver_condition(&self, batch_id: &str, condition: DeliverCondition) -> crate::error::Result<()> {
        self.kv
            .hset_batch(batch_id, &[("deliver_condition", condition.as_str().to_string())])
            .await
            .map_err(RouterError::from)
    }

    /// Fails with [`RouterError::BatchNotGo`] if the batch has already been
    /// aborted, blocking re-entry of late stragglers into a closed batch (§8
    /// scenario S6).
    pub async fn ensure_not_blocked(&self, batch_id: &str) -> crate::error::Result<()> {
        if self.deliver_condition(batch_id).await? == DeliverCondition::Abort {
            return Err(RouterError::BatchNotGo(batch_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, BrokerPort};
    use crate::class::ClassRegistry;
    use crate::external::FixedClock;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeKv {
        hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    }

    #[async_trait]
    impl KvPort for FakeKv {
        async fn hset_batch(&self, batch_id: &str, fields: &[(&str, String)]) -> std::result::Result<(), KvError> {
            let mut hashes = self.hashes.lock().unwrap();
            let entry = hashes.entry(batch_id.to_string()).or_default();
            for (k, v) in fields {
                entry.insert(k.to_string(), v.clone());
            }
            Ok(())
        }

        async fn hincr(&self, batch_id: &str, field: &str, delta: i64) -> std::result::Result<i64, KvError> {
            let mut hashes = self.hashes.lock().unwrap();
            let entry = hashes.entry(batch_id.to_string()).or_default();
            let current: i64 = entry.get(field).and_then(|s| s.parse().ok()).unwrap_or(0);
            let updated = current + delta;
            entry.insert(field.to_string(), updated.to_string());
            Ok(updated)
        }

        async fn hget(&self, batch_id: &str, field: &str) -> std::result::Result<Option<String>, KvError> {
            let hashes = self.hashes.lock().unwrap();
            Ok(hashes.get(batch_id).and_then(|h| h.get(field).cloned()))
        }

        async fn expire(&self, _batch_id: &str, _ttl_seconds: i64) -> std::result::Result<(), KvError> {
            Ok(())
        }
    }

    struct FakeBroker {
        published: Mutex<Vec<(String, String, Vec<u8>)>>,
    }

    #[async_trait]
    impl BrokerPort for FakeBroker {
        async fn declare_topology(&self, _classes: &ClassRegistry) -> std::result::Result<(), BrokerError> {
            Ok(())
        }

        async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> std::result::Result<(), BrokerError> {
            self.published.lock().unwrap().push((exchange.to_string(), routing_key.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    fn store() -> (BatchStore, Arc<FakeKv>) {
        let kv = Arc::new(FakeKv::default());
        let broker: Arc<dyn BrokerPort> = Arc::new(FakeBroker { published: Mutex::new(Vec::new()) });
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(1_000));
        let delay = Arc::new(DelayScheduler::new(broker, clock.clone(), "delay_exchange"));
        (BatchStore::new(kv.clone(), delay, clock, "dlr_exchange", "dlr_route"), kv)
    }

    #[tokio::test]
    async fn create_batch_initializes_counts_and_pending_condition() {
        let (store, kv) = store();
        let spec = BatchSpec {
            batch_id: "b1".into(),
            batch_size: 3,
            common_tags: vec!["tag_a".into()],
            requests: vec!["r1".into(), "r2".into(), "r3".into()],
            send_time: 1_000,
            deliver_ttl_seconds: 300,
            system_id: Some("sys1".into()),
            min_delay: Some(3600),
        };
        store.create_batch(spec).await.unwrap();
        assert_eq!(kv.hget("b1", "batch_size").await.unwrap(), Some("3".to_string()));
        assert_eq!(kv.hget("b1", "state").await.unwrap(), Some("PROCESSING".to_string()));
        assert_eq!(store.deliver_condition("b1").await.unwrap(), DeliverCondition::Pending);
    }

    #[tokio::test]
    async fn create_batch_with_far_future_send_time_opens_delayed() {
        let (store, kv) = store();
        // clock fixed at 1_000; send_time 2 hours out, min_delay 3600s (S5).
        let spec = BatchSpec {
            batch_id: "b5".into(),
            batch_size: 1,
            common_tags: vec![],
            requests: vec!["r1".into()],
            send_time: 1_000 + 7_200,
            deliver_ttl_seconds: 60,
            system_id: None,
            min_delay: Some(3_600),
        };
        store.create_batch(spec).await.unwrap();
        assert_eq!(kv.hget("b5", "state").await.unwrap(), Some("DELAYED:8200".to_string()));
    }

    #[tokio::test]
    async fn record_result_tracks_both_counters_independently() {
        let (store, _kv) = store();
        store
            .create_batch(BatchSpec {
                batch_id: "b2".into(),
                batch_size: 2,
                common_tags: vec![],
                requests: vec!["r1".into(), "r2".into()],
                send_time: 1_000,
                deliver_ttl_seconds: 60,
                system_id: None,
                min_delay: None,
            })
            .await
            .unwrap();
        let (good, bad) = store.record_result("b2", true).await.unwrap();
        assert_eq!((good, bad), (1, 0));
        let (good, bad) = store.record_result("b2", false).await.unwrap();
        assert_eq!((good, bad), (1, 1));
    }

    #[tokio::test]
    async fn aborted_batch_blocks_further_entry() {
        let (store, _kv) = store();
        store
            .create_batch(BatchSpec {
                batch_id: "b3".into(),
                batch_size: 1,
                common_tags: vec![],
                requests: vec!["r1".into()],
                send_time: 1_000,
                deliver_ttl_seconds: 60,
                system_id: None,
                min_delay: None,
            })
            .await
            .unwrap();
        store.set_deliver_condition("b3", DeliverCondition::Abort).await.unwrap();
        let err = store.ensure_not_blocked("b3").await.unwrap_err();
        assert!(matches!(err, RouterError::BatchNotGo(_)));
    }
}
